use redb::TableDefinition;

// source identity (stable): source hash <-> id
pub const SOURCE_ID: TableDefinition<&[u8], u64> = TableDefinition::new("source_id");
pub const ID_SOURCE: TableDefinition<u64, &[u8]> = TableDefinition::new("id_source");

// counters
pub const META_U64: TableDefinition<&str, u64> = TableDefinition::new("meta_u64");
pub const KEY_NEXT_SOURCE_ID: &str = "next_source_id";

// source hash -> source data blob (filesize, file_type, zero_count, nonprobative_count)
pub const SOURCE_DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("source_data");

// source hash -> packed (repository_name, file_name) pairs, insertion order
pub const SOURCE_NAME: TableDefinition<&[u8], &[u8]> = TableDefinition::new("source_name");

// block hash -> hash data blob (k_entropy, block_label, (source_id, sub_count) list)
pub const HASH_DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hash_data");

// hash prefix -> packed (suffix, source_id, file_offset) entries
pub const HASH_STORE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hash_store");
