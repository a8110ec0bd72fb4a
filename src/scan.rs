use crate::codec::{self, HashDataValue, SourceDataValue};
use crate::db::{self, DbHandle};
use crate::hexutil;
use crate::records::{self, BlockRecord, ExpandedBlock, ExpandedSource, SourceRecord};
use crate::schema;
use crate::settings::Settings;
use anyhow::{anyhow, Result};
use redb::{ReadableTable, ReadableTableMetadata};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::Mutex;

/// Read facade. Every operation runs in its own read transaction and sees
/// the last committed state.
///
/// The manager remembers which hashes and sources it has already expanded;
/// repeats shrink to the bare `block_hash` form and sources drop out of
/// later `sources` arrays. Scans that need full output every time should
/// use a fresh manager.
pub struct ScanManager {
    handle: DbHandle,
    reported_hashes: Mutex<HashSet<Vec<u8>>>,
    reported_sources: Mutex<HashSet<Vec<u8>>>,
}

/// One block's data with sub_counts keyed by source hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub k_entropy: u64,
    pub block_label: String,
    pub source_sub_counts: Vec<(Vec<u8>, u64)>,
}

impl ScanManager {
    /// Open a database shared, for reading.
    pub fn open(db_dir: &Path) -> Result<ScanManager> {
        let handle = db::open_ro(db_dir)?;
        Ok(ScanManager {
            handle,
            reported_hashes: Mutex::new(HashSet::new()),
            reported_sources: Mutex::new(HashSet::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.handle.settings
    }

    /// Hash data row for a block hash, if present.
    pub fn find_hash(&self, block_hash: &[u8]) -> Result<Option<HashDataValue>> {
        let tx = self.handle.db.begin_read()?;
        let hash_data = tx.open_table(schema::HASH_DATA)?;
        match hash_data.get(block_hash)? {
            Some(v) => Ok(Some(HashDataValue::decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Hash data with sub_counts keyed by source hash instead of id, for
    /// work that crosses databases with different id assignments.
    pub fn find_hash_sources(&self, block_hash: &[u8]) -> Result<Option<BlockEntry>> {
        let Some(row) = self.find_hash(block_hash)? else {
            return Ok(None);
        };
        let tx = self.handle.db.begin_read()?;
        let id_source = tx.open_table(schema::ID_SOURCE)?;
        let mut source_sub_counts = Vec::with_capacity(row.source_sub_counts.len());
        for &(id, sub_count) in &row.source_sub_counts {
            let file_hash = match id_source.get(id)? {
                Some(h) => h.value().to_vec(),
                None => return Err(anyhow!("source id {} has no source hash", id)),
            };
            source_sub_counts.push((file_hash, sub_count));
        }
        Ok(Some(BlockEntry {
            k_entropy: row.k_entropy,
            block_label: row.block_label,
            source_sub_counts,
        }))
    }

    /// The exact count: total sub_counts recorded for the block.
    pub fn find_hash_count(&self, block_hash: &[u8]) -> Result<u64> {
        Ok(self
            .find_hash(block_hash)?
            .map(|row| row.total_count())
            .unwrap_or(0))
    }

    /// Entry count of the prefix bucket; an upper bound on the number of
    /// recorded offsets, read without touching the hash data store.
    pub fn find_approximate_hash_count(&self, block_hash: &[u8]) -> Result<u64> {
        let suffix_len = self.handle.settings.hash_suffix_bytes as usize;
        let prefix = codec::hash_prefix(block_hash, self.handle.settings.hash_prefix_bits);
        let tx = self.handle.db.begin_read()?;
        let hash_store = tx.open_table(schema::HASH_STORE)?;
        match hash_store.get(prefix.as_slice())? {
            Some(v) => Ok((v.value().len() / (suffix_len + 16)) as u64),
            None => Ok(0),
        }
    }

    /// Source data row, if the source hash is known.
    pub fn find_source_data(&self, file_hash: &[u8]) -> Result<Option<SourceDataValue>> {
        let tx = self.handle.db.begin_read()?;
        let source_data = tx.open_table(schema::SOURCE_DATA)?;
        match source_data.get(file_hash)? {
            Some(v) => Ok(Some(SourceDataValue::decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// (repository_name, file_name) pairs in insertion order; empty when
    /// none are recorded.
    pub fn find_source_names(&self, file_hash: &[u8]) -> Result<Vec<(String, String)>> {
        let tx = self.handle.db.begin_read()?;
        let source_name = tx.open_table(schema::SOURCE_NAME)?;
        match source_name.get(file_hash)? {
            Some(v) => codec::unpack_name_pairs(v.value()),
            None => Ok(Vec::new()),
        }
    }

    /// Full expansion of a block hash, or the empty string when absent.
    pub fn find_expanded_hash_json(&self, block_hash: &[u8]) -> Result<String> {
        let Some(row) = self.find_hash(block_hash)? else {
            return Ok(String::new());
        };
        let block_hash_hex = hexutil::bin_to_hex(block_hash);

        let first_report = {
            let mut reported = lock(&self.reported_hashes)?;
            reported.insert(block_hash.to_vec())
        };
        if !first_report {
            return records::to_json(&ExpandedBlock {
                block_hash: block_hash_hex,
                entropy: None,
                block_label: None,
                source_list_id: None,
                sources: None,
                source_offset_pairs: None,
            });
        }

        let tx = self.handle.db.begin_read()?;
        let id_source = tx.open_table(schema::ID_SOURCE)?;
        let source_data = tx.open_table(schema::SOURCE_DATA)?;
        let source_name = tx.open_table(schema::SOURCE_NAME)?;
        let hash_store = tx.open_table(schema::HASH_STORE)?;

        // raw (source hash, offset) pairs from the prefix bucket
        let suffix_len = self.handle.settings.hash_suffix_bytes as usize;
        let prefix = codec::hash_prefix(block_hash, self.handle.settings.hash_prefix_bits);
        let suffix = codec::bucket_suffix(block_hash, self.handle.settings.hash_suffix_bytes);
        let mut offset_pairs: Vec<(Vec<u8>, u64)> = Vec::new();
        if let Some(v) = hash_store.get(prefix.as_slice())? {
            for entry in codec::unpack_offset_entries(v.value(), suffix_len)? {
                if entry.suffix == suffix {
                    let file_hash = match id_source.get(entry.source_id)? {
                        Some(h) => h.value().to_vec(),
                        None => {
                            return Err(anyhow!(
                                "source id {} has no source hash",
                                entry.source_id
                            ))
                        }
                    };
                    offset_pairs.push((file_hash, entry.file_offset));
                }
            }
        }
        offset_pairs.sort();

        // sources referenced by sub_counts or offsets, in hash order
        let mut source_hashes: BTreeSet<Vec<u8>> = BTreeSet::new();
        for &(id, _) in &row.source_sub_counts {
            match id_source.get(id)? {
                Some(h) => {
                    source_hashes.insert(h.value().to_vec());
                }
                None => return Err(anyhow!("source id {} has no source hash", id)),
            }
        }
        for (file_hash, _) in &offset_pairs {
            source_hashes.insert(file_hash.clone());
        }

        let mut crc = crc32fast::Hasher::new();
        for file_hash in &source_hashes {
            crc.update(file_hash);
        }

        let mut sources = Vec::new();
        {
            let mut reported = lock(&self.reported_sources)?;
            for file_hash in &source_hashes {
                if !reported.insert(file_hash.clone()) {
                    continue;
                }
                let data = match source_data.get(file_hash.as_slice())? {
                    Some(v) => SourceDataValue::decode(v.value())?,
                    None => SourceDataValue::default(),
                };
                let name_pairs = match source_name.get(file_hash.as_slice())? {
                    Some(v) => codec::unpack_name_pairs(v.value())?,
                    None => Vec::new(),
                };
                sources.push(ExpandedSource {
                    file_hash: hexutil::bin_to_hex(file_hash),
                    filesize: data.filesize,
                    file_type: data.file_type,
                    nonprobative_count: data.nonprobative_count,
                    name_pairs: flatten_name_pairs(name_pairs),
                });
            }
        }

        let mut pairs_json: Vec<Value> = Vec::with_capacity(offset_pairs.len() * 2);
        for (file_hash, file_offset) in &offset_pairs {
            pairs_json.push(Value::from(hexutil::bin_to_hex(file_hash)));
            pairs_json.push(Value::from(*file_offset));
        }

        records::to_json(&ExpandedBlock {
            block_hash: block_hash_hex,
            entropy: Some(row.k_entropy),
            block_label: Some(row.block_label),
            source_list_id: Some(crc.finalize()),
            sources: Some(sources),
            source_offset_pairs: Some(pairs_json),
        })
    }

    /// Canonical block record, or the empty string when absent.
    pub fn export_hash_json(&self, block_hash: &[u8]) -> Result<String> {
        let Some(row) = self.find_hash(block_hash)? else {
            return Ok(String::new());
        };
        let tx = self.handle.db.begin_read()?;
        let id_source = tx.open_table(schema::ID_SOURCE)?;

        let mut source_sub_counts: Vec<Value> =
            Vec::with_capacity(row.source_sub_counts.len() * 2);
        for &(id, sub_count) in &row.source_sub_counts {
            let file_hash = match id_source.get(id)? {
                Some(h) => h.value().to_vec(),
                None => return Err(anyhow!("source id {} has no source hash", id)),
            };
            source_sub_counts.push(Value::from(hexutil::bin_to_hex(&file_hash)));
            source_sub_counts.push(Value::from(sub_count));
        }
        records::to_json(&BlockRecord {
            block_hash: hexutil::bin_to_hex(block_hash),
            k_entropy: row.k_entropy,
            block_label: row.block_label,
            source_sub_counts,
        })
    }

    /// Canonical source record, or the empty string when the source hash
    /// has no id.
    pub fn export_source_json(&self, file_hash: &[u8]) -> Result<String> {
        let tx = self.handle.db.begin_read()?;
        let source_id = tx.open_table(schema::SOURCE_ID)?;
        if source_id.get(file_hash)?.is_none() {
            return Ok(String::new());
        }
        let source_data = tx.open_table(schema::SOURCE_DATA)?;
        let source_name = tx.open_table(schema::SOURCE_NAME)?;
        let data = match source_data.get(file_hash)? {
            Some(v) => SourceDataValue::decode(v.value())?,
            None => SourceDataValue::default(),
        };
        let name_pairs = match source_name.get(file_hash)? {
            Some(v) => codec::unpack_name_pairs(v.value())?,
            None => Vec::new(),
        };
        records::to_json(&SourceRecord {
            file_hash: hexutil::bin_to_hex(file_hash),
            filesize: data.filesize,
            file_type: data.file_type,
            zero_count: data.zero_count,
            nonprobative_count: data.nonprobative_count,
            name_pairs: flatten_name_pairs(name_pairs),
        })
    }

    /// First block hash in key order, empty when the database has none.
    pub fn first_hash(&self) -> Result<Vec<u8>> {
        self.first_key(schema::HASH_DATA)
    }

    /// Block hash after `prev` in key order, empty at the end.
    pub fn next_hash(&self, prev: &[u8]) -> Result<Vec<u8>> {
        self.next_key(schema::HASH_DATA, prev)
    }

    /// First source hash in key order, empty when the database has none.
    pub fn first_source(&self) -> Result<Vec<u8>> {
        self.first_key(schema::SOURCE_ID)
    }

    /// Source hash after `prev` in key order, empty at the end.
    pub fn next_source(&self, prev: &[u8]) -> Result<Vec<u8>> {
        self.next_key(schema::SOURCE_ID, prev)
    }

    /// Counts of the five stores as JSON.
    pub fn size(&self) -> Result<String> {
        db::store_sizes_json(&self.handle)
    }

    pub fn size_hashes(&self) -> Result<u64> {
        let tx = self.handle.db.begin_read()?;
        Ok(tx.open_table(schema::HASH_DATA)?.len()?)
    }

    pub fn size_sources(&self) -> Result<u64> {
        let tx = self.handle.db.begin_read()?;
        Ok(tx.open_table(schema::SOURCE_ID)?.len()?)
    }

    fn first_key<V: redb::Value + 'static>(
        &self,
        table: redb::TableDefinition<&'static [u8], V>,
    ) -> Result<Vec<u8>> {
        let tx = self.handle.db.begin_read()?;
        let t = tx.open_table(table)?;
        let first = t.iter()?.next();
        match first {
            Some(row) => {
                let (k, _) = row?;
                Ok(k.value().to_vec())
            }
            None => Ok(Vec::new()),
        }
    }

    fn next_key<V: redb::Value + 'static>(
        &self,
        table: redb::TableDefinition<&'static [u8], V>,
        prev: &[u8],
    ) -> Result<Vec<u8>> {
        let tx = self.handle.db.begin_read()?;
        let t = tx.open_table(table)?;
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Excluded(prev), Bound::Unbounded);
        let next = t.range::<&[u8]>(bounds)?.next();
        match next {
            Some(row) => {
                let (k, _) = row?;
                Ok(k.value().to_vec())
            }
            None => Ok(Vec::new()),
        }
    }
}

fn flatten_name_pairs(pairs: Vec<(String, String)>) -> Vec<String> {
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for (repository_name, file_name) in pairs {
        out.push(repository_name);
        out.push(file_name);
    }
    out
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("scan manager cache lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::ImportManager;

    /// Create a database and run the canonical insert sequence.
    fn seeded_db() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        db::create(&db_dir, &Settings::default(), "create").unwrap();
        let manager = ImportManager::open(&db_dir, "insert test data").unwrap();
        manager
            .insert_source_name(b"hhhhhhhh", "rn1", "fn1")
            .unwrap();
        manager
            .insert_source_data(b"hhhhhhhh", 100, "ft1", 0, 1)
            .unwrap();
        manager
            .insert_hash(b"hhhhhhhh", b"gggggggg", 512, 2, "block label")
            .unwrap();
        (dir, db_dir)
    }

    #[test]
    fn expanded_hash_single_insert() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        assert_eq!(
            scan.find_expanded_hash_json(b"hhhhhhhh").unwrap(),
            "{\"block_hash\":\"6868686868686868\",\"entropy\":2,\
             \"block_label\":\"block label\",\"source_list_id\":3724381083,\
             \"sources\":[{\"file_hash\":\"6767676767676767\",\"filesize\":0,\
             \"file_type\":\"\",\"nonprobative_count\":0,\"name_pairs\":[]}],\
             \"source_offset_pairs\":[\"6767676767676767\",512]}"
        );
    }

    #[test]
    fn expanded_hash_repeat_abbreviates() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        let _ = scan.find_expanded_hash_json(b"hhhhhhhh").unwrap();
        assert_eq!(
            scan.find_expanded_hash_json(b"hhhhhhhh").unwrap(),
            "{\"block_hash\":\"6868686868686868\"}"
        );
    }

    #[test]
    fn expanded_hash_absent_is_empty() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        assert_eq!(scan.find_expanded_hash_json(b"aaaaaaaa").unwrap(), "");
    }

    #[test]
    fn export_hash_canonical_record() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        assert_eq!(
            scan.export_hash_json(b"hhhhhhhh").unwrap(),
            "{\"block_hash\":\"6868686868686868\",\"k_entropy\":2,\
             \"block_label\":\"block label\",\
             \"source_sub_counts\":[\"6767676767676767\",1]}"
        );
        assert_eq!(scan.export_hash_json(b"aaaaaaaa").unwrap(), "");
    }

    #[test]
    fn export_source_canonical_record() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        assert_eq!(
            scan.export_source_json(b"gggggggg").unwrap(),
            "{\"file_hash\":\"6767676767676767\",\"filesize\":0,\"file_type\":\"\",\
             \"zero_count\":0,\"nonprobative_count\":0,\"name_pairs\":[]}"
        );
        assert_eq!(
            scan.export_source_json(b"hhhhhhhh").unwrap(),
            "{\"file_hash\":\"6868686868686868\",\"filesize\":100,\"file_type\":\"ft1\",\
             \"zero_count\":0,\"nonprobative_count\":1,\"name_pairs\":[\"rn1\",\"fn1\"]}"
        );
        assert_eq!(scan.export_source_json(b"absent!!").unwrap(), "");
    }

    #[test]
    fn counts() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        assert_eq!(scan.find_hash_count(b"hhhhhhhh").unwrap(), 1);
        assert_eq!(scan.find_approximate_hash_count(b"hhhhhhhh").unwrap(), 1);
        assert_eq!(scan.find_hash_count(b"aaaaaaaa").unwrap(), 0);
        assert_eq!(scan.find_approximate_hash_count(b"aaaaaaaa").unwrap(), 0);
    }

    #[test]
    fn source_data_lookup() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        let data = scan.find_source_data(b"hhhhhhhh").unwrap().unwrap();
        assert_eq!(data.filesize, 100);
        assert_eq!(data.file_type, "ft1");
        assert_eq!(data.nonprobative_count, 1);
        assert!(scan.find_source_data(b"absent!!").unwrap().is_none());
    }

    #[test]
    fn hash_iteration_in_key_order() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        let first = scan.first_hash().unwrap();
        assert_eq!(first, b"hhhhhhhh".to_vec());
        assert_eq!(scan.next_hash(&first).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn source_iteration_in_key_order() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        let first = scan.first_source().unwrap();
        assert_eq!(first, b"gggggggg".to_vec());
        let second = scan.next_source(&first).unwrap();
        assert_eq!(second, b"hhhhhhhh".to_vec());
        assert_eq!(scan.next_source(&second).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn sizes() {
        let (_tmp, db_dir) = seeded_db();
        let scan = ScanManager::open(&db_dir).unwrap();
        assert_eq!(scan.size_hashes().unwrap(), 1);
        assert_eq!(scan.size_sources().unwrap(), 2);
        assert_eq!(
            scan.size().unwrap(),
            "{\"hash_data_store\":1,\"hash_store\":1,\"source_data_store\":2,\
             \"source_id_store\":2,\"source_name_store\":1}"
        );
    }

    #[test]
    fn source_list_id_is_stable_per_source_set() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        db::create(&db_dir, &Settings::default(), "create").unwrap();
        let manager = ImportManager::open(&db_dir, "import").unwrap();
        for line in [
            "{\"block_hash\":\"2222222222222222\",\"k_entropy\":7,\"block_label\":\"bl1\",\"source_sub_counts\":[\"1111111111111111\",1]}",
            "{\"block_hash\":\"8899aabbccddeeff\",\"k_entropy\":8,\"block_label\":\"bl2\",\"source_sub_counts\":[\"0011223344556677\",2,\"0000000000000000\",1]}",
            "{\"block_hash\":\"ffffffffffffffff\",\"k_entropy\":9,\"block_label\":\"bl3\",\"source_sub_counts\":[\"0011223344556677\",1]}",
        ] {
            manager.import_json(line).unwrap();
        }
        drop(manager);

        let scan = ScanManager::open(&db_dir).unwrap();
        let e = scan
            .find_expanded_hash_json(&hexutil::hex_to_bin("2222222222222222"))
            .unwrap();
        assert!(e.contains("\"source_list_id\":1303964917"), "{}", e);
        let e = scan
            .find_expanded_hash_json(&hexutil::hex_to_bin("8899aabbccddeeff"))
            .unwrap();
        assert!(e.contains("\"source_list_id\":36745675"), "{}", e);
        let e = scan
            .find_expanded_hash_json(&hexutil::hex_to_bin("ffffffffffffffff"))
            .unwrap();
        assert!(e.contains("\"source_list_id\":2343118327"), "{}", e);

        // iteration walks the three hashes in key order
        let h1 = scan.first_hash().unwrap();
        assert_eq!(hexutil::bin_to_hex(&h1), "2222222222222222");
        let h2 = scan.next_hash(&h1).unwrap();
        assert_eq!(hexutil::bin_to_hex(&h2), "8899aabbccddeeff");
        let h3 = scan.next_hash(&h2).unwrap();
        assert_eq!(hexutil::bin_to_hex(&h3), "ffffffffffffffff");
        assert_eq!(scan.next_hash(&h3).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn empty_database_iterates_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        db::create(&db_dir, &Settings::default(), "create").unwrap();
        let scan = ScanManager::open(&db_dir).unwrap();
        assert_eq!(scan.first_hash().unwrap(), Vec::<u8>::new());
        assert_eq!(scan.first_source().unwrap(), Vec::<u8>::new());
        assert_eq!(scan.size_hashes().unwrap(), 0);
    }
}
