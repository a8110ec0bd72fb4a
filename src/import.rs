use crate::codec::{self, HashDataValue, OffsetEntry, SourceDataValue};
use crate::db::{self, DbHandle};
use crate::hexutil;
use crate::records::{self, ParsedRecord};
use crate::schema;
use crate::settings::Settings;
use anyhow::{anyhow, Result};
use redb::{ReadableTable, Table};
use std::path::Path;

pub const MAX_HASH_BYTES: usize = 32;
pub const MIN_BLOCK_HASH_BYTES: usize = 4;
pub const MAX_LABEL_BYTES: usize = 200;
pub const MAX_NAME_BYTES: usize = 2000;

/// Write facade. Holds the exclusive database lease for its lifetime.
pub struct ImportManager {
    handle: DbHandle,
}

enum OffsetOutcome {
    Recorded,
    Discarded,
    Duplicate,
}

impl ImportManager {
    /// Open a database for modification. Fails while another writer holds it.
    pub fn open(db_dir: &Path, command: &str) -> Result<ImportManager> {
        let handle = db::open_rw(db_dir, command)?;
        Ok(ImportManager { handle })
    }

    pub fn settings(&self) -> &Settings {
        &self.handle.settings
    }

    /// Append the (repository_name, file_name) pair unless already present.
    pub fn insert_source_name(
        &self,
        file_hash: &[u8],
        repository_name: &str,
        file_name: &str,
    ) -> Result<()> {
        check_source_hash(file_hash)?;
        check_len(repository_name, MAX_NAME_BYTES, "repository_name")?;
        check_len(file_name, MAX_NAME_BYTES, "file_name")?;

        let tx = self.handle.db.begin_write()?;
        {
            let mut source_name = tx.open_table(schema::SOURCE_NAME)?;
            let mut pairs = match source_name.get(file_hash)? {
                Some(v) => codec::unpack_name_pairs(v.value())?,
                None => Vec::new(),
            };
            let pair = (repository_name.to_string(), file_name.to_string());
            if !pairs.contains(&pair) {
                pairs.push(pair);
                source_name.insert(file_hash, codec::pack_name_pairs(&pairs).as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Write or overwrite the source data row, allocating an id if needed.
    pub fn insert_source_data(
        &self,
        file_hash: &[u8],
        filesize: u64,
        file_type: &str,
        zero_count: u64,
        nonprobative_count: u64,
    ) -> Result<()> {
        check_source_hash(file_hash)?;
        check_len(file_type, MAX_LABEL_BYTES, "file_type")?;

        let tx = self.handle.db.begin_write()?;
        {
            let mut source_id = tx.open_table(schema::SOURCE_ID)?;
            let mut id_source = tx.open_table(schema::ID_SOURCE)?;
            let mut meta = tx.open_table(schema::META_U64)?;
            let mut source_data = tx.open_table(schema::SOURCE_DATA)?;

            get_or_create_source_id(
                &mut source_id,
                &mut id_source,
                &mut meta,
                &mut source_data,
                file_hash,
            )?;
            let row = SourceDataValue {
                filesize,
                file_type: file_type.to_string(),
                zero_count,
                nonprobative_count,
            };
            source_data.insert(file_hash, row.encode().as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The ingest write: record the (source, offset) occurrence of a block.
    ///
    /// Creates the hash data row if absent (first entropy and label win),
    /// records the distinct (id, offset) pair subject to the fan-out cap,
    /// and increments the source's sub_count. An exact duplicate pair
    /// changes nothing; a distinct pair past the cap is discarded but the
    /// sub_count still increments.
    pub fn insert_hash(
        &self,
        block_hash: &[u8],
        file_hash: &[u8],
        file_offset: u64,
        k_entropy: u64,
        block_label: &str,
    ) -> Result<()> {
        check_block_hash(block_hash)?;
        check_source_hash(file_hash)?;
        check_len(block_label, MAX_LABEL_BYTES, "block_label")?;
        self.check_alignment(file_offset)?;

        let settings = self.handle.settings;
        let tx = self.handle.db.begin_write()?;
        {
            let mut source_id = tx.open_table(schema::SOURCE_ID)?;
            let mut id_source = tx.open_table(schema::ID_SOURCE)?;
            let mut meta = tx.open_table(schema::META_U64)?;
            let mut source_data = tx.open_table(schema::SOURCE_DATA)?;
            let mut hash_data = tx.open_table(schema::HASH_DATA)?;
            let mut hash_store = tx.open_table(schema::HASH_STORE)?;

            let id = get_or_create_source_id(
                &mut source_id,
                &mut id_source,
                &mut meta,
                &mut source_data,
                file_hash,
            )?;

            let mut row = match hash_data.get(block_hash)? {
                Some(v) => HashDataValue::decode(v.value())?,
                None => HashDataValue {
                    k_entropy,
                    block_label: block_label.to_string(),
                    source_sub_counts: Vec::new(),
                },
            };

            let outcome =
                record_offset_entry(&mut hash_store, &settings, block_hash, id, file_offset)?;
            if !matches!(outcome, OffsetOutcome::Duplicate) {
                match row.source_sub_counts.iter_mut().find(|(i, _)| *i == id) {
                    Some((_, sub_count)) => *sub_count += 1,
                    None => row.source_sub_counts.push((id, 1)),
                }
            }
            hash_data.insert(block_hash, row.encode().as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The explicit-delta write: add `sub_count` for the source without
    /// touching offsets. Used by the JSON importer and the set-algebra
    /// driver; supplying the delta disables automatic incrementing.
    pub fn merge_hash(
        &self,
        block_hash: &[u8],
        k_entropy: u64,
        block_label: &str,
        file_hash: &[u8],
        sub_count: u64,
    ) -> Result<()> {
        check_block_hash(block_hash)?;
        check_source_hash(file_hash)?;
        check_len(block_label, MAX_LABEL_BYTES, "block_label")?;

        let tx = self.handle.db.begin_write()?;
        {
            let mut source_id = tx.open_table(schema::SOURCE_ID)?;
            let mut id_source = tx.open_table(schema::ID_SOURCE)?;
            let mut meta = tx.open_table(schema::META_U64)?;
            let mut source_data = tx.open_table(schema::SOURCE_DATA)?;
            let mut hash_data = tx.open_table(schema::HASH_DATA)?;

            let id = get_or_create_source_id(
                &mut source_id,
                &mut id_source,
                &mut meta,
                &mut source_data,
                file_hash,
            )?;

            let mut row = match hash_data.get(block_hash)? {
                Some(v) => HashDataValue::decode(v.value())?,
                None => HashDataValue {
                    k_entropy,
                    block_label: block_label.to_string(),
                    source_sub_counts: Vec::new(),
                },
            };
            match row.source_sub_counts.iter_mut().find(|(i, _)| *i == id) {
                Some((_, existing)) => *existing += sub_count,
                None => row.source_sub_counts.push((id, sub_count)),
            }
            hash_data.insert(block_hash, row.encode().as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record one (source, offset) pair for a block without changing any
    /// sub_count. The import path for explicit source_offset_pairs arrays.
    fn insert_hash_offset(
        &self,
        block_hash: &[u8],
        file_hash: &[u8],
        file_offset: u64,
        k_entropy: u64,
        block_label: &str,
    ) -> Result<()> {
        check_block_hash(block_hash)?;
        check_source_hash(file_hash)?;
        self.check_alignment(file_offset)?;

        let settings = self.handle.settings;
        let tx = self.handle.db.begin_write()?;
        {
            let mut source_id = tx.open_table(schema::SOURCE_ID)?;
            let mut id_source = tx.open_table(schema::ID_SOURCE)?;
            let mut meta = tx.open_table(schema::META_U64)?;
            let mut source_data = tx.open_table(schema::SOURCE_DATA)?;
            let mut hash_data = tx.open_table(schema::HASH_DATA)?;
            let mut hash_store = tx.open_table(schema::HASH_STORE)?;

            let id = get_or_create_source_id(
                &mut source_id,
                &mut id_source,
                &mut meta,
                &mut source_data,
                file_hash,
            )?;

            if hash_data.get(block_hash)?.is_none() {
                let row = HashDataValue {
                    k_entropy,
                    block_label: block_label.to_string(),
                    source_sub_counts: Vec::new(),
                };
                hash_data.insert(block_hash, row.encode().as_slice())?;
            }
            record_offset_entry(&mut hash_store, &settings, block_hash, id, file_offset)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Apply one JSON record line. Bad lines report an error without
    /// poisoning the session.
    pub fn import_json(&self, line: &str) -> Result<()> {
        match records::parse_record(line)? {
            ParsedRecord::Block(block) => {
                let block_hash = decode_hash(&block.block_hash, "block_hash")?;
                for (hex, sub_count) in records::hex_u64_pairs(&block.source_sub_counts)? {
                    let file_hash = decode_hash(&hex, "source hash")?;
                    self.merge_hash(
                        &block_hash,
                        block.k_entropy,
                        &block.block_label,
                        &file_hash,
                        sub_count,
                    )?;
                }
                for (hex, file_offset) in records::hex_u64_pairs(&block.source_offset_pairs)? {
                    let file_hash = decode_hash(&hex, "source hash")?;
                    self.insert_hash_offset(
                        &block_hash,
                        &file_hash,
                        file_offset,
                        block.k_entropy,
                        &block.block_label,
                    )?;
                }
                Ok(())
            }
            ParsedRecord::Source(source) => {
                let file_hash = decode_hash(&source.file_hash, "file_hash")?;
                self.insert_source_data(
                    &file_hash,
                    source.filesize,
                    &source.file_type,
                    source.zero_count,
                    source.nonprobative_count,
                )?;
                for (repository_name, file_name) in records::name_pairs(&source.name_pairs)? {
                    self.insert_source_name(&file_hash, &repository_name, &file_name)?;
                }
                Ok(())
            }
        }
    }

    /// Counts of the five stores as JSON.
    pub fn size(&self) -> Result<String> {
        db::store_sizes_json(&self.handle)
    }

    /// First source hash already in this database, empty when none.
    /// Lets a writer enumerate what it holds before merging into it.
    pub fn first_source(&self) -> Result<Vec<u8>> {
        let tx = self.handle.db.begin_read()?;
        let source_id = tx.open_table(schema::SOURCE_ID)?;
        let first = source_id.iter()?.next();
        match first {
            Some(row) => {
                let (k, _) = row?;
                Ok(k.value().to_vec())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Source hash after `prev` in key order, empty at the end.
    pub fn next_source(&self, prev: &[u8]) -> Result<Vec<u8>> {
        let tx = self.handle.db.begin_read()?;
        let source_id = tx.open_table(schema::SOURCE_ID)?;
        let bounds: (std::ops::Bound<&[u8]>, std::ops::Bound<&[u8]>) =
            (std::ops::Bound::Excluded(prev), std::ops::Bound::Unbounded);
        let next = source_id.range::<&[u8]>(bounds)?.next();
        match next {
            Some(row) => {
                let (k, _) = row?;
                Ok(k.value().to_vec())
            }
            None => Ok(Vec::new()),
        }
    }

    fn check_alignment(&self, file_offset: u64) -> Result<()> {
        let alignment = u64::from(self.handle.settings.byte_alignment);
        if file_offset % alignment != 0 {
            return Err(anyhow!(
                "file offset {} is not aligned to {}",
                file_offset,
                alignment
            ));
        }
        Ok(())
    }
}

fn record_offset_entry(
    hash_store: &mut Table<&'static [u8], &'static [u8]>,
    settings: &Settings,
    block_hash: &[u8],
    source_id: u64,
    file_offset: u64,
) -> Result<OffsetOutcome> {
    let prefix = codec::hash_prefix(block_hash, settings.hash_prefix_bits);
    let suffix = codec::bucket_suffix(block_hash, settings.hash_suffix_bytes);
    let suffix_len = settings.hash_suffix_bytes as usize;

    let mut entries = match hash_store.get(prefix.as_slice())? {
        Some(v) => codec::unpack_offset_entries(v.value(), suffix_len)?,
        None => Vec::new(),
    };

    let mut matching = 0u64;
    for e in &entries {
        if e.suffix == suffix {
            if e.source_id == source_id && e.file_offset == file_offset {
                return Ok(OffsetOutcome::Duplicate);
            }
            matching += 1;
        }
    }
    if matching >= u64::from(settings.max_source_offset_pairs) {
        return Ok(OffsetOutcome::Discarded);
    }

    entries.push(OffsetEntry {
        suffix,
        source_id,
        file_offset,
    });
    hash_store.insert(prefix.as_slice(), codec::pack_offset_entries(&entries).as_slice())?;
    Ok(OffsetOutcome::Recorded)
}

fn get_or_create_source_id<'t>(
    source_id: &mut Table<'t, &'static [u8], u64>,
    id_source: &mut Table<'t, u64, &'static [u8]>,
    meta: &mut Table<'t, &'static str, u64>,
    source_data: &mut Table<'t, &'static [u8], &'static [u8]>,
    file_hash: &[u8],
) -> Result<u64> {
    if let Some(v) = source_id.get(file_hash)? {
        return Ok(v.value());
    }
    let next = match meta.get(schema::KEY_NEXT_SOURCE_ID)? {
        Some(v) => v.value(),
        None => 1, // id 0 is reserved
    };
    meta.insert(schema::KEY_NEXT_SOURCE_ID, next + 1)?;
    source_id.insert(file_hash, next)?;
    id_source.insert(next, file_hash)?;
    // every allocated id gets a source data row, default until written
    if source_data.get(file_hash)?.is_none() {
        source_data.insert(file_hash, SourceDataValue::default().encode().as_slice())?;
    }
    Ok(next)
}

fn check_block_hash(hash: &[u8]) -> Result<()> {
    if hash.len() < MIN_BLOCK_HASH_BYTES || hash.len() > MAX_HASH_BYTES {
        return Err(anyhow!(
            "block hash width {} is out of range {}..={}",
            hash.len(),
            MIN_BLOCK_HASH_BYTES,
            MAX_HASH_BYTES
        ));
    }
    Ok(())
}

fn check_source_hash(hash: &[u8]) -> Result<()> {
    if hash.is_empty() || hash.len() > MAX_HASH_BYTES {
        return Err(anyhow!(
            "source hash width {} is out of range 1..={}",
            hash.len(),
            MAX_HASH_BYTES
        ));
    }
    Ok(())
}

fn check_len(s: &str, max: usize, what: &str) -> Result<()> {
    if s.len() > max {
        return Err(anyhow!("{} is too long: {} bytes (max {})", what, s.len(), max));
    }
    Ok(())
}

fn decode_hash(hex: &str, what: &str) -> Result<Vec<u8>> {
    let bytes = hexutil::hex_to_bin(hex);
    if bytes.is_empty() {
        return Err(anyhow!("invalid {} hex: '{}'", what, hex));
    }
    Ok(bytes)
}
