use crate::dbdir::{self, DB_FILE, LOCK_FILE};
use crate::settings::{self, Settings};
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use redb::Database;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

pub struct DbHandle {
    pub db_dir: PathBuf,
    pub db: Database,
    pub settings: Settings,
    // Keep the lock file open for the lifetime of DbHandle, so the lock is held.
    _lock_file: File,
}

/// Create a new database directory. The path must not exist yet.
pub fn create(db_dir: &Path, settings: &Settings, command: &str) -> Result<()> {
    settings.validate()?;
    if db_dir.exists() {
        return Err(anyhow!("Path {} already exists", db_dir.display()));
    }
    fs::create_dir(db_dir)
        .with_context(|| format!("Failed to create {}", db_dir.display()))?;

    settings::write_settings(db_dir, settings)?;
    dbdir::append_history(db_dir, command)?;

    let db_file_path = db_dir.join(DB_FILE);
    let db = Database::create(&db_file_path)
        .with_context(|| format!("Failed to initialize {}", db_file_path.display()))?;
    ensure_schema(&db)?;
    Ok(())
}

/// Open an existing database for exclusive modification.
pub fn open_rw(db_dir: &Path, command: &str) -> Result<DbHandle> {
    dbdir::ensure_db_dir_is_valid(db_dir)?;
    let lock_file = open_lock_file(db_dir)?;
    lock_file.try_lock_exclusive().with_context(|| {
        format!("Database is locked by another writer: {}", db_dir.display())
    })?;

    let settings = settings::read_settings(db_dir)?;
    let db_file_path = db_dir.join(DB_FILE);
    let db = Database::create(&db_file_path)
        .with_context(|| format!("Failed to open {}", db_file_path.display()))?;
    ensure_schema(&db)?;
    dbdir::append_history(db_dir, command)?;

    Ok(DbHandle {
        db_dir: db_dir.to_path_buf(),
        db,
        settings,
        _lock_file: lock_file,
    })
}

/// Open an existing database shared, for reading.
pub fn open_ro(db_dir: &Path) -> Result<DbHandle> {
    dbdir::ensure_db_dir_is_valid(db_dir)?;
    let lock_file = open_lock_file(db_dir)?;
    lock_file
        .try_lock_shared()
        .with_context(|| format!("Database is locked for writing: {}", db_dir.display()))?;

    let settings = settings::read_settings(db_dir)?;
    let db_file_path = db_dir.join(DB_FILE);
    let db = Database::open(&db_file_path)
        .with_context(|| format!("Failed to open {}", db_file_path.display()))?;

    Ok(DbHandle {
        db_dir: db_dir.to_path_buf(),
        db,
        settings,
        _lock_file: lock_file,
    })
}

fn open_lock_file(db_dir: &Path) -> Result<File> {
    let lock_path = db_dir.join(LOCK_FILE);
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file {}", lock_path.display()))
}

/// Counts of the five stores as JSON. hash_store and source_name count
/// entries (offset entries, name pairs); the others count keys.
pub fn store_sizes_json(handle: &DbHandle) -> Result<String> {
    use redb::{ReadableTable, ReadableTableMetadata};

    let suffix_len = handle.settings.hash_suffix_bytes as usize;
    let tx = handle.db.begin_read()?;

    let hash_data = tx.open_table(crate::schema::HASH_DATA)?;
    let source_data = tx.open_table(crate::schema::SOURCE_DATA)?;
    let source_id = tx.open_table(crate::schema::SOURCE_ID)?;

    let hash_store = tx.open_table(crate::schema::HASH_STORE)?;
    let mut offset_entries: u64 = 0;
    for bucket in hash_store.iter()? {
        let (_, v) = bucket?;
        offset_entries += (v.value().len() / (suffix_len + 16)) as u64;
    }

    let source_name = tx.open_table(crate::schema::SOURCE_NAME)?;
    let mut name_pair_count: u64 = 0;
    for row in source_name.iter()? {
        let (_, v) = row?;
        name_pair_count += crate::codec::unpack_name_pairs(v.value())?.len() as u64;
    }

    crate::records::to_json(&crate::records::StoreSizes {
        hash_data_store: hash_data.len()?,
        hash_store: offset_entries,
        source_data_store: source_data.len()?,
        source_id_store: source_id.len()?,
        source_name_store: name_pair_count,
    })
}

fn ensure_schema(db: &Database) -> Result<()> {
    let tx = db.begin_write().context("begin_write() failed")?;
    {
        let _ = tx.open_table(crate::schema::SOURCE_ID)?;
        let _ = tx.open_table(crate::schema::ID_SOURCE)?;
        let _ = tx.open_table(crate::schema::META_U64)?;
        let _ = tx.open_table(crate::schema::SOURCE_DATA)?;
        let _ = tx.open_table(crate::schema::SOURCE_NAME)?;
        let _ = tx.open_table(crate::schema::HASH_DATA)?;
        let _ = tx.open_table(crate::schema::HASH_STORE)?;
    }
    tx.commit().context("commit() failed")?;
    Ok(())
}
