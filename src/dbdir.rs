use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DB_FILE: &str = "index.redb";
pub const SETTINGS_FILE: &str = "settings.json";
pub const HISTORY_FILE: &str = "history";
pub const LOCK_FILE: &str = "LOCK";

/// Ensure the directory looks like an existing database.
pub fn ensure_db_dir_is_valid(db_dir: &Path) -> Result<()> {
    if !db_dir.is_dir() {
        return Err(anyhow!("Database directory {} does not exist", db_dir.display()));
    }
    let has_db = db_dir.join(DB_FILE).is_file();
    let has_settings = db_dir.join(SETTINGS_FILE).is_file();
    if !has_db || !has_settings {
        return Err(anyhow!(
            "Directory {} does not look like a database (expected {} and {})",
            db_dir.display(),
            SETTINGS_FILE,
            DB_FILE
        ));
    }
    Ok(())
}

/// Append a command line to the history log with a unix timestamp.
pub fn append_history(db_dir: &Path, command: &str) -> Result<()> {
    let path = db_dir.join(HISTORY_FILE);
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let secs = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };
    writeln!(f, "{} {}", secs, command)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_dir_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_db_dir_is_valid(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn dir_without_store_files_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_db_dir_is_valid(dir.path()).is_err());
    }

    #[test]
    fn history_appends() {
        let dir = tempfile::tempdir().unwrap();
        append_history(dir.path(), "create x").unwrap();
        append_history(dir.path(), "import x y").unwrap();
        let text = fs::read_to_string(dir.path().join(HISTORY_FILE)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" create x"));
        assert!(lines[1].ends_with(" import x y"));
    }
}
