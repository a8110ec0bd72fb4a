use crate::dbdir::SETTINGS_FILE;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CURRENT_SETTINGS_VERSION: u32 = 3;

/// Database tuning options, written once at creation and immutable after.
///
/// Field order is the canonical key order of the printable form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub settings_version: u32,
    pub byte_alignment: u32,
    pub block_size: u32,
    pub max_source_offset_pairs: u32,
    pub hash_prefix_bits: u32,
    pub hash_suffix_bytes: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            settings_version: CURRENT_SETTINGS_VERSION,
            byte_alignment: 512,
            block_size: 512,
            max_source_offset_pairs: 100_000,
            hash_prefix_bits: 28,
            hash_suffix_bytes: 3,
        }
    }
}

impl Settings {
    pub fn settings_string(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize settings")
    }

    pub fn validate(&self) -> Result<()> {
        if self.settings_version != CURRENT_SETTINGS_VERSION {
            return Err(anyhow!(
                "settings version {} does not match supported version {}",
                self.settings_version,
                CURRENT_SETTINGS_VERSION
            ));
        }
        if self.byte_alignment == 0 {
            return Err(anyhow!("byte_alignment must not be 0"));
        }
        if self.hash_prefix_bits == 0 || self.hash_prefix_bits > 256 {
            return Err(anyhow!(
                "hash_prefix_bits {} out of range 1..=256",
                self.hash_prefix_bits
            ));
        }
        if self.hash_suffix_bytes == 0 || self.hash_suffix_bytes > 32 {
            return Err(anyhow!(
                "hash_suffix_bytes {} out of range 1..=32",
                self.hash_suffix_bytes
            ));
        }
        Ok(())
    }
}

pub fn write_settings(db_dir: &Path, settings: &Settings) -> Result<()> {
    let path = db_dir.join(SETTINGS_FILE);
    fs::write(&path, settings.settings_string()?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub fn read_settings(db_dir: &Path) -> Result<Settings> {
    let path = db_dir.join(SETTINGS_FILE);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let settings: Settings = serde_json::from_str(&text)
        .with_context(|| format!("Malformed settings in {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_string() {
        let s = Settings::default();
        assert_eq!(
            s.settings_string().unwrap(),
            "{\"settings_version\":3,\"byte_alignment\":512,\"block_size\":512,\
             \"max_source_offset_pairs\":100000,\"hash_prefix_bits\":28,\"hash_suffix_bytes\":3}"
        );
    }

    #[test]
    fn settings_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings {
            byte_alignment: 1,
            block_size: 2,
            max_source_offset_pairs: 3,
            hash_prefix_bits: 4,
            hash_suffix_bytes: 5,
            ..Settings::default()
        };
        write_settings(dir.path(), &s).unwrap();
        assert_eq!(read_settings(dir.path()).unwrap(), s);
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.settings_version = 2;
        // write bypasses validation; the read must reject it
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            serde_json::to_string(&s).unwrap(),
        )
        .unwrap();
        assert!(read_settings(dir.path()).is_err());
    }

    #[test]
    fn rejects_zero_alignment() {
        let mut s = Settings::default();
        s.byte_alignment = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_missing_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_settings(dir.path()).is_err());
    }
}
