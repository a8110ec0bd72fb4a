use crate::hexutil;
use crate::records::{self, ApproximateCountRecord, CountRecord};
use crate::scan::ScanManager;
use anyhow::{anyhow, Result};
use std::io::{Read, Write};

/// Query run for each stream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    ExpandedHash,
    HashCount,
    ApproximateHashCount,
}

/// Result framing. Binary results carry no trailing newline and no length
/// prefix; downstream framing is the consumer's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    TextOutput,
    BinaryOutput,
}

impl ScanManager {
    /// Scan fixed-width records from `input` and write results to `output`.
    ///
    /// Each record is `hash_size` bytes of block hash followed by
    /// `metadata_size` bytes echoed verbatim into the result. An all-zero
    /// hash terminates the scan cleanly. Lookup misses emit nothing. A
    /// trailing partial record flushes the completed results and fails.
    /// One pass, no seeking; closing `input` ends the scan at the next
    /// record boundary.
    pub fn scan_stream(
        &self,
        input: &mut dyn Read,
        output: &mut dyn Write,
        hash_size: usize,
        metadata_size: usize,
        mode: ScanMode,
        format: OutputFormat,
    ) -> Result<()> {
        if hash_size == 0 {
            return Err(anyhow!("scan stream hash size must not be 0"));
        }
        let record_size = hash_size + metadata_size;
        let mut record = vec![0u8; record_size];

        loop {
            let filled = fill_record(input, &mut record)?;
            if filled == 0 {
                output.flush()?;
                return Ok(());
            }
            if filled < record_size {
                output.flush()?;
                return Err(anyhow!(
                    "unexpected input size {} is not {} in scan stream",
                    filled,
                    record_size
                ));
            }

            let (block_hash, metadata) = record.split_at(hash_size);
            if block_hash.iter().all(|&b| b == 0) {
                output.flush()?;
                return Ok(());
            }

            if let Some(json) = self.scan_record(block_hash, mode)? {
                match format {
                    OutputFormat::TextOutput => {
                        writeln!(output, "{}{}", hexutil::bin_to_hex(metadata), json)?;
                    }
                    OutputFormat::BinaryOutput => {
                        output.write_all(metadata)?;
                        output.write_all(json.as_bytes())?;
                    }
                }
            }
        }
    }

    fn scan_record(&self, block_hash: &[u8], mode: ScanMode) -> Result<Option<String>> {
        match mode {
            ScanMode::ExpandedHash => {
                let json = self.find_expanded_hash_json(block_hash)?;
                Ok(if json.is_empty() { None } else { Some(json) })
            }
            ScanMode::HashCount => {
                let count = self.find_hash_count(block_hash)?;
                if count == 0 {
                    return Ok(None);
                }
                Ok(Some(records::to_json(&CountRecord {
                    block_hash: hexutil::bin_to_hex(block_hash),
                    count,
                })?))
            }
            ScanMode::ApproximateHashCount => {
                let approximate_count = self.find_approximate_hash_count(block_hash)?;
                if approximate_count == 0 {
                    return Ok(None);
                }
                Ok(Some(records::to_json(&ApproximateCountRecord {
                    block_hash: hexutil::bin_to_hex(block_hash),
                    approximate_count,
                })?))
            }
        }
    }
}

/// Fill the record buffer, returning how many bytes arrived before EOF.
fn fill_record(input: &mut dyn Read, record: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < record.len() {
        let n = input.read(&mut record[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::import::ImportManager;
    use crate::settings::Settings;
    use std::io::Cursor;

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

    /// pack('8sQ', hash, 1)
    fn record(hash: &[u8; 8]) -> Vec<u8> {
        let mut out = hash.to_vec();
        out.extend_from_slice(&1u64.to_le_bytes());
        out
    }

    #[test]
    fn text_scan_to_eof() {
        let (_tmp, db_dir) = seeded_db();
        let scan = crate::scan::ScanManager::open(&db_dir).unwrap();
        // the manager has already reported this hash, so the stream result
        // shrinks to the bare block_hash form
        let _ = scan.find_expanded_hash_json(b"hhhhhhhh").unwrap();

        let mut input = Vec::new();
        input.extend_from_slice(&record(b"aaaaaaaa"));
        input.extend_from_slice(&record(b"hhhhhhhh"));
        let mut output = Vec::new();
        scan.scan_stream(
            &mut Cursor::new(input),
            &mut output,
            8,
            8,
            ScanMode::ExpandedHash,
            OutputFormat::TextOutput,
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "0100000000000000{\"block_hash\":\"6868686868686868\"}\n"
        );
    }

    #[test]
    fn first_expansion_is_full() {
        let (_tmp, db_dir) = seeded_db();
        let scan = crate::scan::ScanManager::open(&db_dir).unwrap();
        let mut input = record(b"hhhhhhhh");
        input.extend_from_slice(&record(b"hhhhhhhh"));
        let mut output = Vec::new();
        scan.scan_stream(
            &mut Cursor::new(input),
            &mut output,
            8,
            8,
            ScanMode::ExpandedHash,
            OutputFormat::TextOutput,
        )
        .unwrap();
        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"source_list_id\":3724381083"), "{}", lines[0]);
        assert_eq!(lines[1], "0100000000000000{\"block_hash\":\"6868686868686868\"}");
    }

    #[test]
    fn hash_count_mode() {
        let (_tmp, db_dir) = seeded_db();
        let scan = crate::scan::ScanManager::open(&db_dir).unwrap();
        let mut input = Vec::new();
        input.extend_from_slice(&record(b"aaaaaaaa"));
        input.extend_from_slice(&record(b"hhhhhhhh"));
        let mut output = Vec::new();
        scan.scan_stream(
            &mut Cursor::new(input),
            &mut output,
            8,
            8,
            ScanMode::HashCount,
            OutputFormat::TextOutput,
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "0100000000000000{\"block_hash\":\"6868686868686868\",\"count\":1}\n"
        );
    }

    #[test]
    fn approximate_hash_count_mode() {
        let (_tmp, db_dir) = seeded_db();
        let scan = crate::scan::ScanManager::open(&db_dir).unwrap();
        let mut input = Vec::new();
        input.extend_from_slice(&record(b"aaaaaaaa"));
        input.extend_from_slice(&record(b"hhhhhhhh"));
        let mut output = Vec::new();
        scan.scan_stream(
            &mut Cursor::new(input),
            &mut output,
            8,
            8,
            ScanMode::ApproximateHashCount,
            OutputFormat::TextOutput,
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "0100000000000000{\"block_hash\":\"6868686868686868\",\"approximate_count\":1}\n"
        );
    }

    #[test]
    fn zero_hash_terminates_cleanly() {
        let (_tmp, db_dir) = seeded_db();
        let scan = crate::scan::ScanManager::open(&db_dir).unwrap();
        let mut input = record(&[0u8; 8]);
        input.extend_from_slice(&record(b"hhhhhhhh"));
        let mut output = Vec::new();
        scan.scan_stream(
            &mut Cursor::new(input),
            &mut output,
            8,
            8,
            ScanMode::ExpandedHash,
            OutputFormat::TextOutput,
        )
        .unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn trailing_partial_record_fails_after_flush() {
        let (_tmp, db_dir) = seeded_db();
        let scan = crate::scan::ScanManager::open(&db_dir).unwrap();
        let _ = scan.find_expanded_hash_json(b"hhhhhhhh").unwrap();

        let mut input = Vec::new();
        input.extend_from_slice(&record(b"aaaaaaaa"));
        input.extend_from_slice(&record(b"hhhhhhhh"));
        input.push(0x00);
        let mut output = Vec::new();
        let err = scan
            .scan_stream(
                &mut Cursor::new(input),
                &mut output,
                8,
                8,
                ScanMode::ExpandedHash,
                OutputFormat::TextOutput,
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected input size 1 is not 16 in scan stream"
        );
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "0100000000000000{\"block_hash\":\"6868686868686868\"}\n"
        );
    }

    #[test]
    fn binary_output_has_no_framing() {
        let (_tmp, db_dir) = seeded_db();
        let scan = crate::scan::ScanManager::open(&db_dir).unwrap();
        let _ = scan.find_expanded_hash_json(b"hhhhhhhh").unwrap();

        let input = record(b"hhhhhhhh");
        let mut output = Vec::new();
        scan.scan_stream(
            &mut Cursor::new(input),
            &mut output,
            8,
            8,
            ScanMode::ExpandedHash,
            OutputFormat::BinaryOutput,
        )
        .unwrap();
        let mut expected = 1u64.to_le_bytes().to_vec();
        expected.extend_from_slice(b"{\"block_hash\":\"6868686868686868\"}");
        assert_eq!(output, expected);
    }
}
