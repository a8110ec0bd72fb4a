use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical block record, one line of an export file.
/// `source_sub_counts` alternates source hash hex and sub_count.
#[derive(Debug, Serialize)]
pub struct BlockRecord {
    pub block_hash: String,
    pub k_entropy: u64,
    pub block_label: String,
    pub source_sub_counts: Vec<Value>,
}

/// Canonical source record, one line of an export file.
/// `name_pairs` alternates repository_name and file_name.
#[derive(Debug, Serialize)]
pub struct SourceRecord {
    pub file_hash: String,
    pub filesize: u64,
    pub file_type: String,
    pub zero_count: u64,
    pub nonprobative_count: u64,
    pub name_pairs: Vec<String>,
}

/// A source embedded in scan output. Leaner than the canonical record.
#[derive(Debug, Serialize)]
pub struct ExpandedSource {
    pub file_hash: String,
    pub filesize: u64,
    pub file_type: String,
    pub nonprobative_count: u64,
    pub name_pairs: Vec<String>,
}

/// Scan expansion of one block hash. A hash this manager already reported
/// carries the `block_hash` field alone.
#[derive(Debug, Serialize)]
pub struct ExpandedBlock {
    pub block_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entropy: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_list_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<ExpandedSource>>,
    /// Alternates source hash hex and file offset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_offset_pairs: Option<Vec<Value>>,
}

#[derive(Debug, Serialize)]
pub struct CountRecord {
    pub block_hash: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct ApproximateCountRecord {
    pub block_hash: String,
    pub approximate_count: u64,
}

/// Store sizes, the payload of `size()`.
#[derive(Debug, Serialize)]
pub struct StoreSizes {
    pub hash_data_store: u64,
    pub hash_store: u64,
    pub source_data_store: u64,
    pub source_id_store: u64,
    pub source_name_store: u64,
}

pub fn to_json<T: Serialize>(record: &T) -> Result<String> {
    serde_json::to_string(record).context("Failed to serialize record")
}

/// Incoming block record. Either array may be absent.
#[derive(Debug, Deserialize)]
pub struct BlockRecordIn {
    pub block_hash: String,
    #[serde(default)]
    pub k_entropy: u64,
    #[serde(default)]
    pub block_label: String,
    #[serde(default)]
    pub source_sub_counts: Vec<Value>,
    #[serde(default)]
    pub source_offset_pairs: Vec<Value>,
}

/// Incoming source record.
#[derive(Debug, Deserialize)]
pub struct SourceRecordIn {
    pub file_hash: String,
    #[serde(default)]
    pub filesize: u64,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub zero_count: u64,
    #[serde(default)]
    pub nonprobative_count: u64,
    #[serde(default)]
    pub name_pairs: Vec<String>,
}

#[derive(Debug)]
pub enum ParsedRecord {
    Block(BlockRecordIn),
    Source(SourceRecordIn),
}

/// Parse one import line into a block or source record.
pub fn parse_record(line: &str) -> Result<ParsedRecord> {
    let value: Value =
        serde_json::from_str(line).with_context(|| format!("Malformed JSON record: {}", line))?;
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("JSON record is not an object: {}", line))?;
    if object.contains_key("block_hash") {
        let record: BlockRecordIn = serde_json::from_value(value.clone())
            .with_context(|| format!("Malformed block record: {}", line))?;
        Ok(ParsedRecord::Block(record))
    } else if object.contains_key("file_hash") {
        let record: SourceRecordIn = serde_json::from_value(value.clone())
            .with_context(|| format!("Malformed source record: {}", line))?;
        Ok(ParsedRecord::Source(record))
    } else {
        Err(anyhow!("JSON record is neither block nor source: {}", line))
    }
}

/// Split an alternating [hex, number, hex, number, ...] array into pairs.
pub fn hex_u64_pairs(values: &[Value]) -> Result<Vec<(String, u64)>> {
    if values.len() % 2 != 0 {
        return Err(anyhow!("pair array has odd length {}", values.len()));
    }
    let mut out = Vec::with_capacity(values.len() / 2);
    for chunk in values.chunks(2) {
        let hex = chunk[0]
            .as_str()
            .ok_or_else(|| anyhow!("pair array entry is not a hex string"))?;
        let n = chunk[1]
            .as_u64()
            .ok_or_else(|| anyhow!("pair array entry is not an unsigned number"))?;
        out.push((hex.to_string(), n));
    }
    Ok(out)
}

/// Split a flat [repo, name, repo, name, ...] array into pairs.
pub fn name_pairs(values: &[String]) -> Result<Vec<(String, String)>> {
    if values.len() % 2 != 0 {
        return Err(anyhow!("name_pairs array has odd length {}", values.len()));
    }
    Ok(values
        .chunks(2)
        .map(|c| (c[0].clone(), c[1].clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_record_canonical_order() {
        let rec = BlockRecord {
            block_hash: "2222222222222222".to_string(),
            k_entropy: 1,
            block_label: "bl1".to_string(),
            source_sub_counts: vec![Value::from("11"), Value::from(1u64)],
        };
        assert_eq!(
            to_json(&rec).unwrap(),
            "{\"block_hash\":\"2222222222222222\",\"k_entropy\":1,\
             \"block_label\":\"bl1\",\"source_sub_counts\":[\"11\",1]}"
        );
    }

    #[test]
    fn source_record_canonical_order() {
        let rec = SourceRecord {
            file_hash: "11".to_string(),
            filesize: 1,
            file_type: "A".to_string(),
            zero_count: 11,
            nonprobative_count: 1,
            name_pairs: vec!["r1".to_string(), "f1".to_string()],
        };
        assert_eq!(
            to_json(&rec).unwrap(),
            "{\"file_hash\":\"11\",\"filesize\":1,\"file_type\":\"A\",\
             \"zero_count\":11,\"nonprobative_count\":1,\"name_pairs\":[\"r1\",\"f1\"]}"
        );
    }

    #[test]
    fn abbreviated_expansion_is_block_hash_only() {
        let rec = ExpandedBlock {
            block_hash: "6868686868686868".to_string(),
            entropy: None,
            block_label: None,
            source_list_id: None,
            sources: None,
            source_offset_pairs: None,
        };
        assert_eq!(
            to_json(&rec).unwrap(),
            "{\"block_hash\":\"6868686868686868\"}"
        );
    }

    #[test]
    fn parse_block_record() {
        let line = "{\"block_hash\":\"2222222222222222\",\"k_entropy\":2,\
                    \"block_label\":\"bl2\",\"source_sub_counts\":[\"11\",1,\"22\",2]}";
        match parse_record(line).unwrap() {
            ParsedRecord::Block(b) => {
                assert_eq!(b.block_hash, "2222222222222222");
                assert_eq!(b.k_entropy, 2);
                assert_eq!(
                    hex_u64_pairs(&b.source_sub_counts).unwrap(),
                    vec![("11".to_string(), 1), ("22".to_string(), 2)]
                );
                assert!(b.source_offset_pairs.is_empty());
            }
            other => panic!("expected block record, got {:?}", other),
        }
    }

    #[test]
    fn parse_source_record() {
        let line = "{\"file_hash\":\"22\",\"filesize\":2,\"file_type\":\"B\",\
                    \"zero_count\":12,\"nonprobative_count\":2,\"name_pairs\":[\"r2\",\"f2\"]}";
        match parse_record(line).unwrap() {
            ParsedRecord::Source(s) => {
                assert_eq!(s.file_hash, "22");
                assert_eq!(s.zero_count, 12);
                assert_eq!(
                    name_pairs(&s.name_pairs).unwrap(),
                    vec![("r2".to_string(), "f2".to_string())]
                );
            }
            other => panic!("expected source record, got {:?}", other),
        }
    }

    #[test]
    fn parse_rejects_unknown_shape() {
        assert!(parse_record("{\"neither\":1}").is_err());
        assert!(parse_record("not json").is_err());
        assert!(parse_record("[1,2]").is_err());
    }

    #[test]
    fn pair_helpers_reject_odd_lengths() {
        assert!(hex_u64_pairs(&[Value::from("11")]).is_err());
        assert!(name_pairs(&["r1".to_string()]).is_err());
    }
}
