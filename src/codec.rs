use anyhow::{anyhow, Result};

/// Per-source metadata stored in the source-data store.
///
/// Encoding details are hidden behind encode()/decode().
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDataValue {
    pub filesize: u64,
    pub file_type: String,
    pub zero_count: u64,
    pub nonprobative_count: u64,
}

impl SourceDataValue {
    /// Format v1:
    /// [0]      u8  version = 1
    /// [1..9]   u64 filesize LE
    /// [9..17]  u64 zero_count LE
    /// [17..25] u64 nonprobative_count LE
    /// [25..29] u32 file_type length LE
    /// [29..]   file_type bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(29 + self.file_type.len());
        out.push(1u8);
        out.extend_from_slice(&self.filesize.to_le_bytes());
        out.extend_from_slice(&self.zero_count.to_le_bytes());
        out.extend_from_slice(&self.nonprobative_count.to_le_bytes());
        put_str(&mut out, &self.file_type);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut at = 0;
        let version = take_u8(bytes, &mut at)?;
        if version != 1 {
            return Err(anyhow!("unknown source data version: {}", version));
        }
        let filesize = take_u64(bytes, &mut at)?;
        let zero_count = take_u64(bytes, &mut at)?;
        let nonprobative_count = take_u64(bytes, &mut at)?;
        let file_type = take_str(bytes, &mut at)?;
        Ok(Self {
            filesize,
            file_type,
            zero_count,
            nonprobative_count,
        })
    }
}

/// Per-block metadata stored in the hash-data store.
///
/// `source_sub_counts` keeps (source_id, sub_count) pairs in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashDataValue {
    pub k_entropy: u64,
    pub block_label: String,
    pub source_sub_counts: Vec<(u64, u64)>,
}

impl HashDataValue {
    /// Format v1:
    /// [0]      u8  version = 1
    /// [1..9]   u64 k_entropy LE
    /// [9..13]  u32 block_label length LE
    /// [..]     block_label bytes
    /// [..+4]   u32 pair count LE
    /// [..]     (u64 source_id LE, u64 sub_count LE) pairs
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(17 + self.block_label.len() + self.source_sub_counts.len() * 16);
        out.push(1u8);
        out.extend_from_slice(&self.k_entropy.to_le_bytes());
        put_str(&mut out, &self.block_label);
        out.extend_from_slice(&(self.source_sub_counts.len() as u32).to_le_bytes());
        for &(id, sub_count) in &self.source_sub_counts {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&sub_count.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut at = 0;
        let version = take_u8(bytes, &mut at)?;
        if version != 1 {
            return Err(anyhow!("unknown hash data version: {}", version));
        }
        let k_entropy = take_u64(bytes, &mut at)?;
        let block_label = take_str(bytes, &mut at)?;
        let count = take_u32(bytes, &mut at)? as usize;
        let mut source_sub_counts = Vec::with_capacity(count);
        for _ in 0..count {
            let id = take_u64(bytes, &mut at)?;
            let sub_count = take_u64(bytes, &mut at)?;
            source_sub_counts.push((id, sub_count));
        }
        Ok(Self {
            k_entropy,
            block_label,
            source_sub_counts,
        })
    }

    /// Total count over all sources, the exact per-block count.
    pub fn total_count(&self) -> u64 {
        self.source_sub_counts.iter().map(|&(_, c)| c).sum()
    }
}

/// One (source_id, file_offset) entry inside a hash-store prefix bucket,
/// tagged with the trailing bytes of the full block hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetEntry {
    pub suffix: Vec<u8>,
    pub source_id: u64,
    pub file_offset: u64,
}

/// Bucket entries are fixed width: suffix_len + 16 bytes each.
pub fn pack_offset_entries(entries: &[OffsetEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        out.extend_from_slice(&e.suffix);
        out.extend_from_slice(&e.source_id.to_le_bytes());
        out.extend_from_slice(&e.file_offset.to_le_bytes());
    }
    out
}

pub fn unpack_offset_entries(bytes: &[u8], suffix_len: usize) -> Result<Vec<OffsetEntry>> {
    let entry_len = suffix_len + 16;
    if bytes.len() % entry_len != 0 {
        return Err(anyhow!(
            "hash store bucket size {} is not a multiple of {}",
            bytes.len(),
            entry_len
        ));
    }
    let mut out = Vec::with_capacity(bytes.len() / entry_len);
    let mut at = 0;
    while at < bytes.len() {
        let suffix = bytes[at..at + suffix_len].to_vec();
        at += suffix_len;
        let source_id = take_u64(bytes, &mut at)?;
        let file_offset = take_u64(bytes, &mut at)?;
        out.push(OffsetEntry {
            suffix,
            source_id,
            file_offset,
        });
    }
    Ok(out)
}

/// Pack (repository_name, file_name) pairs, preserving order.
pub fn pack_name_pairs(pairs: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for (repository_name, file_name) in pairs {
        put_str(&mut out, repository_name);
        put_str(&mut out, file_name);
    }
    out
}

pub fn unpack_name_pairs(bytes: &[u8]) -> Result<Vec<(String, String)>> {
    let mut at = 0;
    let count = take_u32(bytes, &mut at)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let repository_name = take_str(bytes, &mut at)?;
        let file_name = take_str(bytes, &mut at)?;
        out.push((repository_name, file_name));
    }
    Ok(out)
}

/// Leading `bits` bits of the hash, packed into whole bytes with the unused
/// low bits of the final byte masked off.
pub fn hash_prefix(hash: &[u8], bits: u32) -> Vec<u8> {
    let bits = (bits as usize).min(hash.len() * 8);
    let full = bits / 8;
    let rem = bits % 8;
    let mut out = hash[..full + usize::from(rem != 0)].to_vec();
    if rem != 0 {
        let last = out.len() - 1;
        out[last] &= 0xffu8 << (8 - rem);
    }
    out
}

/// Trailing suffix bytes of the hash, zero-padded in front when the hash is
/// shorter, so bucket entries stay fixed width.
pub fn bucket_suffix(hash: &[u8], suffix_bytes: u32) -> Vec<u8> {
    let n = suffix_bytes as usize;
    let take = n.min(hash.len());
    let mut out = vec![0u8; n - take];
    out.extend_from_slice(&hash[hash.len() - take..]);
    out
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn take_u8(bytes: &[u8], at: &mut usize) -> Result<u8> {
    if *at + 1 > bytes.len() {
        return Err(anyhow!("value blob too short: {} bytes", bytes.len()));
    }
    let v = bytes[*at];
    *at += 1;
    Ok(v)
}

fn take_u32(bytes: &[u8], at: &mut usize) -> Result<u32> {
    if *at + 4 > bytes.len() {
        return Err(anyhow!("value blob too short: {} bytes", bytes.len()));
    }
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[*at..*at + 4]);
    *at += 4;
    Ok(u32::from_le_bytes(arr))
}

fn take_u64(bytes: &[u8], at: &mut usize) -> Result<u64> {
    if *at + 8 > bytes.len() {
        return Err(anyhow!("value blob too short: {} bytes", bytes.len()));
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[*at..*at + 8]);
    *at += 8;
    Ok(u64::from_le_bytes(arr))
}

fn take_str(bytes: &[u8], at: &mut usize) -> Result<String> {
    let len = take_u32(bytes, at)? as usize;
    if *at + len > bytes.len() {
        return Err(anyhow!("value blob too short: {} bytes", bytes.len()));
    }
    let s = std::str::from_utf8(&bytes[*at..*at + len])
        .map_err(|e| anyhow!("value blob holds invalid utf-8: {}", e))?
        .to_string();
    *at += len;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_data_round_trip() {
        let v = SourceDataValue {
            filesize: 1234,
            file_type: "exe".to_string(),
            zero_count: 5,
            nonprobative_count: 7,
        };
        assert_eq!(SourceDataValue::decode(&v.encode()).unwrap(), v);
    }

    #[test]
    fn source_data_default_round_trip() {
        let v = SourceDataValue::default();
        assert_eq!(SourceDataValue::decode(&v.encode()).unwrap(), v);
    }

    #[test]
    fn hash_data_round_trip() {
        let v = HashDataValue {
            k_entropy: 8000,
            block_label: "W".to_string(),
            source_sub_counts: vec![(1, 2), (3, 1)],
        };
        let back = HashDataValue::decode(&v.encode()).unwrap();
        assert_eq!(back, v);
        assert_eq!(back.total_count(), 3);
    }

    #[test]
    fn hash_data_rejects_truncated_blob() {
        let v = HashDataValue {
            k_entropy: 1,
            block_label: "bl".to_string(),
            source_sub_counts: vec![(1, 1)],
        };
        let mut bytes = v.encode();
        bytes.truncate(bytes.len() - 1);
        assert!(HashDataValue::decode(&bytes).is_err());
    }

    #[test]
    fn offset_entries_round_trip() {
        let entries = vec![
            OffsetEntry {
                suffix: vec![0xaa, 0xbb, 0xcc],
                source_id: 1,
                file_offset: 512,
            },
            OffsetEntry {
                suffix: vec![0x01, 0x02, 0x03],
                source_id: 2,
                file_offset: 4096,
            },
        ];
        let packed = pack_offset_entries(&entries);
        assert_eq!(unpack_offset_entries(&packed, 3).unwrap(), entries);
    }

    #[test]
    fn offset_entries_reject_ragged_bucket() {
        assert!(unpack_offset_entries(&[0u8; 20], 3).is_err());
    }

    #[test]
    fn name_pairs_round_trip() {
        let pairs = vec![
            ("repo1".to_string(), "file1".to_string()),
            ("repo2".to_string(), "file2".to_string()),
        ];
        assert_eq!(unpack_name_pairs(&pack_name_pairs(&pairs)).unwrap(), pairs);
    }

    #[test]
    fn prefix_masks_partial_byte() {
        let hash = [0xffu8; 8];
        // 28 bits -> 4 bytes with the low nibble of the last byte cleared
        assert_eq!(hash_prefix(&hash, 28), vec![0xff, 0xff, 0xff, 0xf0]);
        assert_eq!(hash_prefix(&hash, 16), vec![0xff, 0xff]);
        // wider than the hash clamps to the whole hash
        assert_eq!(hash_prefix(&hash, 256), hash.to_vec());
    }

    #[test]
    fn suffix_pads_short_hashes() {
        let hash = [1u8, 2, 3, 4];
        assert_eq!(bucket_suffix(&hash, 3), vec![2, 3, 4]);
        assert_eq!(bucket_suffix(&hash, 6), vec![0, 0, 1, 2, 3, 4]);
    }
}
