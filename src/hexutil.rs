/// Decode an even-length hex string. Odd length or non-hex characters
/// yield an empty vector, with a warning; callers treat empty as invalid.
pub fn hex_to_bin(hex_string: &str) -> Vec<u8> {
    if hex_string.len() % 2 != 0 {
        tracing::warn!(input = hex_string, "hex input not aligned on even boundary");
        return Vec::new();
    }
    match hex::decode(hex_string) {
        Ok(bytes) => bytes,
        Err(_) => {
            tracing::warn!(input = hex_string, "unexpected hex character");
            Vec::new()
        }
    }
}

/// Lowercase hex form of a binary string.
pub fn bin_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_lowercases() {
        assert_eq!(bin_to_hex(&hex_to_bin("00FFa0")), "00ffa0");
        assert_eq!(bin_to_hex(&hex_to_bin("8899aabbccddeeff")), "8899aabbccddeeff");
    }

    #[test]
    fn odd_length_is_empty() {
        assert!(hex_to_bin("abc").is_empty());
    }

    #[test]
    fn invalid_digit_is_empty() {
        assert!(hex_to_bin("zz").is_empty());
        assert!(hex_to_bin("invalid_hash_value").is_empty());
    }

    #[test]
    fn empty_round_trip() {
        assert_eq!(bin_to_hex(&hex_to_bin("")), "");
    }
}
