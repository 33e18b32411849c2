use crate::protocol::redis::SLOT_COUNT;

/// Compute CRC16 (XMODEM) hash over the provided bytes.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Extract the hash tag from a key per the Redis Cluster rules: when the
/// key contains `{...}` with a non-empty inner substring, only that
/// substring participates in slot hashing.
pub fn trim_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(begin) = key.iter().position(|&b| b == b'{') {
        if let Some(offset) = key[begin + 1..].iter().position(|&b| b == b'}') {
            if offset > 0 {
                let start = begin + 1;
                return &key[start..start + offset];
            }
        }
    }
    key
}

/// Map a key to its cluster slot. An empty key hashes to slot 0.
pub fn key_to_slot(key: &[u8]) -> u16 {
    crc16(trim_hash_tag(key)) % SLOT_COUNT
}

#[cfg(test)]
mod tests {
    use super::{key_to_slot, trim_hash_tag};

    #[test]
    fn trim_hash_tag_extracts_segment() {
        assert_eq!(trim_hash_tag(b"user:{42}:profile"), b"42");
    }

    #[test]
    fn trim_hash_tag_returns_key_when_missing() {
        let key = b"plain-key";
        assert_eq!(trim_hash_tag(key), key);
    }

    #[test]
    fn trim_hash_tag_ignores_empty_tag() {
        let key = b"foo{}bar";
        assert_eq!(trim_hash_tag(key), key);
    }

    #[test]
    fn trim_hash_tag_uses_first_tag() {
        assert_eq!(trim_hash_tag(b"{a}{b}"), b"a");
    }

    #[test]
    fn tagged_keys_share_a_slot() {
        assert_eq!(key_to_slot(b"{user}:name"), key_to_slot(b"{user}:age"));
    }

    #[test]
    fn empty_key_maps_to_slot_zero() {
        assert_eq!(key_to_slot(b""), 0);
    }

    #[test]
    fn known_slot_values() {
        // reference values from the cluster specification
        assert_eq!(key_to_slot(b"foobar"), 12325);
        assert_eq!(key_to_slot(b"123456789"), 12739);
    }
}
