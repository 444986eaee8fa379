//! BLAKE3 checksums over the canonical plaintext encoding of entity values.
//!
//! Every producer (local writes, merges, re-queued resolutions) encodes a value
//! with [`encode_value`] before hashing, so two devices holding the same value
//! always compute the same checksum.

use serde_json::Value;

/// Compact JSON encoding with sorted object keys.
pub fn encode_value(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Lowercase hex BLAKE3 of raw bytes.
pub fn checksum_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

pub fn checksum_value(value: &Value) -> String {
    checksum_bytes(&encode_value(value))
}
