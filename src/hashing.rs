//! Hashing - SHA-256 digests for cache entries
//!
//! Source digests let the cache notice edited text even when the format
//! version did not move. Key digests name entries in file-backed stores.

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Digest of the raw markup a cache entry was rendered from.
pub fn source_digest(raw: &str) -> String {
    sha256_hex(raw.as_bytes())
}

/// Stable storage name for a cache key.
/// key_digest = sha256(namespace + ":" + key)
pub fn key_digest(namespace: &str, key: &str) -> String {
    sha256_hex(format!("{}:{}", namespace, key).as_bytes())
}

// Lowercase hex, no separators.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
