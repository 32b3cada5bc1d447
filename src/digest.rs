//! Content hashing
//!
//! Version hashes are the lowercase hex SHA-256 of the package zip; metadata
//! and manifest hashes use the same digest.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Normalize a published hash for comparison: trims, drops a `0x` prefix,
/// lowercases.
pub fn normalize_hash(hash: &str) -> String {
    let trimmed = hash.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    trimmed.to_lowercase()
}

/// Hex digest, optionally `0x`-prefixed; anything else cannot name an artifact
pub fn is_content_hash(hash: &str) -> bool {
    let hex = hash
        .strip_prefix("0x")
        .or_else(|| hash.strip_prefix("0X"))
        .unwrap_or(hash);
    !hex.is_empty() && hex.len() <= 128 && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compare a computed digest against a published one
pub fn hashes_match(computed: &str, published: &str) -> bool {
    normalize_hash(computed) == normalize_hash(published)
}
