//! Semantic version ordering for `code_hashes`
//!
//! Only `major.minor.patch` take part in ordering. A leading `v` is tolerated
//! and pre-release/build suffixes are ignored, so `1.2.0-beta` ranks equal to
//! `1.2.0`. Missing or unparseable components count as zero.

use std::cmp::Ordering;

/// Parse the ordering triple of a version string
pub fn parse_version(v: &str) -> (u64, u64, u64) {
    let core = v
        .trim()
        .trim_start_matches('v')
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    (
        parts.first().and_then(|s| s.parse().ok()).unwrap_or(0),
        parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0),
        parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0),
    )
}

/// Compare two version strings by semantic precedence
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    parse_version(a).cmp(&parse_version(b))
}

/// Latest `(version, hash)` entry of a version table.
///
/// Entries that rank equal are ordered by version text and then hash, which
/// keeps the result independent of input order.
pub fn latest_version(code_hashes: &[(String, String)]) -> Option<&(String, String)> {
    code_hashes.iter().max_by(|a, b| {
        compare_versions(&a.0, &b.0)
            .then_with(|| a.0.cmp(&b.0))
            .then_with(|| a.1.cmp(&b.1))
    })
}
