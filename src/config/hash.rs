//! Deterministic hashing for change detection.
//!
//! Fingerprints are SHA-256 digests over a canonical byte stream. Maps are
//! ordered (`BTreeMap` and `serde_json`'s default map), so equal inputs always
//! produce equal digests.

use sha2::{Digest, Sha256};

use crate::planner::{ChangeSet, PlannedValue};

/// Field separator so adjacent strings cannot run together.
const SEP: &[u8] = &[0x1f];

/// Hasher for plan fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a change-set.
    ///
    /// Covers every entry's id, kind, operation, prior provider id, changed
    /// attribute names and planned values. `NoOp` entries are included so
    /// that adopting a resource changes the fingerprint.
    #[must_use]
    pub fn hash_change_set(&self, change_set: &ChangeSet) -> String {
        let mut hasher = Sha256::new();

        for entry in change_set.entries() {
            hasher.update(entry.logical_id.as_bytes());
            hasher.update(SEP);
            hasher.update(entry.kind.as_str().as_bytes());
            hasher.update(SEP);
            hasher.update(entry.op.as_str().as_bytes());
            hasher.update(SEP);
            if let Some(before) = &entry.before {
                hasher.update(before.provider_id.as_bytes());
            }
            for name in &entry.changed_attributes {
                hasher.update(SEP);
                hasher.update(name.as_bytes());
            }
            if let Some(after) = &entry.after {
                for (key, value) in after {
                    hasher.update(SEP);
                    hasher.update(key.as_bytes());
                    hasher.update(b"=");
                    match value {
                        PlannedValue::Known(v) => hasher.update(v.to_string().as_bytes()),
                        PlannedValue::Unknown => hasher.update(b"(known after apply)"),
                    }
                }
            }
            hasher.update(b"\n");
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 12 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(12).collect()
    }

    /// Compares two fingerprints; a short prefix of at least 8 characters
    /// matches the full hash it was cut from.
    #[must_use]
    pub fn hashes_match(expected: &str, actual: &str) -> bool {
        let expected = expected.trim();
        if expected.len() < 8 || expected.len() > actual.len() {
            return false;
        }

        expected
            .bytes()
            .zip(actual.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef123456");
    }

    #[test]
    fn test_hashes_match_accepts_prefix() {
        let full = "abcdef1234567890";
        assert!(ConfigHasher::hashes_match(full, full));
        assert!(ConfigHasher::hashes_match("abcdef12", full));
        assert!(!ConfigHasher::hashes_match("abcdef13", full));
        assert!(!ConfigHasher::hashes_match("abc", full));
    }
}
