//! Input hashing for change detection.
//!
//! Declared inputs are hashed over a canonical encoding (object keys in
//! sorted order, type-tagged scalars) so the same inputs always produce the
//! same digest regardless of how they were written in YAML.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::spec::ProgramConfig;

/// Hasher for computing input and program hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a resource's declared inputs.
    #[must_use]
    pub fn hash_inputs(&self, inputs: &Value) -> String {
        let mut hasher = Sha256::new();
        Self::feed(&mut hasher, inputs);
        hex::encode(hasher.finalize())
    }

    /// Computes a hash of the whole program, used for display only.
    #[must_use]
    pub fn hash_program(&self, config: &ProgramConfig) -> String {
        let mut hasher = Sha256::new();
        hasher.update(config.program.name.as_bytes());
        hasher.update([0]);
        hasher.update(config.program.stage.as_bytes());
        hasher.update([0]);
        match serde_json::to_value(&config.databases) {
            Ok(value) => Self::feed(&mut hasher, &value),
            Err(_) => hasher.update(b"databases"),
        }
        match serde_json::to_value(&config.resources) {
            Ok(value) => Self::feed(&mut hasher, &value),
            Err(_) => hasher.update(b"resources"),
        }
        hex::encode(hasher.finalize())
    }

    /// Feeds a canonical encoding of `value` into `hasher`.
    fn feed(hasher: &mut Sha256, value: &Value) {
        match value {
            Value::Null => hasher.update(b"n"),
            Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
            Value::Number(n) => {
                hasher.update(b"#");
                hasher.update(n.to_string().as_bytes());
                hasher.update([0]);
            }
            Value::String(s) => {
                hasher.update(b"s");
                hasher.update((s.len() as u64).to_be_bytes());
                hasher.update(s.as_bytes());
            }
            Value::Array(items) => {
                hasher.update(b"[");
                for item in items {
                    Self::feed(hasher, item);
                }
                hasher.update(b"]");
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                hasher.update(b"{");
                for key in keys {
                    hasher.update((key.len() as u64).to_be_bytes());
                    hasher.update(key.as_bytes());
                    Self::feed(hasher, &map[key]);
                }
                hasher.update(b"}");
            }
        }
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
