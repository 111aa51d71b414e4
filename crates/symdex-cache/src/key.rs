use crate::util::normalize_ref;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain separator mixed into every key so digests from other SHA-256 users
/// (segment ids, fingerprints) can never be mistaken for cache keys.
const KEY_DOMAIN: &[u8] = b"symdex.cache-key.v1";

/// A content-addressed cache key: lowercase hex SHA-256 over the symbol
/// reference, file path, file bytes and schema version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for one lookup. Pure: no I/O.
    ///
    /// Each variable-length field is length-prefixed so that moving bytes
    /// between adjacent fields always changes the digest.
    pub fn derive(
        symbol_ref: &str,
        file_path: &str,
        file_bytes: &[u8],
        schema_version: u32,
    ) -> Self {
        let symbol_ref = normalize_ref(symbol_ref);
        let file_path = normalize_ref(file_path);

        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        update_field(&mut hasher, symbol_ref.as_bytes());
        update_field(&mut hasher, file_path.as_bytes());
        update_field(&mut hasher, file_bytes);
        hasher.update(schema_version.to_le_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lock shard for this key (first two hex characters, 256 shards).
    ///
    /// Keys that did not come from [`CacheKey::derive`] and are too short fall
    /// into shard `00`.
    pub fn shard(&self) -> &str {
        self.0.get(..2).unwrap_or("00")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Plain SHA-256 hex digest, used for segment ids.
pub(crate) fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REF: &str = "sym://src/target.py";
    const PATH: &str = "src/target.py";

    #[test]
    fn derive_is_deterministic() {
        let a = CacheKey::derive(REF, PATH, b"def foo():\n    pass\n", 1);
        let b = CacheKey::derive(REF, PATH, b"def foo():\n    pass\n", 1);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn every_input_participates_in_the_key() {
        let base = CacheKey::derive(REF, PATH, b"def foo(): pass\n", 1);
        assert_ne!(base, CacheKey::derive(REF, PATH, b"def foo(): pass \n", 1));
        assert_ne!(base, CacheKey::derive(REF, PATH, b"def foo(): pass\n", 2));
        assert_ne!(base, CacheKey::derive("sym://src/other.py", PATH, b"def foo(): pass\n", 1));
        assert_ne!(base, CacheKey::derive(REF, "src/other.py", b"def foo(): pass\n", 1));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = CacheKey::derive("ab", "c", b"", 1);
        let b = CacheKey::derive("a", "bc", b"", 1);
        assert_ne!(a, b);

        let c = CacheKey::derive("a", "b", b"c", 1);
        let d = CacheKey::derive("a", "bc", b"", 1);
        assert_ne!(c, d);
    }

    #[test]
    fn separators_are_normalized_before_hashing() {
        let unix = CacheKey::derive("sym://src/a.py", "src/a.py", b"x", 1);
        let windows = CacheKey::derive("sym://src\\a.py", "src\\a.py", b"x", 1);
        assert_eq!(unix, windows);
    }

    #[test]
    fn shard_is_key_prefix() {
        let key = CacheKey::derive(REF, PATH, b"", 1);
        assert_eq!(key.shard(), &key.as_str()[..2]);
    }

    #[test]
    fn deserialized_short_key_uses_fallback_shard() {
        let key: CacheKey = serde_json::from_str("\"a\"").unwrap();
        assert_eq!(key.shard(), "00");
        let empty: CacheKey = serde_json::from_str("\"\"").unwrap();
        assert_eq!(empty.shard(), "00");
    }

    #[test]
    fn key_is_distinct_from_plain_content_digest() {
        let key = CacheKey::derive("", "", b"", 0);
        assert_ne!(key.as_str(), sha256_hex(b""));
    }
}
