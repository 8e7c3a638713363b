//! Namespaced cache keys.
//!
//! A [`CacheKey`] can only be derived from an entity [`Key`] plus the
//! configured namespace tag, so protocol code cannot address a cache slot
//! that bypasses the prefix and collides with unrelated users of a shared
//! cache cluster.

use std::fmt;

use lockstep_core::Key;

/// Cache address of one entity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the cache key for `key` under `prefix`.
    ///
    /// Two keys map to the same cache key iff their encodings are equal.
    pub fn derive(prefix: &str, key: &Key) -> Self {
        let encoded = key.encode();
        let mut s = String::with_capacity(prefix.len() + encoded.len());
        s.push_str(prefix);
        s.push_str(&encoded);
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Derive cache keys for a batch, preserving order.
pub fn derive_all(prefix: &str, keys: &[Key]) -> Vec<CacheKey> {
    keys.iter().map(|k| CacheKey::derive(prefix, k)).collect()
}
