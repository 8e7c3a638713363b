//! Cache backend contract.
//!
//! This module defines the operations the coherence protocol requires of a
//! cache backend. Concrete backends (in-process, LMDB, a cache-server
//! client) implement it; the protocol never depends on which one it gets.

use std::collections::HashMap;

use async_trait::async_trait;
use lockstep_core::{CacheEntry, LockstepResult};

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations should be thread-safe and support concurrent access.
///
/// # Positional results
///
/// `add` and `compare_and_swap` report per-entry outcomes: on partial
/// failure they return `LockstepError::Multi` with one slot per input entry,
/// in input order. Entries are applied in input order, so a batch naming the
/// same key twice behaves like two consecutive calls.
///
/// # Expiry
///
/// A `ttl` of zero means the entry never expires. Expired entries behave
/// exactly like missing ones for every operation.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Store each entry only if no live entry exists at its key.
    ///
    /// Fails a position with `CacheError::NotStored` iff a live entry
    /// already exists there.
    async fn add(&self, entries: &[CacheEntry]) -> LockstepResult<()>;

    /// Unconditionally overwrite each entry.
    async fn set(&self, entries: &[CacheEntry]) -> LockstepResult<()>;

    /// Overwrite each entry only if its current CAS token matches the one
    /// attached to the entry.
    ///
    /// Fails a position with `CacheError::NotStored` if no live entry
    /// exists, or `CacheError::CasConflict` if one exists with a different
    /// token (or the entry carries no token at all).
    async fn compare_and_swap(&self, entries: &[CacheEntry]) -> LockstepResult<()>;

    /// Remove keys. Removing a missing key is not an error.
    async fn delete(&self, keys: &[String]) -> LockstepResult<()>;

    /// Fetch the live entries among `keys`.
    ///
    /// Missing keys are simply absent from the map. Every returned entry
    /// carries the CAS token a later `compare_and_swap` must present.
    async fn get_multi(&self, keys: &[String]) -> LockstepResult<HashMap<String, CacheEntry>>;

    /// Get cache statistics.
    async fn stats(&self) -> LockstepResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Keys found by `get_multi`.
    pub hits: u64,
    /// Keys requested by `get_multi` but not found.
    pub misses: u64,
    /// Number of live entries currently in the cache.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
