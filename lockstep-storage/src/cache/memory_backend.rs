//! In-process cache backend.
//!
//! Holds entries in a mutex-guarded map. Every write bumps a backend-wide
//! version counter and the version becomes the entry's CAS token, so any
//! overwrite (value, status or TTL) invalidates previously captured tokens.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lockstep_core::{
    CacheEntry, CacheError, CasToken, EntryStatus, LockstepResult, MultiError,
};

use super::traits::{CacheBackend, CacheStats};

#[derive(Debug, Clone)]
struct Slot {
    status: EntryStatus,
    value: Vec<u8>,
    ttl: Duration,
    expires_at: Option<Instant>,
    version: u64,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }

    fn to_entry(&self, key: &str) -> CacheEntry {
        CacheEntry::new(key, self.status, self.value.clone(), self.ttl)
            .with_cas(version_token(self.version))
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    next_version: u64,
    hits: u64,
    misses: u64,
}

impl Inner {
    fn live(&self, key: &str, now: Instant) -> Option<&Slot> {
        self.slots.get(key).filter(|slot| slot.is_live(now))
    }

    fn write(&mut self, entry: &CacheEntry, now: Instant) {
        self.next_version += 1;
        let expires_at = if entry.ttl.is_zero() {
            None
        } else {
            Some(now + entry.ttl)
        };
        self.slots.insert(
            entry.key.clone(),
            Slot {
                status: entry.status,
                value: entry.value.clone(),
                ttl: entry.ttl,
                expires_at,
                version: self.next_version,
            },
        );
    }
}

fn version_token(version: u64) -> CasToken {
    CasToken::new(version.to_be_bytes().to_vec())
}

/// Cache backend living in process memory.
///
/// # Example
///
/// ```ignore
/// let backend = MemoryCacheBackend::new();
/// backend.set(&[CacheEntry::present("k", b"v".to_vec(), Duration::ZERO)]).await?;
/// let found = backend.get_multi(&["k".to_string()]).await?;
/// ```
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    inner: Mutex<Inner>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, CacheError> {
        self.inner.lock().map_err(|_| CacheError::LockPoisoned)
    }

    /// Read one live entry without touching hit/miss statistics.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let inner = self.lock().ok()?;
        inner.live(key, Instant::now()).map(|slot| slot.to_entry(key))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|inner| inner.slots.values().filter(|s| s.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.slots.clear();
        }
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        match self.lock() {
            Ok(mut inner) => {
                let before = inner.slots.len();
                inner.slots.retain(|_, slot| slot.is_live(now));
                before - inner.slots.len()
            }
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn add(&self, entries: &[CacheEntry]) -> LockstepResult<()> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let mut errors = MultiError::new(entries.len());

        for (i, entry) in entries.iter().enumerate() {
            if inner.live(&entry.key, now).is_some() {
                errors.set(i, CacheError::NotStored.into());
            } else {
                inner.write(entry, now);
            }
        }

        errors.into_result()
    }

    async fn set(&self, entries: &[CacheEntry]) -> LockstepResult<()> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        for entry in entries {
            inner.write(entry, now);
        }
        Ok(())
    }

    async fn compare_and_swap(&self, entries: &[CacheEntry]) -> LockstepResult<()> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let mut errors = MultiError::new(entries.len());

        for (i, entry) in entries.iter().enumerate() {
            let current = inner.live(&entry.key, now).map(|slot| version_token(slot.version));
            match (current, entry.cas()) {
                (None, _) => errors.set(i, CacheError::NotStored.into()),
                (Some(current), Some(expected)) if current == *expected => {
                    inner.write(entry, now);
                }
                (Some(_), _) => errors.set(i, CacheError::CasConflict.into()),
            }
        }

        errors.into_result()
    }

    async fn delete(&self, keys: &[String]) -> LockstepResult<()> {
        let mut inner = self.lock()?;
        for key in keys {
            inner.slots.remove(key);
        }
        Ok(())
    }

    async fn get_multi(&self, keys: &[String]) -> LockstepResult<HashMap<String, CacheEntry>> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let mut found = HashMap::with_capacity(keys.len());

        for key in keys {
            if let Some(slot) = inner.live(key, now) {
                found.insert(key.clone(), slot.to_entry(key));
            }
        }

        let hits = found.len() as u64;
        inner.hits += hits;
        inner.misses += keys.len() as u64 - hits;
        Ok(found)
    }

    async fn stats(&self) -> LockstepResult<CacheStats> {
        let now = Instant::now();
        let inner = self.lock()?;
        Ok(CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entry_count: inner.slots.values().filter(|s| s.is_live(now)).count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::{LockToken, LockstepError};

    fn present(key: &str, value: &str) -> CacheEntry {
        CacheEntry::present(key, value.as_bytes().to_vec(), Duration::ZERO)
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let backend = MemoryCacheBackend::new();
        backend
            .set(&[present("a", "1"), present("b", "2")])
            .await
            .expect("set should succeed");

        let found = backend
            .get_multi(&keys(&["a", "b", "c"]))
            .await
            .expect("get should succeed");
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"].value, b"1");
        assert!(found["a"].cas().is_some());
        assert!(!found.contains_key("c"));

        let stats = backend.stats().await.expect("stats should succeed");
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 2);
    }

    #[tokio::test]
    async fn test_add_duplicate_key_in_one_batch() {
        let backend = MemoryCacheBackend::new();
        let err = backend
            .add(&[present("dup", "first"), present("dup", "second")])
            .await
            .expect_err("second add must fail");

        let me = err.as_multi().expect("positional error");
        assert!(me[0].is_none());
        assert!(me.get(1).is_some_and(LockstepError::is_not_stored));
        assert_eq!(backend.peek("dup").map(|e| e.value), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_cas_conflict_scenario() {
        let backend = MemoryCacheBackend::new();
        backend
            .set(&[
                present("A", "a"),
                present("B", "b"),
                present("C", "c"),
                present("D", "d"),
            ])
            .await
            .expect("seed");

        let snapshot = backend
            .get_multi(&keys(&["A", "B", "C", "D"]))
            .await
            .expect("get");

        // B deleted, C value changed, D status changed.
        backend.delete(&keys(&["B"])).await.expect("delete");
        backend.set(&[present("C", "c2")]).await.expect("set C");
        backend
            .set(&[CacheEntry::new("D", EntryStatus::Absent, b"d".to_vec(), Duration::ZERO)])
            .await
            .expect("set D");

        let swaps: Vec<CacheEntry> = ["A", "B", "C", "D"]
            .iter()
            .map(|k| {
                let cas = snapshot[*k].cas().cloned().expect("token");
                present(k, "new").with_cas(cas)
            })
            .collect();

        let err = backend
            .compare_and_swap(&swaps)
            .await
            .expect_err("three positions must fail");
        let me = err.as_multi().expect("positional error");
        assert!(me[0].is_none());
        assert!(me.get(1).is_some_and(LockstepError::is_not_stored));
        assert!(me.get(2).is_some_and(LockstepError::is_cas_conflict));
        assert!(me.get(3).is_some_and(LockstepError::is_cas_conflict));

        assert_eq!(backend.peek("A").map(|e| e.value), Some(b"new".to_vec()));
        assert!(backend.peek("B").is_none());
        assert_eq!(backend.peek("C").map(|e| e.value), Some(b"c2".to_vec()));
        assert_eq!(backend.peek("D").map(|e| e.status), Some(EntryStatus::Absent));
    }

    #[tokio::test]
    async fn test_cas_without_token_conflicts() {
        let backend = MemoryCacheBackend::new();
        backend.set(&[present("k", "v")]).await.expect("seed");
        let err = backend
            .compare_and_swap(&[present("k", "w")])
            .await
            .expect_err("no token");
        assert!(err.as_multi().and_then(|m| m.get(0)).is_some_and(LockstepError::is_cas_conflict));
    }

    #[tokio::test]
    async fn test_expiration() {
        let backend = MemoryCacheBackend::new();
        let token = LockToken::from(7);
        backend
            .set(&[CacheEntry::lock("k", token, Duration::from_secs(1))])
            .await
            .expect("set");

        let found = backend.get_multi(&keys(&["k"])).await.expect("get");
        assert!(found["k"].is_locked_by(token));

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let found = backend.get_multi(&keys(&["k"])).await.expect("get after expiry");
        assert!(found.is_empty(), "expired entry is a miss, not an error");

        // An expired slot accepts an add again.
        backend
            .add(&[present("k", "fresh")])
            .await
            .expect("add over expired entry");
        assert_eq!(backend.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_not_an_error() {
        let backend = MemoryCacheBackend::new();
        backend
            .delete(&keys(&["nope"]))
            .await
            .expect("idempotent delete");
        assert!(backend.is_empty());
    }
}
