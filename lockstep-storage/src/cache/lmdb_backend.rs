//! LMDB-backed cache implementation.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! cache that survives process restarts and can be shared by every process
//! on a host.
//!
//! # Record format
//!
//! Each value is stored as `[status: 1][expires_at_ms: 8][version: 8][payload]`
//! with little-endian integers. `expires_at_ms` of zero means "never". The
//! version is the entry's CAS token.
//!
//! Entries live in the `entries` database. The `meta` database holds the
//! last version handed out, advanced inside each write transaction, so every
//! process sharing the environment draws from the same counter.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `get_multi` and `stats`
//! - One write transaction per batch for `add`, `set`, `compare_and_swap`
//!   and `delete`, so a batch is applied atomically and in input order
//! - Hit/miss counters are atomics, local to this handle

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use lockstep_core::{
    CacheEntry, CacheError, CasToken, EntryStatus, LockstepError, LockstepResult, MultiError,
};

use super::traits::{CacheBackend, CacheStats};

const HEADER_LEN: usize = 17;

const ENTRIES_DB: &str = "entries";
const META_DB: &str = "meta";
const VERSION_KEY: &[u8] = b"version";

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for LockstepError {
    fn from(e: LmdbCacheError) -> Self {
        LockstepError::Cache(CacheError::Backend {
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct Record {
    status: EntryStatus,
    expires_at_ms: i64,
    version: u64,
    value: Vec<u8>,
}

impl Record {
    fn decode(key: &str, bytes: &[u8]) -> Result<Self, LmdbCacheError> {
        let corrupt = |reason: &str| LmdbCacheError::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if bytes.len() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }
        let status = EntryStatus::from_byte(bytes[0]).ok_or_else(|| corrupt("unknown status"))?;
        let expires: [u8; 8] = bytes[1..9]
            .try_into()
            .map_err(|_| corrupt("invalid expiry"))?;
        let version: [u8; 8] = bytes[9..17]
            .try_into()
            .map_err(|_| corrupt("invalid version"))?;
        Ok(Self {
            status,
            expires_at_ms: i64::from_le_bytes(expires),
            version: u64::from_le_bytes(version),
            value: bytes[HEADER_LEN..].to_vec(),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.value.len());
        bytes.push(self.status.as_byte());
        bytes.extend_from_slice(&self.expires_at_ms.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.value);
        bytes
    }

    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms == 0 || now_ms < self.expires_at_ms
    }

    fn remaining_ttl(&self, now_ms: i64) -> Duration {
        if self.expires_at_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((self.expires_at_ms - now_ms).max(1) as u64)
        }
    }

    fn to_entry(&self, key: &str, now_ms: i64) -> CacheEntry {
        CacheEntry::new(key, self.status, self.value.clone(), self.remaining_ttl(now_ms))
            .with_cas(version_token(self.version))
    }
}

fn version_token(version: u64) -> CasToken {
    CasToken::new(version.to_be_bytes().to_vec())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// LMDB-backed cache.
///
/// # Example
///
/// ```ignore
/// use lockstep_storage::cache::LmdbCacheBackend;
///
/// let backend = LmdbCacheBackend::new("/tmp/cache", 100)?;
/// backend.set(&[CacheEntry::present("k", b"v".to_vec(), Duration::ZERO)]).await?;
/// ```
pub struct LmdbCacheBackend {
    /// The LMDB environment.
    env: Env,
    /// Cache entries keyed by cache key.
    db: Database<Bytes, Bytes>,
    /// Backend bookkeeping: the version counter.
    meta: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LmdbCacheBackend {
    /// Open (or create) the cache environment in `path`, mapping at most
    /// `max_size_mb` megabytes.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(ENTRIES_DB))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        let meta: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(META_DB))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            meta,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Last version stored in the environment, zero for a fresh one.
    fn load_version(&self, txn: &RoTxn) -> Result<u64, LmdbCacheError> {
        let bytes = self
            .meta
            .get(txn, VERSION_KEY)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        match bytes {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.try_into().map_err(|_| LmdbCacheError::Corrupt {
                    key: String::from_utf8_lossy(VERSION_KEY).into_owned(),
                    reason: "invalid version counter".to_string(),
                })?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn store_version(&self, txn: &mut RwTxn, version: u64) -> Result<(), LmdbCacheError> {
        self.meta
            .put(txn, VERSION_KEY, &version.to_le_bytes())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))
    }

    fn record_for(entry: &CacheEntry, version: u64, now_ms: i64) -> Record {
        let expires_at_ms = if entry.ttl.is_zero() {
            0
        } else {
            now_ms + entry.ttl.as_millis() as i64
        };
        Record {
            status: entry.status,
            expires_at_ms,
            version,
            value: entry.value.clone(),
        }
    }

    fn read_live(&self, txn: &RoTxn, key: &str, now_ms: i64) -> Result<Option<Record>, LmdbCacheError> {
        let bytes = self
            .db
            .get(txn, key.as_bytes())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        match bytes {
            Some(bytes) => {
                let record = Record::decode(key, bytes)?;
                Ok(record.is_live(now_ms).then_some(record))
            }
            None => Ok(None),
        }
    }

    /// Apply `decide` to every entry inside a single write transaction.
    ///
    /// `decide` sees the live record (if any) and returns `Ok(())` to write
    /// the entry or the error to record at that position.
    fn apply_batch<F>(&self, entries: &[CacheEntry], decide: F) -> LockstepResult<()>
    where
        F: Fn(&CacheEntry, Option<&Record>) -> Result<(), CacheError>,
    {
        let now_ms = now_millis();
        let mut errors = MultiError::new(entries.len());

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        let start = self.load_version(&wtxn)?;
        let mut version = start;

        for (i, entry) in entries.iter().enumerate() {
            let current = self.read_live(&wtxn, &entry.key, now_ms)?;
            match decide(entry, current.as_ref()) {
                Ok(()) => {
                    version += 1;
                    let record = Self::record_for(entry, version, now_ms);
                    self.db
                        .put(&mut wtxn, entry.key.as_bytes(), &record.encode())
                        .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
                }
                Err(err) => errors.set(i, err.into()),
            }
        }

        if version != start {
            self.store_version(&mut wtxn, version)?;
        }
        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        errors.into_result()
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    async fn add(&self, entries: &[CacheEntry]) -> LockstepResult<()> {
        self.apply_batch(entries, |_, current| match current {
            Some(_) => Err(CacheError::NotStored),
            None => Ok(()),
        })
    }

    async fn set(&self, entries: &[CacheEntry]) -> LockstepResult<()> {
        self.apply_batch(entries, |_, _| Ok(()))
    }

    async fn compare_and_swap(&self, entries: &[CacheEntry]) -> LockstepResult<()> {
        self.apply_batch(entries, |entry, current| match (current, entry.cas()) {
            (None, _) => Err(CacheError::NotStored),
            (Some(record), Some(expected)) if version_token(record.version) == *expected => Ok(()),
            (Some(_), _) => Err(CacheError::CasConflict),
        })
    }

    async fn delete(&self, keys: &[String]) -> LockstepResult<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        for key in keys {
            self.db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        }

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn get_multi(&self, keys: &[String]) -> LockstepResult<HashMap<String, CacheEntry>> {
        let now_ms = now_millis();
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.read_live(&rtxn, key, now_ms)? {
                found.insert(key.clone(), record.to_entry(key, now_ms));
            }
        }

        let hits = found.len() as u64;
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses
            .fetch_add(keys.len() as u64 - hits, Ordering::Relaxed);
        Ok(found)
    }

    async fn stats(&self) -> LockstepResult<CacheStats> {
        let now_ms = now_millis();
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut entry_count = 0u64;
        for result in iter {
            let Ok((key, bytes)) = result else { continue };
            let key = String::from_utf8_lossy(key);
            if Record::decode(&key, bytes).is_ok_and(|r| r.is_live(now_ms)) {
                entry_count += 1;
            }
        }

        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
        })
    }
}
