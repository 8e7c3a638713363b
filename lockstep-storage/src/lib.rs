//! Lockstep Storage - Cache Coherence Protocol
//!
//! Serves reads from a cache without ever returning a value older than the
//! backing store's last acknowledged write:
//!
//! - reads lock missing keys with add-if-absent, confirm ownership by
//!   token, fall back to the store and publish results with CAS
//! - writes lock every key with an unconditional set before the store
//!   changes and unlock afterwards; deletes keep their lock
//! - transactions buffer their locks and publish them after commit
//! - batches larger than a per-call limit fan out concurrently and report
//!   positional errors in input order

pub mod batch;
pub mod cache;
pub mod client;
pub mod context;
pub mod read;
pub mod sink;
pub mod store;
pub mod token;
pub mod txn;
pub mod write;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use cache::{
    CacheBackend, CacheKey, CacheStats, LmdbCacheBackend, LmdbCacheError, MemoryCacheBackend,
};
pub use client::Lockstep;
pub use context::{CancelHandle, Context};
pub use read::ReadState;
pub use sink::ErrorSink;
pub use store::{
    BackingStore, MemoryStore, MemoryTransaction, StoreLimits, StoreOps, StoreTransaction,
};
pub use token::{TokenGenerator, TokenSource};
pub use txn::{LockBuffer, Transaction};

pub use lockstep_core::{
    CacheEntry, CacheError, CasToken, Entity, EntryStatus, Key, KeyId, LockToken, LockstepConfig,
    LockstepError, LockstepResult, MultiError, Mutation, MutationKind, StoreError,
    ValidationError,
};

// ============================================================================
// TESTS
// ============================================================================
