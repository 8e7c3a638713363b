//! Lockstep Core - Data Types
//!
//! Pure data structures shared by the coherence protocol, the cache
//! backends and the backing-store adapters. No I/O lives here.

pub mod config;
pub mod entity;
pub mod entry;
pub mod error;
pub mod key;
pub mod lock;
pub mod multi_error;
pub mod mutation;

pub use config::{
    LockstepConfig, DEFAULT_CACHE_KEY_PREFIX, DEFAULT_LOCK_TTL, DEFAULT_MAX_CACHE_VALUE_BYTES,
};
pub use entity::Entity;
pub use entry::{CacheEntry, CasToken, EntryStatus};
pub use error::{
    CacheError, ConfigError, LockstepError, LockstepResult, StoreError, ValidationError,
};
pub use key::{Key, KeyId};
pub use lock::{LockToken, LOCK_TOKEN_LEN};
pub use multi_error::MultiError;
pub use mutation::{Mutation, MutationKind};
