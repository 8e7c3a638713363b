//! Cache layer: the backend contract and the bundled backends.
//!
//! The coherence protocol only talks to a cache through [`CacheBackend`].
//! Every slot it touches is addressed by a [`CacheKey`], which can only be
//! derived from an entity key plus the configured namespace tag.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryCacheBackend`]: process-local, used by tests and single-node
//!   deployments.
//! - [`LmdbCacheBackend`]: memory-mapped and shared by every process on a
//!   host.

pub mod cache_key;
pub mod lmdb_backend;
pub mod memory_backend;
pub mod traits;

pub use cache_key::{derive_all, CacheKey};
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use memory_backend::MemoryCacheBackend;
pub use traits::{CacheBackend, CacheStats};
