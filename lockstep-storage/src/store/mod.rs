//! Backing store layer: the contract the protocol consumes and an
//! in-process implementation.

pub mod memory_store;
pub mod traits;

pub use memory_store::{MemoryStore, MemoryTransaction, StoreLimits};
pub use traits::{BackingStore, StoreOps, StoreTransaction};
