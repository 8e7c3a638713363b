//! Backing store contract.
//!
//! The backing store is the authoritative database of record. The coherence
//! protocol only needs bulk get / put / delete / mutate by key, a per-call
//! item limit it must never exceed, and a transaction handle exposing the
//! same operations.
//!
//! Values cross this boundary as serialized bytes; entity encoding happens
//! in the client, so the protocol can stage the exact bytes the store
//! returned for cache replenishment.

use async_trait::async_trait;
use lockstep_core::{Key, LockstepResult, Mutation};

/// Bulk entity operations shared by a store and its transactions.
///
/// # Positional results
///
/// On partial failure every method returns `LockstepError::Multi` with one
/// slot per input item. A store-wide failure may instead be a single plain
/// error. A missing entity is reported as `StoreError::NoSuchEntity` at its
/// position.
#[async_trait]
pub trait StoreOps: Send + Sync {
    /// Fetch `keys` into `dst`, which has the same length as `keys`.
    async fn get_multi(&self, keys: &[Key], dst: &mut [Option<Vec<u8>>]) -> LockstepResult<()>;

    /// Store `values` under `keys`. Incomplete keys receive a fresh id; the
    /// returned keys are complete and in input order.
    async fn put_multi(&self, keys: &[Key], values: &[Vec<u8>]) -> LockstepResult<Vec<Key>>;

    /// Remove `keys`. Removing a missing entity is not an error.
    async fn delete_multi(&self, keys: &[Key]) -> LockstepResult<()>;

    /// Apply a mixed batch of inserts, upserts, updates and deletes.
    ///
    /// Returns the affected key per position: the completed key for
    /// value-carrying kinds, `None` for deletes.
    async fn mutate(&self, mutations: &[Mutation<Vec<u8>>]) -> LockstepResult<Vec<Option<Key>>>;
}

/// A backing store that can open transactions.
#[async_trait]
pub trait BackingStore: StoreOps {
    type Txn: StoreTransaction;

    async fn begin(&self) -> LockstepResult<Self::Txn>;
}

/// One in-flight store transaction.
///
/// Isolation semantics are the store's own. Writes become visible only
/// after `commit` succeeds.
#[async_trait]
pub trait StoreTransaction: StoreOps {
    async fn commit(self) -> LockstepResult<()>;

    async fn rollback(self) -> LockstepResult<()>;
}
