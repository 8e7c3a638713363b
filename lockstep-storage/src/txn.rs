//! Transactions and their lock buffer.
//!
//! Locks taken inside a transaction are held back in a [`LockBuffer`] and
//! published with a single cache `set` right after the backing store
//! commits. An aborted transaction publishes nothing.

use std::slice;

use lockstep_core::{CacheEntry, Entity, Key, LockstepError, LockstepResult, Mutation};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::CacheBackend;
use crate::client::{
    check_lengths, encode_all, encode_mutations, single_error, validate_complete,
    validate_structure, Lockstep,
};
use crate::context::Context;
use crate::read::read_uncached;
use crate::store::{BackingStore, StoreTransaction};
use crate::write::{LockTarget, Writer};

/// Pending lock entries of one transaction. Concurrent sub-operations
/// append through the mutex.
#[derive(Debug, Default)]
pub struct LockBuffer {
    entries: Mutex<Vec<CacheEntry>>,
}

impl LockBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, entries: Vec<CacheEntry>) {
        self.entries.lock().await.extend(entries);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn into_entries(self) -> Vec<CacheEntry> {
        self.entries.into_inner()
    }
}

/// A logical transaction over the backing store.
///
/// Reads go straight to the store transaction: uncommitted state must
/// never reach the cache, and the cache cannot see it either. Writes lock
/// into the buffer and are never unlocked; the published locks expire on
/// their own.
///
/// Dropping a transaction without calling [`commit`](Transaction::commit)
/// discards its locks, the same as [`rollback`](Transaction::rollback).
pub struct Transaction<'a, S: BackingStore, C> {
    client: &'a Lockstep<S, C>,
    txn: S::Txn,
    locks: LockBuffer,
}

impl<'a, S, C> Transaction<'a, S, C>
where
    S: BackingStore,
    C: CacheBackend,
{
    pub(crate) fn new(client: &'a Lockstep<S, C>, txn: S::Txn, locks: LockBuffer) -> Self {
        Self { client, txn, locks }
    }

    fn writer(&self) -> Writer<'_, S::Txn, C> {
        Writer {
            store: &self.txn,
            locks: LockTarget::Buffer(&self.locks),
            config: self.client.config(),
            sink: self.client.sink(),
            tokens: self.client.tokens(),
        }
    }

    /// Number of lock entries waiting for commit.
    pub async fn pending_locks(&self) -> usize {
        self.locks.len().await
    }

    pub async fn get_multi<T: Entity>(
        &self,
        ctx: &Context,
        keys: &[Key],
        dst: &mut [Option<T>],
    ) -> LockstepResult<()> {
        check_lengths(keys.len(), dst.len())?;
        validate_complete(keys)?;
        read_uncached(ctx, &self.txn, self.client.config().get_limit, keys, dst).await
    }

    pub async fn get<T: Entity>(&self, ctx: &Context, key: &Key) -> LockstepResult<T> {
        let mut dst = [None];
        self.get_multi(ctx, slice::from_ref(key), &mut dst)
            .await
            .map_err(single_error)?;
        let [value] = dst;
        value.ok_or_else(|| lockstep_core::StoreError::NoSuchEntity.into())
    }

    pub async fn put_multi<T: Entity>(
        &self,
        ctx: &Context,
        keys: &[Key],
        values: &[T],
    ) -> LockstepResult<Vec<Key>> {
        check_lengths(keys.len(), values.len())?;
        validate_structure(keys)?;
        let encoded = encode_all(values)?;
        self.writer().put_multi(ctx, keys, &encoded).await
    }

    pub async fn put<T: Entity>(&self, ctx: &Context, key: &Key, value: &T) -> LockstepResult<Key> {
        let mut keys = self
            .put_multi(ctx, slice::from_ref(key), slice::from_ref(value))
            .await
            .map_err(single_error)?;
        keys.pop().ok_or_else(|| {
            lockstep_core::StoreError::Backend {
                reason: "put returned no key".into(),
            }
            .into()
        })
    }

    pub async fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> LockstepResult<()> {
        validate_complete(keys)?;
        self.writer().delete_multi(ctx, keys).await
    }

    pub async fn delete(&self, ctx: &Context, key: &Key) -> LockstepResult<()> {
        self.delete_multi(ctx, slice::from_ref(key))
            .await
            .map_err(single_error)
    }

    pub async fn mutate<T: Entity>(
        &self,
        ctx: &Context,
        mutations: &[Mutation<T>],
    ) -> LockstepResult<Vec<Option<Key>>> {
        let encoded = encode_mutations(mutations)?;
        self.writer().mutate(ctx, &encoded).await
    }

    /// Commit the store transaction, then publish every buffered lock in
    /// one cache call.
    ///
    /// A failed commit publishes nothing. A failed publish after a durable
    /// commit is returned as `LockstepError::LockFlush`.
    pub async fn commit(self, ctx: &Context) -> LockstepResult<()> {
        let Self { client, txn, locks } = self;
        ctx.run(txn.commit()).await?;

        let entries = locks.into_entries();
        if entries.is_empty() {
            return Ok(());
        }
        debug!(count = entries.len(), "flushing transaction locks");
        ctx.run(client.cache().set(&entries)).await.map_err(|err| {
            warn!(error = %err, count = entries.len(), "transaction locks not flushed");
            LockstepError::LockFlush {
                reason: err.to_string(),
            }
        })
    }

    /// Roll the store transaction back. Buffered locks are discarded.
    pub async fn rollback(self, ctx: &Context) -> LockstepResult<()> {
        let Self { txn, locks, .. } = self;
        debug!(discarded = locks.into_entries().len(), "transaction rolled back");
        ctx.run(txn.rollback()).await
    }
}
