//! Write, delete and mutate lock protocol.
//!
//! Every complete key touched by a mutation is locked in the cache with an
//! unconditional set before the backing store changes. Outside a
//! transaction, keys whose new value should become cacheable again are
//! unlocked once the store call succeeds; deleted keys stay locked until
//! the lock expires. Inside a transaction the locks go to the transaction's
//! buffer instead and nothing is unlocked.

use lockstep_core::{
    CacheEntry, Key, LockstepConfig, LockstepError, LockstepResult, Mutation, StoreError,
    ValidationError,
};
use tracing::debug;

use crate::batch::{chunk_ranges, effective_limit, join_chunks};
use crate::cache::{CacheBackend, CacheKey};
use crate::context::Context;
use crate::sink::ErrorSink;
use crate::store::StoreOps;
use crate::token::TokenSource;
use crate::txn::LockBuffer;

/// Where lock entries go.
pub(crate) enum LockTarget<'a, C: ?Sized> {
    /// Straight to the cache; unlock after success.
    Cache(&'a C),
    /// Into a transaction's buffer; flushed on commit, never unlocked.
    Buffer(&'a LockBuffer),
}

/// Mutations through one store with cache locking.
pub(crate) struct Writer<'a, St: ?Sized, C: ?Sized> {
    pub store: &'a St,
    pub locks: LockTarget<'a, C>,
    pub config: &'a LockstepConfig,
    pub sink: &'a ErrorSink,
    pub tokens: &'a TokenSource,
}

impl<St, C> Writer<'_, St, C>
where
    St: StoreOps + ?Sized,
    C: CacheBackend + ?Sized,
{
    pub async fn put_multi(
        &self,
        ctx: &Context,
        keys: &[Key],
        values: &[Vec<u8>],
    ) -> LockstepResult<Vec<Key>> {
        if keys.len() != values.len() {
            return Err(ValidationError::LengthMismatch {
                keys: keys.len(),
                values: values.len(),
            }
            .into());
        }
        let limit = self.config.put_limit;
        let mut completed: Vec<Option<Key>> = vec![None; keys.len()];
        let chunks = chunk_ranges(keys.len(), limit)
            .into_iter()
            .zip(completed.chunks_mut(effective_limit(keys.len(), limit)))
            .map(|(range, out)| {
                let keys = &keys[range.clone()];
                let values = &values[range.clone()];
                (range, self.put_chunk(ctx, keys, values, out))
            });
        join_chunks(keys.len(), chunks).await?;

        completed
            .into_iter()
            .collect::<Option<Vec<Key>>>()
            .ok_or_else(|| short_response("put"))
    }

    async fn put_chunk(
        &self,
        ctx: &Context,
        keys: &[Key],
        values: &[Vec<u8>],
        out: &mut [Option<Key>],
    ) -> LockstepResult<()> {
        let locked = self.cache_keys(keys.iter());
        self.lock(ctx, &locked).await?;

        let stored = ctx.run(self.store.put_multi(keys, values)).await?;
        if stored.len() != out.len() {
            return Err(short_response("put"));
        }
        for (slot, key) in out.iter_mut().zip(stored) {
            *slot = Some(key);
        }

        self.unlock(ctx, &locked).await;
        Ok(())
    }

    pub async fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> LockstepResult<()> {
        let limit = self.config.delete_limit;
        let chunks = chunk_ranges(keys.len(), limit).into_iter().map(|range| {
            let keys = &keys[range.clone()];
            (range, self.delete_chunk(ctx, keys))
        });
        join_chunks(keys.len(), chunks).await
    }

    async fn delete_chunk(&self, ctx: &Context, keys: &[Key]) -> LockstepResult<()> {
        let locked = self.cache_keys(keys.iter());
        self.lock(ctx, &locked).await?;
        // The lock outlives the delete and keeps the key uncached.
        ctx.run(self.store.delete_multi(keys)).await
    }

    pub async fn mutate(
        &self,
        ctx: &Context,
        mutations: &[Mutation<Vec<u8>>],
    ) -> LockstepResult<Vec<Option<Key>>> {
        let limit = self.config.put_limit;
        let mut affected: Vec<Option<Key>> = vec![None; mutations.len()];
        let chunks = chunk_ranges(mutations.len(), limit)
            .into_iter()
            .zip(affected.chunks_mut(effective_limit(mutations.len(), limit)))
            .map(|(range, out)| {
                let batch = &mutations[range.clone()];
                (range, self.mutate_chunk(ctx, batch, out))
            });
        join_chunks(mutations.len(), chunks).await?;
        Ok(affected)
    }

    async fn mutate_chunk(
        &self,
        ctx: &Context,
        mutations: &[Mutation<Vec<u8>>],
        out: &mut [Option<Key>],
    ) -> LockstepResult<()> {
        let locked = self.cache_keys(mutations.iter().map(|m| &m.key));
        self.lock(ctx, &locked).await?;

        let results = ctx.run(self.store.mutate(mutations)).await?;
        if results.len() != out.len() {
            return Err(short_response("mutate"));
        }
        out.clone_from_slice(&results);

        let reopen = self.cache_keys(
            mutations
                .iter()
                .filter(|m| m.kind.reopens_cache())
                .map(|m| &m.key),
        );
        self.unlock(ctx, &reopen).await;
        Ok(())
    }

    /// Cache keys of every complete key. Incomplete keys name nothing that
    /// could be cached yet.
    fn cache_keys<'k>(&self, keys: impl Iterator<Item = &'k Key>) -> Vec<CacheKey> {
        keys.filter(|k| k.is_complete())
            .map(|k| CacheKey::derive(&self.config.cache_key_prefix, k))
            .collect()
    }

    async fn lock(&self, ctx: &Context, keys: &[CacheKey]) -> LockstepResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let token = self.tokens.generator().next_token();
        let entries: Vec<CacheEntry> = keys
            .iter()
            .map(|k| CacheEntry::lock(k.as_str(), token, self.config.lock_ttl))
            .collect();

        match &self.locks {
            LockTarget::Cache(cache) => ctx.run(cache.set(&entries)).await,
            LockTarget::Buffer(buffer) => {
                buffer.append(entries).await;
                Ok(())
            }
        }
    }

    /// Re-open `keys` for caching. Failure does not undo the mutation; it
    /// goes to the error sink.
    async fn unlock(&self, ctx: &Context, keys: &[CacheKey]) {
        let LockTarget::Cache(cache) = &self.locks else {
            return;
        };
        if keys.is_empty() {
            return;
        }

        let raw: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        match ctx.run(cache.delete(&raw)).await {
            Ok(()) => {}
            Err(err) if is_already_gone(&err) => {
                debug!(count = raw.len(), "unlock found nothing to delete");
            }
            Err(err) => self.sink.report(ctx, &err),
        }
    }
}

/// "Nothing there" answers to an unlock, which make it a no-op.
fn is_already_gone(err: &LockstepError) -> bool {
    match err {
        LockstepError::Multi(me) => me.iter().flatten().all(is_already_gone),
        err => err.is_cache_miss() || err.is_not_stored(),
    }
}

fn short_response(op: &str) -> LockstepError {
    StoreError::Backend {
        reason: format!("{op} returned a different number of keys than requested"),
    }
    .into()
}
