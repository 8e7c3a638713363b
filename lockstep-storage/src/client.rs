//! The `Lockstep` client: strongly consistent cached access to a backing
//! store.
//!
//! The client owns its collaborators explicitly. Nothing is global: two
//! clients over different stores, caches or prefixes never interact.

use std::slice;
use std::sync::Arc;

use lockstep_core::{
    Entity, Key, LockstepConfig, LockstepError, LockstepResult, MultiError, Mutation,
    StoreError, ValidationError,
};
use tracing::{debug, info};

use crate::batch::{chunk_ranges, join_chunks};
use crate::cache::{derive_all, CacheBackend, CacheStats};
use crate::context::Context;
use crate::read::Reader;
use crate::sink::ErrorSink;
use crate::store::BackingStore;
use crate::token::TokenSource;
use crate::txn::{LockBuffer, Transaction};
use crate::write::{LockTarget, Writer};

/// Cached, strongly consistent entity access.
///
/// # Example
///
/// ```ignore
/// let client = Lockstep::new(Arc::new(store), Arc::new(cache), LockstepConfig::default())?;
/// let ctx = Context::background().with_timeout(Duration::from_secs(5));
///
/// let key = client.put(&ctx, &Key::named("User", "ada"), &user).await?;
/// let user: User = client.get(&ctx, &key).await?;
/// ```
pub struct Lockstep<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
    config: LockstepConfig,
    sink: ErrorSink,
    tokens: TokenSource,
}

impl<S, C> Lockstep<S, C>
where
    S: BackingStore,
    C: CacheBackend,
{
    /// Build a client. Fails if `config` does not validate.
    pub fn new(store: Arc<S>, cache: Arc<C>, config: LockstepConfig) -> LockstepResult<Self> {
        config.validate()?;
        info!(
            prefix = %config.cache_key_prefix,
            lock_ttl_ms = config.lock_ttl.as_millis() as u64,
            "lockstep client ready"
        );
        Ok(Self {
            store,
            cache,
            config,
            sink: ErrorSink::default(),
            tokens: TokenSource::new(),
        })
    }

    /// Route recovered errors to `sink` instead of the log.
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_token_source(mut self, tokens: TokenSource) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub(crate) fn sink(&self) -> &ErrorSink {
        &self.sink
    }

    pub(crate) fn tokens(&self) -> &TokenSource {
        &self.tokens
    }

    fn reader(&self) -> Reader<'_, S, C> {
        Reader {
            store: self.store.as_ref(),
            cache: self.cache.as_ref(),
            config: &self.config,
            tokens: &self.tokens,
        }
    }

    fn writer(&self) -> Writer<'_, S, C> {
        Writer {
            store: self.store.as_ref(),
            locks: LockTarget::Cache(self.cache.as_ref()),
            config: &self.config,
            sink: &self.sink,
            tokens: &self.tokens,
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read `keys` into `dst` (same length), serving from cache where it is
    /// safe and falling back to the backing store otherwise.
    ///
    /// On partial failure returns a `MultiError` with one slot per key;
    /// `StoreError::NoSuchEntity` marks keys that do not exist.
    pub async fn get_multi<T: Entity>(
        &self,
        ctx: &Context,
        keys: &[Key],
        dst: &mut [Option<T>],
    ) -> LockstepResult<()> {
        check_lengths(keys.len(), dst.len())?;
        validate_complete(keys)?;
        debug!(count = keys.len(), "get_multi");
        self.reader().get_multi(ctx, keys, dst).await
    }

    pub async fn get<T: Entity>(&self, ctx: &Context, key: &Key) -> LockstepResult<T> {
        let mut dst = [None];
        self.get_multi(ctx, slice::from_ref(key), &mut dst)
            .await
            .map_err(single_error)?;
        let [value] = dst;
        value.ok_or_else(|| StoreError::NoSuchEntity.into())
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store `values` under `keys`. Incomplete keys get ids from the store;
    /// the completed keys are returned in input order.
    pub async fn put_multi<T: Entity>(
        &self,
        ctx: &Context,
        keys: &[Key],
        values: &[T],
    ) -> LockstepResult<Vec<Key>> {
        check_lengths(keys.len(), values.len())?;
        validate_structure(keys)?;
        let encoded = encode_all(values)?;
        debug!(count = keys.len(), "put_multi");
        self.writer().put_multi(ctx, keys, &encoded).await
    }

    pub async fn put<T: Entity>(&self, ctx: &Context, key: &Key, value: &T) -> LockstepResult<Key> {
        let encoded = value.to_bytes()?;
        key.validate()?;
        let mut keys = self
            .writer()
            .put_multi(ctx, slice::from_ref(key), slice::from_ref(&encoded))
            .await
            .map_err(single_error)?;
        keys.pop()
            .ok_or_else(|| StoreError::Backend { reason: "put returned no key".into() }.into())
    }

    pub async fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> LockstepResult<()> {
        validate_complete(keys)?;
        debug!(count = keys.len(), "delete_multi");
        self.writer().delete_multi(ctx, keys).await
    }

    pub async fn delete(&self, ctx: &Context, key: &Key) -> LockstepResult<()> {
        self.delete_multi(ctx, slice::from_ref(key))
            .await
            .map_err(single_error)
    }

    /// Apply a mixed batch of inserts, upserts, updates and deletes in one
    /// backing-store call per chunk.
    pub async fn mutate<T: Entity>(
        &self,
        ctx: &Context,
        mutations: &[Mutation<T>],
    ) -> LockstepResult<Vec<Option<Key>>> {
        let encoded = encode_mutations(mutations)?;
        debug!(count = mutations.len(), "mutate");
        self.writer().mutate(ctx, &encoded).await
    }

    /// Drop whatever the cache holds for `keys`, locks included.
    ///
    /// This is the explicit unlock for deleted keys, and a repair tool for
    /// keys whose locks outlived a failed store call.
    pub async fn invalidate(&self, ctx: &Context, keys: &[Key]) -> LockstepResult<()> {
        validate_structure(keys)?;
        let raw: Vec<String> = derive_all(&self.config.cache_key_prefix, keys)
            .into_iter()
            .map(String::from)
            .collect();
        let limit = self.config.cache_get_limit;
        let chunks = chunk_ranges(raw.len(), limit).into_iter().map(|range| {
            let batch = &raw[range.clone()];
            (range, ctx.run(self.cache.delete(batch)))
        });
        join_chunks(raw.len(), chunks).await
    }

    pub async fn cache_stats(&self) -> LockstepResult<CacheStats> {
        self.cache.stats().await
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    /// Open a transaction. Its locks reach the cache only after commit.
    pub async fn begin_transaction(&self, ctx: &Context) -> LockstepResult<Transaction<'_, S, C>> {
        let txn = ctx.run(self.store.begin()).await?;
        Ok(Transaction::new(self, txn, LockBuffer::new()))
    }
}

// ============================================================================
// INPUT CHECKS
// ============================================================================

pub(crate) fn check_lengths(keys: usize, values: usize) -> LockstepResult<()> {
    if keys != values {
        return Err(ValidationError::LengthMismatch { keys, values }.into());
    }
    Ok(())
}

/// Positional validation errors, reported before any I/O.
fn collect_invalid<F>(keys: &[Key], check: F) -> LockstepResult<()>
where
    F: Fn(&Key) -> Result<(), ValidationError>,
{
    keys.iter()
        .map(|key| check(key).err().map(LockstepError::from))
        .collect::<MultiError>()
        .into_result()
}

pub(crate) fn validate_structure(keys: &[Key]) -> LockstepResult<()> {
    collect_invalid(keys, Key::validate)
}

pub(crate) fn validate_complete(keys: &[Key]) -> LockstepResult<()> {
    collect_invalid(keys, |key| {
        key.validate()?;
        if key.is_complete() {
            Ok(())
        } else {
            Err(ValidationError::IncompleteKey {
                key: key.to_string(),
            })
        }
    })
}

pub(crate) fn encode_all<T: Entity>(values: &[T]) -> LockstepResult<Vec<Vec<u8>>> {
    values.iter().map(Entity::to_bytes).collect()
}

pub(crate) fn encode_mutations<T: Entity>(
    mutations: &[Mutation<T>],
) -> LockstepResult<Vec<Mutation<Vec<u8>>>> {
    let mut errors = MultiError::new(mutations.len());
    let mut encoded = Vec::with_capacity(mutations.len());

    for (index, m) in mutations.iter().enumerate() {
        if let Err(err) = m.key.validate() {
            errors.set(index, err.into());
            continue;
        }
        if m.kind.carries_value() && m.value.is_none() {
            errors.set(index, ValidationError::MissingValue { index }.into());
            continue;
        }
        let value = m.value.as_ref().map(Entity::to_bytes).transpose()?;
        encoded.push(Mutation {
            kind: m.kind,
            key: m.key.clone(),
            value,
        });
    }

    errors.into_result()?;
    Ok(encoded)
}

/// Unwrap the one slot of a single-item batch error.
pub(crate) fn single_error(err: LockstepError) -> LockstepError {
    match err {
        LockstepError::Multi(me) if me.len() == 1 => me
            .into_slots()
            .into_iter()
            .flatten()
            .next()
            .unwrap_or(LockstepError::Multi(MultiError::new(1))),
        err => err,
    }
}
