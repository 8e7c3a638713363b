//! Read coherence engine.
//!
//! One read batch walks every key through
//! `Miss -> {InternalLock | ExternalLock} -> Done`:
//!
//! 1. bulk cache lookup; `Present` and `Absent` entries finish the key,
//!    `Locked` or undecodable entries mark it `ExternalLock`
//! 2. add-if-absent a `Locked` entry carrying a fresh token for every miss
//! 3. re-read the misses; our own token means `InternalLock`, anything
//!    else locked means `ExternalLock`
//! 4. one batched backing-store get for every locked key
//! 5. CAS the results back for `InternalLock` keys only
//!
//! Nothing here ever waits on another caller's lock: a foreign lock just
//! sends the key to the backing store.

use std::collections::HashMap;

use lockstep_core::{
    CacheEntry, CasToken, Entity, EntryStatus, Key, LockToken, LockstepConfig, LockstepError,
    LockstepResult, MultiError, StoreError,
};
use tracing::debug;

use crate::batch::{chunk_ranges, effective_limit, join_chunks};
use crate::cache::{CacheBackend, CacheKey};
use crate::context::Context;
use crate::store::StoreOps;
use crate::token::{TokenGenerator, TokenSource};

/// Where a key stands in the read protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Not in cache yet.
    Miss,
    /// We hold the lock and own replenishment.
    InternalLock,
    /// Someone else is resolving the key, or the cache cannot be trusted.
    ExternalLock,
    Done,
}

#[derive(Debug)]
struct ReadItem {
    cache_key: CacheKey,
    state: ReadState,
    /// Set once, when the item enters lock acquisition.
    token: Option<LockToken>,
    /// Captured when our lock is confirmed.
    cas: Option<CasToken>,
    error: Option<LockstepError>,
}

impl ReadItem {
    fn new(cache_key: CacheKey) -> Self {
        Self {
            cache_key,
            state: ReadState::Miss,
            token: None,
            cas: None,
            error: None,
        }
    }

    fn finish(&mut self, error: Option<LockstepError>) {
        self.state = ReadState::Done;
        self.error = error;
    }

    /// Resolve from a cache entry another party published.
    fn apply_found<T: Entity>(&mut self, entry: &CacheEntry, slot: &mut Option<T>) {
        match entry.status {
            EntryStatus::Absent => self.finish(Some(StoreError::NoSuchEntity.into())),
            EntryStatus::Present => match T::from_bytes(&entry.value) {
                Ok(value) => {
                    *slot = Some(value);
                    self.finish(None);
                }
                Err(err) => {
                    debug!(key = %self.cache_key, error = %err, "undecodable cache entry");
                    self.state = ReadState::ExternalLock;
                }
            },
            EntryStatus::Locked => self.state = ReadState::ExternalLock,
        }
    }

    fn holds_lock(&self) -> bool {
        matches!(self.state, ReadState::InternalLock | ReadState::ExternalLock)
    }
}

/// Cached reads against one store and one cache.
pub(crate) struct Reader<'a, St: ?Sized, C: ?Sized> {
    pub store: &'a St,
    pub cache: &'a C,
    pub config: &'a LockstepConfig,
    pub tokens: &'a TokenSource,
}

impl<St, C> Reader<'_, St, C>
where
    St: StoreOps + ?Sized,
    C: CacheBackend + ?Sized,
{
    /// Read `keys` into `dst`, splitting into chunks no larger than either
    /// the backing store or the cache allows.
    pub async fn get_multi<T: Entity>(
        &self,
        ctx: &Context,
        keys: &[Key],
        dst: &mut [Option<T>],
    ) -> LockstepResult<()> {
        let limit = self.config.get_limit.min(self.config.cache_get_limit);
        let chunks = chunk_ranges(keys.len(), limit)
            .into_iter()
            .zip(dst.chunks_mut(effective_limit(keys.len(), limit)))
            .map(|(range, slots)| {
                let keys = &keys[range.clone()];
                let mut tokens = self.tokens.generator();
                (range, async move { self.read_chunk(ctx, &mut tokens, keys, slots).await })
            });
        join_chunks(keys.len(), chunks).await
    }

    async fn read_chunk<T: Entity>(
        &self,
        ctx: &Context,
        tokens: &mut TokenGenerator,
        keys: &[Key],
        dst: &mut [Option<T>],
    ) -> LockstepResult<()> {
        let prefix = &self.config.cache_key_prefix;
        let mut items: Vec<ReadItem> = keys
            .iter()
            .map(|key| ReadItem::new(CacheKey::derive(prefix, key)))
            .collect();

        self.lookup(ctx, &mut items, dst).await;
        self.lock_misses(ctx, tokens, &mut items).await;
        self.confirm_locks(ctx, &mut items, dst).await;
        let staged = self.fall_back(ctx, keys, &mut items, dst).await;
        self.replenish(ctx, staged).await;

        items
            .into_iter()
            .map(|item| item.error)
            .collect::<MultiError>()
            .into_result()
    }

    async fn lookup<T: Entity>(&self, ctx: &Context, items: &mut [ReadItem], dst: &mut [Option<T>]) {
        let cache_keys: Vec<String> = items.iter().map(|i| i.cache_key.to_string()).collect();
        let found = match ctx.run(self.cache.get_multi(&cache_keys)).await {
            Ok(found) => found,
            Err(err) => {
                debug!(error = %err, count = items.len(), "cache lookup failed, treating as misses");
                return;
            }
        };

        for (item, slot) in items.iter_mut().zip(dst.iter_mut()) {
            if let Some(entry) = found.get(item.cache_key.as_str()) {
                item.apply_found(entry, slot);
            }
        }
    }

    async fn lock_misses(&self, ctx: &Context, tokens: &mut TokenGenerator, items: &mut [ReadItem]) {
        let mut locks = Vec::new();
        for item in items.iter_mut().filter(|i| i.state == ReadState::Miss) {
            let token = tokens.next_token();
            item.token = Some(token);
            locks.push(CacheEntry::lock(
                item.cache_key.as_str(),
                token,
                self.config.lock_ttl,
            ));
        }
        if locks.is_empty() {
            return;
        }

        // Losing the add race is expected; confirmation sorts out who won.
        if let Err(err) = ctx.run(self.cache.add(&locks)).await {
            debug!(error = %err, count = locks.len(), "lock add partially failed");
        }
    }

    async fn confirm_locks<T: Entity>(
        &self,
        ctx: &Context,
        items: &mut [ReadItem],
        dst: &mut [Option<T>],
    ) {
        let cache_keys: Vec<String> = items
            .iter()
            .filter(|i| i.state == ReadState::Miss)
            .map(|i| i.cache_key.to_string())
            .collect();
        if cache_keys.is_empty() {
            return;
        }

        let found: HashMap<String, CacheEntry> =
            match ctx.run(self.cache.get_multi(&cache_keys)).await {
                Ok(found) => found,
                Err(err) => {
                    debug!(error = %err, "lock confirmation failed, bypassing cache");
                    HashMap::new()
                }
            };

        for (item, slot) in items.iter_mut().zip(dst.iter_mut()) {
            if item.state != ReadState::Miss {
                continue;
            }
            match (found.get(item.cache_key.as_str()), item.token) {
                (Some(entry), Some(token)) if entry.is_locked_by(token) => {
                    item.state = ReadState::InternalLock;
                    item.cas = entry.cas().cloned();
                }
                (Some(entry), _) => item.apply_found(entry, slot),
                // Evicted between add and re-read: nobody owns it.
                (None, _) => item.state = ReadState::ExternalLock,
            }
        }
    }

    /// Fetch every locked item from the backing store and return the cache
    /// entries to publish.
    async fn fall_back<T: Entity>(
        &self,
        ctx: &Context,
        keys: &[Key],
        items: &mut [ReadItem],
        dst: &mut [Option<T>],
    ) -> Vec<CacheEntry> {
        let positions: Vec<usize> = (0..items.len()).filter(|&i| items[i].holds_lock()).collect();
        if positions.is_empty() {
            return Vec::new();
        }

        let store_keys: Vec<Key> = positions.iter().map(|&i| keys[i].clone()).collect();
        let mut fetched: Vec<Option<Vec<u8>>> = vec![None; positions.len()];
        let result = ctx
            .run(self.store.get_multi(&store_keys, &mut fetched))
            .await;
        let errors = positional(result, positions.len());

        let mut staged = Vec::new();
        for ((&i, bytes), error) in positions.iter().zip(fetched).zip(errors) {
            let item = &mut items[i];
            let owned = item.state == ReadState::InternalLock;

            let bytes = match (error, bytes) {
                (None, Some(bytes)) => bytes,
                (Some(err), _) if !err.is_no_such_entity() => {
                    // Lock stays until it expires; no cache write.
                    item.finish(Some(err));
                    continue;
                }
                _ => {
                    if owned {
                        staged.push(self.stage(item, CacheEntry::absent(
                            item.cache_key.as_str(),
                            self.config.absent_ttl,
                        )));
                    }
                    item.finish(Some(StoreError::NoSuchEntity.into()));
                    continue;
                }
            };

            match T::from_bytes(&bytes) {
                Ok(value) => {
                    dst[i] = Some(value);
                    if owned && bytes.len() <= self.config.max_cache_value_bytes {
                        let entry = CacheEntry::present(
                            item.cache_key.as_str(),
                            bytes,
                            self.config.entity_ttl,
                        );
                        staged.push(self.stage(item, entry));
                    }
                    item.finish(None);
                }
                Err(err) => item.finish(Some(err)),
            }
        }
        staged
    }

    fn stage(&self, item: &ReadItem, entry: CacheEntry) -> CacheEntry {
        match &item.cas {
            Some(cas) => entry.with_cas(cas.clone()),
            None => entry,
        }
    }

    async fn replenish(&self, ctx: &Context, staged: Vec<CacheEntry>) {
        if staged.is_empty() {
            return;
        }
        // A failed swap means a writer got there first; its state is newer.
        if let Err(err) = ctx.run(self.cache.compare_and_swap(&staged)).await {
            debug!(error = %err, count = staged.len(), "replenishment skipped");
        }
    }
}

/// Read `keys` straight from `store`, bypassing the cache entirely.
pub(crate) async fn read_uncached<St, T>(
    ctx: &Context,
    store: &St,
    limit: usize,
    keys: &[Key],
    dst: &mut [Option<T>],
) -> LockstepResult<()>
where
    St: StoreOps + ?Sized,
    T: Entity,
{
    let chunks = chunk_ranges(keys.len(), limit)
        .into_iter()
        .zip(dst.chunks_mut(effective_limit(keys.len(), limit)))
        .map(|(range, slots)| {
            let keys = &keys[range.clone()];
            (range, async move {
                let mut fetched: Vec<Option<Vec<u8>>> = vec![None; keys.len()];
                let result = ctx.run(store.get_multi(keys, &mut fetched)).await;
                let mut errors = positional(result, keys.len());
                for ((slot, bytes), error) in slots.iter_mut().zip(fetched).zip(errors.iter_mut()) {
                    if error.is_some() {
                        continue;
                    }
                    match bytes.map(|b| T::from_bytes(&b)) {
                        Some(Ok(value)) => *slot = Some(value),
                        Some(Err(err)) => *error = Some(err),
                        None => *error = Some(StoreError::NoSuchEntity.into()),
                    }
                }
                errors.into_iter().collect::<MultiError>().into_result()
            })
        });
    join_chunks(keys.len(), chunks).await
}

/// Spread a store result over `len` positions.
fn positional(result: LockstepResult<()>, len: usize) -> Vec<Option<LockstepError>> {
    match result {
        Ok(()) => vec![None; len],
        Err(LockstepError::Multi(me)) if me.len() == len => me.into_slots(),
        Err(err) => vec![Some(err); len],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn setup() -> (MemoryStore, MemoryCacheBackend, LockstepConfig, TokenSource) {
        (
            MemoryStore::default(),
            MemoryCacheBackend::new(),
            LockstepConfig::default(),
            TokenSource::seeded(1),
        )
    }

    fn encode(s: &str) -> Vec<u8> {
        serde_json::to_vec(s).expect("encode")
    }

    #[test]
    fn test_positional_spreads_flat_errors() {
        let spread = positional(Err(LockstepError::Canceled), 3);
        assert_eq!(spread, vec![Some(LockstepError::Canceled); 3]);
        assert_eq!(positional(Ok(()), 2), vec![None, None]);
    }

    #[tokio::test]
    async fn test_cold_read_replenishes_cache() {
        let (store, cache, config, tokens) = setup();
        let key = Key::named("Note", "a");
        store
            .put_multi(&[key.clone()], &[encode("hello")])
            .await
            .expect("seed");

        let reader = Reader { store: &store, cache: &cache, config: &config, tokens: &tokens };
        let mut dst: Vec<Option<String>> = vec![None];
        reader
            .get_multi(&Context::background(), &[key.clone()], &mut dst)
            .await
            .expect("read should succeed");
        assert_eq!(dst[0].as_deref(), Some("hello"));

        let cached = cache
            .peek(CacheKey::derive(&config.cache_key_prefix, &key).as_str())
            .expect("replenished");
        assert_eq!(cached.status, EntryStatus::Present);
        assert_eq!(cached.value, encode("hello"));
    }

    #[tokio::test]
    async fn test_missing_key_caches_absent() {
        let (store, cache, config, tokens) = setup();
        let key = Key::named("Note", "ghost");
        let reader = Reader { store: &store, cache: &cache, config: &config, tokens: &tokens };

        let mut dst: Vec<Option<String>> = vec![None];
        let err = reader
            .get_multi(&Context::background(), &[key.clone()], &mut dst)
            .await
            .expect_err("missing");
        assert!(err
            .as_multi()
            .and_then(|m| m.get(0))
            .is_some_and(LockstepError::is_no_such_entity));

        let cached = cache
            .peek(CacheKey::derive(&config.cache_key_prefix, &key).as_str())
            .expect("negative entry");
        assert_eq!(cached.status, EntryStatus::Absent);
    }

    #[tokio::test]
    async fn test_foreign_lock_bypasses_cache_without_replenishing() {
        let (store, cache, config, tokens) = setup();
        let key = Key::named("Note", "busy");
        store
            .put_multi(&[key.clone()], &[encode("fresh")])
            .await
            .expect("seed");
        let cache_key = CacheKey::derive(&config.cache_key_prefix, &key);
        let foreign = CacheEntry::lock(cache_key.as_str(), LockToken::from(99), Duration::from_secs(30));
        cache.set(&[foreign]).await.expect("foreign lock");

        let reader = Reader { store: &store, cache: &cache, config: &config, tokens: &tokens };
        let mut dst: Vec<Option<String>> = vec![None];
        reader
            .get_multi(&Context::background(), &[key], &mut dst)
            .await
            .expect("read through");
        assert_eq!(dst[0].as_deref(), Some("fresh"));

        let cached = cache.peek(cache_key.as_str()).expect("lock still there");
        assert!(cached.is_locked_by(LockToken::from(99)));
    }

    #[tokio::test]
    async fn test_undecodable_cache_entry_falls_through() {
        let (store, cache, config, tokens) = setup();
        let key = Key::named("Note", "garbled");
        store
            .put_multi(&[key.clone()], &[encode("good")])
            .await
            .expect("seed");
        let cache_key = CacheKey::derive(&config.cache_key_prefix, &key);
        cache
            .set(&[CacheEntry::present(cache_key.as_str(), b"{not json".to_vec(), Duration::ZERO)])
            .await
            .expect("garbage");

        let reader = Reader { store: &store, cache: &cache, config: &config, tokens: &tokens };
        let mut dst: Vec<Option<String>> = vec![None];
        reader
            .get_multi(&Context::background(), &[key], &mut dst)
            .await
            .expect("served from store");
        assert_eq!(dst[0].as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_oversized_value_is_not_cached() {
        let (store, cache, config, tokens) = setup();
        let config = config.with_max_cache_value_bytes(4);
        let key = Key::named("Note", "big");
        store
            .put_multi(&[key.clone()], &[encode("far too large")])
            .await
            .expect("seed");

        let reader = Reader { store: &store, cache: &cache, config: &config, tokens: &tokens };
        let mut dst: Vec<Option<String>> = vec![None];
        reader
            .get_multi(&Context::background(), &[key.clone()], &mut dst)
            .await
            .expect("read");
        assert_eq!(dst[0].as_deref(), Some("far too large"));

        let cached = cache
            .peek(CacheKey::derive(&config.cache_key_prefix, &key).as_str())
            .expect("our lock remains");
        assert!(cached.is_locked());
    }
}
