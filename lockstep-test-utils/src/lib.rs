//! Lockstep Test Utilities
//!
//! Shared test infrastructure for the Lockstep workspace:
//! - Proptest generators for keys and sample entities
//! - Fixtures for common scenarios
//! - Call-counting and fault-injecting wrappers around the cache and
//!   backing-store contracts
//! - Custom assertions for positional errors

pub use lockstep_core::{
    CacheEntry, CacheError, Key, LockstepConfig, LockstepError, LockstepResult, MultiError,
    Mutation, StoreError,
};
pub use lockstep_storage::{
    BackingStore, CacheBackend, CacheStats, Context, Lockstep, MemoryCacheBackend, MemoryStore,
    StoreLimits, StoreOps, TokenSource,
};

use serde::{Deserialize, Serialize};

/// Sample entity used across the workspace's tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub body: String,
    pub revision: u32,
}

impl Article {
    pub fn new(title: impl Into<String>, revision: u32) -> Self {
        let title = title.into();
        Self {
            body: format!("body of {title}"),
            title,
            revision,
        }
    }
}

/// Install a test-friendly `tracing` subscriber. Filter with `RUST_LOG`;
/// safe to call from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and entities.

    use super::*;
    use proptest::prelude::*;

    /// A kind from a small fixed set, so collisions between generated keys
    /// actually happen.
    pub fn arb_kind() -> impl Strategy<Value = String> {
        prop_oneof![Just("Article"), Just("User"), Just("Order")].prop_map(String::from)
    }

    /// A complete root key with either a numeric id or a name.
    pub fn arb_root_key() -> impl Strategy<Value = Key> {
        prop_oneof![
            (arb_kind(), 1i64..10_000).prop_map(|(kind, id)| Key::with_id(kind, id)),
            (arb_kind(), "[a-z0-9:/_-]{1,12}").prop_map(|(kind, name)| Key::named(kind, name)),
        ]
    }

    /// A complete key, possibly with a parent and a namespace.
    pub fn arb_key() -> impl Strategy<Value = Key> {
        (
            arb_root_key(),
            proptest::option::of(arb_root_key()),
            proptest::option::of("[a-z]{1,6}"),
        )
            .prop_map(|(key, parent, namespace)| {
                let key = match parent {
                    Some(parent) => key.with_parent(parent),
                    None => key,
                };
                match namespace {
                    Some(ns) => key.in_namespace(ns),
                    None => key,
                }
            })
    }

    /// Distinct complete keys.
    pub fn arb_unique_keys(size: std::ops::Range<usize>) -> impl Strategy<Value = Vec<Key>> {
        prop::collection::btree_set(arb_key(), size).prop_map(|set| set.into_iter().collect())
    }

    pub fn arb_article() -> impl Strategy<Value = Article> {
        ("[A-Za-z ]{1,24}", ".{0,64}", 0u32..100).prop_map(|(title, body, revision)| Article {
            title,
            body,
            revision,
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built clients and data.

    use super::*;
    use std::sync::Arc;

    /// `count` numbered article keys.
    pub fn article_keys(count: usize) -> Vec<Key> {
        (1..=count as i64).map(|i| Key::with_id("Article", i)).collect()
    }

    /// One article per key, revision = position.
    pub fn articles_for(keys: &[Key]) -> Vec<Article> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| Article::new(key.to_string(), i as u32))
            .collect()
    }

    /// Config whose limits force fan-out on small batches.
    pub fn small_limits_config(limit: usize) -> LockstepConfig {
        LockstepConfig::default()
            .with_store_limits(limit, limit, limit)
            .with_cache_get_limit(limit)
    }

    /// A client over fresh in-memory backends, deterministic lock tokens.
    pub fn memory_client(
        config: LockstepConfig,
    ) -> (Lockstep<MemoryStore, MemoryCacheBackend>, MemoryStore, Arc<MemoryCacheBackend>) {
        let store = MemoryStore::new(StoreLimits::from_config(&config));
        let cache = Arc::new(MemoryCacheBackend::new());
        let client = build_client(store.clone(), Arc::clone(&cache), config);
        (client, store, cache)
    }

    /// Build a client over arbitrary backends.
    pub fn build_client<S: BackingStore, C: CacheBackend>(
        store: S,
        cache: Arc<C>,
        config: LockstepConfig,
    ) -> Lockstep<S, C> {
        match Lockstep::new(Arc::new(store), cache, config) {
            Ok(client) => client.with_token_source(TokenSource::seeded(7)),
            Err(err) => panic!("fixture config must be valid: {err}"),
        }
    }
}

// ============================================================================
// TEST DOUBLES
// ============================================================================

pub mod doubles {
    //! Wrappers that count calls or inject failures.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::future::BoxFuture;

    use super::*;
    use lockstep_storage::StoreTransaction;

    fn injected(op: &str) -> LockstepError {
        CacheError::Backend {
            reason: format!("injected {op} failure"),
        }
        .into()
    }

    // ------------------------------------------------------------------------
    // Backing store
    // ------------------------------------------------------------------------

    /// Counts backing-store calls and per-key fetches; can fail gets.
    #[derive(Debug)]
    pub struct CountingStore<S> {
        inner: S,
        get_calls: AtomicUsize,
        fetched: Mutex<HashMap<Key, usize>>,
        fail_gets: Mutex<Option<LockstepError>>,
    }

    impl<S> CountingStore<S> {
        pub fn new(inner: S) -> Self {
            Self {
                inner,
                get_calls: AtomicUsize::new(0),
                fetched: Mutex::new(HashMap::new()),
                fail_gets: Mutex::new(None),
            }
        }

        pub fn inner(&self) -> &S {
            &self.inner
        }

        /// Number of `get_multi` calls so far.
        pub fn get_calls(&self) -> usize {
            self.get_calls.load(Ordering::SeqCst)
        }

        /// How many times `key` was requested from the store.
        pub fn fetches_of(&self, key: &Key) -> usize {
            self.fetched
                .lock()
                .map(|f| f.get(key).copied().unwrap_or(0))
                .unwrap_or(0)
        }

        pub fn reset(&self) {
            self.get_calls.store(0, Ordering::SeqCst);
            if let Ok(mut fetched) = self.fetched.lock() {
                fetched.clear();
            }
        }

        /// Make every following `get_multi` fail with `err`.
        pub fn fail_gets_with(&self, err: Option<LockstepError>) {
            if let Ok(mut slot) = self.fail_gets.lock() {
                *slot = err;
            }
        }

        fn record_get(&self, keys: &[Key]) -> LockstepResult<()> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut fetched) = self.fetched.lock() {
                for key in keys {
                    *fetched.entry(key.clone()).or_default() += 1;
                }
            }
            match self.fail_gets.lock().ok().and_then(|slot| slot.clone()) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl<S: StoreOps> StoreOps for CountingStore<S> {
        async fn get_multi(&self, keys: &[Key], dst: &mut [Option<Vec<u8>>]) -> LockstepResult<()> {
            self.record_get(keys)?;
            self.inner.get_multi(keys, dst).await
        }

        async fn put_multi(&self, keys: &[Key], values: &[Vec<u8>]) -> LockstepResult<Vec<Key>> {
            self.inner.put_multi(keys, values).await
        }

        async fn delete_multi(&self, keys: &[Key]) -> LockstepResult<()> {
            self.inner.delete_multi(keys).await
        }

        async fn mutate(
            &self,
            mutations: &[Mutation<Vec<u8>>],
        ) -> LockstepResult<Vec<Option<Key>>> {
            self.inner.mutate(mutations).await
        }
    }

    #[async_trait]
    impl<S: BackingStore> BackingStore for CountingStore<S> {
        type Txn = S::Txn;

        async fn begin(&self) -> LockstepResult<Self::Txn> {
            self.inner.begin().await
        }
    }

    // ------------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------------

    /// Cache operations a [`FaultyCache`] can fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum CacheOp {
        Add,
        Set,
        CompareAndSwap,
        Delete,
        GetMulti,
    }

    type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

    /// When a [`FaultyCache`] hook runs relative to its operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Phase {
        Before,
        After,
    }

    /// Cache wrapper that counts calls, fails selected operations, and can
    /// run one-shot async hooks around the next call of an operation.
    ///
    /// Hooks are how tests put another client's work in the gaps of the
    /// read protocol, e.g. between the lock add and its confirmation.
    pub struct FaultyCache<C> {
        inner: C,
        /// Operation fails once it has been called more than this many times.
        failing: Mutex<HashMap<CacheOp, usize>>,
        calls: Mutex<HashMap<CacheOp, usize>>,
        hooks: Mutex<HashMap<(Phase, CacheOp), Hook>>,
    }

    impl<C> FaultyCache<C> {
        pub fn new(inner: C) -> Self {
            Self {
                inner,
                failing: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                hooks: Mutex::new(HashMap::new()),
            }
        }

        pub fn inner(&self) -> &C {
            &self.inner
        }

        /// Fail every following call of `op`.
        pub fn fail(&self, op: CacheOp) {
            self.fail_after(op, 0);
        }

        /// Let `op` through `calls` more times, then fail it.
        pub fn fail_after(&self, op: CacheOp, calls: usize) {
            let threshold = self.calls(op) + calls;
            if let Ok(mut failing) = self.failing.lock() {
                failing.insert(op, threshold);
            }
        }

        pub fn heal(&self, op: CacheOp) {
            if let Ok(mut failing) = self.failing.lock() {
                failing.remove(&op);
            }
        }

        pub fn calls(&self, op: CacheOp) -> usize {
            self.calls
                .lock()
                .map(|c| c.get(&op).copied().unwrap_or(0))
                .unwrap_or(0)
        }

        /// Run `hook` once, just before the next `op` reaches the inner
        /// cache.
        pub fn before_next<F>(&self, op: CacheOp, hook: F)
        where
            F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
        {
            self.install(Phase::Before, op, Box::new(hook));
        }

        /// Run `hook` once, right after the next `op` returns from the
        /// inner cache.
        pub fn after_next<F>(&self, op: CacheOp, hook: F)
        where
            F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
        {
            self.install(Phase::After, op, Box::new(hook));
        }

        pub fn before_next_cas<F>(&self, hook: F)
        where
            F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
        {
            self.before_next(CacheOp::CompareAndSwap, hook);
        }

        fn install(&self, phase: Phase, op: CacheOp, hook: Hook) {
            if let Ok(mut hooks) = self.hooks.lock() {
                hooks.insert((phase, op), hook);
            }
        }

        async fn fire(&self, phase: Phase, op: CacheOp) {
            let hook = self
                .hooks
                .lock()
                .ok()
                .and_then(|mut hooks| hooks.remove(&(phase, op)));
            if let Some(hook) = hook {
                hook().await;
            }
        }

        fn enter(&self, op: CacheOp) -> LockstepResult<()> {
            let count = match self.calls.lock() {
                Ok(mut calls) => {
                    let count = calls.entry(op).or_default();
                    *count += 1;
                    *count
                }
                Err(_) => 0,
            };
            let threshold = self.failing.lock().ok().and_then(|f| f.get(&op).copied());
            match threshold {
                Some(threshold) if count > threshold => Err(injected(&format!("{op:?}"))),
                _ => Ok(()),
            }
        }

        async fn around<T, Fut>(&self, op: CacheOp, call: Fut) -> LockstepResult<T>
        where
            Fut: std::future::Future<Output = LockstepResult<T>>,
        {
            self.enter(op)?;
            self.fire(Phase::Before, op).await;
            let result = call.await;
            self.fire(Phase::After, op).await;
            result
        }
    }

    #[async_trait]
    impl<C: CacheBackend> CacheBackend for FaultyCache<C> {
        async fn add(&self, entries: &[CacheEntry]) -> LockstepResult<()> {
            self.around(CacheOp::Add, self.inner.add(entries)).await
        }

        async fn set(&self, entries: &[CacheEntry]) -> LockstepResult<()> {
            self.around(CacheOp::Set, self.inner.set(entries)).await
        }

        async fn compare_and_swap(&self, entries: &[CacheEntry]) -> LockstepResult<()> {
            self.around(CacheOp::CompareAndSwap, self.inner.compare_and_swap(entries))
                .await
        }

        async fn delete(&self, keys: &[String]) -> LockstepResult<()> {
            self.around(CacheOp::Delete, self.inner.delete(keys)).await
        }

        async fn get_multi(
            &self,
            keys: &[String],
        ) -> LockstepResult<HashMap<String, CacheEntry>> {
            self.around(CacheOp::GetMulti, self.inner.get_multi(keys)).await
        }

        async fn stats(&self) -> LockstepResult<CacheStats> {
            self.inner.stats().await
        }
    }

    /// A store transaction that refuses to commit.
    pub struct DoomedTransaction<T>(pub T);

    #[async_trait]
    impl<T: StoreTransaction> StoreOps for DoomedTransaction<T> {
        async fn get_multi(&self, keys: &[Key], dst: &mut [Option<Vec<u8>>]) -> LockstepResult<()> {
            self.0.get_multi(keys, dst).await
        }

        async fn put_multi(&self, keys: &[Key], values: &[Vec<u8>]) -> LockstepResult<Vec<Key>> {
            self.0.put_multi(keys, values).await
        }

        async fn delete_multi(&self, keys: &[Key]) -> LockstepResult<()> {
            self.0.delete_multi(keys).await
        }

        async fn mutate(
            &self,
            mutations: &[Mutation<Vec<u8>>],
        ) -> LockstepResult<Vec<Option<Key>>> {
            self.0.mutate(mutations).await
        }
    }

    #[async_trait]
    impl<T: StoreTransaction> StoreTransaction for DoomedTransaction<T> {
        async fn commit(self) -> LockstepResult<()> {
            self.0.rollback().await?;
            Err(StoreError::TransactionFailed {
                reason: "commit refused".into(),
            }
            .into())
        }

        async fn rollback(self) -> LockstepResult<()> {
            self.0.rollback().await
        }
    }

    /// A store whose transactions never commit.
    pub struct DoomedStore<S>(pub S);

    #[async_trait]
    impl<S: BackingStore> StoreOps for DoomedStore<S> {
        async fn get_multi(&self, keys: &[Key], dst: &mut [Option<Vec<u8>>]) -> LockstepResult<()> {
            self.0.get_multi(keys, dst).await
        }

        async fn put_multi(&self, keys: &[Key], values: &[Vec<u8>]) -> LockstepResult<Vec<Key>> {
            self.0.put_multi(keys, values).await
        }

        async fn delete_multi(&self, keys: &[Key]) -> LockstepResult<()> {
            self.0.delete_multi(keys).await
        }

        async fn mutate(
            &self,
            mutations: &[Mutation<Vec<u8>>],
        ) -> LockstepResult<Vec<Option<Key>>> {
            self.0.mutate(mutations).await
        }
    }

    #[async_trait]
    impl<S: BackingStore> BackingStore for DoomedStore<S> {
        type Txn = DoomedTransaction<S::Txn>;

        async fn begin(&self) -> LockstepResult<Self::Txn> {
            Ok(DoomedTransaction(self.0.begin().await?))
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Helpers for inspecting positional results.

    use super::*;

    /// Spread any batch result over `len` positions: `Ok` is all `None`, a
    /// matching `MultiError` is its slots, a flat error fills every slot.
    pub fn slot_errors(result: &LockstepResult<()>, len: usize) -> Vec<Option<LockstepError>> {
        match result {
            Ok(()) => vec![None; len],
            Err(LockstepError::Multi(me)) if me.len() == len => me.iter().cloned().collect(),
            Err(err) => vec![Some(err.clone()); len],
        }
    }

    /// Assert the error at `index` satisfies `check`.
    #[track_caller]
    pub fn assert_slot<F>(result: &LockstepResult<()>, len: usize, index: usize, check: F)
    where
        F: Fn(&LockstepError) -> bool,
    {
        let slots = slot_errors(result, len);
        match &slots[index] {
            Some(err) if check(err) => {}
            other => panic!("unexpected error at position {index}: {other:?}"),
        }
    }

    /// Assert position `index` succeeded.
    #[track_caller]
    pub fn assert_slot_ok(result: &LockstepResult<()>, len: usize, index: usize) {
        let slots = slot_errors(result, len);
        assert!(
            slots[index].is_none(),
            "expected success at position {index}, got {:?}",
            slots[index]
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_slot_errors_spreads_flat_error() {
        let result: LockstepResult<()> = Err(LockstepError::Canceled);
        let slots = assertions::slot_errors(&result, 3);
        assert!(slots.iter().all(|s| s == &Some(LockstepError::Canceled)));
    }

    #[test]
    fn test_articles_for_keys() {
        let keys = fixtures::article_keys(3);
        let articles = fixtures::articles_for(&keys);
        assert_eq!(articles.len(), 3);
        assert_eq!(articles[2].revision, 2);
    }

    #[tokio::test]
    async fn test_faulty_cache_injects_and_heals() {
        let cache = doubles::FaultyCache::new(MemoryCacheBackend::new());
        cache.fail(doubles::CacheOp::Delete);
        assert!(cache.delete(&["k".to_string()]).await.is_err());
        cache.heal(doubles::CacheOp::Delete);
        assert!(cache.delete(&["k".to_string()]).await.is_ok());
        assert_eq!(cache.calls(doubles::CacheOp::Delete), 2);
    }

    #[tokio::test]
    async fn test_faulty_cache_fails_after_allowed_calls() {
        let cache = doubles::FaultyCache::new(MemoryCacheBackend::new());
        cache.fail_after(doubles::CacheOp::GetMulti, 1);
        assert!(cache.get_multi(&["k".to_string()]).await.is_ok());
        assert!(cache.get_multi(&["k".to_string()]).await.is_err());
        assert!(cache.get_multi(&["k".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_faulty_cache_hooks_fire_once_in_order() {
        use futures_util::FutureExt;
        use std::sync::{Arc, Mutex};

        let cache = doubles::FaultyCache::new(MemoryCacheBackend::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (label, before) in [("before", true), ("after", false)] {
            let seen = Arc::clone(&seen);
            let hook = move || {
                async move {
                    seen.lock().expect("hook log").push(label);
                }
                .boxed()
            };
            if before {
                cache.before_next(doubles::CacheOp::Add, hook);
            } else {
                cache.after_next(doubles::CacheOp::Add, hook);
            }
        }

        let entry = CacheEntry::absent("k", std::time::Duration::ZERO);
        cache.add(&[entry.clone()]).await.expect("add should succeed");
        let _ = cache.add(&[entry]).await;
        assert_eq!(*seen.lock().expect("hook log"), vec!["before", "after"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_keys_are_complete(keys in generators::arb_unique_keys(1..20)) {
            for key in &keys {
                prop_assert!(key.is_complete());
                prop_assert!(key.validate().is_ok());
            }
        }
    }
}
