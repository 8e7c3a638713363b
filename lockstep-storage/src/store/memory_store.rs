//! In-process backing store.
//!
//! Enforces per-call item limits the way a remote store would, allocates ids
//! for incomplete keys, and buffers transaction writes until commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lockstep_core::{
    Key, LockstepConfig, LockstepResult, Mutation, MutationKind, MultiError, StoreError,
    ValidationError,
};
use tokio::sync::Mutex;

use super::traits::{BackingStore, StoreOps, StoreTransaction};

/// Per-call item limits of a backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub get: usize,
    pub put: usize,
    pub delete: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            get: 1000,
            put: 500,
            delete: 500,
        }
    }
}

impl StoreLimits {
    pub fn new(get: usize, put: usize, delete: usize) -> Self {
        Self { get, put, delete }
    }

    /// The limits a client built from `config` will respect.
    pub fn from_config(config: &LockstepConfig) -> Self {
        Self::new(config.get_limit, config.put_limit, config.delete_limit)
    }
}

type Entities = BTreeMap<Key, Vec<u8>>;
type Pending = BTreeMap<Key, Option<Vec<u8>>>;

#[derive(Debug)]
struct Shared {
    entities: Mutex<Entities>,
    next_id: AtomicI64,
    limits: StoreLimits,
}

impl Shared {
    fn complete(&self, key: &Key) -> Key {
        if key.is_complete() {
            key.clone()
        } else {
            key.complete_with(self.next_id.fetch_add(1, Ordering::Relaxed))
        }
    }
}

/// Read/write access to entity state: either the committed map or a
/// transaction's pending writes layered over it.
trait View {
    fn read(&self, key: &Key) -> Option<&[u8]>;
    fn write(&mut self, key: Key, value: Option<Vec<u8>>);
}

impl View for Entities {
    fn read(&self, key: &Key) -> Option<&[u8]> {
        self.get(key).map(Vec::as_slice)
    }

    fn write(&mut self, key: Key, value: Option<Vec<u8>>) {
        match value {
            Some(value) => {
                self.insert(key, value);
            }
            None => {
                self.remove(&key);
            }
        }
    }
}

struct Overlay<'a> {
    base: &'a Entities,
    pending: &'a mut Pending,
}

impl View for Overlay<'_> {
    fn read(&self, key: &Key) -> Option<&[u8]> {
        match self.pending.get(key) {
            Some(staged) => staged.as_deref(),
            None => self.base.read(key),
        }
    }

    fn write(&mut self, key: Key, value: Option<Vec<u8>>) {
        self.pending.insert(key, value);
    }
}

fn check_limit(op: &'static str, limit: usize, got: usize) -> LockstepResult<()> {
    if got > limit {
        return Err(StoreError::LimitExceeded { op, limit, got }.into());
    }
    Ok(())
}

fn require_complete(key: &Key) -> Result<(), ValidationError> {
    key.validate()?;
    if !key.is_complete() {
        return Err(ValidationError::IncompleteKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn get_into(
    view: &impl View,
    limits: StoreLimits,
    keys: &[Key],
    dst: &mut [Option<Vec<u8>>],
) -> LockstepResult<()> {
    check_limit("get", limits.get, keys.len())?;
    let mut errors = MultiError::new(keys.len());

    for (i, key) in keys.iter().enumerate() {
        if let Err(err) = require_complete(key) {
            errors.set(i, err.into());
            continue;
        }
        match view.read(key) {
            Some(value) => dst[i] = Some(value.to_vec()),
            None => errors.set(i, StoreError::NoSuchEntity.into()),
        }
    }

    errors.into_result()
}

fn put_all(
    view: &mut impl View,
    shared: &Shared,
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
    check_limit("put", shared.limits.put, keys.len())?;

    let mut errors = MultiError::new(keys.len());
    for (i, key) in keys.iter().enumerate() {
        if let Err(err) = key.validate() {
            errors.set(i, err.into());
        }
    }
    errors.into_result()?;

    let mut completed = Vec::with_capacity(keys.len());
    for (key, value) in keys.iter().zip(values) {
        let key = shared.complete(key);
        view.write(key.clone(), Some(value.clone()));
        completed.push(key);
    }
    Ok(completed)
}

fn delete_all(view: &mut impl View, limits: StoreLimits, keys: &[Key]) -> LockstepResult<()> {
    check_limit("delete", limits.delete, keys.len())?;

    let mut errors = MultiError::new(keys.len());
    for (i, key) in keys.iter().enumerate() {
        match require_complete(key) {
            Ok(()) => view.write(key.clone(), None),
            Err(err) => errors.set(i, err.into()),
        }
    }
    errors.into_result()
}

/// All-or-nothing: nothing is written unless every mutation is valid.
fn mutate_all(
    view: &mut impl View,
    shared: &Shared,
    mutations: &[Mutation<Vec<u8>>],
) -> LockstepResult<Vec<Option<Key>>> {
    check_limit("mutate", shared.limits.put, mutations.len())?;

    let mut staged = Pending::new();
    let mut errors = MultiError::new(mutations.len());
    let mut affected = Vec::with_capacity(mutations.len());

    for (i, m) in mutations.iter().enumerate() {
        let outcome = stage_one(shared, m, i, |key| match staged.get(key) {
            Some(value) => value.is_some(),
            None => view.read(key).is_some(),
        });

        match outcome {
            Ok((key, value)) => {
                let reported = m.kind.carries_value().then(|| key.clone());
                staged.insert(key, value);
                affected.push(reported);
            }
            Err(err) => {
                errors.set(i, err);
                affected.push(None);
            }
        }
    }

    errors.into_result()?;
    for (key, value) in staged {
        view.write(key, value);
    }
    Ok(affected)
}

fn stage_one(
    shared: &Shared,
    m: &Mutation<Vec<u8>>,
    index: usize,
    exists: impl Fn(&Key) -> bool,
) -> Result<(Key, Option<Vec<u8>>), lockstep_core::LockstepError> {
    m.key.validate()?;
    if m.kind.carries_value() && m.value.is_none() {
        return Err(ValidationError::MissingValue { index }.into());
    }

    match m.kind {
        MutationKind::Insert => {
            let key = shared.complete(&m.key);
            if exists(&key) {
                return Err(StoreError::AlreadyExists.into());
            }
            Ok((key, m.value.clone()))
        }
        MutationKind::Upsert => Ok((shared.complete(&m.key), m.value.clone())),
        MutationKind::Update => {
            require_complete(&m.key)?;
            if !exists(&m.key) {
                return Err(StoreError::NoSuchEntity.into());
            }
            Ok((m.key.clone(), m.value.clone()))
        }
        MutationKind::Delete => {
            require_complete(&m.key)?;
            Ok((m.key.clone(), None))
        }
    }
}

/// In-process backing store. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}

impl MemoryStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            shared: Arc::new(Shared {
                entities: Mutex::new(Entities::new()),
                next_id: AtomicI64::new(1),
                limits,
            }),
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.shared.limits
    }

    /// Number of stored entities.
    pub async fn len(&self) -> usize {
        self.shared.entities.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Raw stored bytes for `key`, bypassing limits.
    pub async fn raw(&self, key: &Key) -> Option<Vec<u8>> {
        self.shared.entities.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl StoreOps for MemoryStore {
    async fn get_multi(&self, keys: &[Key], dst: &mut [Option<Vec<u8>>]) -> LockstepResult<()> {
        let entities = self.shared.entities.lock().await;
        get_into(&*entities, self.shared.limits, keys, dst)
    }

    async fn put_multi(&self, keys: &[Key], values: &[Vec<u8>]) -> LockstepResult<Vec<Key>> {
        let mut entities = self.shared.entities.lock().await;
        put_all(&mut *entities, &self.shared, keys, values)
    }

    async fn delete_multi(&self, keys: &[Key]) -> LockstepResult<()> {
        let mut entities = self.shared.entities.lock().await;
        delete_all(&mut *entities, self.shared.limits, keys)
    }

    async fn mutate(&self, mutations: &[Mutation<Vec<u8>>]) -> LockstepResult<Vec<Option<Key>>> {
        let mut entities = self.shared.entities.lock().await;
        mutate_all(&mut *entities, &self.shared, mutations)
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    type Txn = MemoryTransaction;

    async fn begin(&self) -> LockstepResult<Self::Txn> {
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            pending: Mutex::new(Pending::new()),
        })
    }
}

/// Transaction over a [`MemoryStore`]. Reads see the transaction's own
/// writes; nothing reaches the store until commit.
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    pending: Mutex<Pending>,
}

#[async_trait]
impl StoreOps for MemoryTransaction {
    async fn get_multi(&self, keys: &[Key], dst: &mut [Option<Vec<u8>>]) -> LockstepResult<()> {
        let entities = self.shared.entities.lock().await;
        let mut pending = self.pending.lock().await;
        let overlay = Overlay {
            base: &entities,
            pending: &mut pending,
        };
        get_into(&overlay, self.shared.limits, keys, dst)
    }

    async fn put_multi(&self, keys: &[Key], values: &[Vec<u8>]) -> LockstepResult<Vec<Key>> {
        let entities = self.shared.entities.lock().await;
        let mut pending = self.pending.lock().await;
        let mut overlay = Overlay {
            base: &entities,
            pending: &mut pending,
        };
        put_all(&mut overlay, &self.shared, keys, values)
    }

    async fn delete_multi(&self, keys: &[Key]) -> LockstepResult<()> {
        let entities = self.shared.entities.lock().await;
        let mut pending = self.pending.lock().await;
        let mut overlay = Overlay {
            base: &entities,
            pending: &mut pending,
        };
        delete_all(&mut overlay, self.shared.limits, keys)
    }

    async fn mutate(&self, mutations: &[Mutation<Vec<u8>>]) -> LockstepResult<Vec<Option<Key>>> {
        let entities = self.shared.entities.lock().await;
        let mut pending = self.pending.lock().await;
        let mut overlay = Overlay {
            base: &entities,
            pending: &mut pending,
        };
        mutate_all(&mut overlay, &self.shared, mutations)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self) -> LockstepResult<()> {
        let mut entities = self.shared.entities.lock().await;
        for (key, value) in self.pending.into_inner() {
            entities.write(key, value);
        }
        Ok(())
    }

    async fn rollback(self) -> LockstepResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::LockstepError;

    fn bytes(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryStore::default();
        let keys = vec![Key::named("User", "ada"), Key::incomplete("User")];
        let completed = store
            .put_multi(&keys, &[bytes("a"), bytes("b")])
            .await
            .expect("put should succeed");
        assert_eq!(completed[0], keys[0]);
        assert!(completed[1].is_complete());

        let mut dst = vec![None; 2];
        store
            .get_multi(&completed, &mut dst)
            .await
            .expect("get should succeed");
        assert_eq!(dst, vec![Some(bytes("a")), Some(bytes("b"))]);
    }

    #[tokio::test]
    async fn test_get_reports_missing_positionally() {
        let store = MemoryStore::default();
        store
            .put_multi(&[Key::with_id("K", 1)], &[bytes("x")])
            .await
            .expect("put");

        let keys = vec![Key::with_id("K", 1), Key::with_id("K", 2)];
        let mut dst = vec![None; 2];
        let err = store
            .get_multi(&keys, &mut dst)
            .await
            .expect_err("one key missing");
        let me = err.as_multi().expect("positional");
        assert!(me[0].is_none());
        assert!(me.get(1).is_some_and(LockstepError::is_no_such_entity));
        assert_eq!(dst[0], Some(bytes("x")));
    }

    #[tokio::test]
    async fn test_limits_are_enforced() {
        let store = MemoryStore::new(StoreLimits::new(2, 2, 2));
        let keys: Vec<Key> = (1..=3).map(|i| Key::with_id("K", i)).collect();
        let mut dst = vec![None; 3];
        let err = store
            .get_multi(&keys, &mut dst)
            .await
            .expect_err("over limit");
        assert!(matches!(
            err,
            LockstepError::Store(StoreError::LimitExceeded { op: "get", limit: 2, got: 3 })
        ));
    }

    #[tokio::test]
    async fn test_incomplete_key_rejected_for_get() {
        let store = MemoryStore::default();
        let mut dst = vec![None];
        let err = store
            .get_multi(&[Key::incomplete("K")], &mut dst)
            .await
            .expect_err("incomplete");
        assert!(matches!(
            err.as_multi().and_then(|m| m.get(0)),
            Some(LockstepError::Validation(ValidationError::IncompleteKey { .. }))
        ));
    }

    #[tokio::test]
    async fn test_mutate_is_all_or_nothing() {
        let store = MemoryStore::default();
        let existing = Key::with_id("K", 1);
        store
            .put_multi(&[existing.clone()], &[bytes("v")])
            .await
            .expect("seed");

        let err = store
            .mutate(&[
                Mutation::upsert(Key::with_id("K", 2), bytes("new")),
                Mutation::insert(existing.clone(), bytes("dup")),
            ])
            .await
            .expect_err("insert over existing");
        let me = err.as_multi().expect("positional");
        assert!(me[0].is_none());
        assert_eq!(
            me.get(1),
            Some(&LockstepError::Store(StoreError::AlreadyExists))
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_mutate_mixed_kinds() {
        let store = MemoryStore::default();
        let a = Key::with_id("K", 1);
        let b = Key::with_id("K", 2);
        store
            .put_multi(&[a.clone(), b.clone()], &[bytes("a"), bytes("b")])
            .await
            .expect("seed");

        let affected = store
            .mutate(&[
                Mutation::update(a.clone(), bytes("a2")),
                Mutation::delete(b.clone()),
                Mutation::insert(Key::incomplete("K"), bytes("c")),
            ])
            .await
            .expect("mutate should succeed");

        assert_eq!(affected[0], Some(a.clone()));
        assert_eq!(affected[1], None);
        assert!(affected[2].as_ref().is_some_and(Key::is_complete));
        assert_eq!(store.raw(&a).await, Some(bytes("a2")));
        assert_eq!(store.raw(&b).await, None);
    }

    #[tokio::test]
    async fn test_update_missing_entity_fails() {
        let store = MemoryStore::default();
        let err = store
            .mutate(&[Mutation::update(Key::with_id("K", 9), bytes("x"))])
            .await
            .expect_err("update needs an existing entity");
        assert!(err
            .as_multi()
            .and_then(|m| m.get(0))
            .is_some_and(LockstepError::is_no_such_entity));
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let store = MemoryStore::default();
        let key = Key::named("K", "t");

        let txn = store.begin().await.expect("begin");
        txn.put_multi(&[key.clone()], &[bytes("v")])
            .await
            .expect("txn put");

        let mut dst = vec![None];
        txn.get_multi(&[key.clone()], &mut dst)
            .await
            .expect("txn reads its own write");
        assert_eq!(dst[0], Some(bytes("v")));
        assert_eq!(store.raw(&key).await, None);

        txn.commit().await.expect("commit");
        assert_eq!(store.raw(&key).await, Some(bytes("v")));

        let txn = store.begin().await.expect("begin");
        txn.delete_multi(&[key.clone()]).await.expect("txn delete");
        txn.rollback().await.expect("rollback");
        assert_eq!(store.raw(&key).await, Some(bytes("v")));
    }
}
