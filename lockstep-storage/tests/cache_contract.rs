//! Conformance suite for `CacheBackend` implementations.
//!
//! Every backend the protocol can run on must pass the same scenarios.

use std::collections::HashMap;
use std::time::Duration;

use lockstep_storage::{
    CacheBackend, CacheEntry, EntryStatus, LmdbCacheBackend, LockToken, LockstepError,
    MemoryCacheBackend,
};
use tempfile::TempDir;

fn present(key: &str, value: &str, ttl: Duration) -> CacheEntry {
    CacheEntry::present(key, value.as_bytes().to_vec(), ttl)
}

fn names(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

fn slots(result: Result<(), LockstepError>, len: usize) -> Vec<Option<LockstepError>> {
    match result {
        Ok(()) => vec![None; len],
        Err(LockstepError::Multi(me)) => me.into_slots(),
        Err(err) => panic!("expected positional errors, got {err}"),
    }
}

async fn fetch<C: CacheBackend>(cache: &C, keys: &[&str]) -> HashMap<String, CacheEntry> {
    cache
        .get_multi(&names(keys))
        .await
        .expect("get_multi should succeed")
}

// ============================================================================
// SCENARIOS
// ============================================================================

async fn cas_conflict_scenario<C: CacheBackend>(cache: &C) {
    let forever = Duration::ZERO;
    cache
        .set(&[
            present("a", "a0", forever),
            present("b", "b0", forever),
            present("c", "c0", forever),
            present("d", "d0", forever),
        ])
        .await
        .expect("seed should succeed");
    let snapshot = fetch(cache, &["a", "b", "c", "d"]).await;

    // Another writer interferes with b, c and d between get and CAS.
    cache.delete(&names(&["b"])).await.expect("delete b");
    cache
        .set(&[present("c", "c1", forever)])
        .await
        .expect("rewrite c");
    cache
        .set(&[CacheEntry::new("d", EntryStatus::Absent, b"d0".to_vec(), forever)])
        .await
        .expect("flip d");

    let swap: Vec<CacheEntry> = ["a", "b", "c", "d"]
        .iter()
        .map(|k| {
            let cas = snapshot[*k].cas().cloned().expect("cas token");
            present(k, "mine", forever).with_cas(cas)
        })
        .collect();
    let errors = slots(cache.compare_and_swap(&swap).await, 4);

    assert_eq!(errors[0], None);
    assert!(errors[1].as_ref().is_some_and(LockstepError::is_not_stored));
    assert!(errors[2].as_ref().is_some_and(LockstepError::is_cas_conflict));
    assert!(errors[3].as_ref().is_some_and(LockstepError::is_cas_conflict));

    let after = fetch(cache, &["a", "b", "c", "d"]).await;
    assert_eq!(after["a"].value, b"mine");
    assert!(!after.contains_key("b"));
    assert_eq!(after["c"].value, b"c1");
    assert_eq!(after["d"].status, EntryStatus::Absent);
}

async fn duplicate_add_scenario<C: CacheBackend>(cache: &C) {
    let errors = slots(
        cache
            .add(&[
                present("dup", "first", Duration::ZERO),
                present("dup", "second", Duration::ZERO),
            ])
            .await,
        2,
    );
    assert_eq!(errors[0], None);
    assert!(errors[1].as_ref().is_some_and(LockstepError::is_not_stored));
    assert_eq!(fetch(cache, &["dup"]).await["dup"].value, b"first");
}

async fn expiration_scenario<C: CacheBackend>(cache: &C) {
    cache
        .set(&[present("short", "v", Duration::from_secs(1))])
        .await
        .expect("set should succeed");
    assert!(fetch(cache, &["short"]).await.contains_key("short"));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let found = fetch(cache, &["short"]).await;
    assert!(found.is_empty(), "expired entry is a miss, not an error");

    // An expired key is free for add-if-absent again.
    cache
        .add(&[present("short", "again", Duration::ZERO)])
        .await
        .expect("add over expired entry should succeed");
}

async fn lock_ownership_scenario<C: CacheBackend>(cache: &C) {
    let ttl = Duration::from_secs(32);
    let ours = LockToken::from_bytes([1, 2, 3, 4]);
    let theirs = LockToken::from_bytes([9, 9, 9, 9]);

    cache
        .add(&[CacheEntry::lock("k", ours, ttl)])
        .await
        .expect("first lock should succeed");
    let lost = slots(cache.add(&[CacheEntry::lock("k", theirs, ttl)]).await, 1);
    assert!(lost[0].as_ref().is_some_and(LockstepError::is_not_stored));

    let entry = fetch(cache, &["k"]).await.remove("k").expect("lock entry");
    assert!(entry.is_locked_by(ours));
    assert!(!entry.is_locked_by(theirs));
}

async fn delete_is_idempotent<C: CacheBackend>(cache: &C) {
    cache
        .delete(&names(&["never-written"]))
        .await
        .expect("deleting a missing key should succeed");
    cache
        .set(&[present("gone", "v", Duration::ZERO)])
        .await
        .expect("set");
    cache.delete(&names(&["gone"])).await.expect("delete");
    cache.delete(&names(&["gone"])).await.expect("second delete");
    assert!(fetch(cache, &["gone"]).await.is_empty());
}

async fn run_contract<C: CacheBackend>(make: impl Fn() -> C) {
    cas_conflict_scenario(&make()).await;
    duplicate_add_scenario(&make()).await;
    expiration_scenario(&make()).await;
    lock_ownership_scenario(&make()).await;
    delete_is_idempotent(&make()).await;
}

// ============================================================================
// BACKENDS
// ============================================================================

#[tokio::test]
async fn test_memory_backend_contract() {
    run_contract(MemoryCacheBackend::new).await;
}

#[tokio::test]
async fn test_lmdb_backend_contract() {
    let root = TempDir::new().expect("TempDir creation should succeed");
    let counter = std::sync::atomic::AtomicUsize::new(0);
    run_contract(|| {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        LmdbCacheBackend::new(root.path().join(format!("env-{n}")), 10)
            .expect("backend creation should succeed")
    })
    .await;
}
