//! Exactly-once minting under concurrent callers.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use occurrence_identity::locks::ShardedKeyLocks;
use occurrence_identity::test_support::CountingKeyStore;
use occurrence_identity::{CompositeKey, IdentityStore, LockPolicy};

fn key(raw: &str) -> CompositeKey {
    CompositeKey::from_stored(raw).unwrap()
}

fn patient_policy() -> LockPolicy {
    LockPolicy {
        wait: Duration::from_millis(200),
        max_attempts: 20,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(20),
    }
}

#[test]
fn concurrent_callers_observe_one_identifier() {
    let counting = Arc::new(CountingKeyStore::in_memory().with_put_delay(Duration::from_millis(5)));
    let store = Arc::new(IdentityStore::with_parts(
        counting.clone(),
        Arc::new(ShardedKeyLocks::new()),
        patient_policy(),
    ));

    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.get_or_mint(&key("dr1|NHM|Birds|42")).unwrap()
            })
        })
        .collect();

    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(counting.puts(), 1);

    // Idempotent afterwards, with no further writes.
    for _ in 0..10 {
        assert_eq!(store.get_or_mint(&key("dr1|NHM|Birds|42")).unwrap(), ids[0]);
    }
    assert_eq!(counting.puts(), 1);
    assert_eq!(store.metrics().minted, 1);
}

#[test]
fn distinct_keys_mint_in_parallel() {
    let counting = Arc::new(CountingKeyStore::in_memory());
    let store = Arc::new(IdentityStore::with_parts(
        counting.clone(),
        Arc::new(ShardedKeyLocks::new()),
        patient_policy(),
    ));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..100 {
                    // Every thread touches the shared keys and its own keys.
                    store.get_or_mint(&key(&format!("dr1|shared-{i}"))).unwrap();
                    store.get_or_mint(&key(&format!("dr1|t{t}-{i}"))).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counting.puts(), 100 + 8 * 100);
    assert_eq!(store.backend().len().unwrap(), 900);
}

#[test]
fn shared_lock_table_serializes_two_stores() {
    let counting = Arc::new(CountingKeyStore::in_memory().with_put_delay(Duration::from_millis(2)));
    let locks = Arc::new(ShardedKeyLocks::new());
    let a = Arc::new(IdentityStore::with_parts(
        counting.clone(),
        locks.clone(),
        patient_policy(),
    ));
    let b = Arc::new(IdentityStore::with_parts(
        counting.clone(),
        locks.clone(),
        patient_policy(),
    ));

    let handles: Vec<_> = [a, b]
        .into_iter()
        .flat_map(|store| {
            (0..4).map(move |_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.get_or_mint(&key("dr1|occ-7")).unwrap())
            })
        })
        .collect();
    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(counting.puts(), 1);
    assert_eq!(locks.held_count(), 0);
}
