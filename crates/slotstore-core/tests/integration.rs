//! Integration tests: several handles attached to one store directory.
//!
//! Each handle maps the files and opens the lock file independently, which
//! is exactly what separate processes do.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use slotstore_core::{inspect, Config, Field, ReopenPolicy, SlotError, SlotStore, StoreState};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(dir: &Path) -> Config {
    Config {
        max_record_count: 32,
        max_record_size: 64,
        hash_bucket_count: 16,
        primary_field_len: 24,
        secondary_field_len: 16,
        ..Config::new(dir, "quotes")
    }
}

fn attach(config: Config) -> SlotStore {
    let mut store = SlotStore::new(config);
    store.initialize().unwrap();
    store
}

// ---------------------------------------------------------------------------
// Shared Visibility
// ---------------------------------------------------------------------------

#[test]
fn test_handles_see_each_others_writes() {
    let dir = TempDir::new().unwrap();
    let a = attach(config(dir.path()));
    let b = attach(config(dir.path()));

    a.put(b"7203.T", Some(b"JP3633400001"), b"toyota").unwrap();
    assert_eq!(b.get_copy(Field::Primary, b"7203.T").unwrap().unwrap(), b"toyota");
    assert_eq!(b.get_copy(Field::Secondary, b"JP3633400001").unwrap().unwrap(), b"toyota");

    b.put(b"6758.T", Some(b"JP3435000009"), b"sony").unwrap();
    assert_eq!(a.len().unwrap(), 2);
    assert_eq!(b.len().unwrap(), 2);

    // A duplicate through the other handle is still a duplicate
    assert!(matches!(
        b.put(b"7203.T", Some(b"OTHER"), b"x"),
        Err(SlotError::KeyExists { field: Field::Primary, .. })
    ));

    a.del(b"6758.T").unwrap();
    assert!(b.get(Field::Secondary, b"JP3435000009").unwrap().is_none());
    assert!(a.validate_integrity());
    assert!(b.validate_integrity());
}

#[test]
fn test_free_list_is_shared() {
    let dir = TempDir::new().unwrap();
    let a = attach(Config { max_record_count: 2, ..config(dir.path()) });
    let b = attach(Config { max_record_count: 2, ..config(dir.path()) });

    a.put(b"one", Some(b"1"), b"v").unwrap();
    b.put(b"two", Some(b"2"), b"v").unwrap();
    assert!(matches!(a.put(b"three", Some(b"3"), b"v"), Err(SlotError::NoSpace { capacity: 2 })));

    b.del(b"one").unwrap();
    a.put(b"three", Some(b"3"), b"v").unwrap();
    assert_eq!(b.get(Field::Primary, b"three").unwrap().unwrap().seq(), 1);
    a.verify_arena().unwrap();
}

#[test]
fn test_clear_is_visible_to_other_handles() {
    let dir = TempDir::new().unwrap();
    let a = attach(config(dir.path()));
    let b = attach(config(dir.path()));

    a.put(b"k", Some(b"s"), b"v").unwrap();
    b.clear().unwrap();
    assert!(a.get(Field::Primary, b"k").unwrap().is_none());
    assert_eq!(a.get_statistics().unwrap().free_records, 32);
}

#[test]
fn test_concurrent_writers_across_handles() {
    let dir = TempDir::new().unwrap();
    let stores: Vec<Arc<SlotStore>> = (0..4).map(|_| Arc::new(attach(config(dir.path())))).collect();

    let handles: Vec<_> = stores
        .iter()
        .enumerate()
        .map(|(t, store)| {
            let store = Arc::clone(store);
            thread::spawn(move || {
                for i in 0..8 {
                    let pkey = format!("h{}-k{}", t, i);
                    let skey = format!("h{}-s{}", t, i);
                    store.put(pkey.as_bytes(), Some(skey.as_bytes()), pkey.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let check = &stores[0];
    assert_eq!(check.len().unwrap(), 32);
    for t in 0..4 {
        for i in 0..8 {
            let pkey = format!("h{}-k{}", t, i);
            let skey = format!("h{}-s{}", t, i);
            assert_eq!(check.get_copy(Field::Secondary, skey.as_bytes()).unwrap().unwrap(), pkey.as_bytes());
        }
    }
    check.verify_arena().unwrap();
    assert!(check.validate_integrity());
}

// ---------------------------------------------------------------------------
// Reopen
// ---------------------------------------------------------------------------

#[test]
fn test_reopen_keeps_records_and_free_list() {
    let dir = TempDir::new().unwrap();
    {
        let store = attach(config(dir.path()));
        for i in 0..5 {
            store.put(format!("k{}", i).as_bytes(), Some(format!("s{}", i).as_bytes()), b"v").unwrap();
        }
        store.del(b"k2").unwrap();
        store.sync().unwrap();
    }

    let store = attach(config(dir.path()));
    assert_eq!(store.state(), StoreState::Ready);
    assert_eq!(store.len().unwrap(), 4);
    assert!(store.get(Field::Primary, b"k2").unwrap().is_none());

    // The slot freed before the restart is handed out first
    store.put(b"new", Some(b"snew"), b"v").unwrap();
    assert_eq!(store.get(Field::Primary, b"new").unwrap().unwrap().seq(), 3);
}

#[test]
fn test_reopen_with_different_geometry() {
    let dir = TempDir::new().unwrap();
    drop(attach(config(dir.path())));

    let mut verify = SlotStore::new(Config { max_record_size: 128, ..config(dir.path()) });
    match verify.initialize() {
        Err(SlotError::HeaderMismatch { field, persisted, configured, .. }) => {
            assert_eq!(field, "max_record_size");
            assert_eq!(persisted, 64);
            assert_eq!(configured, 128);
        }
        other => panic!("expected HeaderMismatch, got {:?}", other),
    }

    let trusting = attach(Config {
        max_record_size: 128,
        reopen_policy: ReopenPolicy::TrustFile,
        ..config(dir.path())
    });
    assert_eq!(trusting.geometry().unwrap().max_record_size, 64);
}

#[test]
fn test_recreated_records_file_replaces_old_indexes() {
    let dir = TempDir::new().unwrap();
    let small = Config { max_record_count: 4, ..config(dir.path()) };
    {
        let store = attach(small.clone());
        store.put(b"old", Some(b"o"), b"v").unwrap();
        store.sync().unwrap();
    }
    std::fs::remove_file(small.records_path()).unwrap();

    let larger = Config { max_record_count: 8, ..config(dir.path()) };
    let store = attach(larger.clone());
    assert_eq!(store.len().unwrap(), 0);
    assert!(store.get(Field::Primary, b"old").unwrap().is_none());
    assert!(store.get(Field::Secondary, b"o").unwrap().is_none());

    for i in 0..8 {
        store.put(format!("k{}", i).as_bytes(), Some(format!("s{}", i).as_bytes()), b"v").unwrap();
    }
    assert!(store.validate_integrity());
    drop(store);

    // Later handles reopen the rebuilt files normally
    let again = attach(larger);
    assert_eq!(again.len().unwrap(), 8);
}

#[test]
fn test_corrupted_header_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    drop(attach(cfg.clone()));

    let path = cfg.records_path();
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[16] ^= 0xFF; // max_record_size, covered by the geometry checksum
    std::fs::write(&path, &bytes).unwrap();

    let mut store = SlotStore::new(cfg);
    assert!(matches!(store.initialize(), Err(SlotError::Corrupted { .. })));
    assert_eq!(store.state(), StoreState::Uninitialized);
}

// ---------------------------------------------------------------------------
// Inspect
// ---------------------------------------------------------------------------

#[test]
fn test_inspect_while_attached() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let store = attach(cfg.clone());
    store.put(b"a", Some(b"x"), b"1").unwrap();
    store.put(b"b", Some(b"y"), b"2").unwrap();

    let info = inspect(&store.records_path()).unwrap();
    assert_eq!(info.live_records, 2);
    assert_eq!(info.free_records, 30);
    assert_eq!(info.geometry.max_record_size, 64);
    assert_eq!(info.geometry.secondary_field_len, 16);

    // Inspection never joins the store, so the writer is not blocked
    store.put(b"c", Some(b"z"), b"3").unwrap();
    assert_eq!(SlotStore::inspect(&cfg.records_path()).unwrap().live_records, 3);
}

#[test]
fn test_unlocked_handle_still_locks_a_locked_store() {
    let dir = TempDir::new().unwrap();
    let a = attach(config(dir.path()));
    let b = attach(Config {
        lock_enabled: false,
        reopen_policy: ReopenPolicy::TrustFile,
        ..config(dir.path())
    });
    assert!(b.geometry().unwrap().lock_enabled);

    let reserved = a.add_record(b"held", Some(b"h"), 4).unwrap();
    let finished = Arc::new(AtomicBool::new(false));
    let writer = {
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            b.put(b"other", Some(b"o"), b"v").unwrap();
            finished.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!finished.load(Ordering::SeqCst), "write went through while another handle held the write lock");

    drop(reserved);
    writer.join().unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(a.len().unwrap(), 2);
}

#[test]
fn test_unlocked_store() {
    let dir = TempDir::new().unwrap();
    let store = attach(Config { lock_enabled: false, ..config(dir.path()) });
    store.put(b"k", Some(b"s"), b"v").unwrap();
    assert!(!store.config().lock_path().exists());
    assert!(!inspect(&store.records_path()).unwrap().geometry.lock_enabled);
}
