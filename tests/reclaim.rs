//! Region reclamation tests: the map must survive the region manager
//! taking its mapping away between operations.
//!
//! The reclamation sweep is process-global, so every test here serialises
//! on one mutex to keep the sweep counts deterministic.

use std::sync::Mutex;

use pmap::{gc, PMap};

static SWEEP: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SWEEP.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn test_reload_after_reclaim() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let map: PMap<u64, u64> = PMap::open(dir.path(), "reload").unwrap();

    for k in 0..2_000u64 {
        map.set(k, k * k);
    }

    let reclaimed = gc::reclaim_all(false);
    assert!(reclaimed >= 1, "the idle map should have given up its region");

    // Every operation reloads transparently.
    assert_eq!(map.len(), 2_000);
    for k in 0..2_000u64 {
        assert_eq!(map.get(&k), k * k);
    }
    assert_eq!(map.iter().count(), 2_000);
    map.validate();
}

#[test]
fn test_mutation_after_reclaim() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let map: PMap<u64, u64> = PMap::open(dir.path(), "mutate").unwrap();

    for k in 0..100u64 {
        map.set(k, k);
    }
    assert!(gc::reclaim_all(false) >= 1);

    map.set(200, 201);
    assert_eq!(map.erase(&0), 1);
    assert_eq!(map.len(), 100);
    assert_eq!(map.get(&200), 201);
    map.validate();
}

#[test]
fn test_reclaim_refused_while_iterator_held() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let map: PMap<u64, u64> = PMap::open(dir.path(), "held").unwrap();

    for k in 0..50u64 {
        map.set(k, k);
    }

    let it = map.iter();
    // The iterator's read-lock makes the callback refuse.
    assert_eq!(gc::reclaim_all(false), 0);
    assert_eq!(it.count(), 50);

    // With the iterator gone the sweep succeeds.
    assert_eq!(gc::reclaim_all(false), 1);
    assert_eq!(map.len(), 50);
}

#[test]
fn test_reclaim_empty_map_unlinks_file() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("shrink");
    let map: PMap<u64, u64> = PMap::open(dir.path(), "shrink").unwrap();

    for k in 0..10u64 {
        map.set(k, k);
    }
    for k in 0..10u64 {
        map.erase(&k);
    }
    assert!(file.exists(), "file stays while the empty map is still mapped");

    assert_eq!(gc::reclaim_all(false), 1);
    assert!(!file.exists(), "reclaiming an empty map drops its file");

    // The instance is still usable afterwards.
    map.set(1, 2);
    assert_eq!(map.get(&1), 2);
    assert!(file.exists());
}

#[test]
fn test_repeated_reclaim_cycles() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let map: PMap<u64, u64> = PMap::open(dir.path(), "cycles").unwrap();

    for round in 0..5u64 {
        for k in 0..200u64 {
            map.set(k, k + round);
        }
        assert!(gc::reclaim_all(false) >= 1);
        assert_eq!(map.len(), 200);
        assert_eq!(map.get(&7), 7 + round);
    }
    map.validate();
}

#[test]
fn test_anonymous_map_unaffected_by_sweep_of_named() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let named: PMap<u64, u64> = PMap::open(dir.path(), "named").unwrap();
    named.set(1, 1);

    // Holding a read-lock pins the anonymous region; only the named map
    // yields.
    let anon: PMap<u64, u64> = PMap::anonymous();
    anon.set(2, 2);
    let guard = anon.lock_ref();
    assert_eq!(gc::reclaim_all(false), 1);
    assert_eq!(*guard.value(&2), 2);
    drop(guard);

    assert_eq!(named.get(&1), 1);
}
