use crate::hash::MapHasher;
use crate::map::PMap;

/// Degenerate hasher: every key lands in the same home bucket.
struct ConstHasher;

impl MapHasher<u64> for ConstHasher {
    fn hash(_key: &u64) -> u64 {
        7
    }
}

#[test]
fn test_set_get_has_erase() {
    let map: PMap<u64, u64> = PMap::anonymous();

    assert!(map.is_empty());
    assert!(!map.has(&1));

    map.set(1, 100);
    map.set(2, 200);
    assert_eq!(map.len(), 2);
    assert!(map.has(&1));
    assert_eq!(map.get(&1), 100);
    assert_eq!(map.get(&2), 200);

    assert_eq!(map.erase(&1), 1);
    assert!(!map.has(&1));
    assert_eq!(map.len(), 1);
    assert_eq!(map.erase(&1), 0);
}

#[test]
fn test_update_in_place() {
    let map: PMap<u64, u64> = PMap::anonymous();

    map.set(5, 1);
    let len_after_first = map.len();
    map.set(5, 2);

    assert_eq!(map.len(), len_after_first);
    assert_eq!(map.get(&5), 2);
}

#[test]
fn test_probe_on_fresh_map_allocates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let map: PMap<u64, u64> = PMap::open(dir.path(), "lazy").unwrap();

    assert!(!map.has(&1));
    assert_eq!(map.erase(&1), 0);
    assert_eq!(map.len(), 0);
    assert_eq!(map.iter().count(), 0);
    assert!(!dir.path().join("lazy").exists());

    map.set(1, 1);
    assert!(dir.path().join("lazy").exists());
}

#[test]
fn test_iteration_visits_live_entries_once() {
    let map: PMap<u64, u64> = PMap::anonymous();
    for k in 0..300u64 {
        map.set(k, k * 3);
    }
    map.erase(&7);
    map.erase(&8);

    let mut seen = std::collections::HashSet::new();
    for (k, v) in map.iter() {
        assert_eq!(v, k * 3);
        assert!(seen.insert(k), "key {k} visited twice");
    }
    assert_eq!(seen.len(), 298);
    assert!(!seen.contains(&7));
    assert!(!seen.contains(&8));
}

#[test]
fn test_find_positions_iterator() {
    let map: PMap<u64, u64> = PMap::anonymous();
    for k in 0..50u64 {
        map.set(k, k + 1000);
    }

    let it = map.find(&25);
    assert!(!it.is_end());
    assert_eq!(it.current(), Some((25, 1025)));

    let missing = map.find(&999);
    assert!(missing.is_end());
    assert_eq!(missing.current(), None);
}

#[test]
fn test_erase_iter() {
    let map: PMap<u64, u64> = PMap::anonymous();
    for k in 0..20u64 {
        map.set(k, k);
    }

    let it = map.find(&11);
    assert!(!it.is_end());
    map.erase_iter(&it);
    drop(it);

    assert!(!map.has(&11));
    assert_eq!(map.len(), 19);
}

#[test]
fn test_iterator_owns_read_lock() {
    let map: PMap<u64, u64> = PMap::anonymous();
    map.set(1, 1);

    assert_eq!(map.read_locks(), 0);
    let it = map.iter();
    assert_eq!(map.read_locks(), 1);
    let it2 = it.clone();
    assert_eq!(map.read_locks(), 2);
    drop(it);
    assert_eq!(map.read_locks(), 1);
    drop(it2);
    assert_eq!(map.read_locks(), 0);
}

#[test]
fn test_ref_guard_access() {
    let map: PMap<u64, u64> = PMap::anonymous();
    map.set(3, 30);

    let mut guard = map.lock_ref();
    assert_eq!(*guard.value(&3), 30);
    *guard.value_mut(&3) += 1;
    assert_eq!(*guard.value(&3), 31);
    drop(guard);

    assert_eq!(map.get(&3), 31);
    assert_eq!(map.read_locks(), 0);
}

#[test]
fn test_growth_preserves_entries() {
    let map: PMap<u64, u64> = PMap::anonymous();

    for k in 0..5000u64 {
        map.set(k, k.wrapping_mul(7));
    }

    assert_eq!(map.len(), 5000);
    // 5000 entries cannot fit the initial 1024 slots.
    assert!(map.load_factor() <= 5000.0 / 8192.0 + 0.001);
    for k in 0..5000u64 {
        assert_eq!(map.get(&k), k.wrapping_mul(7));
    }
    map.validate();
}

#[test]
fn test_reserve() {
    let map: PMap<u64, u64> = PMap::anonymous();
    map.set(1, 1);
    map.reserve(10_000);

    assert!(map.capacity() >= 10_000);
    assert_eq!(map.get(&1), 1);
    map.validate();
}

#[test]
fn test_degenerate_hasher_survives_via_info_widening() {
    let map: PMap<u64, u64, ConstHasher> = PMap::anonymous();

    for k in 0..64u64 {
        map.set(k, k + 1);
    }
    assert_eq!(map.len(), 64);
    // 64 chained entries fit in the initial 1024 slots, so only the
    // info-widening path may have run, never a rehash.
    assert_eq!(map.capacity(), 819);

    for k in 0..64u64 {
        assert_eq!(map.get(&k), k + 1);
    }
    assert_eq!(map.iter().count(), 64);
    map.validate();
}

#[test]
fn test_erase_compaction_under_collisions() {
    let map: PMap<u64, u64, ConstHasher> = PMap::anonymous();

    for k in 0..32u64 {
        map.set(k, k);
    }
    for k in (0..32u64).step_by(2) {
        assert_eq!(map.erase(&k), 1);
    }

    assert_eq!(map.len(), 16);
    for k in 0..32u64 {
        assert_eq!(map.has(&k), k % 2 == 1);
    }
    map.validate();
}

#[test]
fn test_clear_resets_map() {
    let dir = tempfile::tempdir().unwrap();
    let map: PMap<u64, u64> = PMap::open(dir.path(), "wipe").unwrap();

    for k in 0..100u64 {
        map.set(k, k);
    }
    assert!(dir.path().join("wipe").exists());

    map.clear();
    assert!(map.is_empty());
    assert!(!dir.path().join("wipe").exists());
    assert!(!map.has(&5));

    // The instance stays usable.
    map.set(1, 2);
    assert_eq!(map.get(&1), 2);
}

#[test]
fn test_load_factor_accessors() {
    let map: PMap<u64, u64, crate::hash::MixHasher, 50> = PMap::anonymous();
    assert_eq!(map.max_load_factor(), 0.5);

    map.set(1, 1);
    assert!(map.load_factor() > 0.0);
    assert_eq!(map.capacity(), 512);
}

#[test]
fn test_custom_pod_key_with_bytes_hasher() {
    use crate::hash::BytesHasher;

    #[derive(Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct NodeHandle {
        graph: u32,
        node: u32,
    }

    let map: PMap<NodeHandle, u64, BytesHasher> = PMap::anonymous();
    for i in 0..200u32 {
        map.set(NodeHandle { graph: i % 4, node: i }, u64::from(i) * 11);
    }

    assert_eq!(map.len(), 200);
    for i in 0..200u32 {
        assert_eq!(map.get(&NodeHandle { graph: i % 4, node: i }), u64::from(i) * 11);
    }
    map.validate();
}

#[test]
#[should_panic(expected = "absent key")]
fn test_get_absent_key_panics() {
    let map: PMap<u64, u64> = PMap::anonymous();
    map.set(1, 1);
    map.get(&2);
}
