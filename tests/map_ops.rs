//! Core map operation tests: growth, collisions, erase compaction.

use std::collections::{HashMap, HashSet};

use rand::prelude::*;

use pmap::{MapHasher, PMap};

/// Worst-case hasher: every key shares one home bucket.
struct ConstHasher;

impl MapHasher<u64> for ConstHasher {
    fn hash(_key: &u64) -> u64 {
        42
    }
}

#[test]
fn test_grow_to_ten_thousand() {
    let map: PMap<u64, u64> = PMap::anonymous();

    for k in 0..10_000u64 {
        map.set(k, k * 7);
    }

    assert_eq!(map.len(), 10_000);
    for k in 0..10_000u64 {
        assert_eq!(map.get(&k), k * 7);
    }
    // 10k entries at 80% load need 16k slots: at least three doublings
    // from the initial 1024.
    assert!(
        map.load_factor() <= 10_000.0 / 16_384.0 + 0.001,
        "load factor {} implies fewer than 16k slots",
        map.load_factor()
    );
    map.validate();
}

#[test]
fn test_constant_hash_collisions() {
    let map: PMap<u64, u64, ConstHasher> = PMap::anonymous();

    for k in 0..64u64 {
        map.set(k, k * 2);
    }

    assert_eq!(map.len(), 64);
    for k in 0..64u64 {
        assert!(map.has(&k));
        assert_eq!(map.get(&k), k * 2);
    }

    let visited: HashSet<u64> = map.iter().map(|(k, _)| k).collect();
    assert_eq!(visited.len(), 64);
    // A 64-entry chain fits the initial table through info widening alone.
    assert_eq!(map.capacity(), 819);
    map.validate();
}

#[test]
fn test_erase_compaction_round() {
    let map: PMap<u64, u64> = PMap::anonymous();

    for k in 0..100u64 {
        map.set(k, k);
    }
    for k in (0..100u64).step_by(2) {
        assert_eq!(map.erase(&k), 1);
    }

    let remaining: HashSet<u64> = map.iter().map(|(k, _)| k).collect();
    assert_eq!(remaining.len(), 50);
    assert!(remaining.iter().all(|k| k % 2 == 1));
    map.validate();

    for k in (0..100u64).step_by(2) {
        map.set(k, k);
    }
    assert_eq!(map.len(), 100);
    map.validate();
}

#[test]
fn test_erase_all_then_reuse() {
    let map: PMap<u64, u64> = PMap::anonymous();

    for k in 0..500u64 {
        map.set(k, k + 1);
    }
    for k in 0..500u64 {
        assert_eq!(map.erase(&k), 1);
    }
    assert!(map.is_empty());
    assert_eq!(map.iter().count(), 0);

    for k in 0..500u64 {
        map.set(k, k + 2);
    }
    assert_eq!(map.len(), 500);
    assert_eq!(map.get(&499), 501);
    map.validate();
}

#[test]
fn test_randomized_against_std_hashmap() {
    let map: PMap<u64, u64> = PMap::anonymous();
    let mut model: HashMap<u64, u64> = HashMap::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..20_000 {
        let key = rng.gen_range(0..2_000u64);
        match rng.gen_range(0..10) {
            0..=5 => {
                let value = rng.gen::<u64>();
                map.set(key, value);
                model.insert(key, value);
            }
            6..=8 => {
                let removed = map.erase(&key);
                assert_eq!(removed, usize::from(model.remove(&key).is_some()));
            }
            _ => {
                assert_eq!(map.has(&key), model.contains_key(&key));
            }
        }
    }

    assert_eq!(map.len(), model.len());
    for (k, v) in map.iter() {
        assert_eq!(model.get(&k), Some(&v));
    }
    map.validate();
}

#[test]
fn test_find_and_erase_iter() {
    let map: PMap<u64, u64> = PMap::anonymous();
    for k in 0..64u64 {
        map.set(k, k);
    }

    let it = map.find(&17);
    assert_eq!(it.current(), Some((17, 17)));
    map.erase_iter(&it);
    drop(it);

    assert!(!map.has(&17));
    assert_eq!(map.len(), 63);
    assert!(map.find(&17).is_end());
    map.validate();
}
