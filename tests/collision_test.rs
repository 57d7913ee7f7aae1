use std::hash::{BuildHasher, Hasher};

use listmap_rs::ListMap;

/// Hasher that maps every key to 0, forcing all entries into one index slot
/// and one hash run of the list.
#[derive(Clone, Default)]
struct ZeroState;

struct ZeroHasher;

impl Hasher for ZeroHasher {
    fn finish(&self) -> u64 {
        0
    }
    fn write(&mut self, _bytes: &[u8]) {}
}

impl BuildHasher for ZeroState {
    type Hasher = ZeroHasher;
    fn build_hasher(&self) -> ZeroHasher {
        ZeroHasher
    }
}

#[test]
fn test_constant_hash_set_and_get() {
    let m: ListMap<String, i32, ZeroState> = ListMap::with_hasher(ZeroState);
    m.insert("1".to_string(), 1);
    m.insert("2".to_string(), 2);

    assert_eq!(m.get(&"1".to_string()), Some(1));
    assert_eq!(m.get(&"2".to_string()), Some(2));
    assert_eq!(m.len(), 2);
}

#[test]
fn test_constant_hash_many_keys() {
    let m: ListMap<u64, u64, ZeroState> = ListMap::with_hasher(ZeroState);
    for i in 0..500u64 {
        m.insert(i, i * 3);
    }
    assert_eq!(m.len(), 500);
    for i in 0..500u64 {
        assert_eq!(m.get(&i), Some(i * 3));
    }
}

#[test]
fn test_constant_hash_update_and_remove() {
    let m: ListMap<u64, u64, ZeroState> = ListMap::with_hasher(ZeroState);
    for i in 0..100u64 {
        m.insert(i, i);
    }

    assert_eq!(m.insert(42, 4242), Some(42));
    assert_eq!(m.get(&42), Some(4242));

    for i in (0..100u64).step_by(3) {
        m.remove(&i);
    }
    for i in 0..100u64 {
        if i % 3 == 0 {
            assert_eq!(m.get(&i), None);
        } else if i == 42 {
            assert_eq!(m.get(&i), Some(4242));
        } else {
            assert_eq!(m.get(&i), Some(i));
        }
    }
}

#[test]
fn test_constant_hash_bulk_remove() {
    let m: ListMap<u64, u64, ZeroState> = ListMap::with_hasher(ZeroState);
    for i in 0..64u64 {
        m.insert(i, i);
    }

    let victims: Vec<u64> = (0..32).collect();
    m.remove_bulk(&victims);

    assert_eq!(m.len(), 32);
    for i in 0..64u64 {
        if i < 32 {
            assert_eq!(m.get(&i), None);
        } else {
            assert_eq!(m.get(&i), Some(i));
        }
    }
}

#[test]
fn test_constant_hash_iteration() {
    let m: ListMap<u64, u64, ZeroState> = ListMap::with_hasher(ZeroState);
    for i in 0..50u64 {
        m.insert(i, i);
    }

    let mut keys: Vec<u64> = m.keys().collect();
    keys.sort_unstable();
    assert_eq!(keys, (0..50).collect::<Vec<u64>>());
}

#[test]
fn test_constant_hash_swap_and_cas() {
    let m: ListMap<u64, u64, ZeroState> = ListMap::with_hasher(ZeroState);
    for i in 0..20u64 {
        m.insert(i, i);
    }

    assert_eq!(m.swap(&7, 70), Some(7));
    assert!(m.compare_and_swap(&8, &8, 80));
    assert!(!m.compare_and_swap(&9, &90, 900));
    assert_eq!(m.get(&7), Some(70));
    assert_eq!(m.get(&8), Some(80));
    assert_eq!(m.get(&9), Some(9));
}
