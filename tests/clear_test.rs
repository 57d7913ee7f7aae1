use std::sync::Arc;
use std::thread;

use listmap_rs::ListMap;

#[test]
fn test_clear_detaches_live_iteration() {
    // clear publishes fresh metadata and detaches the whole list; a cursor
    // that is already past the sentinel sits on the detached chain, whose
    // nodes are all flagged, so it terminates instead of yielding stale pairs
    let m: ListMap<u64, u64> = ListMap::new();
    for i in 0..50u64 {
        m.insert(i, i);
    }

    let mut iter = m.iter();
    let first = iter.next();
    assert!(first.is_some());

    m.clear();
    assert_eq!(iter.next(), None);
    drop(iter);

    // the map itself is immediately serviceable again
    m.insert(7, 70);
    assert_eq!(m.len(), 1);
    let fresh: Vec<(u64, u64)> = m.iter().collect();
    assert_eq!(fresh, vec![(7, 70)]);
}

#[test]
fn test_clear_is_idempotent() {
    let m: ListMap<u64, String> = ListMap::with_capacity(8);

    // clearing an empty map publishes a fresh index and nothing else
    m.clear();
    assert_eq!(m.len(), 0);
    assert_eq!(m.capacity(), 256);
    assert_eq!(m.fill_rate(), 0);

    for i in 0..600u64 {
        m.insert(i, format!("v{}", i));
    }
    m.clear();
    m.clear();
    assert_eq!(m.len(), 0);
    assert_eq!(m.fill_rate(), 0);
    assert_eq!(m.remove(&1), None);
    assert!(!m.contains_key(&599));
}

#[test]
fn test_clear_resets_index_size() {
    let m: ListMap<u64, u64> = ListMap::with_capacity(4);
    for i in 0..2_000u64 {
        m.insert(i, i);
    }
    assert!(m.capacity() > 256);

    m.clear();
    assert_eq!(m.capacity(), 256);
    assert_eq!(m.fill_rate(), 0);
}

#[test]
fn test_reuse_after_clear() {
    let m: ListMap<u64, String> = ListMap::new();
    for i in 0..100u64 {
        m.insert(i, format!("a{}", i));
    }
    m.clear();
    assert!(m.is_empty());

    for i in 0..100u64 {
        m.insert(i, format!("b{}", i));
    }
    assert_eq!(m.len(), 100);
    for i in 0..100u64 {
        assert_eq!(m.get(&i), Some(format!("b{}", i)));
    }
}

#[test]
fn test_repeated_clear_cycles() {
    let m: ListMap<u64, Vec<u8>> = ListMap::new();
    for cycle in 0..10u64 {
        for i in 0..200u64 {
            m.insert(i, vec![cycle as u8; 16]);
        }
        assert_eq!(m.len(), 200);
        m.clear();
        assert_eq!(m.len(), 0);
    }
}

#[test]
fn test_clear_with_concurrent_readers() {
    let m: Arc<ListMap<u64, u64>> = Arc::new(ListMap::new());
    for i in 0..1_000u64 {
        m.insert(i, i);
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let map = m.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                for i in 0..1_000u64 {
                    if let Some(v) = map.get(&i) {
                        assert_eq!(v, i);
                    }
                }
            }
        }));
    }
    {
        let map = m.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..20 {
                map.clear();
                thread::yield_now();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    m.clear();
    assert!(m.is_empty());
}
