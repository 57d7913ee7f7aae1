use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use listmap_rs::ListMap;

#[derive(Clone, Debug, PartialEq)]
struct Payload {
    val: i32,
}

#[test]
fn test_compare_and_swap_structural_equality() {
    let m: ListMap<String, Payload> = ListMap::new();
    m.insert("1".to_string(), Payload { val: 1 });

    assert!(!m.compare_and_swap(&"1".to_string(), &Payload { val: 420 }, Payload { val: 2 }));
    assert!(m.compare_and_swap(&"1".to_string(), &Payload { val: 1 }, Payload { val: 2 }));
    assert_eq!(m.get(&"1".to_string()), Some(Payload { val: 2 }));
}

#[test]
fn test_compare_and_swap_absent_key() {
    let m: ListMap<u64, u64> = ListMap::new();
    assert!(!m.compare_and_swap(&1, &10, 20));
    assert_eq!(m.get(&1), None);
    assert_eq!(m.len(), 0);
}

#[test]
fn test_swap_present_and_absent() {
    let m: ListMap<u64, String> = ListMap::new();
    m.insert(5, "old".to_string());

    assert_eq!(m.swap(&5, "new".to_string()), Some("old".to_string()));
    assert_eq!(m.get(&5), Some("new".to_string()));

    // swap never inserts
    assert_eq!(m.swap(&6, "never".to_string()), None);
    assert_eq!(m.get(&6), None);
    assert_eq!(m.len(), 1);
}

#[test]
fn test_cas_succeeds_exactly_once_per_expected_value() {
    let m: Arc<ListMap<u64, u64>> = Arc::new(ListMap::new());
    m.insert(1, 0);

    let n_threads = 8;
    let barrier = Arc::new(Barrier::new(n_threads));
    let wins = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for t in 0..n_threads as u64 {
        let map = m.clone();
        let b = barrier.clone();
        let w = wins.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            if map.compare_and_swap(&1, &0, t + 100) {
                w.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(wins.load(Ordering::Relaxed), 1);
    let settled = m.get(&1).unwrap();
    assert!((100..100 + n_threads as u64).contains(&settled));
}

#[test]
fn test_swap_chain_preserves_every_value() {
    let m: Arc<ListMap<u32, u64>> = Arc::new(ListMap::new());
    m.insert(9, 0);

    let n_threads = 4;
    let per_thread = 1_000u64;
    let barrier = Arc::new(Barrier::new(n_threads));

    let mut handles = Vec::new();
    for t in 0..n_threads as u64 {
        let map = m.clone();
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            let mut got = Vec::with_capacity(per_thread as usize);
            for i in 0..per_thread {
                let prior = map.swap(&9, t * per_thread + i + 1).unwrap();
                got.push(prior);
            }
            got
        }));
    }

    // each swapped-out value is observed by exactly one swapper or remains stored
    let mut seen: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    seen.push(m.get(&9).unwrap());
    seen.sort_unstable();
    let before = seen.len();
    seen.dedup();
    assert_eq!(before, seen.len(), "a swapped value surfaced twice");
    assert_eq!(before, (n_threads as u64 * per_thread + 1) as usize);
}
