//! ListMap: a lock-free concurrent hash map backed by a hash-ordered linked list
//! with a resizable jump index. Optimized for read-heavy workloads; readers never
//! block writers and writers never block readers.

use std::hash::{BuildHasher, Hash};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use xxhash_rust::xxh3::Xxh3Builder;

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Default index size for a map created without a capacity hint.
const DEFAULT_SIZE: usize = 256;

/// Maximum fill rate (percent) of the index before a resize is triggered.
const MAX_FILL_RATE: usize = 50;

/// Tag bit on a node's `next` pointer marking the node itself as deleted.
const TAG_DELETED: usize = 1;

/// Tag bit on a node's `next` pointer claiming the node for reclamation.
/// Set at most once, after `TAG_DELETED`, by whoever unlinks the node.
const TAG_RETIRED: usize = 2;

// ================================================================================================
// INTERNAL DATA STRUCTURES
// ================================================================================================

/// A single node of the sorted list. The list is ordered by ascending `hash`;
/// nodes with equal hashes form a run disambiguated by key equality.
///
/// The deleted flag lives in the tag bits of `next`: once `TAG_DELETED` is set
/// it is never cleared, and every CAS through the node's `next` word that
/// expects an untagged pointer fails from then on. That is what keeps splices
/// after a dead node and unlinks performed by a dead node from ever succeeding.
struct Node<K, V> {
    hash: u64,
    key: MaybeUninit<K>, // uninitialized only for the sentinel head
    value: Atomic<V>,    // null only for the sentinel head
    next: Atomic<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    fn new(hash: u64, key: K) -> Self {
        Self {
            hash,
            key: MaybeUninit::new(key),
            value: Atomic::null(),
            next: Atomic::null(),
        }
    }

    fn sentinel() -> Self {
        Self {
            hash: 0,
            key: MaybeUninit::uninit(),
            value: Atomic::null(),
            next: Atomic::null(),
        }
    }

    /// Key accessor. Must never be called on the sentinel head.
    #[inline(always)]
    unsafe fn key(&self) -> &K {
        self.key.assume_init_ref()
    }

    #[inline(always)]
    fn is_deleted(&self, guard: &Guard) -> bool {
        self.next.load(Ordering::Acquire, guard).tag() & TAG_DELETED != 0
    }

    /// Set the deleted flag. Returns whether this call was the one that set it.
    fn mark(&self, guard: &Guard) -> bool {
        loop {
            let next = self.next.load(Ordering::Acquire, guard);
            if next.tag() & TAG_DELETED != 0 {
                return false;
            }
            if self
                .next
                .compare_exchange(
                    next,
                    next.with_tag(next.tag() | TAG_DELETED),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// A snapshot of the jump index: slot array, its geometry and the filled-slot
/// counter. Kept generic over `(K, V)` so slot access monomorphizes together
/// with node layout and key comparison.
struct Metadata<K, V> {
    /// `64 - log2(index.len())`; shifting a hash right by this yields its slot.
    keyshifts: u32,
    /// Number of non-nil slots, drives the fill-rate check.
    count: AtomicUsize,
    /// Non-owning pointers into the list. Nil means "no hint yet; scan back".
    index: Box<[Atomic<Node<K, V>>]>,
}

impl<K, V> Metadata<K, V> {
    /// `len` must be a power of two >= 2.
    fn with_len(len: usize) -> Self {
        let index = (0..len)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            keyshifts: u64::BITS - len.trailing_zeros(),
            count: AtomicUsize::new(0),
            index,
        }
    }

    #[inline(always)]
    fn slot_of(&self, hash: u64) -> usize {
        (hash >> self.keyshifts) as usize
    }

    /// Best list node to start a forward search for `hash` from, or null.
    ///
    /// Reads the slot for `hash` and scans backwards across earlier slots while
    /// the current one is nil, overshoots, or refers to a deleted node. Staying
    /// nil is always legal for a slot, which is why callers fall back to the
    /// list head when this returns nothing usable.
    fn index_node<'g>(&self, hash: u64, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        let mut slot = self.slot_of(hash);
        loop {
            let item = self.index[slot].load(Ordering::Acquire, guard);
            let usable = match unsafe { item.as_ref() } {
                Some(node) => node.hash <= hash && !node.is_deleted(guard),
                None => false,
            };
            if usable || slot == 0 {
                return item;
            }
            slot -= 1;
        }
    }

    /// Publish `item` into its slot if the slot is nil or currently holds a
    /// node with a greater hash. Each slot always prefers the smallest-hash
    /// node mapping to it. Returns the new filled-slot count when this call
    /// filled a nil slot, otherwise 0.
    fn add_to_index(&self, item: Shared<'_, Node<K, V>>, guard: &Guard) -> usize {
        let node = unsafe { item.deref() };
        let cell = &self.index[self.slot_of(node.hash)];
        loop {
            let cur = cell.load(Ordering::Acquire, guard);
            match unsafe { cur.as_ref() } {
                None => {
                    if cell
                        .compare_exchange(
                            Shared::null(),
                            item,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        )
                        .is_ok()
                    {
                        return self.count.fetch_add(1, Ordering::AcqRel) + 1;
                    }
                }
                Some(existing) => {
                    if node.hash < existing.hash
                        && cell
                            .compare_exchange(cur, item, Ordering::AcqRel, Ordering::Acquire, guard)
                            .is_err()
                    {
                        continue;
                    }
                    return 0;
                }
            }
        }
    }
}

/// Shared state of the map. Lives behind an `Arc` so that deferred reclamation
/// closures can still reach the current metadata after the map handle itself
/// has been dropped.
struct MapCore<K, V> {
    this: Weak<MapCore<K, V>>,
    /// Permanent sentinel; sorts below every real node and is never compared.
    head: Box<Node<K, V>>,
    metadata: Atomic<Metadata<K, V>>,
    num_items: AtomicUsize,
    resizing: AtomicBool,
}

// ================================================================================================
// MAIN MAP STRUCTURE
// ================================================================================================

/// Lock-free concurrent hash map.
///
/// All entries live in a single linked list kept in ascending hash order; a
/// sparse index of pointers into that list accelerates lookups to expected
/// O(1) and is rebuilt online when its fill rate passes the threshold. The
/// index is strictly an accelerator: it can lag the list or lose hints
/// transiently, which costs a longer walk but never a wrong answer.
pub struct ListMap<K, V, S: BuildHasher = Xxh3Builder> {
    core: Arc<MapCore<K, V>>,
    hasher: S,
}

// SAFETY: all shared state is reached through atomics under epoch protection,
// and deferred destruction may drop keys and values on another thread, hence
// Send + Sync are required of both parameters.
unsafe impl<K: Send + Sync, V: Send + Sync, S: BuildHasher + Send> Send for ListMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: BuildHasher + Sync> Sync for ListMap<K, V, S> {}

// ================================================================================================
// CONSTRUCTORS
// ================================================================================================

impl<K: Eq + Hash + Clone + 'static, V: 'static> ListMap<K, V, Xxh3Builder> {
    /// Create a new map with the default index size.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a new map sized for the given number of entries. A capacity of 0
    /// falls back to the default size.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, Xxh3Builder::new())
    }
}

impl<K: Eq + Hash + Clone + 'static, V: 'static, S: BuildHasher> ListMap<K, V, S> {
    /// Create a new map using the provided hasher.
    ///
    /// The hasher is fixed for the lifetime of the map; there is deliberately
    /// no way to swap it on a populated map, since doing so would invalidate
    /// the hash order of the list.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Create a new map with the specified capacity and hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        let size = if capacity == 0 { DEFAULT_SIZE } else { capacity };
        let core = Arc::new_cyclic(|this| MapCore {
            this: this.clone(),
            head: Box::new(Node::sentinel()),
            metadata: Atomic::new(Metadata::with_len(next_pow2(size))),
            num_items: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),
        });
        Self { core, hasher }
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Get the value associated with the given key as a cloned `V`.
    ///
    /// Walks raw `next` pointers from the index hint without helping cleanup,
    /// so readers are never slowed down by deleted nodes awaiting unlink.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let guard = epoch::pin();
        let hash = self.hash(key);
        let mut curr = self.read_start(hash, &guard);
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.hash > hash {
                break;
            }
            if node.hash == hash && unsafe { node.key() } == key {
                let value = node.value.load(Ordering::Acquire, &guard);
                if node.is_deleted(&guard) {
                    return None;
                }
                return Some(unsafe { value.deref() }.clone());
            }
            curr = node.next.load(Ordering::Acquire, &guard).with_tag(0);
        }
        None
    }

    /// Check whether the given key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        let guard = epoch::pin();
        let hash = self.hash(key);
        let mut curr = self.read_start(hash, &guard);
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.hash > hash {
                break;
            }
            if node.hash == hash && unsafe { node.key() } == key {
                return !node.is_deleted(&guard);
            }
            curr = node.next.load(Ordering::Acquire, &guard).with_tag(0);
        }
        false
    }

    /// Insert a key-value pair, replacing and returning any previous value.
    ///
    /// Updates replace the value cell of the existing node atomically; inserts
    /// splice a fresh node into the list with a single CAS and then publish it
    /// into the index, which may trigger an online resize.
    pub fn insert(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = epoch::pin();
        let hash = self.hash(&key);
        let md_shared = self.core.metadata.load(Ordering::Acquire, &guard);
        let md = unsafe { md_shared.deref() };
        let value = Owned::new(value).into_shared(&guard);
        let start = self.write_start(md, hash, &guard);
        let (node, created, old) = self.core.inject(hash, &key, value, true, start, &guard);
        let prior = old.map(|old| {
            let prior = unsafe { old.deref() }.clone();
            unsafe { guard.defer_destroy(old) };
            prior
        });
        if created {
            self.core.num_items.fetch_add(1, Ordering::AcqRel);
        }
        let count = md.add_to_index(node, &guard);
        self.maybe_grow(md.index.len(), count, &guard);
        prior
    }

    /// Remove the key from the map, returning the previous value if this call
    /// was the one that deleted it.
    ///
    /// Deletion only flags the node; it is physically unlinked by whichever
    /// traversal next walks over it. Concurrent removals of the same key
    /// return `Some` for exactly one caller.
    pub fn remove(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let guard = epoch::pin();
        let hash = self.hash(key);
        let md = unsafe { self.core.metadata.load(Ordering::Acquire, &guard).deref() };
        let hint = md.index_node(hash, &guard);
        let mut curr = match unsafe { hint.as_ref() } {
            Some(node) if node.hash <= hash => hint,
            _ => self.core.next_of(&self.core.head, &guard),
        };
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.hash > hash {
                break;
            }
            if node.hash == hash && unsafe { node.key() } == key {
                let value = node.value.load(Ordering::Acquire, &guard);
                if node.mark(&guard) {
                    self.core.remove_from_index(curr, &guard);
                    return Some(unsafe { value.deref() }.clone());
                }
                return None;
            }
            curr = self.core.next_of(node, &guard);
        }
        None
    }

    /// Remove several keys in one pass over the list.
    ///
    /// The keys are sorted by hash so the list is walked once in order, which
    /// is strictly cheaper than removing them one by one.
    pub fn remove_bulk(&self, keys: &[K]) {
        match keys.len() {
            0 => return,
            1 => {
                self.remove_quiet(&keys[0]);
                return;
            }
            _ => {}
        }
        let guard = epoch::pin();
        let mut queue: Vec<(u64, &K)> = keys.iter().map(|k| (self.hash(k), k)).collect();
        queue.sort_by_key(|&(hash, _)| hash);

        let md = unsafe { self.core.metadata.load(Ordering::Acquire, &guard).deref() };
        let hint = md.index_node(queue[0].0, &guard);
        let mut curr = match unsafe { hint.as_ref() } {
            Some(node) if node.hash <= queue[0].0 => hint,
            _ => self.core.next_of(&self.core.head, &guard),
        };
        let mut pos = 0;
        while let Some(node) = unsafe { curr.as_ref() } {
            while pos < queue.len() && queue[pos].0 < node.hash {
                pos += 1;
            }
            if pos >= queue.len() {
                break;
            }
            if node.hash == queue[pos].0 {
                // scan the whole run of equal-hash requests for this node's key
                let mut i = pos;
                while i < queue.len() && queue[i].0 == node.hash {
                    if queue[i].1 == unsafe { node.key() } {
                        if node.mark(&guard) {
                            self.core.remove_from_index(curr, &guard);
                        }
                        break;
                    }
                    i += 1;
                }
            }
            curr = self.core.next_of(node, &guard);
        }
    }

    /// Return the existing value for the key, or insert the given value.
    /// The boolean is `true` if the value was already present.
    pub fn get_or_insert(&self, key: K, value: V) -> (V, bool)
    where
        V: Clone,
    {
        self.get_or_insert_impl(key, || value)
    }

    /// Return the existing value for the key, or insert the value produced by
    /// the closure. The boolean is `true` if the value was already present.
    ///
    /// Under a race the closure may run on more than one caller, but exactly
    /// one produced value is stored; the others are discarded unobserved.
    pub fn get_or_insert_with<F: FnOnce() -> V>(&self, key: K, make: F) -> (V, bool)
    where
        V: Clone,
    {
        self.get_or_insert_impl(key, make)
    }

    /// Atomically replace the value for an existing key, returning the old
    /// value. Absent keys are not inserted.
    pub fn swap(&self, key: &K, new: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = epoch::pin();
        let hash = self.hash(key);
        let md = unsafe { self.core.metadata.load(Ordering::Acquire, &guard).deref() };
        let start = self.write_start(md, hash, &guard);
        let (_, found, _) = self.core.search(hash, key, start, &guard);
        let node = unsafe { found.as_ref() }?;
        let old = node.value.swap(Owned::new(new), Ordering::AcqRel, &guard);
        let prior = unsafe { old.deref() }.clone();
        unsafe { guard.defer_destroy(old) };
        Some(prior)
    }

    /// Atomically set the value for the key to `new` if its current value
    /// equals `old` by structural equality. Returns whether the swap happened;
    /// `false` for absent keys.
    pub fn compare_and_swap(&self, key: &K, old: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let guard = epoch::pin();
        let hash = self.hash(key);
        let md = unsafe { self.core.metadata.load(Ordering::Acquire, &guard).deref() };
        let start = self.write_start(md, hash, &guard);
        let (_, found, _) = self.core.search(hash, key, start, &guard);
        let node = match unsafe { found.as_ref() } {
            Some(node) => node,
            None => return false,
        };
        let current = node.value.load(Ordering::Acquire, &guard);
        if unsafe { current.deref() } != old {
            return false;
        }
        match node.value.compare_exchange(
            current,
            Owned::new(new),
            Ordering::AcqRel,
            Ordering::Acquire,
            &guard,
        ) {
            Ok(_) => {
                unsafe { guard.defer_destroy(current) };
                true
            }
            Err(_) => false,
        }
    }

    /// Invoke the closure for every live entry; returning `false` stops the
    /// iteration early.
    ///
    /// The walk helps unlink deleted nodes as it goes. Entries inserted or
    /// deleted concurrently may or may not be visited; each visited value is
    /// the entry's most recent publication at visit time.
    pub fn for_each<F: FnMut(&K, &V) -> bool>(&self, mut f: F) {
        let guard = epoch::pin();
        let mut curr = self.core.next_of(&self.core.head, &guard);
        while let Some(node) = unsafe { curr.as_ref() } {
            let value = node.value.load(Ordering::Acquire, &guard);
            if !f(unsafe { node.key() }, unsafe { value.deref() }) {
                return;
            }
            curr = self.core.next_of(node, &guard);
        }
    }

    /// Resize the index to hold `new_size` slots, rounded up to the next power
    /// of two; 0 doubles the current size. Returns immediately if another
    /// resize is already running.
    pub fn grow(&self, new_size: usize) {
        if self
            .core
            .resizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let guard = epoch::pin();
            self.core.grow_internal(new_size, &guard);
        }
    }

    /// Remove all entries and shrink the index back to the default size.
    pub fn clear(&self) {
        let guard = epoch::pin();
        let fresh = Owned::new(Metadata::with_len(DEFAULT_SIZE));
        let prev = self.core.metadata.swap(fresh, Ordering::AcqRel, &guard);
        unsafe { guard.defer_destroy(prev) };
        self.core.num_items.store(0, Ordering::Release);

        // Detach the whole list, then flag every node so that in-flight
        // splices behind them fail before the nodes are reclaimed.
        let mut curr = self
            .core
            .head
            .next
            .swap(Shared::null(), Ordering::AcqRel, &guard)
            .with_tag(0);
        while let Some(node) = unsafe { curr.as_ref() } {
            node.mark(&guard);
            let next = node.next.load(Ordering::Acquire, &guard).with_tag(0);
            unsafe { self.core.retire_node(curr, &guard) };
            curr = next;
        }
    }

    /// Number of live entries. Eventually consistent while removals are in
    /// flight.
    pub fn len(&self) -> usize {
        self.core.num_items.load(Ordering::Relaxed)
    }

    /// Returns true if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filled index slots as a percentage of the index length.
    pub fn fill_rate(&self) -> usize {
        let guard = epoch::pin();
        let md = unsafe { self.core.metadata.load(Ordering::Acquire, &guard).deref() };
        md.count.load(Ordering::Relaxed) * 100 / md.index.len()
    }

    /// Current number of index slots.
    pub fn capacity(&self) -> usize {
        let guard = epoch::pin();
        let md = unsafe { self.core.metadata.load(Ordering::Acquire, &guard).deref() };
        md.index.len()
    }

    /// Returns an iterator over cloned key-value pairs.
    ///
    /// The cursor pins the current epoch for as long as it is alive, so prefer
    /// draining it promptly on write-heavy maps.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            map: self,
            current: &*self.core.head as *const Node<K, V>,
            guard: epoch::pin(),
        }
    }

    /// Returns an iterator over cloned keys.
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys { iter: self.iter() }
    }

    /// Returns an iterator over cloned values.
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values { iter: self.iter() }
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    #[inline(always)]
    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Starting node for a read-only walk: the index hint if it does not
    /// overshoot, else the first real node of the list.
    #[inline(always)]
    fn read_start<'g>(&self, hash: u64, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        let md = unsafe { self.core.metadata.load(Ordering::Acquire, guard).deref() };
        let hint = md.index_node(hash, guard);
        match unsafe { hint.as_ref() } {
            Some(node) if node.hash <= hash => hint,
            _ => self
                .core
                .head
                .next
                .load(Ordering::Acquire, guard)
                .with_tag(0),
        }
    }

    /// Starting node for a mutating walk: the index hint if usable, else the
    /// sentinel head itself so that splices before the first node work.
    #[inline(always)]
    fn write_start<'g>(
        &self,
        md: &Metadata<K, V>,
        hash: u64,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let hint = md.index_node(hash, guard);
        match unsafe { hint.as_ref() } {
            Some(node) if node.hash <= hash => hint,
            _ => self.core.head_shared(),
        }
    }

    /// Single-key removal without cloning the value out.
    fn remove_quiet(&self, key: &K) {
        let guard = epoch::pin();
        let hash = self.hash(key);
        let md = unsafe { self.core.metadata.load(Ordering::Acquire, &guard).deref() };
        let hint = md.index_node(hash, &guard);
        let mut curr = match unsafe { hint.as_ref() } {
            Some(node) if node.hash <= hash => hint,
            _ => self.core.next_of(&self.core.head, &guard),
        };
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.hash > hash {
                return;
            }
            if node.hash == hash && unsafe { node.key() } == key {
                if node.mark(&guard) {
                    self.core.remove_from_index(curr, &guard);
                }
                return;
            }
            curr = self.core.next_of(node, &guard);
        }
    }

    fn get_or_insert_impl<F: FnOnce() -> V>(&self, key: K, make: F) -> (V, bool)
    where
        V: Clone,
    {
        let guard = epoch::pin();
        let hash = self.hash(&key);
        let md_shared = self.core.metadata.load(Ordering::Acquire, &guard);
        let md = unsafe { md_shared.deref() };
        let hint = md.index_node(hash, &guard);

        // Fast path: plain read walk, same as get().
        let mut curr = match unsafe { hint.as_ref() } {
            Some(node) if node.hash <= hash => hint,
            _ => self
                .core
                .head
                .next
                .load(Ordering::Acquire, &guard)
                .with_tag(0),
        };
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.hash > hash {
                break;
            }
            if node.hash == hash && unsafe { node.key() } == &key && !node.is_deleted(&guard) {
                let value = node.value.load(Ordering::Acquire, &guard);
                return (unsafe { value.deref() }.clone(), true);
            }
            curr = node.next.load(Ordering::Acquire, &guard).with_tag(0);
        }

        // Missed: produce the value and insert it unless someone beat us to it.
        let value = Owned::new(make()).into_shared(&guard);
        let start = match unsafe { hint.as_ref() } {
            Some(node) if node.hash <= hash => hint,
            _ => self.core.head_shared(),
        };
        let (node, created, _) = self.core.inject(hash, &key, value, false, start, &guard);
        if created {
            self.core.num_items.fetch_add(1, Ordering::AcqRel);
            let inserted = unsafe { value.deref() }.clone();
            let count = md.add_to_index(node, &guard);
            self.maybe_grow(md.index.len(), count, &guard);
            (inserted, false)
        } else {
            // Lost the race; drop our value and report the winner's.
            let existing = unsafe { node.deref() }.value.load(Ordering::Acquire, &guard);
            let actual = unsafe { existing.deref() }.clone();
            drop(unsafe { value.into_owned() });
            (actual, true)
        }
    }

    #[inline(always)]
    fn maybe_grow(&self, len: usize, count: usize, guard: &Guard) {
        if resize_needed(len, count)
            && self
                .core
                .resizing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.core.grow_internal(0, guard);
        }
    }
}

// ================================================================================================
// CORE LIST AND INDEX COORDINATION
// ================================================================================================

impl<K: Eq + 'static, V: 'static> MapCore<K, V> {
    #[inline(always)]
    fn head_shared<'g>(&self) -> Shared<'g, Node<K, V>> {
        Shared::from(&*self.head as *const Node<K, V>)
    }

    /// First live successor of `node`, splicing out flagged nodes on the way.
    ///
    /// The splice CAS expects an untagged pointer, so a node that is itself
    /// flagged can never unlink its successor; it is read through instead.
    fn next_of<'g>(&self, node: &Node<K, V>, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        let mut node = node;
        loop {
            let next = node.next.load(Ordering::Acquire, guard);
            let succ_shared = next.with_tag(0);
            let succ = match unsafe { succ_shared.as_ref() } {
                Some(succ) => succ,
                None => return Shared::null(),
            };
            let succ_next = succ.next.load(Ordering::Acquire, guard);
            if succ_next.tag() & TAG_DELETED == 0 {
                return succ_shared;
            }
            if next.tag() == 0 {
                if node
                    .next
                    .compare_exchange(
                        succ_shared,
                        succ_next.with_tag(0),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .is_ok()
                {
                    unsafe { self.retire_node(succ_shared, guard) };
                }
                continue;
            }
            // this node is flagged itself; walk through without editing
            node = succ;
        }
    }

    /// Walk from `from` and return `(left, match, right)`: the node holding
    /// `(hash, key)` if present with its sorted neighbours, or the insertion
    /// point `(left, null, right)` otherwise. Deleted nodes encountered on the
    /// way are unlinked when a live predecessor is at hand; a lost unlink CAS
    /// restarts the walk.
    fn search<'g>(
        &self,
        hash: u64,
        key: &K,
        from: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> (
        Shared<'g, Node<K, V>>,
        Shared<'g, Node<K, V>>,
        Shared<'g, Node<K, V>>,
    ) {
        let head = self.head_shared();
        'retry: loop {
            let mut left = Shared::null();
            let mut curr = from;
            loop {
                let node = match unsafe { curr.as_ref() } {
                    Some(node) => node,
                    None => return (left, Shared::null(), Shared::null()),
                };
                let next = node.next.load(Ordering::Acquire, guard);
                let succ = next.with_tag(0);
                if next.tag() & TAG_DELETED != 0 {
                    if !left.is_null() {
                        let left_ref = unsafe { left.deref() };
                        match left_ref.next.compare_exchange(
                            curr,
                            succ,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        ) {
                            Ok(_) => unsafe { self.retire_node(curr, guard) },
                            Err(_) => continue 'retry,
                        }
                    }
                    curr = succ;
                    continue;
                }
                if curr != head {
                    if hash < node.hash {
                        return (left, Shared::null(), curr);
                    }
                    if hash == node.hash && unsafe { node.key() } == key {
                        return (left, curr, succ);
                    }
                }
                left = curr;
                curr = succ;
            }
        }
    }

    /// Update the value of an existing node or splice a new one after `left`.
    ///
    /// Returns `(node, created, old_value)`. With `overwrite` false an existing
    /// live node is returned untouched and the caller keeps ownership of
    /// `value`; in every other outcome `value` has been consumed.
    fn inject<'g>(
        &self,
        hash: u64,
        key: &K,
        value: Shared<'g, V>,
        overwrite: bool,
        from: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> (Shared<'g, Node<K, V>>, bool, Option<Shared<'g, V>>)
    where
        K: Clone,
    {
        let mut from = from;
        let mut alloc: Option<Owned<Node<K, V>>> = None;
        loop {
            let (left, found, right) = self.search(hash, key, from, guard);
            if let Some(node) = unsafe { found.as_ref() } {
                if let Some(mut leftover) = alloc.take() {
                    // reclaim the key clone of the allocation that lost the race;
                    // the value cell is settled by the caller
                    unsafe { ptr::drop_in_place(leftover.key.as_mut_ptr()) };
                }
                if !overwrite {
                    return (found, false, None);
                }
                let old = node.value.swap(value, Ordering::AcqRel, guard);
                return (found, false, Some(old));
            }
            if left.is_null() {
                // the hint chain died under us; restart from the sentinel
                from = self.head_shared();
                continue;
            }
            let node = alloc.take().unwrap_or_else(|| {
                let node = Owned::new(Node::new(hash, key.clone()));
                node.value.store(value, Ordering::Relaxed);
                node
            });
            node.next.store(right, Ordering::Relaxed);
            let left_ref = unsafe { left.deref() };
            match left_ref
                .next
                .compare_exchange(right, node, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(spliced) => return (spliced, true, None),
                Err(err) => {
                    alloc = Some(err.new);
                    from = left;
                }
            }
        }
    }

    /// Drop the index entry for a deleted node, repointing its slot at the
    /// next node of the same slot when there is one. Retried until the
    /// metadata snapshot is stable across the attempt, which proves no resize
    /// raced it. Also decrements the item counter for the won deletion.
    fn remove_from_index(&self, item: Shared<'_, Node<K, V>>, guard: &Guard) {
        let node = unsafe { item.deref() };
        loop {
            let md_shared = self.metadata.load(Ordering::Acquire, guard);
            let md = unsafe { md_shared.deref() };
            let slot = md.slot_of(node.hash);
            let mut next = self.next_of(node, guard);
            if let Some(succ) = unsafe { next.as_ref() } {
                if md.slot_of(succ.hash) != slot {
                    next = Shared::null();
                }
            }
            let emptied = md.index[slot]
                .compare_exchange(item, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
                && next.is_null();
            if self.metadata.load(Ordering::Acquire, guard) == md_shared {
                self.num_items.fetch_sub(1, Ordering::AcqRel);
                if emptied {
                    md.count.fetch_sub(1, Ordering::AcqRel);
                }
                return;
            }
        }
    }

    /// Re-project the list into a freshly allocated index: the first node and
    /// every node that opens a new slot are published.
    fn fill_index(&self, md: &Metadata<K, V>, guard: &Guard) {
        let mut last_slot = usize::MAX;
        let mut item = self.next_of(&self.head, guard);
        while let Some(node) = unsafe { item.as_ref() } {
            let slot = md.slot_of(node.hash);
            if slot != last_slot {
                md.add_to_index(item, guard);
                last_slot = slot;
            }
            item = self.next_of(node, guard);
        }
    }

    /// Allocate, re-project and publish a new index, doubling again while the
    /// fill rate stays above the threshold. Caller must have won the resizing
    /// flag; it is cleared on the way out.
    fn grow_internal(&self, new_size: usize, guard: &Guard) {
        let mut new_size = new_size;
        loop {
            let current = unsafe { self.metadata.load(Ordering::Acquire, guard).deref() };
            let len = if new_size == 0 {
                current.index.len() << 1
            } else {
                next_pow2(new_size)
            };
            let md = Owned::new(Metadata::with_len(len));
            self.fill_index(&md, guard);
            let prev = self.metadata.swap(md, Ordering::AcqRel, guard);
            unsafe { guard.defer_destroy(prev) };
            if !resize_needed(len, self.num_items.load(Ordering::Acquire)) {
                self.resizing.store(false, Ordering::Release);
                return;
            }
            new_size = 0;
        }
    }

    /// Schedule a flagged, unlinked node for reclamation.
    ///
    /// Reclamation runs in two deferred phases. After the first grace period,
    /// when no operation that could still publish this node into an index slot
    /// survives, its slot in the then-current index is scrubbed. After a
    /// second grace period, when no reader can have picked the pointer up from
    /// that slot anymore, key, value and node are dropped. The `TAG_RETIRED`
    /// claim bit keeps concurrent unlink paths from scheduling a node twice.
    unsafe fn retire_node(&self, node: Shared<'_, Node<K, V>>, guard: &Guard) {
        let node_ref = node.deref();
        loop {
            let next = node_ref.next.load(Ordering::Acquire, guard);
            if next.tag() & TAG_RETIRED != 0 {
                return;
            }
            if node_ref
                .next
                .compare_exchange(
                    next,
                    next.with_tag(next.tag() | TAG_RETIRED),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok()
            {
                break;
            }
        }
        let core = self
            .this
            .upgrade()
            .expect("core is alive while an operation runs on it");
        let raw = node.as_raw() as usize;
        guard.defer_unchecked(move || {
            let guard = epoch::pin();
            let node_ref = unsafe { &*(raw as *const Node<K, V>) };
            let md = core.metadata.load(Ordering::Acquire, &guard);
            if let Some(md) = unsafe { md.as_ref() } {
                let slot = md.slot_of(node_ref.hash);
                let expected = Shared::from(raw as *const Node<K, V>);
                let _ = md.index[slot].compare_exchange(
                    expected,
                    Shared::null(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    &guard,
                );
            }
            unsafe {
                guard.defer_unchecked(move || {
                    let mut node = Owned::from_raw(raw as *mut Node<K, V>);
                    let value = node.value.load(Ordering::Relaxed, epoch::unprotected());
                    if !value.is_null() {
                        drop(value.into_owned());
                    }
                    ptr::drop_in_place(node.key.as_mut_ptr());
                    drop(node);
                });
            }
        });
    }
}

// ================================================================================================
// DROP IMPLEMENTATIONS
// ================================================================================================

impl<K, V> Drop for MapCore<K, V> {
    fn drop(&mut self) {
        // Sole owner at this point: free whatever is still linked. Nodes that
        // were retired earlier are no longer reachable from the list and are
        // freed by their own deferred destructors.
        unsafe {
            let guard = epoch::unprotected();
            let mut curr = self.head.next.load(Ordering::Relaxed, guard).with_tag(0);
            while let Some(node) = curr.as_ref() {
                let next = node.next.load(Ordering::Relaxed, guard).with_tag(0);
                let value = node.value.load(Ordering::Relaxed, guard);
                if !value.is_null() {
                    drop(value.into_owned());
                }
                let mut owned = curr.into_owned();
                ptr::drop_in_place(owned.key.as_mut_ptr());
                drop(owned);
                curr = next;
            }
            let md = self.metadata.load(Ordering::Relaxed, guard);
            if !md.is_null() {
                drop(md.into_owned());
            }
        }
    }
}

// ================================================================================================
// STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<K: Eq + Hash + Clone + 'static, V: 'static, S: BuildHasher + Default> Default
    for ListMap<K, V, S>
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<'a, K: Eq + Hash + Clone + 'static, V: Clone + 'static, S: BuildHasher> IntoIterator
    for &'a ListMap<K, V, S>
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Eq + Hash + Clone + 'static, V: Clone + 'static, S: BuildHasher + Default>
    FromIterator<(K, V)> for ListMap<K, V, S>
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = ListMap::with_hasher(S::default());
        for (k, v) in iter {
            let _ = map.insert(k, v);
        }
        map
    }
}

impl<K: Eq + Hash + Clone + 'static, V: Clone + 'static, S: BuildHasher> Extend<(K, V)>
    for ListMap<K, V, S>
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            let _ = self.insert(k, v);
        }
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

/// Next power of 2 greater than or equal to n, never below 2.
fn next_pow2(mut n: usize) -> usize {
    if n < 2 {
        return 2;
    }
    n -= 1;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    if usize::BITS == 64 {
        n |= n >> 32;
    }
    n + 1
}

#[inline(always)]
fn resize_needed(len: usize, count: usize) -> bool {
    count * 100 / len > MAX_FILL_RATE
}

// ================================================================================================
// ITERATOR IMPLEMENTATIONS
// ================================================================================================

/// Iterator over the key-value pairs of a [`ListMap`]. Holds an epoch guard
/// for its whole lifetime.
pub struct Iter<'a, K, V, S: BuildHasher = Xxh3Builder> {
    map: &'a ListMap<K, V, S>,
    current: *const Node<K, V>,
    guard: Guard,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
    S: BuildHasher,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = unsafe { self.current.as_ref() }?;
        let succ = self.map.core.next_of(node, &self.guard);
        self.current = succ.as_raw();
        let next = unsafe { succ.as_ref() }?;
        let value = next.value.load(Ordering::Acquire, &self.guard);
        Some((unsafe { next.key() }.clone(), unsafe { value.deref() }.clone()))
    }
}

/// Iterator over the keys of a [`ListMap`].
pub struct Keys<'a, K, V, S: BuildHasher = Xxh3Builder> {
    iter: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Iterator for Keys<'a, K, V, S>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
    S: BuildHasher,
{
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(k, _)| k)
    }
}

/// Iterator over the values of a [`ListMap`].
pub struct Values<'a, K, V, S: BuildHasher = Xxh3Builder> {
    iter: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Iterator for Values<'a, K, V, S>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
    S: BuildHasher,
{
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(_, v)| v)
    }
}

// ================================================================================================
// SERDE SUPPORT
// ================================================================================================

#[cfg(feature = "serde")]
mod serde_support {
    use super::*;
    use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
    use serde::ser::{Serialize, SerializeMap, Serializer};
    use std::fmt;
    use std::marker::PhantomData;

    impl<K, V, S> Serialize for ListMap<K, V, S>
    where
        K: Eq + Hash + Clone + Serialize + 'static,
        V: Clone + Serialize + 'static,
        S: BuildHasher,
    {
        fn serialize<Sr: Serializer>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error> {
            let mut map = serializer.serialize_map(Some(self.len()))?;
            for (k, v) in self.iter() {
                map.serialize_entry(&k, &v)?;
            }
            map.end()
        }
    }

    struct ListMapVisitor<K, V, S> {
        _marker: PhantomData<(K, V, S)>,
    }

    impl<'de, K, V, S> Visitor<'de> for ListMapVisitor<K, V, S>
    where
        K: Eq + Hash + Clone + Deserialize<'de> + 'static,
        V: Clone + Deserialize<'de> + 'static,
        S: BuildHasher + Default,
    {
        type Value = ListMap<K, V, S>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a map")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let map =
                ListMap::with_capacity_and_hasher(access.size_hint().unwrap_or(0), S::default());
            while let Some((k, v)) = access.next_entry()? {
                let _ = map.insert(k, v);
            }
            Ok(map)
        }
    }

    impl<'de, K, V, S> Deserialize<'de> for ListMap<K, V, S>
    where
        K: Eq + Hash + Clone + Deserialize<'de> + 'static,
        V: Clone + Deserialize<'de> + 'static,
        S: BuildHasher + Default,
    {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_map(ListMapVisitor {
                _marker: PhantomData,
            })
        }
    }
}
