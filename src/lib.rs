//! TypeTripleCache: an insert-only concurrent cache keyed by (source, target, context)
//! type triples, built for mapper runtimes that memoize per-type mapping plans.
//! Lock-free reads over an atomically published table; writers serialize on one lock.

use std::any::TypeId;
use std::cell::RefCell;
use std::cmp;
use std::convert::Infallible;
use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use ahash::AHasher;
use parking_lot::ReentrantMutex;

/// Growth multiplier applied to the entry count when sizing the table after an
/// insert. Checked on every insert, so the load factor stays well below 1.
const GROWTH_FACTOR: usize = 3;

/// Odd multiplier mixing the target-type hash so that permutations of the same
/// types in different key slots land in different buckets.
const HASH_FACTOR: u64 = 397;

const DEFAULT_CAPACITY: usize = 32;

/// One cached mapping entry. Key and value never change after construction;
/// `next` is written only by the thread holding the writer lock and read by
/// lock-free readers, so it is atomic with Release/Acquire pairing.
#[cfg_attr(feature = "padding", repr(align(64)))]
struct Node<V> {
    source: TypeId,
    target: TypeId,
    context: TypeId,
    value: V,
    next: AtomicPtr<Node<V>>,
}

struct Table<V> {
    buckets: Vec<AtomicPtr<Node<V>>>,
    mask: usize,
}

impl<V> Table<V> {
    fn new(len: usize) -> Self {
        let mut buckets = Vec::with_capacity(len);
        for _ in 0..len {
            buckets.push(AtomicPtr::new(ptr::null_mut()));
        }
        Table {
            buckets,
            mask: len - 1,
        }
    }
}

/// Writer-side bookkeeping guarded by the writer lock. Superseded tables and
/// every node ever allocated are parked here and freed when the cache drops,
/// so a reader still traversing an orphaned table never touches freed memory.
struct Retired<V> {
    tables: Vec<*mut Table<V>>,
    nodes: Vec<*mut Node<V>>,
}

/// Thread-safe, insert-only cache from a (source, target, context) `TypeId`
/// triple to an opaque value.
///
/// Reads are wait-free and allocation-free: they walk a snapshot of the bucket
/// table taken with a single atomic load. Writes are serialized on a re-entrant
/// lock, so a value factory may itself request other mappings (or even the same
/// one) on the same thread without deadlocking.
pub struct TypeTripleCache<V> {
    table: AtomicPtr<Table<V>>,
    sync: ReentrantMutex<RefCell<Retired<V>>>,
    initial_capacity: usize,
    count: AtomicUsize,
    depth: AtomicUsize,
    hasher: BuildHasherDefault<AHasher>,
}

// SAFETY: the bucket table and chain links are only mutated by the thread
// holding `sync` and are published with Release stores; readers use Acquire
// loads and never see a node before its key/value are written. Values move in
// from any thread and are cloned out through shared references, hence
// V: Send + Sync for sharing and V: Send for ownership transfer on drop.
unsafe impl<V: Send> Send for TypeTripleCache<V> {}
unsafe impl<V: Send + Sync> Sync for TypeTripleCache<V> {}

impl<V> TypeTripleCache<V> {
    /// Creates a cache with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a cache sized for roughly `initial_capacity` entries.
    ///
    /// The table starts at the smallest power of two >= `initial_capacity`
    /// and grows ahead of the entry count from there.
    ///
    /// # Panics
    ///
    /// Panics if `initial_capacity` is zero; a zero-length table cannot be
    /// indexed and the mistake should surface at construction, not on first use.
    pub fn with_capacity(initial_capacity: usize) -> Self {
        assert!(initial_capacity > 0, "initial_capacity must be positive");
        let table = Table::new(calc_table_len(initial_capacity));
        TypeTripleCache {
            table: AtomicPtr::new(Box::into_raw(Box::new(table))),
            sync: ReentrantMutex::new(RefCell::new(Retired {
                tables: Vec::new(),
                nodes: Vec::new(),
            })),
            initial_capacity,
            count: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
            hasher: BuildHasherDefault::<AHasher>::default(),
        }
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Longest bucket chain observed, recomputed on structural change.
    /// Diagnostic only; a growing value signals hash clustering.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Current bucket-table length. Always a power of two.
    pub fn capacity(&self) -> usize {
        self.load_table().buckets.len()
    }

    /// Discards every entry and restores the table to its initial size.
    ///
    /// Readers still traversing the superseded table finish on that snapshot;
    /// it is never mutated after being replaced, only reclaimed on drop.
    pub fn clear(&self) {
        let guard = self.sync.lock();
        let table = Table::new(calc_table_len(self.initial_capacity));
        let old = self.table.swap(Box::into_raw(Box::new(table)), Ordering::AcqRel);
        guard.borrow_mut().tables.push(old);
        self.count.store(0, Ordering::Relaxed);
        self.depth.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn load_table(&self) -> &Table<V> {
        // Set at construction and only ever swapped for another live table.
        unsafe { &*self.table.load(Ordering::Acquire) }
    }

    #[inline]
    fn hash_one(&self, id: TypeId) -> u64 {
        let mut h = self.hasher.build_hasher();
        id.hash(&mut h);
        h.finish()
    }

    #[inline]
    fn calculate_hash(&self, source: TypeId, target: TypeId, context: TypeId) -> u64 {
        self.hash_one(source) ^ self.hash_one(target).wrapping_mul(HASH_FACTOR) ^ self.hash_one(context)
    }

    /// Relocates every node of `old_table` into `new_table` by rewriting chain
    /// links only; key/value payloads are reused in place.
    ///
    /// Detaching a link truncates the old chain for any reader still walking
    /// it. Such a reader reports a miss and re-enters through the writer lock,
    /// where the post-lock lookup runs after relocation and finds the entry.
    fn relocate_nodes(&self, new_table: &Table<V>, old_table: &Table<V>) {
        for bucket in &old_table.buckets {
            let mut node_ptr = bucket.load(Ordering::Relaxed);
            while !node_ptr.is_null() {
                let node = unsafe { &*node_ptr };
                let next = node.next.load(Ordering::Relaxed);
                node.next.store(ptr::null_mut(), Ordering::Release);

                let idx = (self.calculate_hash(node.source, node.target, node.context) as usize)
                    & new_table.mask;
                link_node(&new_table.buckets[idx], node_ptr);

                node_ptr = next;
            }
        }
    }

    /// Inserts a freshly allocated node. Caller holds the writer lock and has
    /// verified the key is absent.
    fn add_node(&self, retired: &RefCell<Retired<V>>, node_ptr: *mut Node<V>) {
        retired.borrow_mut().nodes.push(node_ptr);

        let node = unsafe { &*node_ptr };
        let table = self.load_table();
        let count = self.count.load(Ordering::Relaxed);
        let request = cmp::max(self.initial_capacity, (count + 1) * GROWTH_FACTOR);
        let required = calc_table_len(request);

        if required > table.buckets.len() {
            let new_table = Table::new(required);
            self.relocate_nodes(&new_table, table);

            let idx = (self.calculate_hash(node.source, node.target, node.context) as usize)
                & new_table.mask;
            link_node(&new_table.buckets[idx], node_ptr);

            let depth = table_depth(&new_table);
            // The swap's Release edge publishes the fully built table; a reader
            // that acquires the new pointer sees every relocation and the new node.
            let old = self.table.swap(Box::into_raw(Box::new(new_table)), Ordering::AcqRel);
            retired.borrow_mut().tables.push(old);
            self.depth.store(depth, Ordering::Relaxed);
        } else {
            let idx = (self.calculate_hash(node.source, node.target, node.context) as usize)
                & table.mask;
            // Release on the link store is the barrier readers need: the node's
            // key and value are written before its pointer becomes reachable.
            link_node(&table.buckets[idx], node_ptr);
            self.depth.fetch_max(
                chain_depth(table.buckets[idx].load(Ordering::Relaxed)),
                Ordering::Relaxed,
            );
        }
        self.count.store(count + 1, Ordering::Relaxed);
    }
}

impl<V: Clone> TypeTripleCache<V> {
    /// Looks up the value cached for a type triple.
    ///
    /// Lock-free: a single atomic load of the table reference establishes the
    /// snapshot for the whole walk, and the chain is followed with Acquire
    /// loads until a full-triple match or the end of the bucket.
    ///
    /// # Returns
    ///
    /// * `Option<V>` - The cached value, if the triple has been built before.
    #[inline]
    pub fn get(&self, source: TypeId, target: TypeId, context: TypeId) -> Option<V> {
        let table = self.load_table();
        let idx = (self.calculate_hash(source, target, context) as usize) & table.mask;
        let mut node_ptr = table.buckets[idx].load(Ordering::Acquire);
        while !node_ptr.is_null() {
            let node = unsafe { &*node_ptr };
            if node.source == source && node.target == target && node.context == context {
                return Some(node.value.clone());
            }
            node_ptr = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// Returns the cached value for a triple, invoking `factory` to build it
    /// on a miss.
    ///
    /// The factory runs while the writer lock is held, so concurrent callers
    /// for the same triple block until the first construction finishes and
    /// then receive that value. The lock is re-entrant: the factory may call
    /// back into the cache for nested member mappings on the same thread.
    ///
    /// # Arguments
    ///
    /// * `factory` - Builds the value for a missing triple. Invoked at most
    ///   once per call; its result is discarded if a re-entrant call already
    ///   inserted the same triple.
    pub fn get_or_insert_with<F>(
        &self,
        source: TypeId,
        target: TypeId,
        context: TypeId,
        factory: F,
    ) -> V
    where
        F: FnOnce(TypeId, TypeId, TypeId) -> V,
    {
        let result = self.try_get_or_insert_with(source, target, context, |s, t, c| {
            Ok::<V, Infallible>(factory(s, t, c))
        });
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`get_or_insert_with`](Self::get_or_insert_with).
    ///
    /// A factory error propagates unchanged; no entry is inserted for the
    /// triple, which stays absent and retryable, and the lock is released on
    /// every exit path by scope.
    pub fn try_get_or_insert_with<F, E>(
        &self,
        source: TypeId,
        target: TypeId,
        context: TypeId,
        factory: F,
    ) -> Result<V, E>
    where
        F: FnOnce(TypeId, TypeId, TypeId) -> Result<V, E>,
    {
        let guard = self.sync.lock();

        // Double checked locking: another thread may have built the entry
        // between our lock-free miss and acquiring the lock.
        if let Some(existing) = self.get(source, target, context) {
            return Ok(existing);
        }

        let value = factory(source, target, context)?;

        // Check if added by recursion: a factory building a composite mapping
        // can re-enter for the same triple through a cycle guard.
        if let Some(existing) = self.get(source, target, context) {
            return Ok(existing);
        }

        let node = Box::into_raw(Box::new(Node {
            source,
            target,
            context,
            value: value.clone(),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        self.add_node(&guard, node);

        Ok(value)
    }

    /// Statically typed lookup for callers that know the triple at compile time.
    pub fn get_for<S: 'static, T: 'static, C: 'static>(&self) -> Option<V> {
        self.get(TypeId::of::<S>(), TypeId::of::<T>(), TypeId::of::<C>())
    }

    /// Statically typed form of [`get_or_insert_with`](Self::get_or_insert_with).
    pub fn get_or_insert_for<S: 'static, T: 'static, C: 'static>(
        &self,
        factory: impl FnOnce() -> V,
    ) -> V {
        self.get_or_insert_with(
            TypeId::of::<S>(),
            TypeId::of::<T>(),
            TypeId::of::<C>(),
            |_, _, _| factory(),
        )
    }
}

impl<V> Drop for TypeTripleCache<V> {
    fn drop(&mut self) {
        {
            let guard = self.sync.lock();
            let mut retired = guard.borrow_mut();
            for &node in &retired.nodes {
                unsafe {
                    drop(Box::from_raw(node));
                }
            }
            retired.nodes.clear();
            for &table in &retired.tables {
                unsafe {
                    drop(Box::from_raw(table));
                }
            }
            retired.tables.clear();
        }

        let table = self.table.swap(ptr::null_mut(), Ordering::AcqRel);
        if !table.is_null() {
            unsafe {
                drop(Box::from_raw(table));
            }
        }
    }
}

/// Smallest power of two >= the requested capacity; keeps `hash & mask` a
/// valid bucket index.
fn calc_table_len(request: usize) -> usize {
    request.next_power_of_two()
}

fn chain_depth<V>(mut node: *mut Node<V>) -> usize {
    let mut depth = 0;
    while !node.is_null() {
        depth += 1;
        node = unsafe { (*node).next.load(Ordering::Relaxed) };
    }
    depth
}

fn table_depth<V>(table: &Table<V>) -> usize {
    let mut depth = 0;
    for bucket in &table.buckets {
        depth = cmp::max(chain_depth(bucket.load(Ordering::Relaxed)), depth);
    }
    depth
}

/// Appends `node` to the bucket: head slot if empty, otherwise the chain tail.
/// Only the writer-lock holder calls this; the Release store makes the node's
/// payload visible to any reader that observes the link.
fn link_node<V>(bucket: &AtomicPtr<Node<V>>, node: *mut Node<V>) {
    let head = bucket.load(Ordering::Relaxed);
    if head.is_null() {
        bucket.store(node, Ordering::Release);
    } else {
        let last = find_last(head);
        unsafe {
            (*last).next.store(node, Ordering::Release);
        }
    }
}

fn find_last<V>(mut node: *mut Node<V>) -> *mut Node<V> {
    loop {
        let next = unsafe { (*node).next.load(Ordering::Relaxed) };
        if next.is_null() {
            return node;
        }
        node = next;
    }
}
