//! A bounded cache aging its entries in rounds.
//!
//! Entries are kept in an intrusive doubly linked list ordered by the
//! time they were last touched, most recent first. Because touching an
//! entry moves it to the front and stamps it with the current round,
//! rounds are monotonically decreasing from head to tail and expiry
//! only ever has to look at the tail of the list.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::hash::Hash;
use std::mem::replace;
use std::mem::take;
use std::sync::PoisonError;
use std::sync::RwLock;

use crate::log::trace;
use crate::util::unpoison;


/// Options bounding a [`GenerationalCache`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GCacheOptions {
    /// The maximum number of entries kept. A size of zero disables
    /// caching altogether.
    pub size: usize,
    /// The number of rounds an entry survives without being touched.
    ///
    /// An entry last touched in round `N` is still present after
    /// expiry in round `N + keep_rounds` and removed in round
    /// `N + keep_rounds + 1`.
    pub keep_rounds: u32,
}

impl GCacheOptions {
    /// Create a new `GCacheOptions` object.
    #[inline]
    pub const fn new(size: usize, keep_rounds: u32) -> Self {
        Self { size, keep_rounds }
    }
}

impl Default for GCacheOptions {
    fn default() -> Self {
        Self::new(128, 3)
    }
}


/// Information about a single cache entry, as reported by
/// [`GenerationalCache::debug_info`].
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntryInfo<K, T> {
    /// The entry's key.
    pub key: K,
    /// The round in which the entry was last touched.
    pub round: u32,
    /// A caller provided projection of the entry's value.
    pub value: T,
}

/// A snapshot of the state of a [`GenerationalCache`].
#[derive(Clone, Debug, PartialEq)]
pub struct CacheDebugInfo<K, T> {
    /// The options currently in effect.
    pub options: GCacheOptions,
    /// The current round.
    pub round: u32,
    /// All entries, most recently touched first.
    pub entries: Vec<CacheEntryInfo<K, T>>,
}


#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    round: u32,
    prev: Option<usize>,
    next: Option<usize>,
}


#[derive(Debug)]
struct Inner<K, V> {
    options: GCacheOptions,
    round: u32,
    /// Slab of list nodes; vacant slots are tracked in `free`.
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    /// The most recently touched entry.
    head: Option<usize>,
    /// The least recently touched entry.
    tail: Option<usize>,
}

impl<K, V> Inner<K, V>
where
    K: Clone + Eq + Hash,
{
    fn new(options: GCacheOptions) -> Self {
        Self {
            options,
            round: 0,
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    #[inline]
    fn node(&self, idx: usize) -> Option<&Node<K, V>> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    #[inline]
    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K, V>> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.node_mut(idx) {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };

        match prev.and_then(|prev| self.node_mut(prev)) {
            Some(prev) => prev.next = next,
            None => self.head = next,
        }
        match next.and_then(|next| self.node_mut(next)) {
            Some(next) => next.prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = head;
        }
        match head.and_then(|head| self.node_mut(head)) {
            Some(head) => head.prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn touch(&mut self, idx: usize) {
        let round = self.round;
        if let Some(node) = self.node_mut(idx) {
            node.round = round;
        }
        if self.head != Some(idx) {
            let () = self.unlink(idx);
            let () = self.push_front(idx);
        }
    }

    /// Insert a new node or replace the value of an existing one,
    /// returning the replaced value, if any.
    fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&idx) = self.index.get(&key) {
            let old = self
                .node_mut(idx)
                .map(|node| replace(&mut node.value, value));
            let () = self.touch(idx);
            return old
        }

        let node = Node {
            key: key.clone(),
            value,
            round: self.round,
            prev: None,
            next: None,
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        };
        let _prev = self.index.insert(key, idx);
        let () = self.push_front(idx);
        None
    }

    fn remove(&mut self, idx: usize) -> Option<(K, V)> {
        let () = self.unlink(idx);
        let node = self.nodes.get_mut(idx).and_then(Option::take)?;
        let _idx = self.index.remove(&node.key);
        let () = self.free.push(idx);
        Some((node.key, node.value))
    }

    fn is_expired(&self, node: &Node<K, V>) -> bool {
        self.round.wrapping_sub(node.round) > self.options.keep_rounds
    }

    /// Remove expired and excess entries, returning them.
    fn expire(&mut self) -> Vec<(K, V)> {
        let mut evicted = Vec::new();

        while let Some(tail) = self.tail {
            let expired = match self.node(tail) {
                Some(node) => self.is_expired(node),
                None => break,
            };
            if !expired {
                break
            }
            evicted.extend(self.remove(tail));
        }

        while self.index.len() > self.options.size {
            match self.tail.and_then(|tail| self.remove(tail)) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }

        if self.index.is_empty() {
            // Give back memory once a cache ran dry.
            self.nodes = Vec::new();
            self.free = Vec::new();
        }
        evicted
    }
}


type EvictHook<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;


/// A bounded key-value cache evicting entries based on their age in
/// rounds as well as their recency.
///
/// The cache is driven by a logical clock: [`advance_round`][Self::advance_round]
/// is invoked once per collection cycle and [`evict_expired`][Self::evict_expired]
/// afterwards removes every entry not touched within the last
/// `keep_rounds` rounds, as well as the least recently touched entries
/// exceeding `size`.
///
/// All operations are serialized through an internal reader-writer
/// lock, so that options can be reconfigured concurrently with regular
/// operation. Eviction hooks are invoked after the lock has been
/// released.
pub struct GenerationalCache<K, V> {
    inner: RwLock<Inner<K, V>>,
    on_evict: Option<EvictHook<K, V>>,
}

impl<K, V> GenerationalCache<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Create a new, empty cache with the provided options.
    pub fn new(options: GCacheOptions) -> Self {
        Self {
            inner: RwLock::new(Inner::new(options)),
            on_evict: None,
        }
    }

    /// Create a new, empty cache invoking `on_evict` for every entry
    /// removed from it, right before the entry's value is dropped.
    pub fn with_evict_hook<F>(options: GCacheOptions, on_evict: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        Self {
            inner: RwLock::new(Inner::new(options)),
            on_evict: Some(Box::new(on_evict)),
        }
    }

    fn release(&self, entries: Vec<(K, V)>) {
        for (key, value) in entries {
            if let Some(on_evict) = &self.on_evict {
                let () = on_evict(&key, &value);
            }
            drop(value);
        }
    }

    /// Update the cache's options.
    ///
    /// The new bounds are applied on the next
    /// [`evict_expired`][Self::evict_expired], with the exception of a
    /// size of zero, which causes all lookups to miss immediately.
    pub fn configure(&self, options: GCacheOptions) {
        let mut inner = unpoison(self.inner.write());
        inner.options = options;
    }

    /// Retrieve the options currently in effect.
    pub fn options(&self) -> GCacheOptions {
        unpoison(self.inner.read()).options
    }

    /// Look up the value associated with `key`.
    ///
    /// A hit marks the entry as touched in the current round.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
        V: Clone,
    {
        let mut inner = unpoison(self.inner.write());
        if inner.options.size == 0 {
            return None
        }

        let idx = *inner.index.get(key)?;
        let () = inner.touch(idx);
        inner.node(idx).map(|node| node.value.clone())
    }

    /// Insert `value` under `key`, replacing (and releasing) any value
    /// already present.
    pub fn put(&self, key: K, value: V) {
        let replaced = {
            let mut inner = unpoison(self.inner.write());
            if inner.options.size == 0 {
                return
            }
            inner.insert(key.clone(), value)
        };

        if let Some(replaced) = replaced {
            let () = self.release(vec![(key, replaced)]);
        }
    }

    /// Advance the cache's logical clock by one round.
    pub fn advance_round(&self) {
        let mut inner = unpoison(self.inner.write());
        inner.round = inner.round.wrapping_add(1);
    }

    /// Remove all entries exceeding the cache's bounds, returning the
    /// number of entries removed.
    ///
    /// The cost of this operation is proportional to the number of
    /// entries removed.
    pub fn evict_expired(&self) -> usize {
        let evicted = {
            let mut inner = unpoison(self.inner.write());
            inner.expire()
        };

        let count = evicted.len();
        if count > 0 {
            trace!("evicted {count} cache entries");
        }
        let () = self.release(evicted);
        count
    }

    /// Remove all entries from the cache.
    pub fn clear(&self) {
        let evicted = {
            let mut inner = unpoison(self.inner.write());
            let mut evicted = Vec::with_capacity(inner.index.len());
            while let Some(tail) = inner.tail {
                match inner.remove(tail) {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
            evicted
        };
        let () = self.release(evicted);
    }

    /// Retrieve the current round.
    pub fn round(&self) -> u32 {
        unpoison(self.inner.read()).round
    }

    /// Retrieve the number of entries currently cached.
    pub fn len(&self) -> usize {
        unpoison(self.inner.read()).index.len()
    }

    /// Check whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capture a snapshot of the cache's state, projecting each value
    /// through `project`.
    ///
    /// Taking a snapshot does not touch any entries.
    pub fn debug_info<T, F>(&self, mut project: F) -> CacheDebugInfo<K, T>
    where
        F: FnMut(&K, &V) -> T,
    {
        let inner = unpoison(self.inner.read());
        let mut entries = Vec::with_capacity(inner.index.len());
        let mut next = inner.head;

        while let Some(node) = next.and_then(|idx| inner.node(idx)) {
            let entry = CacheEntryInfo {
                key: node.key.clone(),
                round: node.round,
                value: project(&node.key, &node.value),
            };
            let () = entries.push(entry);
            next = node.next;
        }

        CacheDebugInfo {
            options: inner.options,
            round: inner.round,
            entries,
        }
    }
}

impl<K, V> Debug for GenerationalCache<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let inner = unpoison(self.inner.read());
        f.debug_struct("GenerationalCache")
            .field("options", &inner.options)
            .field("round", &inner.round)
            .field("len", &inner.index.len())
            .finish()
    }
}

impl<K, V> Drop for GenerationalCache<K, V> {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let nodes = take(&mut inner.nodes);

        if let Some(on_evict) = &self.on_evict {
            for node in nodes.into_iter().flatten() {
                let () = on_evict(&node.key, &node.value);
            }
        }
    }
}
