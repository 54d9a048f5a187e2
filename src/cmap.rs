//! Lock-free chained-bucket hash map: many concurrent readers, a single
//! concurrent writer.
//!
//! Grounded on `cmap.c`'s design: each bucket is a singly linked list of
//! nodes sharing a hash; the writer prepends/unlinks nodes with plain
//! stores (there is only ever one writer, so no CAS is needed on the list
//! links themselves), and publishes structural changes — a new bucket
//! array during resize — through a single `AtomicPtr` swap. Readers never
//! take a lock: they snapshot the current table pointer, hazard-protect
//! it, and walk the bucket chain with acquire loads. Because readers only
//! ever hazard-protect the *table* pointer, never individual nodes, a
//! resize rehashes into entirely new `Node`s rather than relinking the old
//! table's live ones — mutating a link a reader might be mid-walk of would
//! be invisible to any hazard scan. The old table (and its now-superseded
//! original nodes, still linked exactly as they were) is handed to
//! [`crate::hp`] for reclamation once no reader can still be walking it,
//! giving the same "RCU-style" resize the original describes.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::hp::{HazardPointers, HpGuard, HpRecord};

const MIN_BUCKETS: usize = 8;
/// Resize (double the bucket count) once the average chain length would
/// exceed this.
const MAX_LOAD_FACTOR: usize = 2;

struct Node<K, V> {
    hash: u64,
    key: K,
    value: V,
    next: AtomicPtr<Node<K, V>>,
}

struct Table<K, V> {
    buckets: Box<[AtomicPtr<Node<K, V>>]>,
    mask: usize,
}

impl<K, V> Table<K, V> {
    fn with_buckets(n: usize) -> Box<Self> {
        let buckets = (0..n)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self { buckets, mask: n - 1 })
    }

    #[inline]
    fn bucket(&self, hash: u64) -> &AtomicPtr<Node<K, V>> {
        &self.buckets[(hash as usize) & self.mask]
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // A `Table` owns every node still reachable from its buckets: a
        // resize rehashes into an entirely fresh set of nodes (see
        // `Cmap::resize`) rather than relinking the old ones, so the old
        // table's chains are never shared with a newer table. Freeing them
        // here, exactly when the table itself becomes safe to free (no
        // hazard-protected reader can still reach it), is what makes it
        // safe to retire the nodes together with the table instead of
        // retiring each node pointer on its own — a reader only ever
        // hazard-protects the table pointer, never individual nodes, so a
        // node's address would never show up in a hazard scan even while a
        // reader is still walking it.
        for slot in self.buckets.iter_mut() {
            let mut current = *slot.get_mut();
            while !current.is_null() {
                // SAFETY: sole owner of this table at drop time; each node
                // is reachable from exactly one bucket chain.
                let mut node = unsafe { Box::from_raw(current) };
                current = *node.next.get_mut();
            }
        }
    }
}

/// A lock-free, single-writer / multi-reader chained hash map.
///
/// `K` must be `Eq + Clone`; keys are hashed by the caller-supplied `u64`
/// passed to [`insert`](Cmap::insert)/[`remove`](Cmap::remove)/[`find`](CmapReader::find)
/// rather than a `Hash` bound, matching `cmap_node`'s explicit `hash` field
/// — callers own their hashing strategy.
pub struct Cmap<K, V> {
    table: AtomicPtr<Table<K, V>>,
    size: AtomicUsize,
    hp: HazardPointers,
    // The single writer's own persistent hazard-pointer record, used only
    // for retiring unlinked nodes/tables. A fresh `hp.register()` guard
    // per retire would mark itself inactive (and thus unscannable) the
    // instant it dropped, orphaning anything that wasn't immediately safe
    // to free; registering once up front and reusing it for the life of
    // the map keeps every retired pointer reachable by a later scan.
    writer_record: *mut HpRecord,
}

// SAFETY: the single writer serializes all mutation; readers only ever
// perform atomic loads and hazard-protected traversal.
unsafe impl<K: Send, V: Send> Send for Cmap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Cmap<K, V> {}

impl<K: Eq, V> Cmap<K, V> {
    /// Create an empty map with the default starting bucket count.
    pub fn new() -> Self {
        let hp = HazardPointers::new();
        let writer_record = hp.register_record();
        Self {
            table: AtomicPtr::new(Box::into_raw(Table::with_buckets(MIN_BUCKETS))),
            size: AtomicUsize::new(0),
            hp,
            writer_record,
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the calling thread as a reader.
    pub fn register(&self) -> CmapReader<'_, K, V> {
        CmapReader {
            map: self,
            hp_guard: self.hp.register(),
        }
    }

    /// Insert `(key, value)` under `hash`, replacing any existing entry
    /// whose key compares equal. Must only be called by the single writer.
    pub fn insert(&self, hash: u64, key: K, value: V)
    where
        K: Clone,
        V: Clone,
    {
        self.remove(hash, &key);

        let table = self.table.load(Ordering::Acquire);
        // SAFETY: the writer is the only thread that ever frees a table,
        // and only after an RCU-style grace period; `table` is current.
        let bucket = unsafe { (*table).bucket(hash) };
        let node = Box::into_raw(Box::new(Node {
            hash,
            key,
            value,
            next: AtomicPtr::new(bucket.load(Ordering::Relaxed)),
        }));
        bucket.store(node, Ordering::Release);
        let size = self.size.fetch_add(1, Ordering::AcqRel) + 1;

        // SAFETY: same as above.
        let bucket_count = unsafe { (*table).mask + 1 };
        if size / bucket_count > MAX_LOAD_FACTOR {
            self.resize(bucket_count * 2);
        }
    }

    /// Remove the entry for `key` under `hash`, if present. Must only be
    /// called by the single writer.
    pub fn remove(&self, hash: u64, key: &K) {
        let table = self.table.load(Ordering::Acquire);
        // SAFETY: see `insert`.
        let bucket = unsafe { (*table).bucket(hash) };

        let mut prev: *const AtomicPtr<Node<K, V>> = bucket;
        let mut current = bucket.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: `current` was just loaded from a link owned by the
            // single writer; it is valid until retired, and retirement
            // only happens after this same writer unlinks it.
            let node = unsafe { &*current };
            if node.hash == hash && &node.key == key {
                let next = node.next.load(Ordering::Relaxed);
                // SAFETY: `prev` is either `bucket` or a still-linked
                // node's `next` field, both valid for the writer's
                // lifetime.
                unsafe { (*prev).store(next, Ordering::Release) };
                self.size.fetch_sub(1, Ordering::AcqRel);
                // SAFETY: `current` is now unreachable from any future
                // traversal; readers already walking it hold a hazard
                // pointer on the table, not individual nodes, so they may
                // still observe `current` mid-walk — defer its actual
                // free to the hazard scan.
                unsafe { self.hp.retire_on(self.writer_record, current) };
                return;
            }
            prev = &node.next;
            current = node.next.load(Ordering::Acquire);
        }
    }

    fn resize(&self, new_bucket_count: usize)
    where
        K: Clone,
        V: Clone,
    {
        let old_table = self.table.load(Ordering::Acquire);
        let new_table = Table::with_buckets(new_bucket_count);

        // SAFETY: `old_table` is the writer's own current table; this loop
        // only *reads* its chains to build fresh nodes below, it never
        // mutates them. A reader only ever hazard-protects the table
        // pointer, not individual nodes, so it may still be mid-walk of
        // `old_table`'s original chains at any point during this resize —
        // mutating a node's `next` field here (as a naive in-place rehash
        // would) would let such a reader follow a rewritten link and skip a
        // key it should still observe. Building an entirely new `Node` for
        // every entry, linked only into `new_table`, leaves every byte of
        // `old_table` untouched for as long as any reader needs it.
        let old = unsafe { &*old_table };
        for slot in old.buckets.iter() {
            let mut current = slot.load(Ordering::Relaxed);
            while !current.is_null() {
                // SAFETY: nodes reachable from the old table are valid for
                // the writer to read until the table itself is retired; no
                // other writer runs concurrently.
                let node = unsafe { &*current };
                let fresh = Box::into_raw(Box::new(Node {
                    hash: node.hash,
                    key: node.key.clone(),
                    value: node.value.clone(),
                    next: AtomicPtr::new(ptr::null_mut()),
                }));
                let new_bucket = new_table.bucket(node.hash);
                // SAFETY: `fresh` was just allocated above and is not yet
                // reachable from anywhere else.
                unsafe {
                    (*fresh)
                        .next
                        .store(new_bucket.load(Ordering::Relaxed), Ordering::Relaxed);
                }
                new_bucket.store(fresh, Ordering::Relaxed);
                current = node.next.load(Ordering::Relaxed);
            }
        }

        let new_raw = Box::into_raw(new_table);
        self.table.store(new_raw, Ordering::Release);
        // SAFETY: `old_table` (and the original nodes still linked from it,
        // left untouched above) is no longer reachable from `self.table`;
        // a reader that hazard-protected it before this swap may still be
        // mid-traversal, so both the table and its nodes are freed
        // together, once a hazard scan proves the table pointer is no
        // longer protected — see `Table`'s own `Drop`.
        unsafe { self.hp.retire_on(self.writer_record, old_table) };
    }
}

impl<K: Eq, V> Default for Cmap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq, V> Drop for Cmap<K, V> {
    fn drop(&mut self) {
        let table = *self.table.get_mut();
        // SAFETY: `&mut self`, no concurrent readers or writer remain;
        // `Table`'s own `Drop` frees every node still reachable from it.
        unsafe {
            drop(Box::from_raw(table));
        }
    }
}

/// A reader's hazard-pointer-protected handle onto a [`Cmap`].
pub struct CmapReader<'a, K, V> {
    map: &'a Cmap<K, V>,
    hp_guard: HpGuard<'a>,
}

impl<'a, K: Eq, V: Clone> CmapReader<'a, K, V> {
    /// Look up `key` under `hash`, returning a clone of its value if
    /// present.
    pub fn find(&self, hash: u64, key: &K) -> Option<V> {
        loop {
            let table = self.map.table.load(Ordering::Acquire);
            self.hp_guard.protect(0, table);
            if self.map.table.load(Ordering::Acquire) != table {
                continue;
            }

            // SAFETY: `table` is hazard-protected and re-confirmed current;
            // it cannot be freed while protected.
            let bucket = unsafe { (*table).bucket(hash) };
            let mut current = bucket.load(Ordering::Acquire);
            while !current.is_null() {
                // SAFETY: nodes are only unlinked, never freed, until a
                // grace period after no reader can observe them; this
                // traversal is within such a window.
                let node = unsafe { &*current };
                if node.hash == hash && &node.key == key {
                    let value = node.value.clone();
                    self.hp_guard.clear(0);
                    return Some(value);
                }
                current = node.next.load(Ordering::Acquire);
            }
            self.hp_guard.clear(0);
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::string::ToString;

    fn hash_of(s: &str) -> u64 {
        // Deterministic toy hash, sufficient for deterministic tests.
        s.bytes().fold(5381u64, |h, b| h.wrapping_mul(33) ^ b as u64)
    }

    #[test]
    fn insert_then_find_returns_the_value() {
        let map: Cmap<String, i32> = Cmap::new();
        map.insert(hash_of("a"), "a".to_string(), 1);
        let reader = map.register();
        assert_eq!(reader.find(hash_of("a"), &"a".to_string()), Some(1));
        assert_eq!(reader.find(hash_of("b"), &"b".to_string()), None);
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let map: Cmap<String, i32> = Cmap::new();
        map.insert(hash_of("a"), "a".to_string(), 1);
        map.insert(hash_of("a"), "a".to_string(), 2);
        assert_eq!(map.len(), 1);
        let reader = map.register();
        assert_eq!(reader.find(hash_of("a"), &"a".to_string()), Some(2));
    }

    #[test]
    fn remove_deletes_the_entry() {
        let map: Cmap<String, i32> = Cmap::new();
        map.insert(hash_of("a"), "a".to_string(), 1);
        map.remove(hash_of("a"), &"a".to_string());
        assert_eq!(map.len(), 0);
        let reader = map.register();
        assert_eq!(reader.find(hash_of("a"), &"a".to_string()), None);
    }

    #[test]
    fn resize_preserves_all_entries() {
        let map: Cmap<String, i32> = Cmap::new();
        for i in 0..64 {
            let key = i.to_string();
            map.insert(hash_of(&key), key, i);
        }
        assert_eq!(map.len(), 64);
        let reader = map.register();
        for i in 0..64 {
            let key = i.to_string();
            assert_eq!(reader.find(hash_of(&key), &key), Some(i));
        }
    }
}
