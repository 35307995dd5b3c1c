//! Open-addressed index mapping fixed-size keys to dense slots.
//!
//! [`DenseMap`] keeps three flat arrays:
//!
//! | Array     | Contents                                                    |
//! |-----------|-------------------------------------------------------------|
//! | `buckets` | `slot + 1` of the newest node hashing to the bucket, `0` = empty |
//! | `nodes`   | `{key, hashcode, previous}`; `previous` chains to the next older node of the bucket, `-1` ends the chain |
//! | `values`  | the payload, parallel to `nodes`                             |
//!
//! Slots `0..len()` are live. Removing a key moves the last live slot into the
//! hole so iteration over [`DenseMap::values`] stays dense; the moved node's
//! bucket chain is patched in place. No allocation happens per entry.
//!
//! Integer keys hash by identity, so sequential entity ids land in distinct
//! buckets of a table sized to their count.

use std::fmt;

use crate::entity::{Egid, GroupId};

/// End-of-chain marker for [`IndexNode::previous`].
const NO_PREVIOUS: i32 = -1;

/// Capacity reached on the first growth of an empty map.
const MIN_CAPACITY: usize = 4;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// A key that can be stored in a [`DenseMap`].
pub trait IndexKey: Copy + Eq + fmt::Debug {
    /// 32-bit hash used to pick a bucket. Equal keys must agree.
    fn hash_code(&self) -> i32;
}

impl IndexKey for u32 {
    #[inline]
    fn hash_code(&self) -> i32 {
        *self as i32
    }
}

impl IndexKey for GroupId {
    #[inline]
    fn hash_code(&self) -> i32 {
        self.id() as i32
    }
}

impl IndexKey for Egid {
    #[inline]
    fn hash_code(&self) -> i32 {
        (self.entity_id ^ self.group_id.id().rotate_left(16)) as i32
    }
}

/// Map a hash onto `0..n`, skipping the division when it is already in range.
#[inline]
pub fn reduce(x: u32, n: u32) -> u32 {
    if x < n {
        x
    } else {
        x % n
    }
}

// ---------------------------------------------------------------------------
// IndexNode
// ---------------------------------------------------------------------------

/// Per-slot bookkeeping of a [`DenseMap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexNode<K> {
    pub key: K,
    hashcode: i32,
    previous: i32,
}

impl<K> IndexNode<K> {
    pub fn hashcode(&self) -> i32 {
        self.hashcode
    }

    /// Slot of the next older node in the same bucket, or `-1`.
    pub fn previous(&self) -> i32 {
        self.previous
    }
}

// ---------------------------------------------------------------------------
// DenseMap
// ---------------------------------------------------------------------------

/// Open-addressed map with dense, swap-removed value storage.
///
/// `values` may hold more entries than there are live nodes after a
/// [`fast_clear`](DenseMap::fast_clear): the tail is kept around so that
/// [`recycle_or_create`](DenseMap::recycle_or_create) can reuse it.
pub struct DenseMap<K, V> {
    buckets: Vec<u32>,
    nodes: Vec<IndexNode<K>>,
    values: Vec<V>,
    capacity: usize,
}

impl<K: IndexKey, V> DenseMap<K, V> {
    pub fn new() -> Self {
        Self {
            buckets: Vec::new(),
            nodes: Vec::new(),
            values: Vec::new(),
            capacity: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buckets: vec![0; capacity],
            nodes: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Entries the map holds before it has to grow.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slot of `key`, if present.
    pub fn try_find_index(&self, key: K) -> Option<u32> {
        if self.buckets.is_empty() {
            return None;
        }
        let hash = key.hash_code();
        let bucket = reduce(hash as u32, self.buckets.len() as u32) as usize;
        let mut slot = self.buckets[bucket] as i32 - 1;
        while slot != NO_PREVIOUS {
            let node = &self.nodes[slot as usize];
            // Distinct keys may share a hash.
            if node.hashcode == hash && node.key == key {
                return Some(slot as u32);
            }
            slot = node.previous;
        }
        None
    }

    #[inline]
    pub fn contains_key(&self, key: K) -> bool {
        self.try_find_index(key).is_some()
    }

    pub fn get(&self, key: K) -> Option<&V> {
        let slot = self.try_find_index(key)?;
        Some(&self.values[slot as usize])
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let slot = self.try_find_index(key)?;
        Some(&mut self.values[slot as usize])
    }

    /// Insert a new key. Hands the value back if the key is already present.
    pub fn add(&mut self, key: K, value: V) -> Result<u32, V> {
        if self.contains_key(key) {
            return Err(value);
        }
        Ok(self.insert_new(key, value))
    }

    /// Value for `key`, inserting `create()` first when absent.
    pub fn get_or_insert_with(&mut self, key: K, create: impl FnOnce() -> V) -> &mut V {
        let slot = match self.try_find_index(key) {
            Some(slot) => slot as usize,
            None => self.insert_new(key, create()) as usize,
        };
        &mut self.values[slot]
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with), but a value left
    /// behind by [`fast_clear`](Self::fast_clear) in the next free slot is
    /// passed to `recycle` and reused instead of calling `create`.
    pub fn recycle_or_create(
        &mut self,
        key: K,
        create: impl FnOnce() -> V,
        recycle: impl FnOnce(&mut V),
    ) -> &mut V {
        let slot = match self.try_find_index(key) {
            Some(slot) => slot as usize,
            None if self.nodes.len() < self.values.len() => {
                let slot = self.push_node(key);
                recycle(&mut self.values[slot]);
                slot
            }
            None => self.insert_new(key, create()) as usize,
        };
        &mut self.values[slot]
    }

    /// Remove `key`, returning its value. The last live entry takes its slot.
    pub fn remove(&mut self, key: K) -> Option<V> {
        if self.buckets.is_empty() {
            return None;
        }
        let hash = key.hash_code();
        let bucket = reduce(hash as u32, self.buckets.len() as u32) as usize;
        let mut slot = self.buckets[bucket] as i32 - 1;
        let mut newer = NO_PREVIOUS;
        while slot != NO_PREVIOUS {
            let node = self.nodes[slot as usize];
            if node.hashcode == hash && node.key == key {
                if newer == NO_PREVIOUS {
                    self.buckets[bucket] = (node.previous + 1) as u32;
                } else {
                    self.nodes[newer as usize].previous = node.previous;
                }
                return self.swap_remove_slot(slot as usize);
            }
            newer = slot;
            slot = node.previous;
        }
        None
    }

    /// Make sure `additional` more entries fit without another rehash.
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.nodes.len() + additional;
        if needed > self.capacity {
            self.resize(needed.max(self.capacity * 2));
        }
    }

    /// Forget every entry but keep the values for recycling.
    ///
    /// O(1) when the map is already empty: `remove` unlinks every node from its
    /// bucket, so no bucket can be set while `nodes` is empty.
    pub fn fast_clear(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        self.nodes.clear();
        self.buckets.fill(0);
    }

    /// Drop every entry. Allocations are kept.
    pub fn clear(&mut self) {
        self.fast_clear();
        self.values.clear();
    }

    /// Remove and yield every entry in slot order.
    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        let live = self.nodes.len();
        if live > 0 {
            self.buckets.fill(0);
        }
        self.values.truncate(live);
        self.nodes
            .drain(..)
            .map(|node| node.key)
            .zip(self.values.drain(..))
    }

    /// Live values in slot order.
    #[inline]
    pub fn values(&self) -> &[V] {
        &self.values[..self.nodes.len()]
    }

    #[inline]
    pub fn values_mut(&mut self) -> &mut [V] {
        let live = self.nodes.len();
        &mut self.values[..live]
    }

    /// Live nodes in slot order.
    #[inline]
    pub fn nodes(&self) -> &[IndexNode<K>] {
        &self.nodes
    }

    /// Nodes and values borrowed together, values mutably.
    #[inline]
    pub fn split_mut(&mut self) -> (&[IndexNode<K>], &mut [V]) {
        let live = self.nodes.len();
        (&self.nodes, &mut self.values[..live])
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.nodes.iter().map(|node| node.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.keys().zip(self.values())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> + '_ {
        let live = self.nodes.len();
        self.nodes
            .iter()
            .map(|node| node.key)
            .zip(self.values[..live].iter_mut())
    }

    /// Mutable access to several distinct keys at once.
    ///
    /// Returns `None` when a key is missing or listed twice.
    pub fn get_many_mut<const N: usize>(&mut self, keys: [K; N]) -> Option<[&mut V; N]> {
        let mut slots = [0usize; N];
        for (i, key) in keys.iter().enumerate() {
            let slot = self.try_find_index(*key)? as usize;
            if slots[..i].contains(&slot) {
                return None;
            }
            slots[i] = slot;
        }
        let live = self.nodes.len();
        let mut found: [Option<&mut V>; N] = std::array::from_fn(|_| None);
        for (slot, value) in self.values[..live].iter_mut().enumerate() {
            if let Some(i) = slots.iter().position(|&s| s == slot) {
                found[i] = Some(value);
            }
        }
        Some(found.map(|value| value.expect("every requested slot is live")))
    }

    /// Feed the index layout (not the values) into `hasher`.
    pub fn hash_layout(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&(self.nodes.len() as u64).to_le_bytes());
        hasher.update(bytemuck::cast_slice(&self.buckets));
        for node in &self.nodes {
            hasher.update(&node.hashcode.to_le_bytes());
            hasher.update(&node.previous.to_le_bytes());
        }
    }

    fn insert_new(&mut self, key: K, value: V) -> u32 {
        let slot = self.push_node(key);
        if slot < self.values.len() {
            self.values[slot] = value;
        } else {
            self.values.push(value);
        }
        slot as u32
    }

    /// Link a node for `key` at the next free slot. The value is left alone.
    fn push_node(&mut self, key: K) -> usize {
        if self.nodes.len() == self.capacity {
            self.resize((self.capacity * 2).max(MIN_CAPACITY));
        }
        let hash = key.hash_code();
        let bucket = reduce(hash as u32, self.buckets.len() as u32) as usize;
        let slot = self.nodes.len();
        self.nodes.push(IndexNode {
            key,
            hashcode: hash,
            previous: self.buckets[bucket] as i32 - 1,
        });
        self.buckets[bucket] = slot as u32 + 1;
        slot
    }

    fn resize(&mut self, capacity: usize) {
        self.nodes.reserve_exact(capacity - self.nodes.len());
        self.values
            .reserve(capacity.saturating_sub(self.values.len()));
        self.capacity = capacity;

        self.buckets.clear();
        self.buckets.resize(capacity, 0);
        let bucket_count = capacity as u32;
        for (slot, node) in self.nodes.iter_mut().enumerate() {
            let bucket = reduce(node.hashcode as u32, bucket_count) as usize;
            node.previous = self.buckets[bucket] as i32 - 1;
            self.buckets[bucket] = slot as u32 + 1;
        }
    }

    /// Move the last live slot into `slot` (already unlinked) and return the
    /// value that was there.
    fn swap_remove_slot(&mut self, slot: usize) -> Option<V> {
        let last = self.nodes.len() - 1;
        if slot != last {
            let moved = self.nodes[last];
            let bucket = reduce(moved.hashcode as u32, self.buckets.len() as u32) as usize;
            if self.buckets[bucket] as usize == last + 1 {
                self.buckets[bucket] = slot as u32 + 1;
            } else {
                let mut walk = self.buckets[bucket] as i32 - 1;
                while walk != NO_PREVIOUS {
                    let node = &mut self.nodes[walk as usize];
                    if node.previous == last as i32 {
                        node.previous = slot as i32;
                        break;
                    }
                    walk = node.previous;
                }
            }
        }
        self.nodes.swap_remove(slot);

        // The removed value goes to the end of `values`, past any recycled tail.
        self.values.swap(slot, last);
        let end = self.values.len() - 1;
        self.values.swap(last, end);
        self.values.pop()
    }
}

impl<K: IndexKey, V> Default for DenseMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: IndexKey, V: fmt::Debug> fmt::Debug for DenseMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
