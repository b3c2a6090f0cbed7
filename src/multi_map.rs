//! `DenseMultiMap`: one bucket per distinct key, an ordered chain of entries
//! per bucket.
//!
//! The control plane is the same one the single-valued map uses; what a dense
//! index points at differs. Each index owns a chain of nodes in a shared
//! generational slot store plus a slot in the key-shadow vector, which keeps
//! key comparison during probing a straight array access, with no chase into
//! the node store while resolving collisions.

use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::slice;

use equivalent::Equivalent;
use slotmap::{DefaultKey, Key, SlotMap};

use crate::raw::{trivial_eq, Hit, IndexWidth, RawTable, NO_BUCKET};

/// Chain endpoints for one bucket. Nodes link forward and backward through
/// the shared store; `len >= 1` for as long as the bucket is occupied.
#[derive(Clone, Copy)]
struct Chain {
    head: DefaultKey,
    tail: DefaultKey,
    len: usize,
}

#[derive(Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: DefaultKey,
    next: DefaultKey,
}

/// Hash multi-map: every insertion is kept, duplicates of a key form an
/// ordered chain in arrival order.
///
/// Layout follows the single-valued [`DenseMap`](crate::DenseMap) (ctrl
/// bytes, redirection slots, dense per-key storage) with two additions: the
/// dense array holds chains of nodes in a generational slot store, and a
/// parallel key-shadow vector caches each bucket's key for probing. Chain
/// nodes never move, so a [`MultiCursor`] pins one element across splices of
/// its neighbors, and its generational key makes a dead element detectable
/// instead of silently aliased.
pub struct DenseMultiMap<K, V, S = ahash::RandomState, W = u32> {
    table: RawTable<W>,
    chains: Vec<Chain>,
    /// Key shadow, parallel to `chains`: the key shared by every node of the
    /// chain at the same index.
    keys: Vec<K>,
    nodes: SlotMap<DefaultKey, Node<K, V>>,
    hasher: S,
}

/// Detached position into a [`DenseMultiMap`]: a dense (per-key) index plus
/// the generational key of one chain node.
///
/// Dereference (`entry_at`) answers through the node key alone and therefore
/// survives rehashes and splices of other nodes; once the node itself is
/// removed the cursor goes inert. The bucket snapshot is only consulted for
/// whole-bucket removal and is re-derived when stale, exactly as for the
/// single-valued cursor.
#[derive(Clone, Copy, Debug)]
pub struct MultiCursor {
    pub(crate) index: usize,
    pub(crate) node: DefaultKey,
    pub(crate) bucket: usize,
    pub(crate) epoch: u64,
}

/// Cursor equality is element identity: same dense slot, same chain node.
impl PartialEq for MultiCursor {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.node == other.node
    }
}

impl Eq for MultiCursor {}

impl<K, V> DenseMultiMap<K, V>
where
    K: Hash + Eq,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }

    pub fn with_buckets(buckets: usize) -> Self {
        Self::with_buckets_and_hasher(buckets, Default::default())
    }
}

impl<K, V, S, W> DenseMultiMap<K, V, S, W> {
    /// Total number of stored entries, duplicates included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct keys (occupied buckets). Load is measured against
    /// this, not against `len`.
    pub fn key_count(&self) -> usize {
        self.chains.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    /// Entry at a cursor, or `None` once that node has been removed.
    pub fn entry_at(&self, cursor: MultiCursor) -> Option<(&K, &V)> {
        self.nodes.get(cursor.node).map(|n| (&n.key, &n.value))
    }

    pub fn value_at_mut(&mut self, cursor: MultiCursor) -> Option<&mut V> {
        self.nodes.get_mut(cursor.node).map(|n| &mut n.value)
    }

    /// All entries: buckets in dense order, each chain in insertion order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            chains: self.chains.iter(),
            nodes: &self.nodes,
            cur: DefaultKey::null(),
            remaining: self.nodes.len(),
        }
    }

    /// Mutable access to every value, in the node store's own (unspecified)
    /// order. For position-directed mutation use
    /// [`value_at_mut`](Self::value_at_mut).
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.nodes.values_mut().map(|node| &mut node.value)
    }
}

impl<K, V, S, W> DenseMultiMap<K, V, S, W>
where
    K: Hash + Eq,
    S: BuildHasher,
    W: IndexWidth,
{
    const VERIFY_STORED: bool = !trivial_eq::<K>();

    pub fn with_hasher(hasher: S) -> Self {
        Self {
            table: RawTable::new(),
            chains: Vec::new(),
            keys: Vec::new(),
            nodes: SlotMap::new(),
            hasher,
        }
    }

    pub fn with_buckets_and_hasher(buckets: usize, hasher: S) -> Self {
        Self {
            table: RawTable::with_buckets(buckets),
            chains: Vec::new(),
            keys: Vec::new(),
            nodes: SlotMap::new(),
            hasher,
        }
    }

    fn lookup<Q>(&self, key: &Q) -> Option<Hit>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        if self.chains.is_empty() {
            return None;
        }
        let hash = self.hasher.hash_one(key);
        let keys = &self.keys;
        self.table
            .probe(hash, Self::VERIFY_STORED, |index| key.equivalent(&keys[index]))
            .ok()
    }

    /// Cursor to the first entry of `key`'s chain, or `None` when absent.
    pub fn find<Q>(&self, key: &Q) -> Option<MultiCursor>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        let hit = self.lookup(key)?;
        Some(MultiCursor {
            index: hit.index,
            node: self.chains[hit.index].head,
            bucket: hit.bucket,
            epoch: self.table.epoch(),
        })
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        self.lookup(key).is_some()
    }

    /// First value stored under `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        let hit = self.lookup(key)?;
        let head = self.chains[hit.index].head;
        Some(&self.nodes[head].value)
    }

    /// All entries of `key`'s chain in insertion order; empty when absent.
    pub fn get_all<Q>(&self, key: &Q) -> GetAll<'_, K, V>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        match self.lookup(key) {
            Some(hit) => {
                let chain = &self.chains[hit.index];
                GetAll {
                    nodes: &self.nodes,
                    cur: chain.head,
                    remaining: chain.len,
                }
            }
            None => GetAll {
                nodes: &self.nodes,
                cur: DefaultKey::null(),
                remaining: 0,
            },
        }
    }

    /// Chain length for `key`, zero when absent.
    pub fn count_of<Q>(&self, key: &Q) -> usize
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        match self.lookup(key) {
            Some(hit) => self.chains[hit.index].len,
            None => 0,
        }
    }

    /// Inserts `key -> value`, always. A repeated key appends to the tail of
    /// its chain (no bucket changes, no rehash); a fresh key claims a bucket
    /// and a key-shadow slot, which is where the one `K::clone` happens.
    ///
    /// # Panics
    ///
    /// With `W = u32`, panics once the map holds `u32::MAX - 1` distinct
    /// keys. The check precedes any mutation.
    pub fn insert(&mut self, key: K, value: V) -> MultiCursor
    where
        K: Clone,
    {
        self.table.allocate_floor();
        assert!(
            self.chains.len() < W::MAX_ENTRIES,
            "dense-table: index width exhausted; use the u64 width for tables this large"
        );
        let hash = self.hasher.hash_one(&key);
        let keys = &self.keys;
        match self
            .table
            .probe(hash, Self::VERIFY_STORED, |index| key == keys[index])
        {
            Ok(hit) => {
                let tail = self.chains[hit.index].tail;
                let node = self.nodes.insert(Node {
                    key,
                    value,
                    prev: tail,
                    next: DefaultKey::null(),
                });
                self.nodes[tail].next = node;
                let chain = &mut self.chains[hit.index];
                chain.tail = node;
                chain.len += 1;
                MultiCursor {
                    index: hit.index,
                    node,
                    bucket: hit.bucket,
                    epoch: self.table.epoch(),
                }
            }
            Err(vacant) => {
                let index = self.chains.len();
                self.keys.push(key.clone());
                let node = self.nodes.insert(Node {
                    key,
                    value,
                    prev: DefaultKey::null(),
                    next: DefaultKey::null(),
                });
                self.chains.push(Chain {
                    head: node,
                    tail: node,
                    len: 1,
                });
                self.table.occupy(vacant, hash, index);
                if self.table.needs_grow(self.chains.len()) {
                    self.table.grow();
                    MultiCursor {
                        index,
                        node,
                        bucket: NO_BUCKET,
                        epoch: self.table.epoch(),
                    }
                } else {
                    MultiCursor {
                        index,
                        node,
                        bucket: vacant,
                        epoch: self.table.epoch(),
                    }
                }
            }
        }
    }

    /// Removes `key`'s entire chain; returns how many entries went with it.
    pub fn remove_all<Q>(&mut self, key: &Q) -> usize
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        match self.lookup(key) {
            Some(hit) => self.remove_chain(hit),
            None => 0,
        }
    }

    /// Removes the single entry the cursor points at.
    ///
    /// With chain neighbors left, this is a pure splice: O(1), no control
    /// plane traffic, and the removed entry plus a cursor to its successor
    /// (or `None` at chain end) come back. Removing the last entry of a
    /// chain retires the whole bucket through the regular backward-shift
    /// path. A cursor whose node is already gone is a no-op.
    pub fn remove_one(&mut self, cursor: MultiCursor) -> Option<((K, V), Option<MultiCursor>)> {
        if cursor.index >= self.chains.len() || !self.nodes.contains_key(cursor.node) {
            return None;
        }
        if self.chains[cursor.index].len >= 2 {
            let node = self.nodes.remove(cursor.node).expect("checked above");
            if node.prev.is_null() {
                self.chains[cursor.index].head = node.next;
            } else {
                self.nodes[node.prev].next = node.next;
            }
            if node.next.is_null() {
                self.chains[cursor.index].tail = node.prev;
            } else {
                self.nodes[node.next].prev = node.prev;
            }
            self.chains[cursor.index].len -= 1;
            let next = (!node.next.is_null()).then_some(MultiCursor {
                index: cursor.index,
                node: node.next,
                bucket: cursor.bucket,
                epoch: cursor.epoch,
            });
            Some(((node.key, node.value), next))
        } else {
            let hit = self.resolve(cursor)?;
            self.drop_bucket(hit);
            let node = self
                .nodes
                .remove(cursor.node)
                .expect("sole chain node outlives its bucket");
            Some(((node.key, node.value), None))
        }
    }

    /// Removes the whole chain the cursor's bucket holds, like
    /// [`remove_all`](Self::remove_all) but addressed by position.
    pub fn remove_all_at(&mut self, cursor: MultiCursor) -> usize {
        if cursor.index >= self.chains.len() || !self.nodes.contains_key(cursor.node) {
            return 0;
        }
        match self.resolve(cursor) {
            Some(hit) => self.remove_chain(hit),
            None => 0,
        }
    }

    /// Turns a cursor back into a live bucket position; mirrors the
    /// single-variant rule. The snapshot must still match the redirect (an
    /// erasure elsewhere can shift this bucket without an epoch bump), or the
    /// bucket is re-derived from the key shadow.
    fn resolve(&self, cursor: MultiCursor) -> Option<Hit> {
        if cursor.index >= self.chains.len() {
            return None;
        }
        if cursor.epoch == self.table.epoch()
            && cursor.bucket != NO_BUCKET
            && self.table.redirects_to(cursor.bucket, cursor.index)
        {
            return Some(Hit {
                bucket: cursor.bucket,
                index: cursor.index,
            });
        }
        let hash = self.hasher.hash_one(&self.keys[cursor.index]);
        Some(Hit {
            bucket: self.table.locate_index(hash, cursor.index),
            index: cursor.index,
        })
    }

    /// Retires the bucket at `hit` from the control plane and the dense
    /// arrays. Chain nodes are left to the caller.
    fn drop_bucket(&mut self, hit: Hit) -> Chain {
        let last = self.chains.len() - 1;
        let last_hash = self.hasher.hash_one(&self.keys[last]);
        let last_bucket = self.table.locate_index(last_hash, last);
        let freed = self.table.release(hit.bucket, last_bucket);
        debug_assert_eq!(freed, hit.index);
        self.keys.swap_remove(freed);
        self.chains.swap_remove(freed)
    }

    fn remove_chain(&mut self, hit: Hit) -> usize {
        let chain = self.drop_bucket(hit);
        let mut cur = chain.head;
        let mut removed = 0;
        while !cur.is_null() {
            let node = self.nodes.remove(cur).expect("chain nodes are live");
            cur = node.next;
            removed += 1;
        }
        debug_assert_eq!(removed, chain.len);
        removed
    }

    pub fn clear(&mut self) {
        self.table.clear();
        self.chains = Vec::new();
        self.keys = Vec::new();
        self.nodes = SlotMap::new();
    }

    pub fn fast_clear(&mut self) {
        self.table.fast_clear();
        self.chains.clear();
        self.keys.clear();
        self.nodes.clear();
    }

    pub fn force_rehash(&mut self) {
        self.table.rebalance(self.chains.len());
    }

    /// Advisory: releases spare capacity of the dense arrays.
    pub fn shrink_to_fit(&mut self) {
        self.chains.shrink_to_fit();
        self.keys.shrink_to_fit();
    }

    #[cfg(test)]
    pub(crate) fn audit(&self) {
        self.table.audit(self.chains.len());
        assert_eq!(self.keys.len(), self.chains.len());
        let mut nodes_seen = 0;
        for (index, chain) in self.chains.iter().enumerate() {
            assert!(chain.len >= 1, "occupied bucket with empty chain");
            let mut cur = chain.head;
            let mut prev = DefaultKey::null();
            for _ in 0..chain.len {
                let node = &self.nodes[cur];
                assert!(node.key == self.keys[index], "shadow key disagreement");
                assert_eq!(node.prev, prev);
                prev = cur;
                cur = node.next;
                nodes_seen += 1;
            }
            assert!(cur.is_null(), "chain longer than its recorded length");
            assert_eq!(chain.tail, prev);
        }
        assert_eq!(nodes_seen, self.nodes.len(), "orphaned nodes");
    }

    #[cfg(test)]
    pub(crate) fn epoch(&self) -> u64 {
        self.table.epoch()
    }
}

impl<K, V, S, W> Default for DenseMultiMap<K, V, S, W>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
    W: IndexWidth,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S, W> Clone for DenseMultiMap<K, V, S, W>
where
    K: Clone,
    V: Clone,
    S: Clone,
    W: IndexWidth,
{
    fn clone(&self) -> Self {
        // SlotMap's clone preserves keys and versions, so chain links and
        // outstanding cursors' node identities stay meaningful on the copy.
        Self {
            table: self.table.clone(),
            chains: self.chains.clone(),
            keys: self.keys.clone(),
            nodes: self.nodes.clone(),
            hasher: self.hasher.clone(),
        }
    }
}

impl<K, V, S, W> fmt::Debug for DenseMultiMap<K, V, S, W>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S, W> Extend<(K, V)> for DenseMultiMap<K, V, S, W>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
    W: IndexWidth,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<K, V, S, W> FromIterator<(K, V)> for DenseMultiMap<K, V, S, W>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Default,
    W: IndexWidth,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::with_hasher(S::default());
        map.extend(iter);
        map
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for DenseMultiMap<K, V>
where
    K: Hash + Eq + Clone,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// Iterator over every entry: dense bucket order, chains in insertion order.
pub struct Iter<'a, K, V> {
    chains: slice::Iter<'a, Chain>,
    nodes: &'a SlotMap<DefaultKey, Node<K, V>>,
    cur: DefaultKey,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.cur.is_null() {
            self.cur = self.chains.next()?.head;
        }
        let node = &self.nodes[self.cur];
        self.cur = node.next;
        self.remaining -= 1;
        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}
impl<K, V> core::iter::FusedIterator for Iter<'_, K, V> {}

impl<K, V> Clone for Iter<'_, K, V> {
    fn clone(&self) -> Self {
        Self {
            chains: self.chains.clone(),
            nodes: self.nodes,
            cur: self.cur,
            remaining: self.remaining,
        }
    }
}

/// Iterator over one key's chain, in insertion order.
pub struct GetAll<'a, K, V> {
    nodes: &'a SlotMap<DefaultKey, Node<K, V>>,
    cur: DefaultKey,
    remaining: usize,
}

impl<'a, K, V> Iterator for GetAll<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        let node = &self.nodes[self.cur];
        self.cur = node.next;
        self.remaining -= 1;
        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for GetAll<'_, K, V> {}
impl<K, V> core::iter::FusedIterator for GetAll<'_, K, V> {}

impl<K, V> Clone for GetAll<'_, K, V> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes,
            cur: self.cur,
            remaining: self.remaining,
        }
    }
}

/// Consuming iterator, same order as [`Iter`].
pub struct IntoIter<K, V> {
    chains: std::vec::IntoIter<Chain>,
    nodes: SlotMap<DefaultKey, Node<K, V>>,
    cur: DefaultKey,
}

impl<K, V> Iterator for IntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.cur.is_null() {
            self.cur = self.chains.next()?.head;
        }
        let node = self.nodes.remove(self.cur).expect("chain nodes are live");
        self.cur = node.next;
        Some((node.key, node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.nodes.len(), Some(self.nodes.len()))
    }
}

impl<K, V> ExactSizeIterator for IntoIter<K, V> {}
impl<K, V> core::iter::FusedIterator for IntoIter<K, V> {}

impl<'a, K, V, S, W> IntoIterator for &'a DenseMultiMap<K, V, S, W> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, S, W> IntoIterator for DenseMultiMap<K, V, S, W> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            chains: self.chains.into_iter(),
            nodes: self.nodes,
            cur: DefaultKey::null(),
        }
    }
}
