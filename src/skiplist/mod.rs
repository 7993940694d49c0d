//! # Skip List Module
//!
//! A lock-free ordered map from byte keys to byte values, ordered by a
//! 64-bit hash of the key.
//!
//! ## Structure
//!
//! ```text
//! head(L3) ──────────────────────────────► x ──► NIL
//!    │                                     │
//! head(L2) ──────────► x ────────────────► x ──► NIL
//!    │                 │                   │
//! head(L1) ──► x ────► x ──────► x ──────► x ──► NIL
//!    │         │       │         │         │
//! sentinel ──► n ──► n ──► n ──► n ──► n ──► n ──► NIL      (base list)
//! ```
//!
//! Nodes and index entries live in two [`Arena`]s and refer to each other
//! by `u32` handle. Every structural change is a compare-and-swap on an
//! `AtomicU32` link.
//!
//! ## Ordering
//!
//! The base list is strictly increasing by `(hash, key)`. Keys that share
//! a hash are ordered by their bytes, so distinct keys never alias.
//!
//! ## Writes
//!
//! - The first writer of a key wins; a later `set` of a live key is a no-op.
//! - A removed key is a tombstone: its node stays linked until a traversal
//!   notices it and swings the predecessor's link past it.
//! - Before a tombstone is unlinked, the top bit of its `next` link is set.
//!   An insert expects an unmarked link, so nothing can be linked behind a
//!   node that is about to disappear.
//!
//! ## Index
//!
//! After a base insert the node is promoted with probability 1/4, then one
//! level further for every consecutive head of a fair coin, capped at
//! [`MAX_HEIGHT`] and at one above the current height. The index is only a
//! search accelerator: losing an index entry to a racing unlink costs
//! speed, never correctness.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering as KeyOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::arena::{Arena, ArenaError, MAX_HANDLES, Pool};
use thiserror::Error;
use tracing::{debug, trace};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Maximum number of index levels above the base list.
pub const MAX_HEIGHT: usize = 24;

/// End-of-chain handle.
const NIL: u32 = MAX_HANDLES;

/// Set on a node's `next` link once the node is logically deleted.
const MARK: u32 = 1 << 31;

/// Initial base-node slots for a standalone list.
const DEFAULT_NODE_SLOTS: usize = 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`SkipList`] operations.
#[derive(Debug, Error)]
pub enum SkipListError {
    /// Node or index storage could not be allocated.
    #[error("arena error: {0}")]
    Arena(#[from] ArenaError),
}

// ------------------------------------------------------------------------------------------------
// Hashing
// ------------------------------------------------------------------------------------------------

/// Hashes a key into the ordering space of the list.
///
/// `h = byte + (h << 6) + (h << 16) - h` with wrapping arithmetic. Zero is
/// reserved for the head sentinel and is remapped to one.
pub fn hash_key(key: &[u8]) -> u64 {
    let h = key.iter().fold(0u64, |h, &b| {
        u64::from(b)
            .wrapping_add(h << 6)
            .wrapping_add(h << 16)
            .wrapping_sub(h)
    });
    h.max(1)
}

fn is_marked(link: u32) -> bool {
    link & MARK != 0
}

fn unmarked(link: u32) -> u32 {
    link & !MARK
}

/// Number of index levels for a freshly inserted node.
fn random_level() -> usize {
    let bits: u32 = rand::random();
    if bits & 0x3 != 0 {
        return 0;
    }
    let heads = (bits >> 2).trailing_ones() as usize;
    (1 + heads).min(MAX_HEIGHT)
}

// ------------------------------------------------------------------------------------------------
// Nodes
// ------------------------------------------------------------------------------------------------

/// A base-level entry.
pub struct Node {
    hash: u64,
    key: Box<[u8]>,
    value: Box<[u8]>,
    deleted: AtomicBool,
    next: AtomicU32,
}

impl Node {
    fn new(hash: u64, key: &[u8], value: &[u8]) -> Self {
        Self {
            hash,
            key: key.into(),
            value: value.into(),
            deleted: AtomicBool::new(false),
            next: AtomicU32::new(NIL),
        }
    }

    fn sentinel() -> Self {
        Self::new(0, &[], &[])
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Freezes the `next` link so nothing can be inserted behind this node.
    fn mark(&self) {
        self.next.fetch_or(MARK, Ordering::AcqRel);
    }

    fn cmp_key(&self, hash: u64, key: &[u8]) -> KeyOrdering {
        (self.hash, &*self.key).cmp(&(hash, key))
    }

    fn precedes(&self, hash: u64, key: &[u8]) -> bool {
        self.cmp_key(hash, key) == KeyOrdering::Less
    }
}

/// An index entry one or more levels above the base list.
pub struct IndexNode {
    node: u32,
    down: u32,
    level: usize,
    right: AtomicU32,
}

impl IndexNode {
    fn new(node: u32, down: u32, level: usize, right: u32) -> Self {
        Self {
            node,
            down,
            level,
            right: AtomicU32::new(right),
        }
    }
}

/// Result of walking the base list towards a key.
enum Position {
    /// A live node with exactly this key.
    Found(u32),
    /// The key is absent and belongs between `pred` and `succ`.
    Before { pred: u32, succ: u32 },
}

// ------------------------------------------------------------------------------------------------
// Node pool
// ------------------------------------------------------------------------------------------------

/// Recycles the node and index arenas of drained skip lists.
///
/// One pool is created per process (see [`crate::Catalog`]) and shared by
/// every memtable, so a flushed list's storage is reused by the next one
/// instead of being freed and reallocated.
pub struct NodePool {
    nodes: Pool<Node>,
    towers: Pool<IndexNode>,
}

impl NodePool {
    /// Creates a pool that parks up to `parked` arena pairs, new arenas
    /// starting with `initial_nodes` base slots.
    pub fn new(parked: usize, initial_nodes: usize) -> Self {
        Self {
            nodes: Pool::new(parked, initial_nodes),
            towers: Pool::new(parked, (initial_nodes / 4).max(1)),
        }
    }

    /// Builds an empty skip list on pooled storage.
    pub fn list(&self) -> Result<SkipList, SkipListError> {
        SkipList::from_arenas(self.nodes.take(), self.towers.take())
    }

    /// Returns a list's storage to the pool.
    pub fn recycle(&self, list: SkipList) {
        let (nodes, towers) = list.into_arenas();
        self.nodes.give(nodes);
        self.towers.give(towers);
    }

    /// Number of parked arena pairs.
    pub fn parked(&self) -> usize {
        self.nodes.parked().min(self.towers.parked())
    }
}

impl Default for NodePool {
    fn default() -> Self {
        Self::new(4, 4096)
    }
}

// ------------------------------------------------------------------------------------------------
// Skip list
// ------------------------------------------------------------------------------------------------

/// Lock-free hashed skip list over byte keys and values.
pub struct SkipList {
    nodes: Arena<Node>,
    towers: Arena<IndexNode>,

    /// Topmost head index entry.
    head: AtomicU32,

    /// Base-level head node.
    sentinel: u32,

    /// Number of live keys.
    len: AtomicUsize,
}

impl SkipList {
    /// Creates an empty list with its own storage.
    pub fn new() -> Result<Self, SkipListError> {
        Self::from_arenas(
            Arena::with_capacity(DEFAULT_NODE_SLOTS),
            Arena::with_capacity(DEFAULT_NODE_SLOTS / 4),
        )
    }

    /// Creates an empty list on the given (empty) arenas.
    fn from_arenas(nodes: Arena<Node>, towers: Arena<IndexNode>) -> Result<Self, SkipListError> {
        let sentinel = nodes.alloc(Node::sentinel())?;
        let head = towers.alloc(IndexNode::new(sentinel, NIL, 1, NIL))?;

        Ok(Self {
            nodes,
            towers,
            head: AtomicU32::new(head),
            sentinel,
            len: AtomicUsize::new(0),
        })
    }

    fn into_arenas(self) -> (Arena<Node>, Arena<IndexNode>) {
        (self.nodes, self.towers)
    }

    // --------------------------------------------------------------------------------------------
    // Point operations
    // --------------------------------------------------------------------------------------------

    /// Returns the value stored for `key`, if live.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let hash = hash_key(key);
        let mut preds = [NIL; MAX_HEIGHT];
        match self.locate(hash, key, &mut preds) {
            Position::Found(n) => self.nodes.get(n).map(|n| &*n.value),
            Position::Before { .. } => None,
        }
    }

    /// Inserts `key` unless a live entry for it already exists.
    ///
    /// Returns `Ok(true)` if this call inserted the key and `Ok(false)` if an
    /// earlier writer already owns it.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<bool, SkipListError> {
        let hash = hash_key(key);
        let mut preds = [NIL; MAX_HEIGHT];
        let mut fresh = None;

        let z = loop {
            let (pred, succ) = match self.locate(hash, key, &mut preds) {
                Position::Found(_) => {
                    trace!(hash, "skip list set: key already present");
                    return Ok(false);
                }
                Position::Before { pred, succ } => (pred, succ),
            };

            let z = match fresh {
                Some(z) => z,
                None => {
                    let z = self.nodes.alloc(Node::new(hash, key, value))?;
                    fresh = Some(z);
                    z
                }
            };

            let (Some(zn), Some(bn)) = (self.nodes.get(z), self.nodes.get(pred)) else {
                continue;
            };
            zn.next.store(succ, Ordering::Release);
            if bn
                .next
                .compare_exchange(succ, z, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break z;
            }
        };

        self.len.fetch_add(1, Ordering::Relaxed);
        self.promote(z, hash, key, &preds)?;
        Ok(true)
    }

    /// Logically deletes `key`.
    ///
    /// The node becomes a tombstone and is unlinked by this or a later
    /// traversal. Returns `true` if this call deleted a live entry.
    pub fn remove(&self, key: &[u8]) -> bool {
        let hash = hash_key(key);
        let mut preds = [NIL; MAX_HEIGHT];

        let Position::Found(n) = self.locate(hash, key, &mut preds) else {
            return false;
        };
        let Some(node) = self.nodes.get(n) else {
            return false;
        };
        if node
            .deleted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        node.mark();
        self.len.fetch_sub(1, Ordering::Relaxed);

        // Walking past the tombstone unlinks it.
        let _ = self.locate(hash, key, &mut preds);
        true
    }

    // --------------------------------------------------------------------------------------------
    // Ordered traversal
    // --------------------------------------------------------------------------------------------

    /// Iterates live entries in hashed-key order.
    pub fn iter(&self) -> Iter<'_> {
        let first = self
            .nodes
            .get(self.sentinel)
            .map_or(NIL, |s| unmarked(s.next.load(Ordering::Acquire)));
        Iter {
            list: self,
            cursor: first,
            end: None,
        }
    }

    /// Visits live entries in order until `visit` returns `false`.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        for (key, value) in self.iter() {
            if !visit(key, value) {
                break;
            }
        }
    }

    /// Visits live entries from `start` through `end` (both inclusive, in
    /// hashed-key order) until `visit` returns `false`.
    pub fn scan<F>(&self, start: &[u8], end: &[u8], mut visit: F)
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        for (key, value) in self.iter_between(start, end) {
            if !visit(key, value) {
                break;
            }
        }
    }

    /// Iterates live entries from `start` through `end` inclusive.
    pub fn iter_between<'a>(&'a self, start: &[u8], end: &'a [u8]) -> Iter<'a> {
        let hash = hash_key(start);
        let mut preds = [NIL; MAX_HEIGHT];
        let cursor = match self.locate(hash, start, &mut preds) {
            Position::Found(n) => n,
            Position::Before { succ, .. } => succ,
        };
        Iter {
            list: self,
            cursor,
            end: Some((hash_key(end), end)),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of index levels, counted by following `down` links.
    pub fn height(&self) -> usize {
        let mut levels = 0;
        let mut q = self.head.load(Ordering::Acquire);
        while let Some(qi) = self.towers.get(q) {
            levels += 1;
            q = qi.down;
        }
        levels
    }

    // --------------------------------------------------------------------------------------------
    // Search
    // --------------------------------------------------------------------------------------------

    /// Descends the index, recording on each level the rightmost entry that
    /// precedes the target, and returns the base node to continue from.
    fn find_predecessor(&self, hash: u64, key: &[u8], preds: &mut [u32; MAX_HEIGHT]) -> u32 {
        let mut q = self.head.load(Ordering::Acquire);
        loop {
            let Some(qi) = self.towers.get(q) else {
                return self.sentinel;
            };
            let r = qi.right.load(Ordering::Acquire);
            if let Some(ri) = self.towers.get(r) {
                match self.nodes.get(ri.node) {
                    Some(rn) if rn.is_deleted() => {
                        let next = ri.right.load(Ordering::Acquire);
                        if qi
                            .right
                            .compare_exchange(r, next, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            trace!(level = qi.level, "unlinked stale index entry");
                        }
                        continue;
                    }
                    Some(rn) if rn.precedes(hash, key) => {
                        q = r;
                        continue;
                    }
                    _ => {}
                }
            }

            preds[qi.level - 1] = q;
            if qi.down == NIL {
                return qi.node;
            }
            q = qi.down;
        }
    }

    /// Walks the base list to the position of `(hash, key)`, unlinking any
    /// tombstones met on the way.
    fn locate(&self, hash: u64, key: &[u8], preds: &mut [u32; MAX_HEIGHT]) -> Position {
        'search: loop {
            let mut b = self.find_predecessor(hash, key, preds);
            loop {
                let Some(bn) = self.nodes.get(b) else {
                    continue 'search;
                };
                let n = bn.next.load(Ordering::Acquire);
                if is_marked(n) {
                    // Predecessor was deleted under us.
                    continue 'search;
                }
                let Some(nn) = self.nodes.get(n) else {
                    return Position::Before { pred: b, succ: NIL };
                };

                let after = nn.next.load(Ordering::Acquire);
                if is_marked(after) {
                    if bn
                        .next
                        .compare_exchange(n, unmarked(after), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        trace!(hash = nn.hash, "unlinked tombstone");
                    }
                    continue;
                }

                match nn.cmp_key(hash, key) {
                    KeyOrdering::Less => b = n,
                    KeyOrdering::Equal if nn.is_deleted() => nn.mark(),
                    KeyOrdering::Equal => return Position::Found(n),
                    KeyOrdering::Greater => return Position::Before { pred: b, succ: n },
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Index maintenance
    // --------------------------------------------------------------------------------------------

    /// Builds an index tower for a freshly inserted node, bottom-up.
    fn promote(
        &self,
        z: u32,
        hash: u64,
        key: &[u8],
        preds: &[u32; MAX_HEIGHT],
    ) -> Result<(), SkipListError> {
        let levels = random_level();
        if levels == 0 {
            return Ok(());
        }

        let top = self.head.load(Ordering::Acquire);
        let height = self.towers.get(top).map_or(1, |t| t.level);
        let levels = levels.min(height + 1).min(MAX_HEIGHT);

        let mut down = NIL;
        for level in 1..=levels.min(height) {
            if self.nodes.get(z).is_none_or(Node::is_deleted) {
                return Ok(());
            }
            let x = self.towers.alloc(IndexNode::new(z, down, level, NIL))?;
            let start = match preds[level - 1] {
                NIL => self.head_at(level),
                q => q,
            };
            self.link_index(start, x, hash, key);
            down = x;
        }

        if levels > height {
            let x = self.towers.alloc(IndexNode::new(z, down, levels, NIL))?;
            let grown = self
                .towers
                .alloc(IndexNode::new(self.sentinel, top, levels, x))?;
            if self
                .head
                .compare_exchange(top, grown, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(height = levels, "skip list grew a level");
            }
        }
        Ok(())
    }

    /// Links index entry `x` into its level, starting the walk at `q`.
    fn link_index(&self, mut q: u32, x: u32, hash: u64, key: &[u8]) {
        let Some(xi) = self.towers.get(x) else {
            return;
        };
        loop {
            let Some(qi) = self.towers.get(q) else {
                return;
            };
            let r = qi.right.load(Ordering::Acquire);
            if let Some(ri) = self.towers.get(r) {
                match self.nodes.get(ri.node) {
                    Some(rn) if rn.is_deleted() => {
                        let next = ri.right.load(Ordering::Acquire);
                        let _ =
                            qi.right
                                .compare_exchange(r, next, Ordering::AcqRel, Ordering::Acquire);
                        continue;
                    }
                    Some(rn) if rn.precedes(hash, key) => {
                        q = r;
                        continue;
                    }
                    _ => {}
                }
            }

            xi.right.store(r, Ordering::Release);
            if qi
                .right
                .compare_exchange(r, x, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Head index entry of `level`, or the lowest head if it does not exist.
    fn head_at(&self, level: usize) -> u32 {
        let mut q = self.head.load(Ordering::Acquire);
        while let Some(qi) = self.towers.get(q) {
            if qi.level <= level || qi.down == NIL {
                return q;
            }
            q = qi.down;
        }
        q
    }
}

// ------------------------------------------------------------------------------------------------
// Iteration
// ------------------------------------------------------------------------------------------------

/// Borrowing iterator over live `(key, value)` pairs in hashed-key order.
pub struct Iter<'a> {
    list: &'a SkipList,
    cursor: u32,
    end: Option<(u64, &'a [u8])>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.list.nodes.get(self.cursor)?;
            if let Some((hash, key)) = self.end {
                if node.cmp_key(hash, key) == KeyOrdering::Greater {
                    self.cursor = NIL;
                    return None;
                }
            }
            self.cursor = unmarked(node.next.load(Ordering::Acquire));
            if !node.is_deleted() {
                return Some((&node.key, &node.value));
            }
        }
    }
}

impl fmt::Display for SkipList {
    /// One line per level, top first, then the base list.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut q = self.head.load(Ordering::Acquire);
        while let Some(qi) = self.towers.get(q) {
            write!(f, "L{}:", qi.level)?;
            let mut r = qi.right.load(Ordering::Acquire);
            while let Some(ri) = self.towers.get(r) {
                if let Some(node) = self.nodes.get(ri.node) {
                    write!(f, " {}", String::from_utf8_lossy(&node.key))?;
                }
                r = ri.right.load(Ordering::Acquire);
            }
            writeln!(f)?;
            q = qi.down;
        }

        write!(f, "L0:")?;
        for (key, value) in self.iter() {
            write!(
                f,
                " {}={}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            )?;
        }
        writeln!(f)
    }
}
