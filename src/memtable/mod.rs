//! # Memtable Module
//!
//! The mutable in-memory layer of a table: a lock-free [`SkipList`] held
//! behind an atomically swappable reference.
//!
//! ## Generations
//!
//! Every swap installs a new *generation*, which wraps one skip list with
//! a count of in-flight writers and a sealed flag.
//!
//! ## Flush protocol
//!
//! 1. Build an empty generation from the [`NodePool`].
//! 2. Publish the current generation as *draining* so reads keep seeing it.
//! 3. Compare-and-swap the current reference from the old generation to
//!    the new one. A flusher that loses the swap retries against whatever
//!    is current now.
//! 4. Seal the old generation and wait until its in-flight writers leave.
//!    A writer registers before checking the seal, so after this point no
//!    write can land in the old list.
//! 5. Drain the old list, in order, into the SSTable.
//! 6. Clear the draining slot and return the list's storage to the pool.
//!
//! A drain that fails leaves the generation in the draining slot; the next
//! flush finishes it before swapping again.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::utils::Backoff;
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::skiplist::{NodePool, SkipList, SkipListError};
use crate::sstable::{SSTable, SSTableError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Represents possible errors returned by [`MemTable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// The skip list could not allocate.
    #[error("skip list error: {0}")]
    SkipList(#[from] SkipListError),

    /// Writing drained rows failed.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Generation
// ------------------------------------------------------------------------------------------------

/// One skip list plus the bookkeeping that lets a flush retire it safely.
struct Generation {
    id: u64,
    list: SkipList,

    /// Writers currently inside `set` on this generation.
    writers: AtomicUsize,

    /// Set once a flush has swapped this generation out.
    sealed: AtomicBool,

    /// Key and value bytes of the inserts that won.
    bytes: AtomicUsize,
}

impl Generation {
    fn new(id: u64, list: SkipList) -> Self {
        Self {
            id,
            list,
            writers: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            bytes: AtomicUsize::new(0),
        }
    }

    /// Registers a writer. Fails if the generation is sealed.
    fn enter(&self) -> bool {
        self.writers.fetch_add(1, Ordering::SeqCst);
        if self.sealed.load(Ordering::SeqCst) {
            self.leave();
            return false;
        }
        true
    }

    fn leave(&self) {
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Seals the generation and waits for registered writers to leave.
    fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.writers.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// The read/write buffer of a table.
pub struct MemTable {
    current: ArcSwap<Generation>,

    /// Generation being drained into the SSTable, still visible to reads.
    draining: ArcSwapOption<Generation>,

    /// Serializes flushers.
    flush_lock: Mutex<()>,

    pool: Arc<NodePool>,
    next_id: AtomicU64,
}

impl MemTable {
    /// Creates an empty memtable whose lists come from `pool`.
    pub fn new(pool: Arc<NodePool>) -> Result<Self, MemtableError> {
        let first = Generation::new(0, pool.list()?);
        Ok(Self {
            current: ArcSwap::from_pointee(first),
            draining: ArcSwapOption::empty(),
            flush_lock: Mutex::new(()),
            pool,
            next_id: AtomicU64::new(1),
        })
    }

    /// Looks up `key` in the current generation, then in a draining one.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let current = self.current.load();
        if let Some(value) = current.list.get(key) {
            return Some(value.to_vec());
        }
        self.draining
            .load_full()
            .and_then(|g| g.list.get(key).map(<[u8]>::to_vec))
    }

    /// Inserts `key` into the current generation.
    ///
    /// Returns `Ok(true)` if this write won, `Ok(false)` if the key was
    /// already present in the current generation.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<bool, MemtableError> {
        let backoff = Backoff::new();
        loop {
            let generation = self.current.load_full();
            if !generation.enter() {
                // A flush swapped this generation out; retry on the new one.
                backoff.spin();
                continue;
            }

            let result = generation.list.set(key, value);
            if let Ok(true) = result {
                generation
                    .bytes
                    .fetch_add(key.len() + value.len(), Ordering::Relaxed);
            }
            generation.leave();

            trace!(generation = generation.id, key_len = key.len(), "memtable set");
            return Ok(result?);
        }
    }

    /// Swaps in an empty generation and drains the old one into `sstable`.
    ///
    /// Returns the number of rows written.
    pub fn flush(&self, sstable: &SSTable) -> Result<usize, MemtableError> {
        let _guard = self.flush_lock.lock().map_err(|_| {
            error!("memtable flush lock poisoned");
            MemtableError::Internal("Mutex poisoned".into())
        })?;

        // 1. Finish a drain that failed earlier.
        let mut written = 0;
        if let Some(stuck) = self.draining.load_full() {
            written += self.drain(stuck, sstable)?;
        }

        loop {
            let old = self.current.load_full();
            if old.list.is_empty() {
                return Ok(written);
            }

            // 2. Make the old generation readable while it drains.
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let fresh = Arc::new(Generation::new(id, self.pool.list()?));
            self.draining.store(Some(Arc::clone(&old)));

            // 3. Swap.
            let prev = self.current.compare_and_swap(&old, fresh);
            if !Arc::ptr_eq(&prev, &old) {
                debug!(generation = old.id, "memtable swap lost, retrying");
                self.draining.store(None);
                continue;
            }
            drop(prev);

            // 4. Quiesce writers of the old generation.
            old.seal();

            // 5. Drain.
            let id = old.id;
            written += self.drain(old, sstable)?;
            info!(generation = id, rows = written, "memtable flushed");
            return Ok(written);
        }
    }

    /// Writes every entry of `generation` into `sstable`, then retires it.
    fn drain(&self, generation: Arc<Generation>, sstable: &SSTable) -> Result<usize, MemtableError> {
        let mut rows = 0;
        for (key, value) in generation.list.iter() {
            sstable.set(key, value)?;
            rows += 1;
        }
        sstable.flush()?;

        self.draining.store(None);
        debug!(generation = generation.id, rows, "generation drained");

        // Readers that still hold the generation keep it alive; it is then
        // dropped by the last of them instead of being recycled.
        if let Ok(retired) = Arc::try_unwrap(generation) {
            self.pool.recycle(retired.list);
        }
        Ok(rows)
    }

    /// Visits live entries of the current and any draining generation.
    ///
    /// A key present in both is visited twice; callers that need unique keys
    /// must deduplicate.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let current = self.current.load_full();
        for (key, value) in current.list.iter() {
            if !visit(key, value) {
                return;
            }
        }
        if let Some(draining) = self.draining.load_full() {
            draining.list.range(visit);
        }
    }

    /// Number of live keys in the current generation.
    pub fn len(&self) -> usize {
        self.current.load().list.len()
    }

    /// Returns `true` if the current generation holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key and value bytes accepted by the current generation.
    pub fn approximate_size(&self) -> usize {
        self.current.load().bytes.load(Ordering::Relaxed)
    }
}

impl fmt::Display for MemTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current.load();
        writeln!(
            f,
            "memtable generation {} ({} keys, {} bytes)",
            current.id,
            current.list.len(),
            current.bytes.load(Ordering::Relaxed)
        )?;
        write!(f, "{}", current.list)
    }
}
