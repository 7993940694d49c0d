//! # Arena Module
//!
//! Typed slot arenas addressed by stable `u32` handles, plus a bounded
//! recycler that hands reset arenas back out.
//!
//! ## Layout
//!
//! An arena is a list of lazily created segments. Segment `k` holds
//! `initial << k` slots, so capacity doubles each time the previous
//! segments are exhausted and existing slots never move. A handle maps to
//! `(segment, slot)` with a couple of bit operations:
//!
//! ```text
//! handle + initial = 2^(s + k) + slot      (initial = 2^s)
//! ```
//!
//! ## Concurrency
//!
//! - `alloc` is lock-free apart from the one-time creation of a new segment.
//! - Every slot is a `OnceLock<T>`: written exactly once by the allocating
//!   thread, read without locking afterwards.
//! - A handle is only observable by other threads after it has been
//!   published through an atomic link with release ordering, so `get`
//!   never races the write of the slot it resolves.
//!
//! Individual slots are never freed. Memory is reclaimed all at once by
//! [`Arena::reset`], which requires exclusive access and keeps the
//! segments for reuse through a [`Pool`].

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::queue::ArrayQueue;
use thiserror::Error;
use tracing::{debug, trace};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Largest handle value an arena will hand out (exclusive).
///
/// The top bit of a `u32` link is reserved by the skip list for marking.
pub const MAX_HANDLES: u32 = u32::MAX >> 1;

/// Smallest first segment an arena is created with.
const MIN_INITIAL_SLOTS: usize = 16;

/// Upper bound on the number of segments (enough to cover `MAX_HANDLES`).
const MAX_SEGMENTS: usize = 32;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Arena`] operations.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// Every handle has been used.
    #[error("arena exhausted after {0} allocations")]
    Exhausted(u32),

    /// A slot that should have been free was already written.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Arena
// ------------------------------------------------------------------------------------------------

type Segment<T> = Box<[OnceLock<T>]>;

/// A grow-by-doubling arena of write-once slots.
pub struct Arena<T> {
    /// Lazily created segments; segment `k` holds `initial << k` slots.
    segments: Box<[OnceLock<Segment<T>>]>,

    /// log2 of the first segment's size.
    shift: u32,

    /// Next handle to hand out.
    next: AtomicU32,
}

impl<T> Arena<T> {
    /// Creates an arena whose first segment holds at least `initial` slots.
    ///
    /// The first segment is allocated eagerly.
    pub fn with_capacity(initial: usize) -> Self {
        let initial = initial.max(MIN_INITIAL_SLOTS).next_power_of_two();
        let shift = initial.trailing_zeros();

        let segments: Box<[OnceLock<Segment<T>>]> =
            (0..MAX_SEGMENTS).map(|_| OnceLock::new()).collect();
        let _ = segments[0].get_or_init(|| new_segment(initial));

        Self {
            segments,
            shift,
            next: AtomicU32::new(0),
        }
    }

    /// Stores `value` in a fresh slot and returns its handle.
    pub fn alloc(&self, value: T) -> Result<u32, ArenaError> {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        if handle >= MAX_HANDLES {
            // Undo so `len` stays meaningful.
            self.next.fetch_sub(1, Ordering::Relaxed);
            return Err(ArenaError::Exhausted(handle));
        }

        let (seg, slot) = self.locate(handle);
        let segment = self.segments[seg].get_or_init(|| {
            let size = 1usize << (self.shift as usize + seg);
            debug!(segment = seg, slots = size, "arena growing");
            new_segment(size)
        });

        segment[slot]
            .set(value)
            .map_err(|_| ArenaError::Internal(format!("slot {handle} written twice")))?;

        trace!(handle, "arena alloc");
        Ok(handle)
    }

    /// Resolves a handle to its value.
    ///
    /// Returns `None` for handles that were never allocated.
    pub fn get(&self, handle: u32) -> Option<&T> {
        if handle >= MAX_HANDLES {
            return None;
        }
        let (seg, slot) = self.locate(handle);
        self.segments[seg].get()?.get(slot)?.get()
    }

    /// Number of handles allocated so far.
    pub fn len(&self) -> usize {
        self.next.load(Ordering::Relaxed).min(MAX_HANDLES) as usize
    }

    /// Returns `true` if nothing has been allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of slots across all created segments.
    pub fn capacity(&self) -> usize {
        self.segments
            .iter()
            .filter_map(OnceLock::get)
            .map(|s| s.len())
            .sum()
    }

    /// Clears every slot while keeping the allocated segments.
    pub fn reset(&mut self) {
        for segment in self.segments.iter_mut().filter_map(OnceLock::get_mut) {
            for slot in segment.iter_mut() {
                let _ = slot.take();
            }
        }
        *self.next.get_mut() = 0;
    }

    /// Maps a handle to `(segment index, slot index)`.
    fn locate(&self, handle: u32) -> (usize, usize) {
        let biased = handle as usize + (1usize << self.shift);
        let top = (usize::BITS - 1 - biased.leading_zeros()) as usize;
        let seg = top - self.shift as usize;
        (seg, biased - (1usize << top))
    }
}

fn new_segment<T>(size: usize) -> Segment<T> {
    (0..size).map(|_| OnceLock::new()).collect()
}

// ------------------------------------------------------------------------------------------------
// Pool
// ------------------------------------------------------------------------------------------------

/// Bounded recycler of reset arenas.
///
/// Arenas returned with [`Pool::give`] are reset and parked; [`Pool::take`]
/// prefers a parked arena over allocating a new one. When the pool is full
/// the returned arena is simply dropped.
pub struct Pool<T> {
    parked: ArrayQueue<Arena<T>>,
    initial: usize,
}

impl<T> Pool<T> {
    /// Creates a pool that parks up to `capacity` arenas, each created with
    /// `initial` slots when none is available.
    pub fn new(capacity: usize, initial: usize) -> Self {
        Self {
            parked: ArrayQueue::new(capacity.max(1)),
            initial,
        }
    }

    /// Returns a parked arena, or a new one.
    pub fn take(&self) -> Arena<T> {
        match self.parked.pop() {
            Some(arena) => arena,
            None => Arena::with_capacity(self.initial),
        }
    }

    /// Resets `arena` and parks it for reuse.
    pub fn give(&self, mut arena: Arena<T>) {
        arena.reset();
        if self.parked.push(arena).is_err() {
            trace!("arena pool full, dropping arena");
        }
    }

    /// Number of arenas currently parked.
    pub fn parked(&self) -> usize {
        self.parked.len()
    }
}
