//! Write-Ahead Log (WAL) Module
//!
//! A segmented commit log. Each [`Segment`] pairs a record store with a
//! fixed-width offset index, and the [`Log`] keeps segments ordered by base
//! offset with the highest one active.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/<base>.store    [u64 BE len][payload] ...
//! <dir>/<base>.index    [u32 BE relative offset][u64 BE position] ...
//! ```
//!
//! # Offsets
//!
//! Every appended record receives the next absolute offset. A segment
//! covers `base..next`; when an append leaves the active segment maxed, a
//! new segment is created at `offset + 1`.
//!
//! # Concurrency model
//!
//! - The segment map sits behind an `RwLock`; appends and rollover take the
//!   write lock, reads take the read lock.
//! - Inside a segment, the store serializes writers with its own mutex.
//!
//! # Recovery
//!
//! Opening a segment cuts a torn trailing record off the store and rewrites
//! index entries that are missing or disagree with the store. An index file
//! found at its full mapped size was not closed; its written size is
//! recovered before that check.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod index;
pub mod segment;
pub mod store;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::mmap::RegionError;
pub use index::ENTRY_WIDTH;
pub use segment::Segment;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index mapping failure.
    #[error("region error: {0}")]
    Region(#[from] RegionError),

    /// Read past the last written byte or entry.
    #[error("Unexpected end of file")]
    Eof,

    /// No segment holds the requested offset.
    #[error("offset {0} is out of range")]
    OffsetOutOfRange(u64),

    /// The index has no room for another entry.
    #[error("index is full")]
    IndexFull,

    /// Store contents contradict their framing.
    #[error("corrupt log: {0}")]
    Corrupt(String),

    /// Rejected [`LogConfig`].
    #[error("invalid log config: {0}")]
    InvalidConfig(String),

    /// Poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Segment sizing for a [`Log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// A segment stops taking records once its store reaches this size.
    pub max_store_bytes: u64,

    /// Mapped size of each index file; bounds the records per segment.
    pub max_index_bytes: u64,

    /// Base offset of the first segment of a new log.
    pub initial_offset: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), WalError> {
        if self.max_store_bytes == 0 {
            return Err(WalError::InvalidConfig(
                "max_store_bytes must be greater than zero".into(),
            ));
        }
        if self.max_index_bytes < ENTRY_WIDTH {
            return Err(WalError::InvalidConfig(format!(
                "max_index_bytes must hold at least one {ENTRY_WIDTH}-byte entry"
            )));
        }
        if usize::try_from(self.max_index_bytes).is_err() {
            return Err(WalError::InvalidConfig(
                "max_index_bytes does not fit in memory".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Log
// ------------------------------------------------------------------------------------------------

/// Segmented, append-only record log rooted at one directory.
pub struct Log {
    dir: PathBuf,
    config: LogConfig,
    segments: RwLock<BTreeMap<u64, Arc<Segment>>>,
}

impl Log {
    /// Opens the log in `dir`, reloading every segment found there, or
    /// starting one at `config.initial_offset`.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> Result<Self, WalError> {
        config.validate()?;
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut bases = BTreeSet::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if !matches!(ext, Some("store") | Some("index")) {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(base) => {
                    bases.insert(base);
                }
                None => warn!(path = %path.display(), "ignoring unrecognized log file"),
            }
        }

        let mut segments = BTreeMap::new();
        for base in bases {
            segments.insert(base, Arc::new(Segment::open(dir, base, &config)?));
        }
        if segments.is_empty() {
            let base = config.initial_offset;
            segments.insert(base, Arc::new(Segment::open(dir, base, &config)?));
        }

        info!(dir = %dir.display(), segments = segments.len(), "log opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            segments: RwLock::new(segments),
        })
    }

    /// Appends `record` to the active segment and returns its offset.
    pub fn append(&self, record: &[u8]) -> Result<u64, WalError> {
        let mut segments = self.write_segments()?;

        let mut active = active(&segments)?;
        if active.is_maxed() {
            // Reopened with a segment that was already full.
            active = self.roll(&mut segments, active.next_offset())?;
        }

        let offset = active.append(record)?;
        if active.is_maxed() {
            self.roll(&mut segments, offset + 1)?;
        }

        trace!(offset, len = record.len(), "log append");
        Ok(offset)
    }

    /// Reads the record at `offset`.
    pub fn read(&self, offset: u64) -> Result<Vec<u8>, WalError> {
        let segment = self
            .read_segments()?
            .range(..=offset)
            .next_back()
            .map(|(_, s)| Arc::clone(s))
            .ok_or(WalError::OffsetOutOfRange(offset))?;
        segment.read(offset)
    }

    /// Visits every record in offset order until `visit` returns `false`.
    ///
    /// Returns the number of records visited.
    pub fn replay<F>(&self, mut visit: F) -> Result<u64, WalError>
    where
        F: FnMut(u64, &[u8]) -> bool,
    {
        let segments: Vec<Arc<Segment>> = self.read_segments()?.values().cloned().collect();
        let mut visited = 0;
        for segment in segments {
            for offset in segment.base_offset()..segment.next_offset() {
                let record = segment.read(offset)?;
                visited += 1;
                if !visit(offset, &record) {
                    return Ok(visited);
                }
            }
        }
        Ok(visited)
    }

    /// Deletes every segment and starts a fresh one after the highest
    /// offset written so far.
    pub fn reset(&self) -> Result<(), WalError> {
        let mut segments = self.write_segments()?;
        let next = segments
            .values()
            .next_back()
            .map_or(self.config.initial_offset, |s| s.next_offset());

        for segment in segments.values() {
            segment.remove()?;
        }
        segments.clear();
        segments.insert(next, Arc::new(Segment::open(&self.dir, next, &self.config)?));

        info!(dir = %self.dir.display(), next, "log reset");
        Ok(())
    }

    /// Makes every appended record durable.
    pub fn sync(&self) -> Result<(), WalError> {
        for segment in self.read_segments()?.values() {
            segment.sync()?;
        }
        Ok(())
    }

    /// Removes every segment whose records all lie below `lowest`.
    ///
    /// The active segment is always kept. Returns the number removed.
    pub fn truncate(&self, lowest: u64) -> Result<usize, WalError> {
        let mut segments = self.write_segments()?;
        let Some(&active_base) = segments.keys().next_back() else {
            return Ok(0);
        };

        let doomed: Vec<u64> = segments
            .iter()
            .filter(|&(&base, s)| base != active_base && s.next_offset() <= lowest)
            .map(|(&base, _)| base)
            .collect();
        for base in &doomed {
            if let Some(segment) = segments.remove(base) {
                segment.remove()?;
            }
        }

        if !doomed.is_empty() {
            debug!(lowest, removed = doomed.len(), "log truncated");
        }
        Ok(doomed.len())
    }

    /// Closes every segment. All are attempted; the first error is returned.
    pub fn close(&self) -> Result<(), WalError> {
        let segments = self.read_segments()?;
        let mut first = None;
        for segment in segments.values() {
            if let Err(e) = segment.close() {
                error!(base_offset = segment.base_offset(), error = %e, "segment close failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Base offset of the oldest segment.
    pub fn lowest_offset(&self) -> Result<u64, WalError> {
        self.read_segments()?
            .keys()
            .next()
            .copied()
            .ok_or_else(|| WalError::Internal("log has no segments".into()))
    }

    /// Offset of the newest record, or `None` if nothing was ever written
    /// at or after the lowest segment.
    pub fn highest_offset(&self) -> Result<Option<u64>, WalError> {
        let segments = self.read_segments()?;
        let lowest = segments.keys().next().copied();
        let next = segments.values().next_back().map(|s| s.next_offset());
        Ok(match (lowest, next) {
            (Some(lowest), Some(next)) if next > lowest => Some(next - 1),
            _ => None,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().map_or(0, |s| s.len())
    }

    /// Segments in base offset order.
    pub fn segments(&self) -> Result<Vec<Arc<Segment>>, WalError> {
        Ok(self.read_segments()?.values().cloned().collect())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Creates and activates a segment at `base`.
    fn roll(
        &self,
        segments: &mut BTreeMap<u64, Arc<Segment>>,
        base: u64,
    ) -> Result<Arc<Segment>, WalError> {
        let segment = Arc::new(Segment::open(&self.dir, base, &self.config)?);
        segments.insert(base, Arc::clone(&segment));
        info!(base_offset = base, "log rolled to new segment");
        Ok(segment)
    }

    fn read_segments(&self) -> Result<RwLockReadGuard<'_, BTreeMap<u64, Arc<Segment>>>, WalError> {
        self.segments.read().map_err(|_| {
            error!("log segments lock poisoned");
            WalError::Internal("RwLock poisoned".into())
        })
    }

    fn write_segments(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<u64, Arc<Segment>>>, WalError> {
        self.segments.write().map_err(|_| {
            error!("log segments lock poisoned");
            WalError::Internal("RwLock poisoned".into())
        })
    }
}

/// The segment with the highest base offset.
fn active(segments: &BTreeMap<u64, Arc<Segment>>) -> Result<Arc<Segment>, WalError> {
    segments
        .values()
        .next_back()
        .cloned()
        .ok_or_else(|| WalError::Internal("log has no segments".into()))
}
