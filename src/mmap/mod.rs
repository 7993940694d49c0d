//! # Mapped Region Module
//!
//! A fixed-size, byte-addressable view of a file through `memmap2`, with a
//! write cursor for sequential appends and random-access reads that never
//! move it.
//!
//! ## Concurrency model
//!
//! - The mapping and its cursor live behind one `RwLock`.
//! - `peek`, `read_at`, and `view` take the read lock and run in parallel.
//! - `append`, `write`, `read`, and `seek` move the cursor and take the
//!   write lock.
//!
//! ## Pinning
//!
//! With [`RegionOptions::pin_writes`] set, the mapping is memory-locked
//! (`mlock`) around every mutation so the copy does not fault mid-write.
//! Pinning is best effort: when the process lacks the locked-memory budget
//! the failure is logged and the write proceeds unpinned. Explicit
//! [`MappedRegion::lock`] / [`MappedRegion::unlock`] calls report errors.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::File;
use std::io::{self, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use memmap2::{Mmap, MmapMut, MmapOptions};
use thiserror::Error;
use tracing::{debug, error, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`MappedRegion`] operations.
#[derive(Debug, Error)]
pub enum RegionError {
    /// Underlying I/O failure (open, stat, map, msync, mlock).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file or requested window has zero length.
    #[error("cannot map an empty region")]
    Empty,

    /// A read asked for bytes beyond the mapped length.
    #[error("range {start}..{end} is outside the {len}-byte region")]
    OutOfBounds { start: usize, end: usize, len: usize },

    /// A read returned fewer bytes than requested.
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    /// A write would run past the end of the region.
    #[error("region full: {needed} bytes needed, {available} available")]
    Full { needed: usize, available: usize },

    /// A mutation was attempted on a region opened read-only.
    #[error("region is not writable")]
    ReadOnly,

    /// The region has been closed.
    #[error("region is closed")]
    Closed,

    /// Poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// How a file is mapped.
#[derive(Debug, Clone)]
pub struct RegionOptions {
    /// Map read-write (shared) instead of read-only.
    pub writable: bool,

    /// Byte offset into the file where the mapping starts.
    pub offset: u64,

    /// Length of the mapping. `None` maps from `offset` to end of file.
    pub len: Option<usize>,

    /// Memory-lock the mapping around each mutation.
    pub pin_writes: bool,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            writable: true,
            offset: 0,
            len: None,
            pin_writes: true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Region
// ------------------------------------------------------------------------------------------------

enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::ReadOnly(m) => &m[..],
            Mapping::Writable(m) => &m[..],
        }
    }

    fn lock(&self) -> io::Result<()> {
        match self {
            Mapping::ReadOnly(m) => m.lock(),
            Mapping::Writable(m) => m.lock(),
        }
    }

    fn unlock(&self) -> io::Result<()> {
        match self {
            Mapping::ReadOnly(m) => m.unlock(),
            Mapping::Writable(m) => m.unlock(),
        }
    }
}

struct Mapped {
    map: Mapping,
    cursor: usize,

    /// Held so the descriptor closes together with the mapping.
    _file: File,
}

/// A memory-mapped window over a file.
pub struct MappedRegion {
    inner: RwLock<Option<Mapped>>,
    len: usize,
    writable: bool,
    pin_writes: bool,

    /// Suppresses repeated pin-failure logs.
    pin_warned: AtomicBool,
}

impl MappedRegion {
    /// Maps `file` according to `opts`.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { MmapOptions::map* }`, which is sound as long as the
    /// mapped range of the file is not truncated or modified by another
    /// process while mapped. The region owns its file handle, and every
    /// in-process access goes through the region's lock.
    pub fn open(file: File, opts: &RegionOptions) -> Result<Self, RegionError> {
        let file_len = file.metadata()?.len();
        let len = match opts.len {
            Some(len) => len,
            None => usize::try_from(file_len.saturating_sub(opts.offset))
                .map_err(|_| RegionError::Internal("file too large to map".into()))?,
        };
        if len == 0 {
            return Err(RegionError::Empty);
        }

        let mut options = MmapOptions::new();
        options.offset(opts.offset).len(len);

        let map = if opts.writable {
            Mapping::Writable(unsafe { options.map_mut(&file)? })
        } else {
            Mapping::ReadOnly(unsafe { options.map(&file)? })
        };

        debug!(len, offset = opts.offset, writable = opts.writable, "region mapped");

        Ok(Self {
            inner: RwLock::new(Some(Mapped {
                map,
                cursor: 0,
                _file: file,
            })),
            len,
            writable: opts.writable,
            pin_writes: opts.pin_writes,
            pin_warned: AtomicBool::new(false),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Copies `data` at the cursor and advances it.
    ///
    /// Returns `(bytes written, offset the data starts at)`.
    pub fn append(&self, data: &[u8]) -> Result<(usize, usize), RegionError> {
        if !self.writable {
            return Err(RegionError::ReadOnly);
        }
        let mut guard = self.write_lock()?;
        let mapped = guard.as_mut().ok_or(RegionError::Closed)?;

        let offset = mapped.cursor;
        let available = self.len - offset;
        if data.len() > available {
            return Err(RegionError::Full {
                needed: data.len(),
                available,
            });
        }

        let pinned = self.pin(&mapped.map);
        if let Mapping::Writable(map) = &mut mapped.map {
            map[offset..offset + data.len()].copy_from_slice(data);
        }
        if pinned {
            let _ = mapped.map.unlock();
        }

        mapped.cursor += data.len();
        trace!(offset, n = data.len(), "region append");
        Ok((data.len(), offset))
    }

    /// Copies `data` at the cursor and advances it; returns bytes written.
    pub fn write(&self, data: &[u8]) -> Result<usize, RegionError> {
        self.append(data).map(|(n, _)| n)
    }

    /// Flushes dirty pages to the file.
    pub fn flush(&self) -> Result<(), RegionError> {
        let guard = self.read_lock()?;
        let mapped = guard.as_ref().ok_or(RegionError::Closed)?;
        if let Mapping::Writable(map) = &mapped.map {
            map.flush()?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Copies `length` bytes starting at `start` into `buf` without moving
    /// the cursor.
    pub fn peek(&self, buf: &mut [u8], start: usize, length: usize) -> Result<usize, RegionError> {
        let guard = self.read_lock()?;
        let mapped = guard.as_ref().ok_or(RegionError::Closed)?;

        let end = start.checked_add(length).unwrap_or(usize::MAX);
        if start >= self.len || end > self.len {
            return Err(RegionError::OutOfBounds {
                start,
                end,
                len: self.len,
            });
        }
        if buf.len() < length {
            return Err(RegionError::ShortRead {
                wanted: length,
                got: buf.len(),
            });
        }

        buf[..length].copy_from_slice(&mapped.map.bytes()[start..end]);
        Ok(length)
    }

    /// Fills `buf` from offset `off`; fails unless the whole buffer is read.
    pub fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize, RegionError> {
        let guard = self.read_lock()?;
        let mapped = guard.as_ref().ok_or(RegionError::Closed)?;

        if off >= self.len {
            return Err(RegionError::OutOfBounds {
                start: off,
                end: off.saturating_add(buf.len()),
                len: self.len,
            });
        }
        let src = &mapped.map.bytes()[off..];
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        if n < buf.len() {
            return Err(RegionError::ShortRead {
                wanted: buf.len(),
                got: n,
            });
        }
        Ok(n)
    }

    /// Copies from the cursor into `buf` and advances the cursor.
    ///
    /// Returns `Ok(0)` at the end of the region.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, RegionError> {
        let mut guard = self.write_lock()?;
        let mapped = guard.as_mut().ok_or(RegionError::Closed)?;

        let src = &mapped.map.bytes()[mapped.cursor..];
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        mapped.cursor += n;
        Ok(n)
    }

    /// Runs `f` over the whole mapped range under the read lock.
    pub fn view<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, RegionError> {
        let guard = self.read_lock()?;
        let mapped = guard.as_ref().ok_or(RegionError::Closed)?;
        Ok(f(mapped.map.bytes()))
    }

    /// Moves the cursor; the result must stay within `0..=len`.
    pub fn seek(&self, pos: SeekFrom) -> Result<usize, RegionError> {
        let mut guard = self.write_lock()?;
        let mapped = guard.as_mut().ok_or(RegionError::Closed)?;

        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(d) => mapped.cursor as i128 + i128::from(d),
            SeekFrom::End(d) => self.len as i128 + i128::from(d),
        };
        if target < 0 || target > self.len as i128 {
            return Err(RegionError::OutOfBounds {
                start: target.max(0) as usize,
                end: target.max(0) as usize,
                len: self.len,
            });
        }

        mapped.cursor = target as usize;
        Ok(mapped.cursor)
    }

    // --------------------------------------------------------------------------------------------
    // Pinning and lifecycle
    // --------------------------------------------------------------------------------------------

    /// Memory-locks the whole mapping.
    pub fn lock(&self) -> Result<(), RegionError> {
        let guard = self.read_lock()?;
        let mapped = guard.as_ref().ok_or(RegionError::Closed)?;
        mapped.map.lock()?;
        Ok(())
    }

    /// Releases a memory lock taken by [`MappedRegion::lock`].
    pub fn unlock(&self) -> Result<(), RegionError> {
        let guard = self.read_lock()?;
        let mapped = guard.as_ref().ok_or(RegionError::Closed)?;
        mapped.map.unlock()?;
        Ok(())
    }

    /// Flushes (if writable) and unmaps; later calls fail with `Closed`.
    ///
    /// Closing twice is harmless.
    pub fn close(&self) -> Result<(), RegionError> {
        let mut guard = self.write_lock()?;
        if let Some(mapped) = guard.take() {
            if let Mapping::Writable(map) = &mapped.map {
                map.flush()?;
            }
            debug!(len = self.len, "region closed");
        }
        Ok(())
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Current cursor position, or `None` once closed.
    pub fn position(&self) -> Option<usize> {
        self.inner
            .read()
            .ok()
            .and_then(|g| g.as_ref().map(|m| m.cursor))
    }

    /// Returns `true` if the region accepts writes.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns `true` after [`MappedRegion::close`].
    pub fn is_closed(&self) -> bool {
        self.inner.read().map_or(true, |g| g.is_none())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Pins the mapping if configured; returns whether it is now pinned.
    fn pin(&self, map: &Mapping) -> bool {
        if !self.pin_writes {
            return false;
        }
        match map.lock() {
            Ok(()) => true,
            Err(e) => {
                if !self.pin_warned.swap(true, Ordering::Relaxed) {
                    debug!(error = %e, "mlock unavailable, writing unpinned");
                }
                false
            }
        }
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, Option<Mapped>>, RegionError> {
        self.inner.read().map_err(|_| {
            error!("region lock poisoned");
            RegionError::Internal("RwLock poisoned".into())
        })
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, Option<Mapped>>, RegionError> {
        self.inner.write().map_err(|_| {
            error!("region lock poisoned");
            RegionError::Internal("RwLock poisoned".into())
        })
    }
}
