//! Offset index: fixed-width entries in a memory-mapped file.
//!
//! ```text
//! [u32 BE relative offset][u64 BE store position]   12 bytes per entry
//! ```
//!
//! The file is grown to its maximum size while open so entries can be
//! appended through the mapping, and truncated back to the written size on
//! close. A file found at full size was not closed cleanly; its written
//! size is recovered from the entries themselves.

use std::fs::{File, OpenOptions};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::WalError;
use crate::mmap::{MappedRegion, RegionOptions};

const OFF_WIDTH: u64 = 4;
const POS_WIDTH: u64 = 8;

/// Width of one index entry.
pub const ENTRY_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

pub struct Index {
    path: PathBuf,
    region: MappedRegion,

    /// Kept for truncating after the mapping is gone.
    file: File,

    size: AtomicU64,
    max_bytes: u64,
}

impl Index {
    /// Opens or creates the index at `path`, mapping `max_bytes`.
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self, WalError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let on_disk = file.metadata()?.len();
        let unclean = on_disk == max_bytes && on_disk > 0;
        file.set_len(max_bytes)?;

        let region = MappedRegion::open(
            file.try_clone()?,
            &RegionOptions {
                len: Some(max_bytes as usize),
                pin_writes: false,
                ..RegionOptions::default()
            },
        )?;

        let size = if unclean {
            let size = region.view(recover_size)?;
            warn!(path = %path.display(), size, "index not closed cleanly, recovered size");
            size
        } else {
            let kept = on_disk.min(max_bytes);
            kept - kept % ENTRY_WIDTH
        };
        region.seek(SeekFrom::Start(size))?;

        debug!(path = %path.display(), entries = size / ENTRY_WIDTH, "index opened");
        Ok(Self {
            path: path.to_path_buf(),
            region,
            file,
            size: AtomicU64::new(size),
            max_bytes,
        })
    }

    /// Reads entry `n`, or the last entry when `n == -1`.
    pub fn read(&self, n: i64) -> Result<(u32, u64), WalError> {
        let size = self.size();
        if size == 0 {
            return Err(WalError::Eof);
        }
        let entry = match n {
            -1 => size / ENTRY_WIDTH - 1,
            n if n >= 0 => n as u64,
            _ => return Err(WalError::Eof),
        };
        let at = entry.checked_mul(ENTRY_WIDTH).ok_or(WalError::Eof)?;
        if at.checked_add(ENTRY_WIDTH).is_none_or(|end| end > size) {
            return Err(WalError::Eof);
        }

        let mut buf = [0u8; ENTRY_WIDTH as usize];
        self.region
            .peek(&mut buf, at as usize, ENTRY_WIDTH as usize)?;
        Ok(decode_entry(&buf))
    }

    /// Appends an entry.
    pub fn write(&self, off: u32, pos: u64) -> Result<(), WalError> {
        if self.is_full() {
            return Err(WalError::IndexFull);
        }
        let mut buf = [0u8; ENTRY_WIDTH as usize];
        buf[..OFF_WIDTH as usize].copy_from_slice(&off.to_be_bytes());
        buf[OFF_WIDTH as usize..].copy_from_slice(&pos.to_be_bytes());

        self.region.append(&buf)?;
        self.size.fetch_add(ENTRY_WIDTH, Ordering::AcqRel);
        Ok(())
    }

    /// Keeps the first `entries` entries and drops the rest.
    pub fn truncate(&self, entries: u64) -> Result<(), WalError> {
        let size = entries.saturating_mul(ENTRY_WIDTH).min(self.size());
        self.region.seek(SeekFrom::Start(size))?;
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    /// Flushes written entries to the file.
    pub fn sync(&self) -> Result<(), WalError> {
        Ok(self.region.flush()?)
    }

    /// Syncs, unmaps, and trims the file to the written entries.
    pub fn close(&self) -> Result<(), WalError> {
        if self.region.is_closed() {
            return Ok(());
        }
        self.region.flush()?;
        self.region.close()?;
        self.file.set_len(self.size())?;
        self.file.sync_all()?;
        debug!(path = %self.path.display(), size = self.size(), "index closed");
        Ok(())
    }

    /// Bytes of written entries.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn entries(&self) -> u64 {
        self.size() / ENTRY_WIDTH
    }

    /// Returns `true` when another entry would not fit.
    pub fn is_full(&self) -> bool {
        self.size() + ENTRY_WIDTH > self.max_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn decode_entry(buf: &[u8; ENTRY_WIDTH as usize]) -> (u32, u64) {
    let mut off = [0u8; OFF_WIDTH as usize];
    let mut pos = [0u8; POS_WIDTH as usize];
    off.copy_from_slice(&buf[..OFF_WIDTH as usize]);
    pos.copy_from_slice(&buf[OFF_WIDTH as usize..]);
    (u32::from_be_bytes(off), u64::from_be_bytes(pos))
}

/// Counts leading entries that look written: entry `i` has relative offset
/// `i` and a position past the previous one.
///
/// Entry 0 of a written index is all zeroes, which is indistinguishable
/// from an empty slot; the segment settles that against its store.
fn recover_size(bytes: &[u8]) -> u64 {
    let mut entries = 0u64;
    let mut last_pos = 0u64;
    for chunk in bytes.chunks_exact(ENTRY_WIDTH as usize) {
        let mut buf = [0u8; ENTRY_WIDTH as usize];
        buf.copy_from_slice(chunk);
        let (off, pos) = decode_entry(&buf);
        if u64::from(off) != entries || (entries > 0 && pos <= last_pos) {
            break;
        }
        last_pos = pos;
        entries += 1;
    }
    entries * ENTRY_WIDTH
}
