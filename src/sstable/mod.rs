//! Sorted String Table (SSTable) Module
//!
//! The persisted layer of a table: an **append-only row log** inside a
//! pre-sized, memory-mapped `.dat` file, plus an **in-memory index** from
//! raw key to the row's `(offset, length)`.
//!
//! "Sorted" refers to the in-memory index only; rows sit on disk in write
//! order and are never rewritten.
//!
//! # On-disk layout
//!
//! ```text
//! begin 0755 <file name>\n          header line
//! key::value;\n                     rows, appended in write order
//! key::value;\n
//! ...
//! \0\0\0 ...                        zeroed ballast up to the configured capacity
//! \nend\n                           footer (never mapped)
//! ```
//!
//! # Recovery
//!
//! The index is not persisted. Opening an existing file scans rows from the
//! end of the header until the first byte that cannot start a complete row;
//! the last row for a key wins, and the write cursor is placed after the last
//! complete row so a torn trailing row is overwritten by the next append.
//!
//! # Concurrency model
//!
//! - Reads take the index read lock, then peek the region under its own
//!   read lock.
//! - `set` holds the index write lock across the append so the index always
//!   points at the newest row for a key.
//!
//! # Failure model
//!
//! I/O and capacity errors propagate. A row that fails to decode is a miss,
//! logged at `warn`, never a panic.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod row;


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::mmap::{MappedRegion, RegionError, RegionOptions};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Every data file starts with this, followed by the file name and `\n`.
pub const HEADER_PREFIX: &[u8] = b"begin 0755 ";

/// Last bytes of every data file.
pub const FOOTER: &[u8] = b"\nend\n";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`SSTable`] operations.
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Mapped region failure, including a full region.
    #[error("region error: {0}")]
    Region(#[from] RegionError),

    /// The key or value cannot be represented as a row.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// The file does not have the expected header or footer.
    #[error("corrupt data file: {0}")]
    Corrupt(String),

    /// Poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Core types
// ------------------------------------------------------------------------------------------------

/// Location of a row inside the mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexValue {
    pub offset: usize,
    pub len: usize,
}

/// Append-only row log with an in-memory key index.
pub struct SSTable {
    path: PathBuf,
    region: MappedRegion,
    index: RwLock<BTreeMap<Vec<u8>, IndexValue>>,

    /// First byte after the header line.
    data_start: usize,
}

impl SSTable {
    /// Opens the data file at `path`, creating it with room for `capacity`
    /// row bytes if it does not exist, and rebuilds the index.
    pub fn open(
        path: impl AsRef<Path>,
        capacity: usize,
        pin_writes: bool,
    ) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut file_len = file.metadata()?.len();
        if file_len == 0 {
            file_len = Self::initialize(&mut file, path, capacity)?;
        }

        // 1. Footer check.
        let footer_len = FOOTER.len() as u64;
        if file_len <= footer_len {
            return Err(SSTableError::Corrupt(format!(
                "{} is {file_len} bytes, too short for a data file",
                path.display()
            )));
        }
        let mut footer = [0u8; FOOTER.len()];
        file.seek(SeekFrom::Start(file_len - footer_len))?;
        file.read_exact(&mut footer)?;
        if footer != FOOTER {
            return Err(SSTableError::Corrupt(format!(
                "{} is missing its footer",
                path.display()
            )));
        }

        // 2. Map everything before the footer.
        let map_len = usize::try_from(file_len - footer_len)
            .map_err(|_| SSTableError::Corrupt("data file too large to map".into()))?;
        let region = MappedRegion::open(
            file,
            &RegionOptions {
                len: Some(map_len),
                pin_writes,
                ..RegionOptions::default()
            },
        )?;

        // 3. Header and row scan.
        let (data_start, data_end, index) = region.view(|bytes| -> Result<_, SSTableError> {
            let data_start = header_len(bytes).ok_or_else(|| {
                SSTableError::Corrupt(format!("{} has no valid header", path.display()))
            })?;

            let mut index = BTreeMap::new();
            let mut rows = row::rows(&bytes[data_start..]);
            for raw in rows.by_ref() {
                index.insert(
                    raw.key.to_vec(),
                    IndexValue {
                        offset: data_start + raw.offset,
                        len: raw.len,
                    },
                );
            }
            Ok((data_start, data_start + rows.consumed(), index))
        })??;

        // 4. Resume appending after the last complete row.
        region.seek(SeekFrom::Start(data_end as u64))?;

        info!(
            path = %path.display(),
            keys = index.len(),
            data_bytes = data_end - data_start,
            capacity = map_len - data_start,
            "sstable opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            region,
            index: RwLock::new(index),
            data_start,
        })
    }

    /// Writes header, ballast, and footer into an empty file.
    fn initialize(
        file: &mut std::fs::File,
        path: &Path,
        capacity: usize,
    ) -> Result<u64, SSTableError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = format!("begin 0755 {name}\n");
        let total = (header.len() + capacity + FOOTER.len()) as u64;

        file.set_len(total)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header.as_bytes())?;
        file.seek(SeekFrom::End(-(FOOTER.len() as i64)))?;
        file.write_all(FOOTER)?;
        file.sync_all()?;

        debug!(path = %path.display(), capacity, "sstable file created");
        Ok(total)
    }

    // --------------------------------------------------------------------------------------------
    // Point operations
    // --------------------------------------------------------------------------------------------

    /// Returns the newest value stored for `key`.
    ///
    /// A row that cannot be read back intact is reported as a miss.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SSTableError> {
        let Some(location) = self.read_index()?.get(key).copied() else {
            return Ok(None);
        };
        self.read_row(key, location)
    }

    /// Appends a row for `key` and points the index at it.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), SSTableError> {
        row::validate(key, value)?;
        let encoded = row::encode(key, value);

        let mut index = self.write_index()?;
        let (len, offset) = self.region.append(&encoded)?;
        index.insert(key.to_vec(), IndexValue { offset, len });

        trace!(offset, len, "sstable set");
        Ok(())
    }

    /// Unmaps the file and drops the index.
    ///
    /// Later writes fail with a closed-region error; later reads miss.
    pub fn free(&self) -> Result<(), SSTableError> {
        self.region.close()?;
        self.write_index()?.clear();
        info!(path = %self.path.display(), "sstable freed");
        Ok(())
    }

    /// Flushes written rows to disk.
    pub fn flush(&self) -> Result<(), SSTableError> {
        Ok(self.region.flush()?)
    }

    // --------------------------------------------------------------------------------------------
    // Traversal and stats
    // --------------------------------------------------------------------------------------------

    /// Visits every indexed key in byte order until `visit` returns `false`.
    ///
    /// Works on a snapshot of the index, so `visit` may call back into the
    /// table.
    pub fn range<F>(&self, mut visit: F) -> Result<(), SSTableError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let snapshot: Vec<(Vec<u8>, IndexValue)> = self
            .read_index()?
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        for (key, location) in snapshot {
            if let Some(value) = self.read_row(&key, location)? {
                if !visit(&key, &value) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.index.read().map_or(0, |i| i.len())
    }

    /// Returns `true` if no key has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row bytes still available before the region is full.
    pub fn remaining(&self) -> usize {
        self.region
            .position()
            .map_or(0, |pos| self.region.len().saturating_sub(pos))
    }

    /// Row bytes written so far.
    pub fn data_len(&self) -> usize {
        self.region
            .position()
            .map_or(0, |pos| pos.saturating_sub(self.data_start))
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Reads and decodes the row at `location`, expecting it to hold `key`.
    fn read_row(&self, key: &[u8], location: IndexValue) -> Result<Option<Vec<u8>>, SSTableError> {
        let mut buf = vec![0u8; location.len];
        match self.region.peek(&mut buf, location.offset, location.len) {
            Ok(_) => {}
            Err(RegionError::OutOfBounds { .. }) => {
                warn!(offset = location.offset, "sstable row out of bounds");
                return Ok(None);
            }
            Err(RegionError::Closed) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match row::decode(&buf) {
            Some((k, v)) if k == key => Ok(Some(v.to_vec())),
            _ => {
                warn!(offset = location.offset, len = location.len, "malformed sstable row");
                Ok(None)
            }
        }
    }

    fn read_index(
        &self,
    ) -> Result<RwLockReadGuard<'_, BTreeMap<Vec<u8>, IndexValue>>, SSTableError> {
        self.index.read().map_err(|_| {
            error!("sstable index lock poisoned");
            SSTableError::Internal("RwLock poisoned".into())
        })
    }

    fn write_index(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<Vec<u8>, IndexValue>>, SSTableError> {
        self.index.write().map_err(|_| {
            error!("sstable index lock poisoned");
            SSTableError::Internal("RwLock poisoned".into())
        })
    }
}

/// Length of a valid `begin 0755 <name>\n` header line at the start of `bytes`.
fn header_len(bytes: &[u8]) -> Option<usize> {
    if !bytes.starts_with(HEADER_PREFIX) {
        return None;
    }
    let newline = bytes.iter().position(|&b| b == b'\n')?;
    (newline > HEADER_PREFIX.len()).then_some(newline + 1)
}
