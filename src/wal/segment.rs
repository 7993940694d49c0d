//! A store and an index sharing one base offset.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use super::index::Index;
use super::store::{LEN_WIDTH, Store};
use super::{LogConfig, WalError};

pub struct Segment {
    store: Store,
    index: Index,
    base_offset: u64,

    /// Absolute offset the next append receives.
    next_offset: Mutex<u64>,

    max_store_bytes: u64,
}

impl Segment {
    /// Opens `<base>.store` and `<base>.index` in `dir`, creating them if
    /// needed, and reconciles the index with the store.
    pub fn open(dir: &Path, base_offset: u64, config: &LogConfig) -> Result<Self, WalError> {
        let store = Store::open(dir.join(format!("{base_offset}.store")))?;
        let index = Index::open(
            dir.join(format!("{base_offset}.index")),
            config.max_index_bytes,
        )?;

        let records = reconcile(&store, &index)?;
        debug!(base_offset, records, "segment opened");

        Ok(Self {
            store,
            index,
            base_offset,
            next_offset: Mutex::new(base_offset + records),
            max_store_bytes: config.max_store_bytes,
        })
    }

    /// Appends a record and returns its absolute offset.
    ///
    /// If the index write fails after the store write, the record stays in
    /// the store unindexed and is indexed again by the next open.
    pub fn append(&self, payload: &[u8]) -> Result<u64, WalError> {
        let mut next = self.lock()?;
        if self.index.is_full() {
            return Err(WalError::IndexFull);
        }
        let relative = u32::try_from(*next - self.base_offset).map_err(|_| WalError::IndexFull)?;

        let (_, pos) = self.store.append(payload)?;
        self.index.write(relative, pos)?;

        let offset = *next;
        *next += 1;
        Ok(offset)
    }

    /// Reads the record at absolute `offset`.
    pub fn read(&self, offset: u64) -> Result<Vec<u8>, WalError> {
        if offset < self.base_offset || offset >= self.next_offset() {
            return Err(WalError::OffsetOutOfRange(offset));
        }
        let (_, pos) = self.index.read((offset - self.base_offset) as i64)?;
        self.store.read(pos)
    }

    /// Returns `true` once either file has reached its limit.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.max_store_bytes || self.index.is_full()
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Offset the next append receives.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
            .lock()
            .map_or(self.base_offset, |next| *next)
    }

    /// Number of records.
    pub fn len(&self) -> u64 {
        self.next_offset() - self.base_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last `(relative offset, position)` written to the index.
    pub fn last_entry(&self) -> Result<(u32, u64), WalError> {
        self.index.read(-1)
    }

    pub fn store_size(&self) -> u64 {
        self.store.size()
    }

    /// Makes every appended record durable.
    pub fn sync(&self) -> Result<(), WalError> {
        self.store.sync()?;
        self.index.sync()
    }

    pub fn close(&self) -> Result<(), WalError> {
        self.index.close()?;
        self.store.close()
    }

    /// Closes and deletes both files.
    pub fn remove(&self) -> Result<(), WalError> {
        self.close()?;
        fs::remove_file(self.index.path())?;
        fs::remove_file(self.store.path())?;
        info!(base_offset = self.base_offset, "segment removed");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, u64>, WalError> {
        self.next_offset.lock().map_err(|_| {
            error!("segment offset lock poisoned");
            WalError::Internal("Mutex poisoned".into())
        })
    }
}

/// Brings the index in line with the records actually in the store.
///
/// A crash can leave a torn record at the end of the store, or complete
/// records the index never heard of. The torn tail is cut off; missing
/// entries are written, wrong ones replaced. Returns the record count.
fn reconcile(store: &Store, index: &Index) -> Result<u64, WalError> {
    let size = store.size();
    let mut positions = Vec::new();
    let mut pos = 0u64;
    while pos + LEN_WIDTH <= size {
        let mut prefix = [0u8; LEN_WIDTH as usize];
        store.read_at(&mut prefix, pos)?;
        let Some(end) = (pos + LEN_WIDTH).checked_add(u64::from_be_bytes(prefix)) else {
            break;
        };
        if end > size {
            break;
        }
        positions.push(pos);
        pos = end;
    }

    if pos < size {
        warn!(path = %store.path().display(), valid = pos, size, "truncating torn store record");
        store.truncate(pos)?;
    }

    // Longest prefix of index entries that agree with the store.
    let mut agreed = 0u64;
    while agreed < index.entries() && (agreed as usize) < positions.len() {
        let (off, at) = index.read(agreed as i64)?;
        if u64::from(off) != agreed || at != positions[agreed as usize] {
            break;
        }
        agreed += 1;
    }

    if agreed != index.entries() || agreed as usize != positions.len() {
        warn!(
            path = %index.path().display(),
            indexed = index.entries(),
            records = positions.len(),
            "rebuilding index tail from store"
        );
        index.truncate(agreed)?;
        for (i, &at) in positions.iter().enumerate().skip(agreed as usize) {
            index.write(i as u32, at)?;
        }
    }

    Ok(positions.len() as u64)
}
