//! # Table Module
//!
//! The storage contract the dispatch layer calls: `get`, `set`, `range`,
//! `print`, `close`. A table combines a [`MemTable`], an [`SSTable`] in
//! `<dir>/<name>.dat`, and, when enabled, a write-ahead [`Log`] in
//! `<dir>/<name>.wal/`.
//!
//! ## Write path
//!
//! 1. Validate the row.
//! 2. Insert into the memtable. Within one memtable generation the first
//!    writer of a key wins and later sets of that key are dropped.
//! 3. If this write won and the WAL is enabled, append the row to the log.
//! 4. Flush if the [`FlushPolicy`] asks for it.
//!
//! ## Read path
//!
//! The memtable (including a generation still being drained) first, then
//! the SSTable.
//!
//! ## Recovery
//!
//! Opening a table with the WAL enabled replays the log, in offset order,
//! into the SSTable, syncs it, and resets the log. After every flush the
//! log segments whose records are all on disk are deleted, and a clean
//! close resets the log.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::KeyValue;
use crate::memtable::{MemTable, MemtableError};
use crate::skiplist::NodePool;
use crate::snapshot::{self, SnapshotError};
use crate::sstable::{SSTable, SSTableError, row};
use crate::wal::{Log, LogConfig, WalError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Table`] operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// The table has been closed.
    #[error("table is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key, value, or name constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// A WAL append failed; the table refuses further work until reopened.
    #[error("table failed after a WAL error; reopen it to recover")]
    Failed,

    /// Decoded data does not consist of whole rows.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// When the memtable is drained into the SSTable.
///
/// A key keeps its first value for the life of a memtable generation, and
/// every flush starts a new generation. Under [`FlushPolicy::EveryWrite`]
/// each `set` therefore lands in a fresh generation and a sequential
/// overwrite is visible at once. Under the batching policies a later `set`
/// of a key already written in the current generation is dropped until the
/// next flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Flush inside every `set` call.
    #[default]
    EveryWrite,

    /// Flush once the memtable holds at least this many key and value
    /// bytes.
    SizeThreshold(usize),

    /// Flush from a background thread on a fixed interval.
    Periodic(Duration),

    /// Flush only when [`Table::flush`] or [`Table::close`] is called.
    Manual,
}

/// Configuration for a [`Table`].
///
/// # Example
///
/// ```rust
/// use strata::{FlushPolicy, TableConfig};
///
/// let config = TableConfig {
///     wal_enabled: true,
///     flush_policy: FlushPolicy::Manual,
///     ..TableConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Keep everything in the memtable; no files are created.
    ///
    /// With nothing to flush into, the memtable is never swapped, so the
    /// first value set for a key is the one kept.
    ///
    /// Default: `false`.
    pub in_memory: bool,

    /// Log every winning write before it can be flushed.
    ///
    /// Default: `false`. Not allowed together with `in_memory`.
    pub wal_enabled: bool,

    /// Default: [`FlushPolicy::EveryWrite`].
    pub flush_policy: FlushPolicy,

    /// Row bytes reserved in a new data file. Writes fail once it is full.
    ///
    /// Default: 4 MiB.
    pub sstable_capacity: usize,

    /// Segment sizing of the WAL.
    ///
    /// Default: 64 KiB stores, 4096 entries per index.
    pub log: LogConfig,

    /// Memory-lock the data file mapping around every row write.
    ///
    /// Default: `false`.
    pub pin_writes: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            in_memory: false,
            wal_enabled: false,
            flush_policy: FlushPolicy::default(),
            sstable_capacity: 4 * 1024 * 1024,
            log: LogConfig {
                max_store_bytes: 64 * 1024,
                max_index_bytes: 4096 * crate::wal::ENTRY_WIDTH,
                initial_offset: 0,
            },
            pin_writes: false,
        }
    }
}

impl TableConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), TableError> {
        if self.in_memory && self.wal_enabled {
            return Err(TableError::InvalidConfig(
                "an in-memory table cannot have a WAL".into(),
            ));
        }
        if !self.in_memory && self.sstable_capacity == 0 {
            return Err(TableError::InvalidConfig(
                "sstable_capacity must be > 0".into(),
            ));
        }
        match self.flush_policy {
            FlushPolicy::SizeThreshold(0) => {
                return Err(TableError::InvalidConfig(
                    "flush size threshold must be > 0".into(),
                ));
            }
            FlushPolicy::Periodic(interval) if interval.is_zero() => {
                return Err(TableError::InvalidConfig(
                    "flush interval must be > 0".into(),
                ));
            }
            _ => {}
        }
        if self.wal_enabled {
            self.log
                .validate()
                .map_err(|e| TableError::InvalidConfig(e.to_string()))?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// State shared between a [`Table`] handle and its flusher thread.
struct Core {
    name: String,
    config: TableConfig,
    memtable: MemTable,

    /// `None` for in-memory tables.
    sstable: Option<SSTable>,
    wal: Option<Log>,

    closed: AtomicBool,

    /// Set when a write reached the memtable but not the WAL.
    failed: AtomicBool,
}

impl Core {
    fn check_open(&self) -> Result<(), TableError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TableError::Closed);
        }
        if self.is_failed() {
            return Err(TableError::Failed);
        }
        Ok(())
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Drains the memtable into the SSTable, then drops WAL segments the
    /// flush made redundant.
    fn flush(&self) -> Result<usize, TableError> {
        if self.is_failed() {
            return Err(TableError::Failed);
        }
        let Some(sstable) = &self.sstable else {
            return Ok(0);
        };

        // Records up to here were applied to the memtable before the drain
        // began, so the drain covers them.
        let covered = match &self.wal {
            Some(wal) => wal.highest_offset()?,
            None => None,
        };

        let rows = self.memtable.flush(sstable)?;

        if let (Some(wal), Some(covered)) = (&self.wal, covered) {
            wal.truncate(covered + 1)?;
        }
        if rows > 0 {
            debug!(table = %self.name, rows, "table flushed");
        }
        Ok(rows)
    }

    fn flush_if_due(&self) -> Result<(), TableError> {
        let due = match self.config.flush_policy {
            FlushPolicy::EveryWrite => true,
            FlushPolicy::SizeThreshold(limit) => self.memtable.approximate_size() >= limit,
            FlushPolicy::Periodic(_) | FlushPolicy::Manual => false,
        };
        if due {
            self.flush()?;
        }
        Ok(())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<bool, TableError> {
        row::validate(key, value)?;
        let won = self.memtable.set(key, value)?;
        if won {
            if let Some(wal) = &self.wal {
                if let Err(e) = wal.append(&row::encode(key, value)) {
                    // The row is in the memtable but not logged; it must
                    // never reach the data file.
                    self.failed.store(true, Ordering::Release);
                    error!(table = %self.name, error = %e, "WAL append failed, table marked failed");
                    return Err(e.into());
                }
            }
        }
        Ok(won)
    }

    /// Visits each live key once, memtable values taking precedence.
    fn range<F>(&self, mut visit: F) -> Result<(), TableError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut stopped = false;

        self.memtable.range(|key, value| {
            if !seen.insert(key.to_vec()) {
                return true;
            }
            stopped = !visit(key, value);
            !stopped
        });
        if stopped {
            return Ok(());
        }

        if let Some(sstable) = &self.sstable {
            sstable.range(|key, value| {
                if seen.contains(key) {
                    return true;
                }
                visit(key, value)
            })?;
        }
        Ok(())
    }
}

/// Background flusher for [`FlushPolicy::Periodic`].
struct Flusher {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl Flusher {
    fn spawn(core: Arc<Core>, interval: Duration) -> Result<Self, TableError> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let ticker = channel::tick(interval);
        let name = core.name.clone();

        let handle = thread::Builder::new()
            .name(format!("strata-flush-{name}"))
            .spawn(move || {
                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => {
                            if core.is_failed() {
                                break;
                            }
                            if let Err(e) = core.flush() {
                                error!(table = %core.name, error = %e, "background flush failed");
                            }
                        }
                        recv(stopped) -> _ => break,
                    }
                }
                debug!(table = %core.name, "flusher stopped");
            })?;

        debug!(table = %name, ?interval, "flusher started");
        Ok(Self { stop, handle })
    }

    fn shutdown(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            error!("flusher thread panicked");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table handle
// ------------------------------------------------------------------------------------------------

/// A named key-value table.
///
/// `Table` is `Send + Sync`; share it across threads through an `Arc`.
///
/// If the handle is dropped without calling [`Table::close`], the
/// destructor closes it and logs any error.
pub struct Table {
    core: Arc<Core>,
    flusher: Mutex<Option<Flusher>>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.core.name)
            .field("closed", &self.core.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Opens (or creates) the table `name` in `dir`.
    ///
    /// With the WAL enabled, records left by a previous run are replayed
    /// into the SSTable before the table is returned.
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        config: TableConfig,
        pool: Arc<NodePool>,
    ) -> Result<Self, TableError> {
        config.validate()?;
        validate_name(name)?;
        let dir = dir.as_ref();

        let memtable = MemTable::new(pool)?;
        let (sstable, wal) = if config.in_memory {
            (None, None)
        } else {
            std::fs::create_dir_all(dir)?;
            let sstable = SSTable::open(
                data_path(dir, name),
                config.sstable_capacity,
                config.pin_writes,
            )?;
            let wal = if config.wal_enabled {
                let log = Log::open(wal_path(dir, name), config.log.clone())?;
                replay(name, &log, &sstable)?;
                Some(log)
            } else {
                None
            };
            (Some(sstable), wal)
        };

        let core = Arc::new(Core {
            name: name.to_string(),
            config,
            memtable,
            sstable,
            wal,
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });

        let flusher = match core.config.flush_policy {
            FlushPolicy::Periodic(interval) if !core.config.in_memory => {
                Some(Flusher::spawn(Arc::clone(&core), interval)?)
            }
            _ => None,
        };

        info!(
            table = name,
            in_memory = core.config.in_memory,
            wal = core.config.wal_enabled,
            policy = ?core.config.flush_policy,
            "table opened"
        );

        Ok(Self {
            core,
            flusher: Mutex::new(flusher),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Point operations
    // --------------------------------------------------------------------------------------------

    /// Returns the current value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TableError> {
        self.core.check_open()?;
        if let Some(value) = self.core.memtable.get(key) {
            return Ok(Some(value));
        }
        match &self.core.sstable {
            Some(sstable) => Ok(sstable.get(key)?),
            None => Ok(None),
        }
    }

    /// Writes `key`, then flushes if the policy calls for it.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::SSTable`] with an invalid-row error if the pair
    /// cannot be stored as a row (see [`crate::sstable::row::validate`]).
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        self.core.check_open()?;
        self.core.set(key, value)?;
        self.core.flush_if_due()
    }

    /// Writes every pair, checking the flush policy once at the end.
    ///
    /// All pairs are validated before any is written.
    pub fn set_batch<K, V>(&self, pairs: &[(K, V)]) -> Result<(), TableError>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.core.check_open()?;
        for (key, value) in pairs {
            row::validate(key.as_ref(), value.as_ref())?;
        }
        for (key, value) in pairs {
            self.core.set(key.as_ref(), value.as_ref())?;
        }
        self.core.flush_if_due()
    }

    // --------------------------------------------------------------------------------------------
    // Traversal
    // --------------------------------------------------------------------------------------------

    /// Visits every live key once until `visit` returns `false`.
    ///
    /// Memtable entries come first, in hashed-key order, then SSTable
    /// entries in byte order.
    pub fn range<F>(&self, visit: F) -> Result<(), TableError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.core.check_open()?;
        self.core.range(visit)
    }

    /// Returns up to `limit` pairs with `start <= key <= end`, sorted by key.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<KeyValue>, TableError> {
        self.core.check_open()?;
        if start > end {
            return Ok(Vec::new());
        }

        let mut hits = BTreeMap::new();
        self.core.range(|key, value| {
            if key >= start && key <= end {
                hits.insert(key.to_vec(), value.to_vec());
            }
            true
        })?;

        Ok(hits.into_iter().take(limit.unwrap_or(usize::MAX)).collect())
    }

    /// Number of distinct live keys.
    pub fn count(&self) -> Result<usize, TableError> {
        self.core.check_open()?;
        let mut n = 0;
        self.core.range(|_, _| {
            n += 1;
            true
        })?;
        Ok(n)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Drains the memtable into the SSTable now. Returns rows written.
    pub fn flush(&self) -> Result<usize, TableError> {
        self.core.check_open()?;
        self.core.flush()
    }

    /// Makes every logged write durable. A no-op without a WAL.
    pub fn sync(&self) -> Result<(), TableError> {
        self.core.check_open()?;
        if let Some(wal) = &self.core.wal {
            wal.sync()?;
        }
        Ok(())
    }

    /// Writes a summary of the table to stdout.
    pub fn print(&self) -> Result<(), TableError> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write_summary(&mut out)
    }

    /// Writes a summary of the table and the memtable's levels to `out`.
    pub fn write_summary<W: Write>(&self, out: &mut W) -> Result<(), TableError> {
        self.core.check_open()?;
        let core = &self.core;

        writeln!(out, "table {}", core.name)?;
        writeln!(out, "  policy: {:?}", core.config.flush_policy)?;
        match &core.sstable {
            Some(sstable) => writeln!(
                out,
                "  sstable: {} keys, {} bytes used, {} bytes free",
                sstable.len(),
                sstable.data_len(),
                sstable.remaining()
            )?,
            None => writeln!(out, "  sstable: none (in-memory)")?,
        }
        if let Some(wal) = &core.wal {
            writeln!(
                out,
                "  wal: {} segments, offsets {}..={}",
                wal.segment_count(),
                wal.lowest_offset()?,
                wal.highest_offset()?
                    .map_or_else(|| "-".to_string(), |o| o.to_string())
            )?;
        }
        write!(out, "{}", core.memtable)?;
        Ok(())
    }

    /// Writes every live pair, sorted by key, to a snapshot at `path`.
    ///
    /// Returns the number of pairs written.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<usize, TableError> {
        self.core.check_open()?;
        let pairs = self.scan_all()?;

        let mut data = Vec::new();
        for (key, value) in &pairs {
            data.extend_from_slice(&row::encode(key, value));
        }

        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        snapshot::encode(&mut writer, &format!("{}.dat", self.core.name), &data)?;
        writer.get_ref().sync_all()?;

        info!(table = %self.core.name, pairs = pairs.len(), path = %path.as_ref().display(), "table exported");
        Ok(pairs.len())
    }

    /// Writes every pair of the snapshot at `path` into this table.
    ///
    /// Returns the number of pairs read.
    pub fn import(&self, path: impl AsRef<Path>) -> Result<usize, TableError> {
        self.core.check_open()?;
        let (_, data) = snapshot::decode(BufReader::new(File::open(path.as_ref())?))?;

        let mut rows = row::rows(&data);
        let pairs: Vec<(&[u8], &[u8])> = rows.by_ref().map(|r| (r.key, r.value)).collect();
        if rows.consumed() != data.len() {
            return Err(TableError::Corrupt(format!(
                "snapshot has {} trailing bytes that are not a row",
                data.len() - rows.consumed()
            )));
        }

        self.set_batch(&pairs)?;
        info!(table = %self.core.name, pairs = pairs.len(), path = %path.as_ref().display(), "table imported");
        Ok(pairs.len())
    }

    /// Stops the flusher, flushes the memtable, unmaps the data file, and
    /// closes the WAL.
    ///
    /// A table marked [`TableError::Failed`] is closed without the flush,
    /// leaving its WAL to be replayed by the next open.
    ///
    /// Later operations return [`TableError::Closed`]. Calling `close`
    /// more than once is harmless.
    pub fn close(&self) -> Result<(), TableError> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let flusher = self
            .flusher
            .lock()
            .map_err(|_| TableError::Internal("Mutex poisoned".into()))?
            .take();
        if let Some(flusher) = flusher {
            flusher.shutdown();
        }

        if self.core.is_failed() {
            // Skip the flush and keep the log: logged rows replay on the
            // next open, the unlogged one is dropped with the memtable.
            warn!(table = %self.core.name, "closing failed table without flush");
            if let Some(sstable) = &self.core.sstable {
                sstable.free()?;
            }
            if let Some(wal) = &self.core.wal {
                wal.close()?;
            }
            return Ok(());
        }

        self.core.flush()?;
        if let Some(sstable) = &self.core.sstable {
            sstable.free()?;
        }
        if let Some(wal) = &self.core.wal {
            // Everything logged is in the data file now.
            wal.reset()?;
            wal.close()?;
        }

        info!(table = %self.core.name, "table closed");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn config(&self) -> &TableConfig {
        &self.core.config
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    fn scan_all(&self) -> Result<Vec<KeyValue>, TableError> {
        let mut all = BTreeMap::new();
        self.core.range(|key, value| {
            all.insert(key.to_vec(), value.to_vec());
            true
        })?;
        Ok(all.into_iter().collect())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                error!(table = %self.core.name, error = %e, "close on drop failed");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Path of the data file of table `name`.
pub fn data_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.dat"))
}

/// Path of the WAL directory of table `name`.
pub fn wal_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.wal"))
}

fn validate_name(name: &str) -> Result<(), TableError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(TableError::InvalidArgument(format!(
            "invalid table name {name:?}"
        )));
    }
    Ok(())
}

/// Applies every logged row to `sstable`, then empties the log.
fn replay(name: &str, log: &Log, sstable: &SSTable) -> Result<(), TableError> {
    let mut failure = None;
    let mut applied = 0usize;

    let visited = log.replay(|offset, record| {
        let Some((key, value)) = row::decode(record) else {
            warn!(table = name, offset, "skipping malformed WAL record");
            return true;
        };
        match sstable.set(key, value) {
            Ok(()) => {
                applied += 1;
                true
            }
            Err(e) => {
                failure = Some(e);
                false
            }
        }
    })?;
    if let Some(e) = failure {
        return Err(e.into());
    }

    sstable.flush()?;
    log.reset()?;
    if visited > 0 {
        info!(table = name, records = visited, applied, "WAL replayed");
    }
    Ok(())
}
