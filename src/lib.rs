//! # Strata
//!
//! An embeddable key-value storage core for named tables. Each table is a
//! **lock-free hashed skip list** in memory, an **append-only row log** in a
//! memory-mapped data file, and optionally a **segmented write-ahead log**.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::{Catalog, FlushPolicy, TableConfig};
//!
//! let catalog = Catalog::open("/tmp/strata").unwrap();
//! let users = catalog
//!     .register(
//!         "users",
//!         TableConfig {
//!             wal_enabled: true,
//!             flush_policy: FlushPolicy::Manual,
//!             ..TableConfig::default()
//!         },
//!     )
//!     .unwrap();
//!
//! // Write
//! users.set(b"alice", b"admin").unwrap();
//!
//! // Read
//! assert_eq!(users.get(b"alice").unwrap(), Some(b"admin".to_vec()));
//!
//! // Visit every key
//! users.range(|key, value| {
//!     println!("{}={}", String::from_utf8_lossy(key), String::from_utf8_lossy(value));
//!     true
//! }).unwrap();
//!
//! // Persist and shut down
//! users.flush().unwrap();
//! catalog.close_all().unwrap();
//! ```
//!
//! ## Features
//!
//! - **First writer wins**: within one memtable generation a key keeps its
//!   first value; a flush opens the key for a new value.
//! - **Configurable flushing**: on every write, past a size threshold, on a
//!   background interval, or only on demand.
//! - **Crash recovery**: with the WAL enabled, unflushed writes are replayed
//!   into the data file on the next open.
//! - **Snapshots**: tables export to and import from uuencoded files.

#![allow(dead_code)]

pub(crate) mod arena;
pub(crate) mod memtable;
pub(crate) mod mmap;
pub(crate) mod skiplist;
pub(crate) mod snapshot;
pub(crate) mod sstable;
pub(crate) mod table;
pub(crate) mod wal;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{error, info};

pub use skiplist::NodePool;
pub use table::{FlushPolicy, Table, TableConfig, TableError};
pub use wal::LogConfig;

/// A single key-value pair returned by [`Table::scan`].
pub type KeyValue = (Vec<u8>, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// Catalog
// ------------------------------------------------------------------------------------------------

/// The registry of open tables in one data directory.
///
/// Build one per process and pass it by reference. It owns the
/// [`NodePool`] every table's memtable draws its skip lists from.
///
/// # Shutdown
///
/// Call [`Catalog::close_all`] for a graceful shutdown. Tables still open
/// when the catalog and every outstanding handle are dropped close
/// themselves and only log errors.
pub struct Catalog {
    data_dir: PathBuf,
    pool: Arc<NodePool>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("data_dir", &self.data_dir)
            .field("tables", &self.names())
            .finish_non_exhaustive()
    }
}

impl Catalog {
    /// Creates `data_dir` if needed and returns a catalog rooted there with
    /// a default node pool.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, TableError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        Ok(Self::with_pool(data_dir, Arc::new(NodePool::default())))
    }

    /// Creates a catalog that hands `pool` to every table.
    ///
    /// The directory is created when the first persistent table opens.
    pub fn with_pool(data_dir: impl AsRef<Path>, pool: Arc<NodePool>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            pool,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Opens table `name` with `config` and registers it.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidArgument`] if `name` is already
    /// registered, and any error from [`Table::open`].
    pub fn register(&self, name: &str, config: TableConfig) -> Result<Arc<Table>, TableError> {
        let mut tables = self.write_tables()?;
        if tables.contains_key(name) {
            return Err(TableError::InvalidArgument(format!(
                "table {name:?} is already registered"
            )));
        }

        let table = Arc::new(Table::open(
            &self.data_dir,
            name,
            config,
            Arc::clone(&self.pool),
        )?);
        tables.insert(name.to_string(), Arc::clone(&table));

        info!(table = name, registered = tables.len(), "table registered");
        Ok(table)
    }

    /// Returns the open table `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().ok()?.get(name).cloned()
    }

    /// Closes table `name` and removes it from the catalog.
    ///
    /// Returns `false` if no such table was registered.
    pub fn close(&self, name: &str) -> Result<bool, TableError> {
        let Some(table) = self.write_tables()?.remove(name) else {
            return Ok(false);
        };
        table.close()?;
        Ok(true)
    }

    /// Closes every table. All are attempted; the first error is returned.
    pub fn close_all(&self) -> Result<(), TableError> {
        let drained: Vec<(String, Arc<Table>)> = self.write_tables()?.drain().collect();

        let mut first = None;
        for (name, table) in drained {
            if let Err(e) = table.close() {
                error!(table = %name, error = %e, "table close failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Registered table names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read_tables()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn read_tables(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Arc<Table>>>, TableError> {
        self.tables.read().map_err(|_| {
            error!("catalog lock poisoned");
            TableError::Internal("RwLock poisoned".into())
        })
    }

    fn write_tables(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<String, Arc<Table>>>, TableError> {
        self.tables.write().map_err(|_| {
            error!("catalog lock poisoned");
            TableError::Internal("RwLock poisoned".into())
        })
    }
}
