use crate::skiplist::NodePool;
use crate::table::{FlushPolicy, Table, TableConfig};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn pool() -> Arc<NodePool> {
    Arc::new(NodePool::new(2, 256))
}

pub fn config(policy: FlushPolicy) -> TableConfig {
    TableConfig {
        flush_policy: policy,
        sstable_capacity: 256 * 1024,
        ..TableConfig::default()
    }
}

pub fn open(dir: &Path, name: &str, config: TableConfig) -> Table {
    Table::open(dir, name, config, pool()).unwrap()
}
