use crate::wal::{Log, LogConfig};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config whose segments hold at most `records` entries.
pub fn config_with_entries(records: u64) -> LogConfig {
    LogConfig {
        max_store_bytes: 1 << 20,
        max_index_bytes: records * crate::wal::ENTRY_WIDTH,
        initial_offset: 0,
    }
}

/// Replay every record of `log` into a `Vec`.
pub fn collect(log: &Log) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::new();
    log.replay(|off, record| {
        out.push((off, record.to_vec()));
        true
    })
    .unwrap();
    out
}

/// Names of the files in `dir`, sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}
