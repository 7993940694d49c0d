//! Point reads and writes through the table facade.
//!
//! ## See also
//! - [`tests_flush`]: flush policies
//! - [`tests_wal`]: recovery through the write-ahead log

#[cfg(test)]
mod tests {
    use crate::sstable::SSTableError;
    use crate::table::tests::helpers::{config, init_tracing, open, pool};
    use crate::table::{FlushPolicy, Table, TableConfig, TableError};
    use tempfile::TempDir;

    /// # Scenario
    /// New table; `set("a", "1")`.
    ///
    /// # Expected behavior
    /// `get("a")` returns `"1"`; `get("b")` misses.
    #[test]
    fn test_set_then_get() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let table = open(tmp.path(), "default", config(FlushPolicy::default()));

        table.set(b"a", b"1").unwrap();
        assert_eq!(table.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(table.get(b"b").unwrap(), None);
    }

    /// # Scenario
    /// Default config: `set("k", "1")` then `set("k", "2")` from one thread,
    /// then a restart.
    ///
    /// # Expected behavior
    /// Each `set` flushes, so the second lands in a fresh generation and
    /// `get("k")` returns `"2"` before and after the restart.
    #[test]
    fn test_sequential_overwrite_visible_with_default_config() {
        let tmp = TempDir::new().unwrap();
        for wal_enabled in [false, true] {
            let name = if wal_enabled { "logged" } else { "plain" };
            let config = TableConfig {
                wal_enabled,
                ..TableConfig::default()
            };
            {
                let table = Table::open(tmp.path(), name, config.clone(), pool()).unwrap();
                table.set(b"k", b"1").unwrap();
                table.set(b"k", b"2").unwrap();
                assert_eq!(table.get(b"k").unwrap(), Some(b"2".to_vec()));
                table.set(b"k", b"3").unwrap();
                assert_eq!(table.get(b"k").unwrap(), Some(b"3".to_vec()));
            }

            let table = Table::open(tmp.path(), name, config, pool()).unwrap();
            assert_eq!(table.get(b"k").unwrap(), Some(b"3".to_vec()));
            assert_eq!(table.count().unwrap(), 1);
        }
    }

    /// # Scenario
    /// `set("a", "1")`, flush, close, reopen against the same file.
    ///
    /// # Expected behavior
    /// `get("a")` is served from the SSTable.
    #[test]
    fn test_value_survives_flush_and_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let table = open(tmp.path(), "default", config(FlushPolicy::Manual));
            table.set(b"a", b"1").unwrap();
            assert_eq!(table.flush().unwrap(), 1);
            table.close().unwrap();
        }
        assert!(tmp.path().join("default.dat").exists());

        let table = open(tmp.path(), "default", config(FlushPolicy::Manual));
        assert!(table.core.memtable.is_empty());
        assert_eq!(table.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_drop_without_close_flushes() {
        let tmp = TempDir::new().unwrap();
        {
            let table = open(tmp.path(), "t", config(FlushPolicy::Manual));
            table.set(b"k", b"v").unwrap();
        }
        let table = open(tmp.path(), "t", config(FlushPolicy::Manual));
        assert_eq!(table.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    /// # Scenario
    /// Set a key twice with no flush in between, then flush and set again.
    ///
    /// # Expected behavior
    /// The second set within one memtable generation is dropped; after a
    /// flush the key can be written again and the new value wins.
    #[test]
    fn test_first_writer_wins_until_flush() {
        let tmp = TempDir::new().unwrap();
        let table = open(tmp.path(), "t", config(FlushPolicy::Manual));

        table.set(b"k", b"x").unwrap();
        table.set(b"k", b"y").unwrap();
        assert_eq!(table.get(b"k").unwrap(), Some(b"x".to_vec()));

        table.flush().unwrap();
        table.set(b"k", b"y").unwrap();
        assert_eq!(table.get(b"k").unwrap(), Some(b"y".to_vec()));
        table.flush().unwrap();
        assert_eq!(table.get(b"k").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn test_set_batch_validates_everything_first() {
        let tmp = TempDir::new().unwrap();
        let table = open(tmp.path(), "t", config(FlushPolicy::Manual));

        let bad: [(&[u8], &[u8]); 2] = [(b"ok", b"1"), (b"bad::key", b"2")];
        assert!(table.set_batch(&bad).is_err());
        assert_eq!(table.get(b"ok").unwrap(), None);

        let good = [("a", "1"), ("b", "2"), ("c", "3")];
        table.set_batch(&good).unwrap();
        assert_eq!(table.count().unwrap(), 3);
    }

    #[test]
    fn test_invalid_rows_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let table = open(tmp.path(), "t", config(FlushPolicy::EveryWrite));

        let err = table.set(b"a::b", b"v").unwrap_err();
        assert!(matches!(
            err,
            TableError::SSTable(SSTableError::InvalidRow(_))
        ));
        assert!(table.set(b"", b"v").is_err());
        assert!(table.set(b"k", b"v;\n").is_err());
        assert_eq!(table.count().unwrap(), 0);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let tmp = TempDir::new().unwrap();
        let table = open(tmp.path(), "t", config(FlushPolicy::Manual));
        table.set(b"a", b"1").unwrap();

        table.close().unwrap();
        table.close().unwrap();
        assert!(table.is_closed());

        assert!(matches!(table.get(b"a"), Err(TableError::Closed)));
        assert!(matches!(table.set(b"a", b"2"), Err(TableError::Closed)));
        assert!(matches!(table.flush(), Err(TableError::Closed)));
        assert!(matches!(table.range(|_, _| true), Err(TableError::Closed)));
    }

    #[test]
    fn test_summary_reports_both_layers() {
        let tmp = TempDir::new().unwrap();
        let table = open(tmp.path(), "people", config(FlushPolicy::Manual));
        table.set(b"alice", b"1").unwrap();
        table.flush().unwrap();
        table.set(b"bob", b"2").unwrap();

        let mut out = Vec::new();
        table.write_summary(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.starts_with("table people\n"));
        assert!(out.contains("policy: Manual"));
        assert!(out.contains("sstable: 1 keys"));
        assert!(out.contains("bob=2"));
        table.print().unwrap();
    }
}
