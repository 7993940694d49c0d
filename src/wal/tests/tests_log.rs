//! Log append, rollover, replay, reset, and reopen.
//!
//! ## See also
//! - [`tests_recovery`]: segment files left behind by a crash

#[cfg(test)]
mod tests {
    use crate::wal::tests::helpers::{collect, file_names, init_tracing};
    use crate::wal::{Log, LogConfig, WalError};
    use tempfile::TempDir;

    fn small_config(max_store_bytes: u64) -> LogConfig {
        LogConfig {
            max_store_bytes,
            ..LogConfig::default()
        }
    }

    #[test]
    fn test_new_log_has_one_segment_at_initial_offset() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let config = LogConfig {
            initial_offset: 100,
            ..LogConfig::default()
        };
        let log = Log::open(tmp.path(), config).unwrap();

        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.lowest_offset().unwrap(), 100);
        assert_eq!(log.highest_offset().unwrap(), None);
        assert_eq!(log.append(b"x").unwrap(), 100);
        assert_eq!(log.highest_offset().unwrap(), Some(100));
    }

    /// # Scenario
    /// Three 8-byte records (16 bytes stored each) with a 32-byte store
    /// limit: the second record maxes the first segment.
    ///
    /// # Expected behavior
    /// The log ends with two segments, the second based at offset 2, and
    /// each segment's last index entry matches its own last write.
    #[test]
    fn test_rollover_after_maxing_write() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), small_config(32)).unwrap();

        assert_eq!(log.append(b"record-0").unwrap(), 0);
        assert_eq!(log.append(b"record-1").unwrap(), 1);
        assert_eq!(log.append(b"record-2").unwrap(), 2);

        let segments = log.segments().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].base_offset(), 0);
        assert_eq!(segments[1].base_offset(), 2);
        assert_eq!(segments[0].last_entry().unwrap(), (1, 16));
        assert_eq!(segments[1].last_entry().unwrap(), (0, 0));

        for off in 0..3u64 {
            assert_eq!(log.read(off).unwrap(), format!("record-{off}").as_bytes());
        }
    }

    #[test]
    fn test_every_write_rolls_with_tiny_store() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), small_config(1)).unwrap();

        for i in 0..3u64 {
            assert_eq!(log.append(b"r").unwrap(), i);
        }

        // Three full segments plus the fresh active one.
        assert_eq!(log.segment_count(), 4);
        let bases: Vec<u64> = log
            .segments()
            .unwrap()
            .iter()
            .map(|s| s.base_offset())
            .collect();
        assert_eq!(bases, [0, 1, 2, 3]);
        assert_eq!(log.read(1).unwrap(), b"r");
    }

    #[test]
    fn test_read_unknown_offset() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig {
            initial_offset: 10,
            ..LogConfig::default()
        };
        let log = Log::open(tmp.path(), config).unwrap();
        log.append(b"x").unwrap();

        assert!(matches!(log.read(5), Err(WalError::OffsetOutOfRange(5))));
        assert!(matches!(log.read(11), Err(WalError::OffsetOutOfRange(11))));
    }

    #[test]
    fn test_replay_visits_records_in_order_across_segments() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), small_config(40)).unwrap();
        for i in 0..10u32 {
            log.append(format!("rec{i}").as_bytes()).unwrap();
        }
        assert!(log.segment_count() > 1);

        let records = collect(&log);
        assert_eq!(records.len(), 10);
        for (i, (off, record)) in records.iter().enumerate() {
            assert_eq!(*off, i as u64);
            assert_eq!(record, format!("rec{i}").as_bytes());
        }

        let mut seen = 0;
        let visited = log
            .replay(|_, _| {
                seen += 1;
                seen < 4
            })
            .unwrap();
        assert_eq!(visited, 4);
    }

    /// # Scenario
    /// Append across several segments, close, reopen the directory.
    ///
    /// # Expected behavior
    /// Segments are reloaded in base order, every record reads back, and
    /// appends continue after the last offset.
    #[test]
    fn test_reopen_restores_segments() {
        let tmp = TempDir::new().unwrap();
        let config = small_config(30);
        let count = {
            let log = Log::open(tmp.path(), config.clone()).unwrap();
            for i in 0..7u32 {
                log.append(format!("r{i}").as_bytes()).unwrap();
            }
            let count = log.segment_count();
            log.close().unwrap();
            count
        };

        let log = Log::open(tmp.path(), config).unwrap();
        assert_eq!(log.segment_count(), count);
        assert_eq!(collect(&log).len(), 7);
        assert_eq!(log.read(6).unwrap(), b"r6");
        assert_eq!(log.append(b"r7").unwrap(), 7);
    }

    #[test]
    fn test_reset_discards_records_and_continues_offsets() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), small_config(20)).unwrap();
        for _ in 0..5 {
            log.append(b"payload").unwrap();
        }

        log.reset().unwrap();

        assert_eq!(log.segment_count(), 1);
        assert!(collect(&log).is_empty());
        assert_eq!(log.lowest_offset().unwrap(), 5);
        assert_eq!(log.highest_offset().unwrap(), None);
        assert_eq!(file_names(tmp.path()), ["5.index", "5.store"]);
        assert_eq!(log.append(b"next").unwrap(), 5);
    }

    #[test]
    fn test_close_is_repeatable() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), LogConfig::default()).unwrap();
        log.append(b"x").unwrap();
        log.close().unwrap();
        log.close().unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let tmp = TempDir::new().unwrap();
        for config in [
            LogConfig {
                max_store_bytes: 0,
                ..LogConfig::default()
            },
            LogConfig {
                max_index_bytes: 11,
                ..LogConfig::default()
            },
        ] {
            assert!(matches!(
                Log::open(tmp.path(), config),
                Err(WalError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_unrelated_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"hi").unwrap();
        std::fs::write(tmp.path().join("abc.store"), b"").unwrap();

        let log = Log::open(tmp.path(), LogConfig::default()).unwrap();
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.lowest_offset().unwrap(), 0);
    }

    /// # Scenario
    /// Records spread over several segments; truncate below offset 4.
    ///
    /// # Expected behavior
    /// Only segments that end before offset 4 are removed; later records
    /// still read back and the active segment survives even when covered.
    #[test]
    fn test_truncate_removes_covered_segments() {
        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path(), small_config(1)).unwrap();
        for i in 0..6u64 {
            log.append(format!("r{i}").as_bytes()).unwrap();
        }
        assert_eq!(log.segment_count(), 7);

        assert_eq!(log.truncate(4).unwrap(), 4);
        assert_eq!(log.lowest_offset().unwrap(), 4);
        assert!(log.read(3).is_err());
        assert_eq!(log.read(4).unwrap(), b"r4");

        assert_eq!(log.truncate(u64::MAX).unwrap(), 2);
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.append(b"r6").unwrap(), 6);
    }
}
