//! Segment offsets, reads, and the maxed check.

#[cfg(test)]
mod tests {
    use crate::wal::tests::helpers::{config_with_entries, file_names, init_tracing};
    use crate::wal::{LogConfig, Segment, WalError};
    use tempfile::TempDir;

    #[test]
    fn test_append_assigns_absolute_offsets() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let segment = Segment::open(tmp.path(), 16, &LogConfig::default()).unwrap();

        assert_eq!(segment.append(b"a").unwrap(), 16);
        assert_eq!(segment.append(b"b").unwrap(), 17);
        assert_eq!(segment.next_offset(), 18);
        assert_eq!(segment.len(), 2);

        assert_eq!(segment.read(16).unwrap(), b"a");
        assert_eq!(segment.read(17).unwrap(), b"b");
        assert_eq!(segment.last_entry().unwrap(), (1, 9));
    }

    #[test]
    fn test_files_are_named_by_base_offset() {
        let tmp = TempDir::new().unwrap();
        let _segment = Segment::open(tmp.path(), 42, &LogConfig::default()).unwrap();
        assert_eq!(file_names(tmp.path()), ["42.index", "42.store"]);
    }

    #[test]
    fn test_reads_outside_segment_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let segment = Segment::open(tmp.path(), 10, &LogConfig::default()).unwrap();
        segment.append(b"x").unwrap();

        assert!(matches!(segment.read(9), Err(WalError::OffsetOutOfRange(9))));
        assert!(matches!(segment.read(11), Err(WalError::OffsetOutOfRange(11))));
    }

    /// # Scenario
    /// A segment whose store limit is 20 bytes takes two 4-byte records.
    ///
    /// # Expected behavior
    /// It is maxed after the second record (24 bytes stored) but not after
    /// the first (12 bytes).
    #[test]
    fn test_maxed_by_store_size() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig {
            max_store_bytes: 20,
            ..LogConfig::default()
        };
        let segment = Segment::open(tmp.path(), 0, &config).unwrap();

        segment.append(b"four").unwrap();
        assert!(!segment.is_maxed());
        segment.append(b"four").unwrap();
        assert!(segment.is_maxed());
    }

    #[test]
    fn test_maxed_by_index_capacity() {
        let tmp = TempDir::new().unwrap();
        let segment = Segment::open(tmp.path(), 0, &config_with_entries(2)).unwrap();

        segment.append(b"a").unwrap();
        assert!(!segment.is_maxed());
        segment.append(b"b").unwrap();
        assert!(segment.is_maxed());
        assert!(matches!(segment.append(b"c"), Err(WalError::IndexFull)));
    }

    #[test]
    fn test_close_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig::default();
        {
            let segment = Segment::open(tmp.path(), 5, &config).unwrap();
            segment.append(b"one").unwrap();
            segment.append(b"two").unwrap();
            segment.close().unwrap();
        }

        let segment = Segment::open(tmp.path(), 5, &config).unwrap();
        assert_eq!(segment.next_offset(), 7);
        assert_eq!(segment.read(6).unwrap(), b"two");
        assert_eq!(segment.append(b"three").unwrap(), 7);
    }

    #[test]
    fn test_remove_deletes_files() {
        let tmp = TempDir::new().unwrap();
        let segment = Segment::open(tmp.path(), 0, &LogConfig::default()).unwrap();
        segment.append(b"x").unwrap();

        segment.remove().unwrap();
        assert!(file_names(tmp.path()).is_empty());
    }
}
