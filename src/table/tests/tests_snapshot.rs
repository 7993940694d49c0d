//! Export and import through uuencoded snapshots.

#[cfg(test)]
mod tests {
    use crate::table::tests::helpers::{config, open};
    use crate::table::{FlushPolicy, TableError};
    use std::fs;
    use tempfile::TempDir;

    /// # Scenario
    /// Export a table whose values contain delimiters and newlines, some
    /// rows flushed and some not, then import the file into a new table.
    ///
    /// # Expected behavior
    /// Both tables scan to the same pairs.
    #[test]
    fn test_export_then_import_copies_every_pair() {
        let tmp = TempDir::new().unwrap();
        let source = open(tmp.path(), "source", config(FlushPolicy::Manual));
        source.set(b"plain", b"value").unwrap();
        source.set(b"colons", b"a::b::c").unwrap();
        source.flush().unwrap();
        source.set(b"lines", b"one\ntwo;three").unwrap();
        for i in 0..50 {
            source
                .set(format!("bulk{i}").as_bytes(), &[b'x'; 40])
                .unwrap();
        }

        let snap = tmp.path().join("source.snap");
        assert_eq!(source.export(&snap).unwrap(), 53);

        let text = fs::read_to_string(&snap).unwrap();
        assert!(text.starts_with("begin 0755 source.dat\n"));
        assert!(text.ends_with("`\nend\n"));

        let target = open(tmp.path(), "target", config(FlushPolicy::Manual));
        assert_eq!(target.import(&snap).unwrap(), 53);

        let all = |t: &crate::table::Table| t.scan(b"\x01", b"\xff", None).unwrap();
        assert_eq!(all(&source), all(&target));
    }

    #[test]
    fn test_empty_table_exports_empty_snapshot() {
        let tmp = TempDir::new().unwrap();
        let table = open(tmp.path(), "empty", config(FlushPolicy::Manual));
        let snap = tmp.path().join("empty.snap");

        assert_eq!(table.export(&snap).unwrap(), 0);
        assert_eq!(
            fs::read_to_string(&snap).unwrap(),
            "begin 0755 empty.dat\n`\nend\n"
        );
        assert_eq!(table.import(&snap).unwrap(), 0);
    }

    #[test]
    fn test_snapshot_without_whole_rows_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let snap = tmp.path().join("bad.snap");
        let mut file = fs::File::create(&snap).unwrap();
        crate::snapshot::encode(&mut file, "bad.dat", b"k::v;\nnot a row").unwrap();
        drop(file);

        let table = open(tmp.path(), "t", config(FlushPolicy::Manual));
        assert!(matches!(table.import(&snap), Err(TableError::Corrupt(_))));
        assert_eq!(table.count().unwrap(), 0);
    }

    #[test]
    fn test_malformed_snapshot_text_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let snap = tmp.path().join("bad.snap");
        fs::write(&snap, "not a snapshot\n").unwrap();

        let table = open(tmp.path(), "t", config(FlushPolicy::Manual));
        assert!(matches!(table.import(&snap), Err(TableError::Snapshot(_))));
    }
}
