#[cfg(test)]
mod tests {
    use crate::db::tests::helpers::{init_tracing, manual_controller};
    use crate::db::{DbConfig, DbController};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_basic_put_get() {
        let tmp = TempDir::new().unwrap();
        let db = manual_controller(tmp.path());

        db.put(b"a", b"foo");
        assert_eq!(db.get(b"a"), b"foo".to_vec());
        assert_eq!(db.get(b"b"), Vec::<u8>::new());
    }

    #[test]
    fn test_overwrite_returns_latest() {
        let tmp = TempDir::new().unwrap();
        let db = manual_controller(tmp.path());

        db.put(b"k", b"v1");
        db.put(b"k", b"v2");
        assert_eq!(db.get(b"k"), b"v2".to_vec());
    }

    #[test]
    fn test_key_exists() {
        let tmp = TempDir::new().unwrap();
        let db = manual_controller(tmp.path());

        db.put(b"here", b"v");
        assert!(db.key_exists(b"here"));
        assert!(!db.key_exists(b"gone"));

        db.erase(b"here");
        assert!(!db.key_exists(b"here"));
    }

    #[test]
    fn test_erase_masks_value() {
        let tmp = TempDir::new().unwrap();
        let db = manual_controller(tmp.path());

        db.put(b"k", b"v");
        db.erase(b"k");
        assert_eq!(db.get(b"k"), Vec::<u8>::new());
    }

    #[test]
    fn test_double_erase_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let db = manual_controller(tmp.path());

        db.put(b"k", b"v");
        db.erase(b"k");
        db.erase(b"k");
        assert!(!db.key_exists(b"k"));
        assert_eq!(db.get(b"k"), Vec::<u8>::new());

        // Erase of a never-written key leaves the same observable state.
        db.erase(b"other");
        assert!(!db.key_exists(b"other"));
    }

    #[test]
    fn test_empty_value_is_distinct_from_absent_for_key_exists() {
        let tmp = TempDir::new().unwrap();
        let db = manual_controller(tmp.path());

        db.put(b"empty", b"");
        assert!(db.key_exists(b"empty"));
        assert_eq!(db.get(b"empty"), Vec::<u8>::new());
        assert!(!db.key_exists(b"missing"));
    }

    #[test]
    fn test_stats_reflect_memtable_writes() {
        let tmp = TempDir::new().unwrap();
        let db = manual_controller(tmp.path());

        db.put(b"a", b"1");
        db.put(b"b", b"2");
        let stats = db.stats();
        assert_eq!(stats.memtable_entries, 2);
        assert_eq!(stats.sstable_count, 0);
    }

    #[test]
    #[should_panic(expected = "start() must be called")]
    fn test_use_before_start_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let db = DbController::new(DbConfig {
            db_directory: tmp.path().to_path_buf(),
            num_worker_threads: 1,
            ..DbConfig::default()
        })
        .unwrap();
        db.put(b"k", b"v");
    }

    #[test]
    fn test_start_is_idempotent() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = DbController::new(DbConfig {
            db_directory: tmp.path().to_path_buf(),
            num_worker_threads: 1,
            background_task_min_gap: Duration::from_secs(3600),
            ..DbConfig::default()
        })
        .unwrap();

        db.start();
        db.start();
        db.put(b"k", b"v");
        assert_eq!(db.get(b"k"), b"v".to_vec());
    }

    #[test]
    fn test_stale_staging_files_are_removed_at_open() {
        let tmp = TempDir::new().unwrap();
        let stale = tmp.path().join("lvl_0.strata.secondary");
        std::fs::write(&stale, b"leftover from an interrupted roll").unwrap();

        let _db = manual_controller(tmp.path());
        assert!(!stale.exists());
    }
}
