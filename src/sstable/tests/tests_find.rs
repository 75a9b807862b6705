#[cfg(test)]
mod tests {
    use crate::memtable::Memtable;
    use crate::sstable::SSTable;
    use crate::table::Lookup;
    use rand::prelude::*;
    use tempfile::TempDir;

    /// Builds a table of `count` zero-padded even keys ("key-0000",
    /// "key-0002", ...) so that odd keys probe the gaps between records.
    fn build_even_table(dir: &std::path::Path, count: u32, index_gap: u64) -> SSTable {
        let memtable = Memtable::new();
        for i in 0..count {
            let key = format!("key-{:04}", i * 2);
            let val = format!("val-{:04}", i * 2);
            memtable.put(key.as_bytes(), val.as_bytes(), false);
        }
        memtable.freeze();
        SSTable::flush(dir.join("even.strata"), &memtable, index_gap).unwrap()
    }

    #[test]
    fn test_every_stored_key_is_found() {
        let tmp = TempDir::new().unwrap();
        // A tiny gap forces many sparse index entries; a record here is
        // ~27 bytes, so roughly every other record is indexed.
        let sst = build_even_table(tmp.path(), 500, 50);
        assert!(sst.index_len() > 10, "index unexpectedly small");

        for i in 0..500u32 {
            let key = format!("key-{:04}", i * 2);
            let segment = sst.find_segment(key.as_bytes()).unwrap().unwrap();
            assert_eq!(segment.key, key.as_bytes());
            assert_eq!(segment.value, format!("val-{:04}", i * 2).as_bytes());
        }
    }

    #[test]
    fn test_absent_keys_between_records_are_not_found() {
        let tmp = TempDir::new().unwrap();
        let sst = build_even_table(tmp.path(), 500, 50);

        for i in 0..500u32 {
            let key = format!("key-{:04}", i * 2 + 1);
            assert!(sst.find_segment(key.as_bytes()).unwrap().is_none());
        }
    }

    #[test]
    fn test_key_below_first_record_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let sst = build_even_table(tmp.path(), 10, 50);

        assert!(sst.find_segment(b"key-").unwrap().is_none());
        assert!(sst.find_segment(b"a").unwrap().is_none());
        assert_eq!(sst.lookup(b"aaa").unwrap(), Lookup::Absent);
    }

    #[test]
    fn test_key_past_last_record_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let sst = build_even_table(tmp.path(), 10, 50);

        assert!(sst.find_segment(b"key-9999").unwrap().is_none());
        assert!(sst.find_segment(b"zzz").unwrap().is_none());
    }

    #[test]
    fn test_lookups_agree_across_index_granularities() {
        let dense_dir = TempDir::new().unwrap();
        let sparse_dir = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        let dense = build_even_table(dense_dir.path(), 300, 1);
        let sparse = build_even_table(sparse_dir.path(), 300, 1 << 20);
        assert!(dense.index_len() > sparse.index_len());

        for _ in 0..1000 {
            let probe = format!("key-{:04}", rng.gen_range(0..700));
            assert_eq!(
                dense.find_segment(probe.as_bytes()).unwrap(),
                sparse.find_segment(probe.as_bytes()).unwrap(),
                "disagreement on {probe}"
            );
        }
    }
}
