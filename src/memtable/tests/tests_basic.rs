#[cfg(test)]
mod tests {
    use crate::memtable::Memtable;
    use crate::table::Lookup;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    #[test]
    fn test_put_and_get() {
        init_tracing();

        let memtable = Memtable::new();
        assert!(memtable.put(b"key1", b"value1", false));

        assert_eq!(memtable.get(b"key1"), b"value1".to_vec());
        assert_eq!(memtable.get(b"key2"), Vec::<u8>::new());
    }

    #[test]
    fn test_overwrite_keeps_latest_value() {
        init_tracing();

        let memtable = Memtable::new();
        assert!(memtable.put(b"k", b"v1", false));
        assert!(memtable.put(b"k", b"v2", false));

        assert_eq!(memtable.get(b"k"), b"v2".to_vec());
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn test_erase_existing_key_masks_value() {
        init_tracing();

        let memtable = Memtable::new();
        memtable.put(b"k", b"v", false);
        assert!(memtable.erase(b"k"));

        assert_eq!(memtable.get(b"k"), Vec::<u8>::new());
        assert_eq!(memtable.lookup(b"k"), Lookup::Tombstone);
    }

    #[test]
    fn test_erase_absent_key_inserts_tombstone() {
        init_tracing();

        let memtable = Memtable::new();
        assert!(memtable.erase(b"never-written"));

        // The tombstone must exist so it can mask older SSTable layers.
        assert_eq!(memtable.lookup(b"never-written"), Lookup::Tombstone);
        assert_eq!(memtable.len(), 1);
        assert_eq!(memtable.size(), 0);
    }

    #[test]
    fn test_erase_is_idempotent() {
        init_tracing();

        let memtable = Memtable::new();
        memtable.put(b"k", b"v", false);
        memtable.erase(b"k");
        let stats_after_one = memtable.stats();

        memtable.erase(b"k");
        let stats_after_two = memtable.stats();

        assert_eq!(stats_after_one.live(), stats_after_two.live());
        assert_eq!(stats_after_one.tombstones(), stats_after_two.tombstones());
        assert_eq!(memtable.lookup(b"k"), Lookup::Tombstone);
    }

    #[test]
    fn test_put_resurrects_tombstone() {
        init_tracing();

        let memtable = Memtable::new();
        memtable.put(b"k", b"v", false);
        memtable.erase(b"k");
        memtable.put(b"k", b"back", false);

        assert_eq!(memtable.lookup(b"k"), Lookup::Live);
        assert_eq!(memtable.get(b"k"), b"back".to_vec());
    }

    #[test]
    fn test_lookup_distinguishes_absent_from_tombstone() {
        init_tracing();

        let memtable = Memtable::new();
        memtable.erase(b"dead");

        assert_eq!(memtable.lookup(b"dead"), Lookup::Tombstone);
        assert_eq!(memtable.lookup(b"missing"), Lookup::Absent);

        // get() collapses both to empty bytes.
        assert_eq!(memtable.get(b"dead"), Vec::<u8>::new());
        assert_eq!(memtable.get(b"missing"), Vec::<u8>::new());
    }

    #[test]
    fn test_iter_for_flush_yields_ascending_keys_with_tombstones() {
        init_tracing();

        let memtable = Memtable::new();
        memtable.put(b"c", b"3", false);
        memtable.put(b"a", b"1", false);
        memtable.erase(b"b");

        let segments: Vec<_> = memtable.iter_for_flush().collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].key, b"a".to_vec());
        assert_eq!(segments[1].key, b"b".to_vec());
        assert!(segments[1].tombstone);
        assert_eq!(segments[2].key, b"c".to_vec());
    }
}
