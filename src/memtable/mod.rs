//! # Memtable Module
//!
//! The mutable, in-memory sorted component of the engine. All writes land
//! here first; the background roll freezes the table and flushes it to an
//! on-disk SSTable.
//!
//! ## Design Invariants
//!
//! - At most one segment per key; an overwrite replaces in place.
//! - While frozen, every mutation fails cleanly (returns `false`); the
//!   controller retries against the fresh primary slot.
//! - The live and tombstone counters always sum to the entry count.
//! - Ordered iteration yields strictly ascending keys.
//!
//! ## Erase Semantics
//!
//! Erasing an absent key still inserts a tombstone: an older SSTable layer
//! may hold the key, and only a tombstone in this newer layer can mask it.
//! Erasing an existing tombstone is a no-op.
//!
//! ## Lifecycle
//!
//! Created mutable, frozen exactly once (idempotent), flushed into an
//! SSTable, then dropped.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use parking_lot::RwLock;
use tracing::trace;

use crate::segment::Segment;
use crate::table::{Lookup, ReadableTable, TableStats};

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// An ordered in-memory mapping from key to the most recent segment for
/// that key.
///
/// # Concurrency
///
/// All state sits behind one `RwLock`: mutations take the write lock and
/// check the freeze flag under it, reads proceed concurrently under the
/// read lock. Freezing is a metadata flip, so the controller's swap window
/// is sub-millisecond.
pub struct Memtable {
    inner: RwLock<MemtableInner>,
}

struct MemtableInner {
    /// Sorted key to segment mapping.
    map: BTreeMap<Vec<u8>, Segment>,

    /// Once set, no mutation succeeds. Transitions false to true exactly once.
    frozen: bool,

    /// Live / tombstone entry counters.
    stats: TableStats,
}

impl Memtable {
    /// Creates an empty, mutable memtable.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemtableInner {
                map: BTreeMap::new(),
                frozen: false,
                stats: TableStats::default(),
            }),
        }
    }

    /// Inserts or overwrites a key.
    ///
    /// Returns `false` without touching the table iff it is frozen. On an
    /// overwrite that changes the entry's tombstone state the counters are
    /// swapped accordingly.
    pub fn put(&self, key: &[u8], value: &[u8], tombstone: bool) -> bool {
        let mut inner = self.inner.write();
        if inner.frozen {
            return false;
        }

        let segment = Segment {
            key: key.to_vec(),
            value: value.to_vec(),
            tombstone,
        };

        match inner.map.insert(key.to_vec(), segment) {
            Some(prior) => {
                if prior.tombstone != tombstone {
                    inner.stats.record_flip(tombstone);
                }
            }
            None => inner.stats.record_insert(tombstone),
        }

        trace!(key_len = key.len(), tombstone, "memtable put");
        true
    }

    /// Records a deletion for a key.
    ///
    /// Absent keys get a fresh tombstone (an older layer may still hold
    /// them); live entries flip to tombstones; existing tombstones are left
    /// untouched. Returns `false` iff the table is frozen.
    pub fn erase(&self, key: &[u8]) -> bool {
        let mut guard = self.inner.write();
        if guard.frozen {
            return false;
        }

        let inner = &mut *guard;
        match inner.map.entry(key.to_vec()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if !existing.tombstone {
                    existing.value.clear();
                    existing.tombstone = true;
                    inner.stats.record_flip(true);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Segment::new_tombstone(key.to_vec()));
                inner.stats.record_insert(true);
            }
        }

        trace!(key_len = key.len(), "memtable erase");
        true
    }

    /// Returns the stored value for a live entry, or empty bytes when the
    /// key is absent or tombstoned.
    pub fn get(&self, key: &[u8]) -> Vec<u8> {
        let inner = self.inner.read();
        match inner.map.get(key) {
            Some(segment) if !segment.tombstone => segment.value.clone(),
            _ => Vec::new(),
        }
    }

    /// Probes for a key, distinguishing tombstones from missing entries.
    pub fn lookup(&self, key: &[u8]) -> Lookup {
        let inner = self.inner.read();
        match inner.map.get(key) {
            Some(segment) if segment.tombstone => Lookup::Tombstone,
            Some(_) => Lookup::Live,
            None => Lookup::Absent,
        }
    }

    /// Renders the memtable immutable. Idempotent.
    pub fn freeze(&self) {
        self.inner.write().frozen = true;
    }

    /// True once [`Memtable::freeze`] has been called.
    pub fn is_frozen(&self) -> bool {
        self.inner.read().frozen
    }

    /// Number of live (non-tombstone) entries.
    pub fn size(&self) -> usize {
        self.inner.read().stats.live()
    }

    /// Total number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    /// True iff the table holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    /// Snapshot of the stats counters.
    pub fn stats(&self) -> TableStats {
        self.inner.read().stats
    }

    /// Ascending snapshot of every segment, tombstones included.
    ///
    /// Consumed by the SSTable flush path; iteration order is the on-disk
    /// record order.
    pub fn iter_for_flush(&self) -> impl Iterator<Item = Segment> {
        let segments: Vec<Segment> = self.inner.read().map.values().cloned().collect();
        segments.into_iter()
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadableTable for Memtable {
    fn lookup(&self, key: &[u8]) -> Lookup {
        Memtable::lookup(self, key)
    }

    fn get(&self, key: &[u8]) -> Vec<u8> {
        Memtable::get(self, key)
    }

    fn size(&self) -> usize {
        Memtable::size(self)
    }
}
