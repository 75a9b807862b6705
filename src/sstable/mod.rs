//! # SSTable Module
//!
//! An immutable, sorted, on-disk table of [`Segment`] records, with a
//! sparse in-memory index bounding the scan distance of every point
//! lookup.
//!
//! ## On-disk layout
//!
//! A bare concatenation of segment records (see [`crate::segment`]), in
//! strictly ascending key order, each key at most once. No header, footer,
//! or checksum.
//!
//! ## Construction modes
//!
//! 1. **Open existing** ([`SSTable::open`]): the file must already exist;
//!    one sequential scan builds the sparse index and the stats counters.
//! 2. **Flush** ([`SSTable::flush`]): dumps a frozen memtable, tombstones
//!    included, to a file that must not yet exist.
//! 3. **Merge** ([`SSTable::merge`]): k-way merges an ordered list of
//!    parent tables (newest first) into a file that must not yet exist;
//!    see [`merge`](self::merge) for the resolution rules.
//!
//! In every mode the sparse index is built by scanning the finished file,
//! so the index can never disagree with what is actually on disk.
//!
//! ## Sparse index
//!
//! A sorted map from selected keys to absolute byte offsets. A record at
//! offset `o` is indexed when `o == 0` or when at least
//! `index_offset_bytes` have passed since the previous indexed record; the
//! first key of the file is therefore always indexed. Larger gaps shrink
//! memory and lengthen the per-lookup linear scan.
//!
//! ## Concurrency
//!
//! The table itself is immutable; the only shared mutable state is the
//! file handle, which is wrapped in a mutex. Every lookup seeks before
//! reading, so lookups and the merge cursors interleave safely on the
//! same handle.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub(crate) mod merge;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    ops::Bound,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::segment::{Segment, SegmentIo, SegmentIoError};
use crate::table::{storage_fatal, Lookup, ReadableTable, TableStats};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Default minimum byte gap between sparse index entries.
pub const DEFAULT_INDEX_OFFSET_BYTES: u64 = 4096;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Segment parse or file I/O failure.
    #[error("segment I/O error: {0}")]
    SegmentIo(#[from] SegmentIoError),

    /// The file's records are not in strictly ascending key order.
    #[error("keys out of order at offset {offset}")]
    OutOfOrder {
        /// Offset of the offending record.
        offset: u64,
    },
}

// ------------------------------------------------------------------------------------------------
// SSTable
// ------------------------------------------------------------------------------------------------

/// An immutable on-disk sorted table.
///
/// Shared between the controller's live list and in-flight readers via
/// `Arc`; the backing file stays readable through the open handle even
/// after a compaction unlinks or renames it.
#[derive(Debug)]
pub struct SSTable {
    /// Path the table was constructed with (canonicalized).
    path: PathBuf,

    /// Stable 64-bit table id, a hash of the canonical path.
    id: u64,

    /// File size in bytes at construction time.
    size_bytes: u64,

    /// Sparse map from selected keys to absolute record offsets.
    sparse_index: BTreeMap<Vec<u8>, u64>,

    /// The table's file handle. Lookups and merge cursors serialize here
    /// and always seek before reading.
    io: Mutex<SegmentIo>,

    /// Live / tombstone record counters.
    stats: TableStats,
}

impl SSTable {
    /// Opens an SSTable over an existing file.
    ///
    /// The file must exist; a missing file is an engine bug (the caller
    /// decides which level files are present before opening them). Any
    /// malformed record fails the scan with a corruption error.
    pub fn open(
        path: impl AsRef<Path>,
        index_offset_bytes: u64,
    ) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        assert!(
            path.exists(),
            "SSTable file {} does not exist",
            path.display()
        );

        let io = SegmentIo::open(path)?;
        let table = Self::from_io(io, index_offset_bytes)?;

        info!(
            path = %table.path.display(),
            id = table.id,
            live = table.stats.live(),
            tombstones = table.stats.tombstones(),
            "opened existing SSTable"
        );
        Ok(table)
    }

    /// Flushes a frozen memtable into a new SSTable file.
    ///
    /// The target must not exist and the memtable must be frozen; both are
    /// asserted. Every segment is written, tombstones included: a newer
    /// layer's tombstone must keep masking older layers after the flush.
    pub fn flush(
        path: impl AsRef<Path>,
        memtable: &crate::memtable::Memtable,
        index_offset_bytes: u64,
    ) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        assert!(
            !path.exists(),
            "flush target {} already exists",
            path.display()
        );
        assert!(memtable.is_frozen(), "flushing a memtable that is not frozen");

        let mut io = SegmentIo::open(path)?;
        for segment in memtable.iter_for_flush() {
            io.write(&segment)?;
        }
        io.flush()?;

        let table = Self::from_io(io, index_offset_bytes)?;
        info!(
            path = %table.path.display(),
            records = table.stats.total(),
            "flushed memtable to SSTable"
        );
        Ok(table)
    }

    /// Merges an ordered list of parent tables (index 0 is the youngest)
    /// into a new SSTable file.
    ///
    /// The target must not exist and the parent list must be non-empty;
    /// both are asserted. Same-key collisions resolve to the youngest
    /// version and tombstones are dropped, since every merge reaches the
    /// base table.
    pub fn merge(
        path: impl AsRef<Path>,
        parents: &[Arc<SSTable>],
        index_offset_bytes: u64,
    ) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        assert!(
            !path.exists(),
            "merge target {} already exists",
            path.display()
        );
        assert!(!parents.is_empty(), "merging an empty parent list");

        let mut io = SegmentIo::open(path)?;
        merge::merge_parents(&mut io, parents)?;

        let table = Self::from_io(io, index_offset_bytes)?;
        info!(
            path = %table.path.display(),
            parents = parents.len(),
            records = table.stats.total(),
            "merged SSTables"
        );
        Ok(table)
    }

    /// Finishes construction over a written (or pre-existing) file: scans
    /// it once to build the sparse index and stats.
    fn from_io(mut io: SegmentIo, index_offset_bytes: u64) -> Result<Self, SSTableError> {
        let (sparse_index, stats) = Self::scan_file(&mut io, index_offset_bytes)?;

        let path = io.path().to_path_buf();
        let id = farmhash::hash64(path.as_os_str().as_encoded_bytes());
        let size_bytes = io.len();

        debug!(
            path = %path.display(),
            index_entries = sparse_index.len(),
            size_bytes,
            "built sparse index"
        );

        Ok(Self {
            path,
            id,
            size_bytes,
            sparse_index,
            io: Mutex::new(io),
            stats,
        })
    }

    /// Sequentially scans the whole file, collecting the sparse index and
    /// the live/tombstone counts.
    fn scan_file(
        io: &mut SegmentIo,
        index_offset_bytes: u64,
    ) -> Result<(BTreeMap<Vec<u8>, u64>, TableStats), SSTableError> {
        io.reset()?;

        let mut index = BTreeMap::new();
        let mut stats = TableStats::default();
        let mut last_indexed: Option<u64> = None;

        while !io.at_end() {
            let offset = io.offset();
            let candidate = match last_indexed {
                None => true,
                Some(last) => offset - last >= index_offset_bytes,
            };

            let segment = io.read_next()?;
            stats.record_insert(segment.tombstone);

            if candidate {
                index.insert(segment.key, offset);
                last_indexed = Some(offset);
            }
        }

        Ok((index, stats))
    }

    /// Locates the segment stored for `key`, if any.
    ///
    /// Sparse-index discipline: jump to the greatest indexed key not above
    /// the query, then scan forward. The file is sorted, so the scan stops
    /// as soon as a key greater than the query is parsed.
    pub fn find_segment(&self, key: &[u8]) -> Result<Option<Segment>, SSTableError> {
        // An empty index means an empty file; a query below the smallest
        // indexed key is below the first record of the file.
        let Some(first_key) = self.sparse_index.keys().next() else {
            return Ok(None);
        };
        if key < first_key.as_slice() {
            return Ok(None);
        }

        let mut io = self.io.lock();

        // Exact index hit: the record is at the recorded offset.
        let lower_bound = self
            .sparse_index
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next();
        if let Some((indexed_key, offset)) = lower_bound
            && indexed_key.as_slice() == key
        {
            io.seek(*offset)?;
            return Ok(Some(io.read_next()?));
        }

        // Otherwise start from the predecessor entry and scan forward.
        let Some((_, offset)) = self
            .sparse_index
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
        else {
            return Ok(None);
        };

        io.seek(*offset)?;
        while !io.at_end() {
            let segment = io.read_next()?;
            if segment.key.as_slice() == key {
                return Ok(Some(segment));
            }
            if segment.key.as_slice() > key {
                return Ok(None);
            }
        }

        Ok(None)
    }

    /// Probes for a key, distinguishing tombstones from missing keys.
    pub fn lookup(&self, key: &[u8]) -> Result<Lookup, SSTableError> {
        Ok(match self.find_segment(key)? {
            Some(segment) if segment.tombstone => Lookup::Tombstone,
            Some(_) => Lookup::Live,
            None => Lookup::Absent,
        })
    }

    /// Returns the stored value, or empty bytes when the key is absent or
    /// tombstoned.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, SSTableError> {
        Ok(match self.find_segment(key)? {
            Some(segment) if !segment.tombstone => segment.value,
            _ => Vec::new(),
        })
    }

    /// Scans the entire file and verifies that keys are strictly
    /// ascending. Debug aid, used by tests and optionally after merges.
    pub fn sanity_check(&self) -> Result<(), SSTableError> {
        let mut io = self.io.lock();
        io.reset()?;

        let mut prev: Option<Vec<u8>> = None;
        while !io.at_end() {
            let offset = io.offset();
            let segment = io.read_next()?;
            if let Some(prev_key) = &prev
                && prev_key >= &segment.key
            {
                return Err(SSTableError::OutOfOrder { offset });
            }
            prev = Some(segment.key);
        }

        Ok(())
    }

    /// Stable table id (hash of the construction path).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Path the table was constructed with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// On-disk size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Number of live (non-tombstone) records.
    pub fn size(&self) -> usize {
        self.stats.live()
    }

    /// Snapshot of the stats counters.
    pub fn stats(&self) -> TableStats {
        self.stats
    }

    /// Number of sparse index entries. Exposed for tests.
    pub fn index_len(&self) -> usize {
        self.sparse_index.len()
    }
}

impl ReadableTable for SSTable {
    /// Layered-read probe. A parse or I/O failure here is unrecoverable
    /// corruption and terminates the process.
    fn lookup(&self, key: &[u8]) -> Lookup {
        SSTable::lookup(self, key)
            .unwrap_or_else(|e| storage_fatal("SSTable point lookup failed", e))
    }

    fn get(&self, key: &[u8]) -> Vec<u8> {
        SSTable::get(self, key)
            .unwrap_or_else(|e| storage_fatal("SSTable point read failed", e))
    }

    fn size(&self) -> usize {
        SSTable::size(self)
    }
}
