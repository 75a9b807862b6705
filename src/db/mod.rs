//! # DB Controller Module
//!
//! The orchestration layer of the engine: owns the two memtable slots and
//! the two SSTable lists, services reads and writes, and drives background
//! compaction (the *table roll*) on the worker pool.
//!
//! ## Layered visibility
//!
//! Reads probe `primary memtable → secondary memtable → SSTables newest to
//! oldest` and stop at the first layer that knows the key. A tombstone in
//! a newer layer short-circuits to "not present"; this is what lets a
//! delete mask values that still exist in older tables on disk.
//!
//! ## Roll protocol
//!
//! The roll job freezes the primary memtable, rotates it into the
//! secondary slot, flushes it to a staging level-0 table, merges the live
//! table list into a staging base table, swaps the staged list in, and
//! renames the staged files over the canonical level files. A
//! [`ScopedRelease`](utils::ScopedRelease) guard re-enqueues the next roll
//! on every exit path, after sleeping out the configured minimum gap.
//!
//! Writers racing a roll see at most a brief window in which the primary
//! memtable is frozen; `put`/`erase` spin until the fresh primary accepts
//! the write. Readers are never blocked: they clone table references under
//! short read locks and keep reading their snapshot through any swap.
//!
//! ## Fault policy
//!
//! Background flush/merge/rename failures and read-path corruption have no
//! recovery story inside a running engine; they log and abort. Restart
//! recovery is simply reopening the canonical level files, which
//! [`DbController::new`] does.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod utils;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::memtable::Memtable;
use crate::sstable::{SSTable, SSTableError, DEFAULT_INDEX_OFFSET_BYTES};
use crate::table::{storage_fatal, Lookup, ReadableTable};
use crate::workerpool::WorkerPool;
use self::utils::ScopedRelease;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Canonical name of the most recently flushed memtable's table.
pub const LEVEL0_FILE: &str = "lvl_0.strata";

/// Canonical name of the merged base table.
pub const BASE_FILE: &str = "lvl_base.strata";

/// Suffix appended to canonical names for staged files during a roll.
pub const STAGING_SUFFIX: &str = ".secondary";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced while constructing a [`DbController`].
///
/// A running controller has no recoverable errors; see the module docs.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failure opening an existing level file.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`DbController`] instance.
///
/// Passed to [`DbController::new`]; there are no global flags or hidden
/// singletons.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding the level files.
    pub db_directory: PathBuf,

    /// Minimum wall-clock interval between consecutive roll jobs.
    pub background_task_min_gap: Duration,

    /// Worker pool size; `0` selects the host's hardware concurrency.
    pub num_worker_threads: usize,

    /// Minimum byte gap between sparse index entries in SSTables.
    pub index_offset_bytes: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_directory: PathBuf::from("stratadb_data"),
            background_task_min_gap: Duration::from_millis(1000),
            num_worker_threads: 0,
            index_offset_bytes: DEFAULT_INDEX_OFFSET_BYTES,
        }
    }
}

/// Snapshot of controller statistics returned by [`DbController::stats`].
#[derive(Debug)]
pub struct DbStats {
    /// Live entries in the primary memtable.
    pub memtable_entries: usize,

    /// Number of SSTables in the live list.
    pub sstable_count: usize,

    /// Sum of live-list SSTable file sizes in bytes.
    pub total_sstable_bytes: u64,
}

// ------------------------------------------------------------------------------------------------
// Controller state
// ------------------------------------------------------------------------------------------------

struct MemtableSlots {
    /// Receives all writes.
    primary: Arc<Memtable>,

    /// Always frozen: either empty between rolls or holding the pre-flush
    /// snapshot while a roll is writing it out.
    secondary: Arc<Memtable>,
}

struct SstableSlots {
    /// Live read list, newest first; the last element is the base table.
    primary: Vec<Arc<SSTable>>,

    /// Staging list built during a roll; empty whenever no roll is
    /// mid-flight.
    secondary: Vec<Arc<SSTable>>,
}

struct ControllerInner {
    config: DbConfig,
    memtables: RwLock<MemtableSlots>,
    sstables: RwLock<SstableSlots>,
    pool: WorkerPool,
    started: AtomicBool,

    /// Set by [`DbController`]'s drop; wakes a roll job sleeping out its
    /// minimum gap so shutdown is not held hostage by the timer.
    stopping: Mutex<bool>,
    stop_signal: Condvar,
}

/// The embedded key/value store handle.
///
/// Dropping the controller stops rescheduling rolls, wakes any roll
/// sleeping out its gap, waits for in-flight background work, and joins
/// the worker pool.
pub struct DbController {
    inner: Arc<ControllerInner>,
}

impl DbController {
    /// Opens (or creates) a database rooted at `config.db_directory`.
    ///
    /// Existing canonical level files are reopened (newest first) so a
    /// restart serves everything the previous run persisted. Staging
    /// files left behind by an interrupted roll are removed.
    pub fn new(config: DbConfig) -> Result<Self, DbError> {
        fs::create_dir_all(&config.db_directory)?;

        // An interrupted roll can leave staged siblings behind; they were
        // never visible to readers, so they are safe to discard.
        for name in [LEVEL0_FILE, BASE_FILE] {
            let staged = config
                .db_directory
                .join(format!("{name}{STAGING_SUFFIX}"));
            match fs::remove_file(&staged) {
                Ok(()) => warn!(path = %staged.display(), "removed stale staging file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut primary_sstables = Vec::new();
        for name in [LEVEL0_FILE, BASE_FILE] {
            let path = config.db_directory.join(name);
            if path.exists() {
                let table = SSTable::open(&path, config.index_offset_bytes)?;
                primary_sstables.push(Arc::new(table));
            }
        }

        let num_threads = if config.num_worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.num_worker_threads
        };

        let secondary = Memtable::new();
        secondary.freeze();

        info!(
            directory = %config.db_directory.display(),
            reopened_tables = primary_sstables.len(),
            num_threads,
            "creating DB controller"
        );

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                memtables: RwLock::new(MemtableSlots {
                    primary: Arc::new(Memtable::new()),
                    secondary: Arc::new(secondary),
                }),
                sstables: RwLock::new(SstableSlots {
                    primary: primary_sstables,
                    secondary: Vec::new(),
                }),
                pool: WorkerPool::new(num_threads),
                started: AtomicBool::new(false),
                stopping: Mutex::new(false),
                stop_signal: Condvar::new(),
            }),
        })
    }

    /// Begins background compaction. Idempotent; must be called before any
    /// read or write.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("starting DB controller");
        let weak = Arc::downgrade(&self.inner);
        self.inner.pool.enqueue(move || {
            if let Some(inner) = weak.upgrade() {
                ControllerInner::roll_tables(&inner);
            }
        });
    }

    /// Inserts or overwrites a key.
    ///
    /// Spins while the primary memtable is frozen for a swap; the freeze
    /// window is the time to exchange two slot handles.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.assert_started();
        loop {
            let primary = self.inner.memtables.read().primary.clone();
            if primary.put(key, value, false) {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Records a deletion for a key. Same retry discipline as
    /// [`DbController::put`].
    pub fn erase(&self, key: &[u8]) {
        self.assert_started();
        loop {
            let primary = self.inner.memtables.read().primary.clone();
            if primary.erase(key) {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Returns the value stored for `key`, or empty bytes when the key is
    /// absent or erased.
    pub fn get(&self, key: &[u8]) -> Vec<u8> {
        self.assert_started();
        for layer in self.read_layers() {
            match layer.lookup(key) {
                Lookup::Live => return layer.get(key),
                Lookup::Tombstone => return Vec::new(),
                Lookup::Absent => {}
            }
        }
        Vec::new()
    }

    /// True iff `key` currently maps to a live value.
    pub fn key_exists(&self, key: &[u8]) -> bool {
        self.assert_started();
        for layer in self.read_layers() {
            match layer.lookup(key) {
                Lookup::Live => return true,
                Lookup::Tombstone => return false,
                Lookup::Absent => {}
            }
        }
        false
    }

    /// Snapshot of controller statistics.
    pub fn stats(&self) -> DbStats {
        let memtable_entries = self.inner.memtables.read().primary.size();
        let tables = self.inner.sstables.read();
        DbStats {
            memtable_entries,
            sstable_count: tables.primary.len(),
            total_sstable_bytes: tables.primary.iter().map(|t| t.size_bytes()).sum(),
        }
    }

    /// Snapshot of the current read stack, newest layer first.
    ///
    /// The clones are taken under short read locks; a concurrent list swap
    /// leaves this snapshot fully readable (the old files stay open
    /// through their handles).
    fn read_layers(&self) -> Vec<Arc<dyn ReadableTable>> {
        let (primary, secondary) = {
            let slots = self.inner.memtables.read();
            (slots.primary.clone(), slots.secondary.clone())
        };

        let mut layers: Vec<Arc<dyn ReadableTable>> = vec![primary, secondary];
        layers.extend(
            self.inner
                .sstables
                .read()
                .primary
                .iter()
                .map(|table| Arc::clone(table) as Arc<dyn ReadableTable>),
        );
        layers
    }

    fn assert_started(&self) {
        assert!(
            self.inner.started.load(Ordering::SeqCst),
            "DbController::start() must be called before use"
        );
    }
}

impl Drop for DbController {
    fn drop(&mut self) {
        *self.inner.stopping.lock() = true;
        self.inner.stop_signal.notify_all();
    }
}

// ------------------------------------------------------------------------------------------------
// Roll (compaction) protocol
// ------------------------------------------------------------------------------------------------

impl ControllerInner {
    /// Background roll job: performs one roll, then reschedules itself
    /// after the minimum gap, on every exit path.
    fn roll_tables(inner: &Arc<ControllerInner>) {
        let start_time = Instant::now();
        let reschedule = Arc::clone(inner);

        let _release = ScopedRelease::new(move || {
            reschedule.sleep_remaining_gap(start_time);

            // Queue the next roll through a weak handle so the job chain
            // never keeps the controller alive on its own.
            if *reschedule.stopping.lock() {
                debug!("controller stopping; roll chain ends");
                return;
            }
            let weak = Arc::downgrade(&reschedule);
            reschedule.pool.enqueue(move || {
                if let Some(inner) = weak.upgrade() {
                    ControllerInner::roll_tables(&inner);
                }
            });
        });

        inner.roll_once();
    }

    /// Sleeps until `background_task_min_gap` has elapsed since
    /// `start_time`, or until shutdown is signaled.
    fn sleep_remaining_gap(&self, start_time: Instant) {
        let deadline = start_time + self.config.background_task_min_gap;
        let mut stopping = self.stopping.lock();
        loop {
            if *stopping {
                return;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            let _ = self.stop_signal.wait_for(&mut stopping, remaining);
        }
    }

    /// One complete roll: freeze/rotate the memtable, flush it, merge the
    /// live tables, publish the staged list, rename the files.
    fn roll_once(&self) {
        assert!(
            self.memtables.read().secondary.is_frozen(),
            "secondary memtable must be frozen on roll entry"
        );
        assert!(
            self.sstables.read().secondary.is_empty(),
            "staging SSTable list must be empty on roll entry"
        );

        // 1. Nothing to roll.
        if self.memtables.read().primary.size() == 0 {
            debug!("primary memtable is empty; skipping roll");
            return;
        }

        info!("rolling tables");

        // 2. Freeze the primary and rotate it into the secondary slot.
        //    Writers spinning on the frozen table pick up the fresh
        //    primary as soon as the lock drops.
        let dumped = {
            let mut slots = self.memtables.write();
            slots.primary.freeze();
            let old_primary =
                std::mem::replace(&mut slots.primary, Arc::new(Memtable::new()));
            slots.secondary = Arc::clone(&old_primary);
            old_primary
        };

        let level0_staged = self.staging_path(LEVEL0_FILE);
        let base_staged = self.staging_path(BASE_FILE);

        // 3. Flush the dumped memtable to the staged level-0 table.
        let mut flushed = false;
        if !dumped.is_empty() {
            debug!(entries = dumped.len(), "flushing memtable to staged level 0");
            let table =
                SSTable::flush(&level0_staged, &dumped, self.config.index_offset_bytes)
                    .unwrap_or_else(|e| storage_fatal("memtable flush failed", e));
            self.sstables.write().secondary.push(Arc::new(table));
            flushed = true;
        }

        // 4. Merge the live list into the staged base table.
        let parents = self.sstables.read().primary.clone();
        let mut merged = false;
        if !parents.is_empty() {
            debug!(parents = parents.len(), "merging live tables into staged base");
            let table =
                SSTable::merge(&base_staged, &parents, self.config.index_offset_bytes)
                    .unwrap_or_else(|e| storage_fatal("table merge failed", e));
            self.sstables.write().secondary.push(Arc::new(table));
            merged = true;
        }
        drop(parents);

        // 5 + 6. Publish the staged list, then retire the old files and
        // move the staged ones to their canonical names. In-flight readers
        // keep their snapshot alive through the Arcs they hold; the
        // unlinked files stay readable through their open handles.
        {
            let mut slots = self.sstables.write();
            let SstableSlots { primary, secondary } = &mut *slots;
            std::mem::swap(primary, secondary);
            slots.secondary.clear();

            for name in [LEVEL0_FILE, BASE_FILE] {
                let canonical = self.config.db_directory.join(name);
                match fs::remove_file(&canonical) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => storage_fatal("removing retired level file failed", e),
                }
            }
            if flushed {
                fs::rename(&level0_staged, self.config.db_directory.join(LEVEL0_FILE))
                    .unwrap_or_else(|e| storage_fatal("renaming staged level 0 failed", e));
            }
            if merged {
                fs::rename(&base_staged, self.config.db_directory.join(BASE_FILE))
                    .unwrap_or_else(|e| storage_fatal("renaming staged base failed", e));
            }
        }

        // 7. Reset the secondary slot so the roll precondition holds at
        // the next entry. Done only after the staged list is live, so the
        // dumped data is visible in some layer at every instant.
        {
            let fresh = Memtable::new();
            fresh.freeze();
            self.memtables.write().secondary = Arc::new(fresh);
        }

        info!("table roll complete");
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.config
            .db_directory
            .join(format!("{name}{STAGING_SUFFIX}"))
    }
}
