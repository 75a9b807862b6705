//! Streaming k-way merge across an ordered list of parent SSTables.
//!
//! Parents are ordered newest (index 0) to oldest (index N-1); the parent
//! index doubles as the *age* of every segment it produces. The merge
//! keeps one cached front segment per parent, repeatedly selects the
//! minimum-key candidate (ties go to the smaller index, the newer table),
//! and funnels candidates through a single-slot [`MergeBuffer`].
//!
//! The buffer is what makes same-key collisions safe: a key is emitted
//! only after a candidate with a *different* key arrives, at which point
//! no parent can still produce a younger version (each parent's stream is
//! ascending, so every later read yields keys at or above the candidate's).
//!
//! Tombstones are dropped on emission. The controller always merges the
//! whole live list down to the base table, so no older layer survives for
//! a dropped tombstone to unmask.

use std::sync::Arc;

use tracing::trace;

use crate::segment::{Segment, SegmentIo};

use super::{SSTable, SSTableError};

// ------------------------------------------------------------------------------------------------
// ParentCursor
// ------------------------------------------------------------------------------------------------

/// Read position into one parent table.
///
/// The cursor shares the parent's own file handle; it saves its byte
/// offset between reads and re-seeks under the handle lock each time, so
/// concurrent point lookups on the same parent interleave safely.
struct ParentCursor {
    table: Arc<SSTable>,
    offset: u64,
    cached: Option<Segment>,
    exhausted: bool,
}

impl ParentCursor {
    fn new(table: Arc<SSTable>) -> Self {
        Self {
            table,
            offset: 0,
            cached: None,
            exhausted: false,
        }
    }

    /// Ensures a front segment is cached, parsing one if needed.
    fn fill(&mut self) -> Result<(), SSTableError> {
        if self.cached.is_some() || self.exhausted {
            return Ok(());
        }

        let mut io = self.table.io.lock();
        io.seek(self.offset)?;
        if io.at_end() {
            self.exhausted = true;
        } else {
            self.cached = Some(io.read_next()?);
            self.offset = io.offset();
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// MergeBuffer
// ------------------------------------------------------------------------------------------------

/// Holds at most one pending `(segment, age)` pair during a merge.
///
/// When nonempty, the buffer holds the most recent version seen so far of
/// a key that may still receive updates from parents not yet exhausted.
struct MergeBuffer {
    pending: Option<(Segment, usize)>,
}

impl MergeBuffer {
    fn new() -> Self {
        Self { pending: None }
    }

    /// Feeds one candidate into the buffer, emitting the previously
    /// pending segment if its key is now final.
    fn offer(
        &mut self,
        segment: Segment,
        age: usize,
        out: &mut SegmentIo,
    ) -> Result<(), SSTableError> {
        match &self.pending {
            None => {
                self.pending = Some((segment, age));
            }
            Some((pending, pending_age)) => {
                if pending.key != segment.key {
                    // No younger occurrence of the pending key can appear:
                    // every remaining read yields keys >= this candidate's.
                    Self::emit(pending, out)?;
                    self.pending = Some((segment, age));
                } else if age < *pending_age {
                    // Same key from a younger parent replaces the buffer.
                    self.pending = Some((segment, age));
                } else {
                    trace!(age, "discarding stale version during merge");
                }
            }
        }
        Ok(())
    }

    /// Emits the held segment, if any, after all parents are exhausted.
    fn finish(&mut self, out: &mut SegmentIo) -> Result<(), SSTableError> {
        if let Some((pending, _)) = self.pending.take() {
            Self::emit(&pending, out)?;
        }
        Ok(())
    }

    fn emit(segment: &Segment, out: &mut SegmentIo) -> Result<(), SSTableError> {
        if segment.tombstone {
            // The merge includes the base table; the deletion is spent.
            return Ok(());
        }
        out.write(segment)?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Merge driver
// ------------------------------------------------------------------------------------------------

/// Merges `parents` (newest first) into `out`, then syncs the writer.
pub(crate) fn merge_parents(
    out: &mut SegmentIo,
    parents: &[Arc<SSTable>],
) -> Result<(), SSTableError> {
    let mut cursors: Vec<ParentCursor> = parents
        .iter()
        .map(|table| ParentCursor::new(Arc::clone(table)))
        .collect();
    let mut buffer = MergeBuffer::new();

    loop {
        // Make sure every non-exhausted parent has its front segment
        // cached before choosing the candidate.
        for cursor in cursors.iter_mut() {
            cursor.fill()?;
        }

        // Minimum key wins; on equal keys the smaller parent index (the
        // newer table) wins. Scanning in index order and replacing only on
        // a strictly smaller key implements that tie-break.
        let mut candidate: Option<usize> = None;
        for idx in 0..cursors.len() {
            let Some(cached) = &cursors[idx].cached else {
                continue;
            };
            candidate = match candidate {
                None => Some(idx),
                Some(best) => {
                    let best_key = cursors[best]
                        .cached
                        .as_ref()
                        .expect("candidate cursor lost its cached segment")
                        .key
                        .as_slice();
                    if cached.key.as_slice() < best_key {
                        Some(idx)
                    } else {
                        Some(best)
                    }
                }
            };
        }

        let Some(idx) = candidate else {
            break; // every parent exhausted with nothing cached
        };

        let segment = cursors[idx]
            .cached
            .take()
            .expect("candidate cursor lost its cached segment");
        buffer.offer(segment, idx, out)?;
    }

    buffer.finish(out)?;
    out.flush()?;
    Ok(())
}
