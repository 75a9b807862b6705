//! # Segment Codec & I/O Handle
//!
//! A *segment* is the single on-disk record unit of the engine: one key,
//! one value, and a tombstone flag. This module owns the wire format and
//! [`SegmentIo`], a positioned read+write file handle that parses and
//! appends segments one record at a time.
//!
//! # On-disk layout
//!
//! ```text
//! [KEY_SIZE_LE_U32][VAL_SIZE_LE_U32][KEY_BYTES][VAL_BYTES][TOMBSTONE_U8]
//! ```
//!
//! Every record occupies `9 + key_size + val_size` bytes. There is no file
//! header, footer, or checksum; a table file is a bare concatenation of
//! records.
//!
//! # Contracts
//!
//! - `read_next` requires `!at_end()`. A record whose declared sizes exceed
//!   the remaining file bytes, a short read, or a tombstone byte other than
//!   `0`/`1` is reported as [`SegmentIoError::Corrupt`]; table files are
//!   immutable, so a malformed record cannot be repaired in-band.
//! - The handle is **not** concurrency-safe. Callers serialize access and
//!   seek before reading; the owning table wraps the handle in a mutex.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::trace;

/// Fixed bytes per record before the key/value payloads: two `u32` size
/// fields plus the tombstone byte.
pub const SEGMENT_HEADER_BYTES: u64 = 9;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment I/O operations.
#[derive(Debug, Error)]
pub enum SegmentIoError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record on disk failed to parse. Table files are written once and
    /// never modified, so this indicates unrecoverable corruption.
    #[error("corrupt segment at offset {offset}: {reason}")]
    Corrupt {
        /// File offset of the record that failed to parse.
        offset: u64,
        /// What went wrong.
        reason: String,
    },

    /// A key or value exceeds the `u32` size field of the wire format.
    #[error("record exceeds wire format limit ({0} bytes)")]
    RecordTooLarge(usize),
}

// ------------------------------------------------------------------------------------------------
// Segment
// ------------------------------------------------------------------------------------------------

/// A single key/value/tombstone record.
///
/// Segments compare by key only; the engine never orders records by value
/// or tombstone state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Record key. At most `u32::MAX` bytes.
    pub key: Vec<u8>,

    /// Record value. Empty for tombstones; at most `u32::MAX` bytes.
    pub value: Vec<u8>,

    /// Whether this record marks the key as erased. A tombstone in a newer
    /// layer masks the key in every older layer.
    pub tombstone: bool,
}

impl Segment {
    /// Creates a live segment.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            tombstone: false,
        }
    }

    /// Creates a tombstone segment with an empty value.
    pub fn new_tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            tombstone: true,
        }
    }

    /// Number of bytes this segment occupies on disk.
    pub fn encoded_len(&self) -> u64 {
        SEGMENT_HEADER_BYTES + self.key.len() as u64 + self.value.len() as u64
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment {
    /// Lexicographic byte comparison on the key.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentIo: positioned record-at-a-time file handle
// ------------------------------------------------------------------------------------------------

/// A read+write file handle that reads and appends [`Segment`] records at
/// an explicit byte offset.
///
/// Opening an existing file never truncates it; a missing file is created
/// empty. The handle tracks its own offset and the current file length, so
/// `at_end` is a pure field comparison.
#[derive(Debug)]
pub struct SegmentIo {
    /// Canonical path of the backing file.
    path: PathBuf,

    /// The open file. Its OS cursor always matches `offset`.
    file: File,

    /// Current byte position.
    offset: u64,

    /// Current file length in bytes. Updated on every write.
    len: u64,
}

impl SegmentIo {
    /// Opens (or creates) the file at `path` for segment I/O, positioned
    /// at the start.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SegmentIoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let path = path.as_ref().canonicalize()?;

        trace!(path = %path.display(), len, "opened segment file");

        Ok(Self {
            path,
            file,
            offset: 0,
            len,
        })
    }

    /// Seeks back to the start of the file.
    pub fn reset(&mut self) -> Result<(), SegmentIoError> {
        self.seek(0)
    }

    /// Current byte position.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Moves the handle to an absolute byte offset.
    pub fn seek(&mut self, offset: u64) -> Result<(), SegmentIoError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    /// True iff the offset sits exactly at the end of the file.
    pub fn at_end(&self) -> bool {
        self.offset == self.len
    }

    /// Current file length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True iff the file holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Canonical path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parses the record at the current offset and advances past it.
    ///
    /// Requires `!at_end()`; reading past the end is an engine bug, not a
    /// recoverable condition.
    pub fn read_next(&mut self) -> Result<Segment, SegmentIoError> {
        assert!(!self.at_end(), "read_next past end of {}", self.path.display());

        let record_offset = self.offset;
        let remaining = self.len - self.offset;

        if remaining < SEGMENT_HEADER_BYTES {
            return Err(SegmentIoError::Corrupt {
                offset: record_offset,
                reason: format!("{remaining} trailing bytes cannot hold a record header"),
            });
        }

        let key_size = self.read_u32()?;
        let val_size = self.read_u32()?;

        let payload = key_size as u64 + val_size as u64;
        if SEGMENT_HEADER_BYTES + payload > remaining {
            return Err(SegmentIoError::Corrupt {
                offset: record_offset,
                reason: format!(
                    "declared sizes (key={key_size}, val={val_size}) exceed {remaining} remaining bytes"
                ),
            });
        }

        let mut key = vec![0u8; key_size as usize];
        self.file.read_exact(&mut key)?;
        let mut value = vec![0u8; val_size as usize];
        self.file.read_exact(&mut value)?;

        let mut flag = [0u8; 1];
        self.file.read_exact(&mut flag)?;
        let tombstone = match flag[0] {
            0 => false,
            1 => true,
            byte => {
                return Err(SegmentIoError::Corrupt {
                    offset: record_offset,
                    reason: format!("invalid tombstone byte 0x{byte:02X}"),
                });
            }
        };

        self.offset += SEGMENT_HEADER_BYTES + payload;

        Ok(Segment {
            key,
            value,
            tombstone,
        })
    }

    /// Serializes one segment at the current offset and advances past it.
    pub fn write(&mut self, segment: &Segment) -> Result<(), SegmentIoError> {
        if segment.key.len() > u32::MAX as usize {
            return Err(SegmentIoError::RecordTooLarge(segment.key.len()));
        }
        if segment.value.len() > u32::MAX as usize {
            return Err(SegmentIoError::RecordTooLarge(segment.value.len()));
        }

        let mut buf = Vec::with_capacity(
            SEGMENT_HEADER_BYTES as usize + segment.key.len() + segment.value.len(),
        );
        buf.extend_from_slice(&(segment.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(segment.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&segment.key);
        buf.extend_from_slice(&segment.value);
        buf.push(segment.tombstone as u8);

        self.file.write_all(&buf)?;
        self.offset += buf.len() as u64;
        self.len = self.len.max(self.offset);

        Ok(())
    }

    /// Durably syncs all written records to disk.
    pub fn flush(&mut self) -> Result<(), SegmentIoError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32, SegmentIoError> {
        let mut buf = [0u8; U32_SIZE];
        self.file.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}
