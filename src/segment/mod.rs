//! Segment (sorted string table) format, reader and writer.
//!
//! A segment is an immutable, on-disk file holding sorted `(key, value)`
//! records plus a sparse index. Segments are produced by flush and by
//! compaction, never mutated in place.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER: 24 bytes]
//!   magic:              u32 LE  (0x53535442, "SSTB")
//!   version:            u32 LE  (1)
//!   entry_count:        u32 LE
//!   index_entry_count:  u32 LE
//!   index_offset:       u64 LE
//! [DATA SECTION]
//!   repeated entry_count times, sorted ascending by key:
//!     key_len:   i32 LE
//!     key_bytes
//!     value_len: i32 LE
//!     value_bytes
//! [SPARSE INDEX SECTION] (starts at index_offset)
//!   repeated index_entry_count times, for every Nth data record:
//!     key_len: i32 LE
//!     key_bytes
//!     offset:  i64 LE   (byte offset of the data record from file start)
//! ```

mod reader;
mod writer;

pub use reader::SegmentReader;
pub use writer::SegmentWriter;

use std::io;
use thiserror::Error;

/// Magic number identifying a segment file (ASCII "SSTB", big-endian reading
/// of the spec's literal constant 0x53535442).
pub const MAGIC: u32 = 0x5353_5442;

/// Current (and only) supported segment format version.
pub const VERSION: u32 = 1;

/// Nominal sparse-index stride: every Nth data record gets an index entry.
pub const SPARSE_INDEX_STRIDE: usize = 16;

/// Size in bytes of the fixed segment header.
pub const HEADER_SIZE: u64 = 24;

/// Errors that can occur while reading or writing a segment file.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt segment: {0}")]
    CorruptSegment(String),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub magic: u32,
    pub version: u32,
    pub entry_count: u32,
    pub index_entry_count: u32,
    pub index_offset: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.index_entry_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index_offset.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Self {
        Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            entry_count: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            index_entry_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            index_offset: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

/// An in-memory `(key, offset)` sparse index entry, loaded at open time.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub key: Vec<u8>,
    pub offset: u64,
}
