//! Module `store` implement the record storage for collections.
//!
//! A collection lays out its documents as records inside extents. Extents
//! are contiguous regions of a collection's storage, allocated as the
//! collection grows. Every record carries a fixed size header followed by
//! the serialized document. Freed space inside an extent is tracked as free
//! blocks, also called deleted records, which are reused first-fit by later
//! inserts.
//!
//! Every mutation is appended to the collection's data file before it is
//! applied in memory. Allocation is deterministic, hence replaying the data
//! file reproduces the exact extent layout.

mod collection;
mod datafile;
mod extent;

pub use collection::{Collection, Storage};
pub use datafile::{DataFile, Op};
pub use extent::{Extent, Record};

/// Bytes reserved at the beginning of every extent.
pub const EXTENT_HEADER_SIZE: usize = 0xB0;
/// Bytes reserved at the beginning of every record.
pub const RECORD_HEADER_SIZE: usize = 16;
/// Page granularity used to track in-memory residency.
pub const PAGE_SIZE: usize = 4096;
/// Records are aligned to this quantum.
pub const RECORD_ALIGN: usize = 4;
/// Left-over space smaller than this is not split off as a free block.
pub const MIN_FREE_SIZE: usize = 32;
/// Upper limit for a serialized document.
pub const MAX_DOC_SIZE: usize = 16 * 1024 * 1024;

/// Size classes for free blocks. A free block falls in the first bucket
/// whose size is larger than the block, blocks larger than the last size
/// land in the last bucket.
pub const FREE_BUCKET_SIZES: [usize; 19] = [
    0x20, 0x40, 0x80, 0x100, 0x200, 0x400, 0x800, 0x1000, 0x2000, 0x4000, 0x8000,
    0x10000, 0x20000, 0x40000, 0x80000, 0x100000, 0x200000, 0x400000, 0x800000,
];

/// Return the free-block size class for a block of `length` bytes.
pub fn free_bucket(length: usize) -> usize {
    FREE_BUCKET_SIZES
        .iter()
        .position(|size| length < *size)
        .unwrap_or(FREE_BUCKET_SIZES.len() - 1)
}

/// Return the record length, header included, for a document that
/// serializes to `doc_size` bytes.
pub fn to_record_length(doc_size: usize) -> usize {
    crate::util::round_up(RECORD_HEADER_SIZE + doc_size, RECORD_ALIGN)
}

/// Location of a record, extent ordinal and offset from the start of the
/// extent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordLoc {
    pub extent: usize,
    pub ofs: usize,
}

impl RecordLoc {
    pub fn new(extent: usize, ofs: usize) -> RecordLoc {
        RecordLoc { extent, ofs }
    }
}
