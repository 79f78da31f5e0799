use croaring::bitmap::Bitmap;
use serde_json::Value;

use std::{
    collections::{btree_map, BTreeMap},
    convert::TryFrom,
    fmt,
    ops::Bound,
    result,
    sync::{Arc, Mutex},
};

use crate::store::{EXTENT_HEADER_SIZE, MIN_FREE_SIZE, PAGE_SIZE};

/// A single document stored in an extent.
#[derive(Clone, Debug)]
pub struct Record {
    /// Insert sequence number, unique and monotonically increasing within
    /// a collection.
    pub seqno: u64,
    /// On-disk length, record header included.
    pub length: usize,
    /// Serialized size of the document.
    pub bson_size: usize,
    pub doc: Arc<Value>,
}

/// Extent is a contiguous region of a collection's storage, holding records
/// and free blocks. Offsets are relative to the start of the extent, the
/// first [EXTENT_HEADER_SIZE] bytes are reserved for the header.
pub struct Extent {
    num: usize,
    length: usize,
    records: BTreeMap<usize, Record>,
    free: BTreeMap<usize, usize>,
    // pages of this extent that are resident in memory.
    resident: Mutex<Bitmap>,
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "extent<{},{} records:{} free:{}>",
            self.num,
            self.length,
            self.records.len(),
            self.free.len()
        )
    }
}

impl Extent {
    /// Create a new extent, `length` must exceed [EXTENT_HEADER_SIZE]. All
    /// the space after the header starts as a single free block.
    pub fn new(num: usize, length: usize) -> Extent {
        let mut free = BTreeMap::new();
        if length > EXTENT_HEADER_SIZE {
            free.insert(EXTENT_HEADER_SIZE, length - EXTENT_HEADER_SIZE);
        }

        let extent = Extent {
            num,
            length,
            records: BTreeMap::new(),
            free,
            resident: Mutex::new(Bitmap::create()),
        };
        extent.touch(0, EXTENT_HEADER_SIZE);
        extent
    }

    /// First-fit allocation of `length` bytes. Return the offset and the
    /// allocated length, which can be larger than `length` when the
    /// remaining space is too small to be a free block of its own.
    pub fn alloc(&mut self, length: usize) -> Option<(usize, usize)> {
        let (ofs, avail) = self
            .free
            .iter()
            .find(|(_, avail)| **avail >= length)
            .map(|(ofs, avail)| (*ofs, *avail))?;

        self.free.remove(&ofs);
        match avail - length {
            rem if rem >= MIN_FREE_SIZE => {
                self.free.insert(ofs + length, rem);
                Some((ofs, length))
            }
            _ => Some((ofs, avail)),
        }
    }

    /// Place record at `ofs`, previously allocated using [Extent::alloc].
    pub fn insert(&mut self, ofs: usize, record: Record) {
        self.touch(ofs, record.length);
        self.records.insert(ofs, record);
    }

    /// Remove record at `ofs`, its space is returned as a free block.
    pub fn remove(&mut self, ofs: usize) -> Option<Record> {
        let record = self.records.remove(&ofs)?;
        self.touch(ofs, record.length);
        self.release(ofs, record.length);
        Some(record)
    }

    // coalesce with neighbouring free blocks.
    fn release(&mut self, mut ofs: usize, mut length: usize) {
        let prev = self
            .free
            .range((Bound::Unbounded, Bound::Excluded(ofs)))
            .next_back()
            .map(|(o, l)| (*o, *l));
        if let Some((pofs, plen)) = prev {
            if pofs + plen == ofs {
                self.free.remove(&pofs);
                ofs = pofs;
                length += plen;
            }
        }
        if let Some(nlen) = self.free.remove(&(ofs + length)) {
            length += nlen;
        }
        self.free.insert(ofs, length);
    }

    /// Read record at `ofs`, pages spanned by the record become resident.
    pub fn get(&self, ofs: usize) -> Option<&Record> {
        let record = self.records.get(&ofs)?;
        self.touch(ofs, record.length);
        Some(record)
    }

    fn touch(&self, ofs: usize, length: usize) {
        if length == 0 {
            return;
        }
        if let Ok(mut bitmap) = self.resident.lock() {
            let (from, till) = (ofs / PAGE_SIZE, (ofs + length - 1) / PAGE_SIZE);
            for page in from..=till {
                if let Ok(page) = u32::try_from(page) {
                    bitmap.add(page)
                }
            }
        }
    }

    /// Drop all pages of this extent from memory.
    pub fn evict_pages(&self) {
        if let Ok(mut bitmap) = self.resident.lock() {
            *bitmap = Bitmap::create();
        }
    }
}

impl Extent {
    #[inline]
    pub fn to_num(&self) -> usize {
        self.num
    }

    #[inline]
    pub fn to_length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn len_records(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn len_free(&self) -> usize {
        self.free.len()
    }

    /// Records in offset order.
    pub fn iter_records(&self) -> btree_map::Iter<usize, Record> {
        self.records.iter()
    }

    /// Free blocks in offset order, as (offset, length).
    pub fn iter_free(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free.iter().map(|(ofs, length)| (*ofs, *length))
    }

    pub fn to_used_size(&self) -> usize {
        self.records.values().map(|r| r.length).sum()
    }

    pub fn to_free_size(&self) -> usize {
        self.free.values().sum()
    }

    /// Number of records placed before a record inserted earlier than
    /// itself, walking the extent in offset order.
    pub fn to_out_of_order(&self) -> usize {
        let mut prev = 0;
        let mut n = 0;
        for record in self.records.values() {
            if record.seqno < prev {
                n += 1;
            }
            prev = record.seqno;
        }
        n
    }

    pub fn is_resident(&self, page: usize) -> bool {
        match (self.resident.lock(), u32::try_from(page)) {
            (Ok(bitmap), Ok(page)) => bitmap.contains(page),
            _ => false,
        }
    }

    pub fn to_resident_pages(&self) -> u64 {
        match self.resident.lock() {
            Ok(bitmap) => bitmap.cardinality(),
            Err(_) => 0,
        }
    }

    /// Number of bytes, within `start..end`, that are resident in memory.
    pub fn to_resident_bytes(&self, start: usize, end: usize) -> usize {
        let end = usize::min(end, self.length);
        if start >= end {
            return 0;
        }

        let mut bytes = 0;
        for page in (start / PAGE_SIZE)..=((end - 1) / PAGE_SIZE) {
            if self.is_resident(page) {
                let (pstart, pend) = (page * PAGE_SIZE, (page + 1) * PAGE_SIZE);
                bytes += usize::min(pend, end) - usize::max(pstart, start);
            }
        }
        bytes
    }
}

#[cfg(test)]
#[path = "extent_test.rs"]
mod extent_test;
