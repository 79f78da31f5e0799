use cbordata::Cborize;
use log::warn;

use std::{convert::TryFrom, ffi, fs};

use crate::{
    util::{self, files},
    Result,
};

/// Durable operations on a collection, appended to its data file in the
/// order they are applied.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub enum Op {
    /// First operation in every data file.
    Create { capped: Option<u64> },
    /// Insert document, serialized as JSON text.
    Insert { seqno: u64, doc: Vec<u8> },
    Remove { seqno: u64 },
    /// Index specification, serialized as JSON text.
    CreateIndex { spec: Vec<u8> },
    DropIndex { name: String },
}

impl Op {
    const ID: u32 = 0x0;
}

/// Append only file of [Op] values, each encoded in cbor.
pub struct DataFile {
    location: ffi::OsString,
    file: fs::File,
    fsync: bool,
}

impl DataFile {
    /// Create a new data file, an older file at `location` is removed.
    pub fn create(location: &ffi::OsStr, fsync: bool) -> Result<DataFile> {
        let file = files::create_file_a(location)?;
        Ok(DataFile {
            location: location.to_os_string(),
            file,
            fsync,
        })
    }

    /// Open an existing data file and return all its operations. A torn
    /// trailing operation, from a crash in the middle of a write, is
    /// discarded and truncated from the file.
    pub fn open(location: &ffi::OsStr, fsync: bool) -> Result<(DataFile, Vec<Op>)> {
        let data = err_at!(IOError, fs::read(location))?;

        let (mut ops, mut fpos) = (vec![], 0_usize);
        while fpos < data.len() {
            match util::from_cbor_bytes::<Op>(&data[fpos..]) {
                Ok((op, n)) => {
                    ops.push(op);
                    fpos += n;
                }
                Err(err) => {
                    warn!(
                        target: "storage",
                        "{:?}, discarding torn tail at {}/{}: {}",
                        location, fpos, data.len(), err
                    );
                    break;
                }
            }
        }

        let file = files::open_file_a(location)?;
        if fpos < data.len() {
            let fpos = err_at!(FailConvert, u64::try_from(fpos))?;
            err_at!(IOError, file.set_len(fpos))?;
        }

        let df = DataFile {
            location: location.to_os_string(),
            file,
            fsync,
        };
        Ok((df, ops))
    }

    /// Append operation, return the number of bytes written.
    pub fn append(&mut self, op: Op) -> Result<usize> {
        let data = util::into_cbor_bytes(op)?;
        files::sync_write(&mut self.file, &data, self.fsync)
    }

    pub fn to_location(&self) -> ffi::OsString {
        self.location.clone()
    }

    /// Remove the data file from disk.
    pub fn purge(self) -> Result<()> {
        let DataFile { location, file, .. } = self;
        std::mem::drop(file);
        err_at!(IOError, fs::remove_file(&location))
    }
}

#[cfg(test)]
#[path = "datafile_test.rs"]
mod datafile_test;
