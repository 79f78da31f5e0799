use serde::de::DeserializeOwned;

use std::{ffi, fs, io::Write, path};

use crate::Result;

/// Create a file in append mode for writing, an older file at the same
/// location shall be removed.
pub fn create_file_a(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = {
        let os_file = path::Path::new(file);
        fs::remove_file(os_file).ok(); // NOTE: ignore remove errors.
        os_file
    };

    {
        let parent = match os_file.parent() {
            Some(parent) => Ok(parent),
            None => err_at!(InvalidFile, msg: "{:?}", file),
        }?;
        err_at!(IOError, fs::create_dir_all(parent))?;
    };

    let mut opts = fs::OpenOptions::new();
    err_at!(IOError, opts.append(true).create_new(true).open(os_file))
}

/// Open existing file in append mode for writing.
pub fn open_file_a(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(file);
    let mut opts = fs::OpenOptions::new();
    err_at!(IOError, opts.append(true).open(os_file))
}

/// Open file for reading.
pub fn open_file_r(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(file);
    err_at!(IOError, fs::OpenOptions::new().read(true).open(os_file))
}

/// Write `data` into file and optionally `fsync` it. Partial writes are
/// treated as error.
pub fn sync_write(file: &mut fs::File, data: &[u8], fsync: bool) -> Result<usize> {
    let n = err_at!(IOError, file.write(data))?;
    if n != data.len() {
        err_at!(IOError, msg: "partial write to file {} {}", n, data.len())?
    }
    if fsync {
        err_at!(IOError, file.sync_all())?;
    }
    Ok(n)
}

/// Load toml file and parse it into type `T`.
pub fn load_toml<P, T>(loc: P) -> Result<T>
where
    P: AsRef<path::Path>,
    T: DeserializeOwned,
{
    let text = err_at!(IOError, fs::read_to_string(loc.as_ref()))?;
    err_at!(InvalidFormat, toml::from_str(&text), "{:?}", loc.as_ref())
}

#[cfg(test)]
#[path = "files_test.rs"]
mod files_test;
