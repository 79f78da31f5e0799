use std::{error, fmt, result};

/// Error variants that are returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and a human readable message.
#[derive(Clone, PartialEq)]
pub enum Error {
    /// Invariant broken, or internal state is inconsistent.
    Fatal(String, String),
    /// Failure while reading/writing a file, shall abort the in-progress
    /// operation but not the process.
    IOError(String, String),
    FailCbor(String, String),
    FailConvert(String, String),
    InvalidFormat(String, String),
    InvalidFile(String, String),
    /// Bad or missing argument, or a bad combination of arguments.
    InvalidInput(String, String),
    /// Requested index, extent or collection does not exist.
    NotFound(String, String),
    /// Duplicate key, or an index that conflicts with an existing one.
    Conflict(String, String),
    /// Operation or command not supported in this build/collection.
    Unsupported(String, String),
    /// Operation was cancelled, or the underlying collection went away.
    Aborted(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
}

impl Error {
    /// Return the message part of the error, without location prefix.
    pub fn to_errmsg(&self) -> String {
        use Error::*;

        match self {
            Fatal(_, m) | IOError(_, m) | FailCbor(_, m) | FailConvert(_, m) => {
                m.to_string()
            }
            InvalidFormat(_, m) | InvalidFile(_, m) | InvalidInput(_, m) => {
                m.to_string()
            }
            NotFound(_, m) | Conflict(_, m) | Unsupported(_, m) | Aborted(_, m) => {
                m.to_string()
            }
            IPCFail(_, m) | ThreadFail(_, m) => m.to_string(),
        }
    }

    /// Return the numeric code for this error, used in command responses.
    pub fn to_code(&self) -> i64 {
        use Error::*;

        match self {
            InvalidInput(_, _) => 2,
            NotFound(_, _) => 26,
            Conflict(_, _) => 11000,
            Unsupported(_, _) => 115,
            Aborted(_, _) => 11601,
            IOError(_, _) => 5,
            _ => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, msg) => write!(f, "{} Fatal: {}", p, msg),
            IOError(p, msg) => write!(f, "{} IOError: {}", p, msg),
            FailCbor(p, msg) => write!(f, "{} FailCbor: {}", p, msg),
            FailConvert(p, msg) => write!(f, "{} FailConvert: {}", p, msg),
            InvalidFormat(p, msg) => write!(f, "{} InvalidFormat: {}", p, msg),
            InvalidFile(p, msg) => write!(f, "{} InvalidFile: {}", p, msg),
            InvalidInput(p, msg) => write!(f, "{} InvalidInput: {}", p, msg),
            NotFound(p, msg) => write!(f, "{} NotFound: {}", p, msg),
            Conflict(p, msg) => write!(f, "{} Conflict: {}", p, msg),
            Unsupported(p, msg) => write!(f, "{} Unsupported: {}", p, msg),
            Aborted(p, msg) => write!(f, "{} Aborted: {}", p, msg),
            IPCFail(p, msg) => write!(f, "{} IPCFail: {}", p, msg),
            ThreadFail(p, msg) => write!(f, "{} ThreadFail: {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
