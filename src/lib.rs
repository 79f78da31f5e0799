//! Package implement storage statistics and crash-safe index builds for a
//! btree backed document store.
//!
//! A [Database] owns a directory of collections. Each collection lays out its
//! documents as records inside fixed-size extents, and maintains one or more
//! btree indexes over those documents. On top of this storage model the
//! package provides three engines:
//!
//! * [diag::Walker], walks extents and chunks of a collection and computes
//!   occupancy statistics, `diskStorageStats` and `pagesInRAM`.
//! * [diag::Inspector], samples an index btree level by level and computes
//!   per level and overall descriptive statistics, `indexStats`.
//! * [build::IndexBuild], builds a new index out-of-place, in foreground or
//!   in background, journaling its progress so that a crash mid-build leaves
//!   the index either absent or finalized, never corrupt.
//!
//! Diagnostic commands are exposed as JSON documents via
//! [Database::run_command], responses are `{ok: 1, ...}` or
//! `{ok: 0, errmsg: "..."}`.
//!
//! ```ignore
//! let db = Database::open(Config::new(dir))?;
//! let coll = db.create_collection("test.docs", None)?;
//! coll.insert(json!({"a": 10}))?;
//! let res = db.run_command(&json!({"indexStats": "test.docs", "index": "_id_"}));
//! ```

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(InvalidInput, msg: "bad argument");
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, std::fs::read(file_path));
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, std::fs::read(file_path), "read failed");
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err($crate::Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

mod config;
mod database;
mod error;

pub mod build;
pub mod diag;
pub mod index;
pub mod stats;
pub mod store;
pub mod util;

pub use crate::config::{Config, TomlConfig};
pub use crate::database::Database;
pub use crate::error::Error;

/// Type alias for Result return type, used by this package.
pub type Result<T> = std::result::Result<T, Error>;
