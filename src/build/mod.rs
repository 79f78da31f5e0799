//! Module `build` implement crash-safe index builds.
//!
//! A build generates index entries for existing records into a side tree,
//! that is registered with the collection's catalog as a pending index and
//! kept up to date by concurrent writers. Progress is recorded in a journal
//! shared by all builds of a database:
//!
//! ```text
//! Start -> Progress* -> Commit -> Done
//!                  \         \
//!                   +---------+--> Abort
//! ```
//!
//! On restart, [replay] turns the journal into a [RecoveryPlan]. Builds
//! that wrote `Commit` are finalized, all other unfinished builds are
//! discarded and shall be reissued by the client. The side tree is never
//! visible to reads before `Commit`, so a crash mid-build leaves the index
//! either absent or complete.

mod builder;
mod journal;
mod recovery;

pub use builder::{run_foreground, BuildHandle, BuildState, IndexBuild, Msg};
pub use journal::{BuildOp, Entry, Journal, JOURNAL_FILE};
pub use recovery::{replay, BuildRecord, RecoveryPlan};
