use cbordata::Cborize;
use log::{debug, warn};

use std::{
    collections::BTreeSet,
    ffi, fmt, fs,
    io::Read,
    path, result,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

use crate::{
    util::{self, files},
    Config, Result,
};

/// File name of the build journal, under the database directory.
pub const JOURNAL_FILE: &str = "index-build.journal";

/// Index build operations, recorded in the journal in the order they
/// happen.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub enum BuildOp {
    /// Index specification is serialized as JSON text.
    Start {
        build_id: u64,
        ns: String,
        spec: Vec<u8>,
        background: bool,
    },
    /// All records up to seqno `cursor` are in the side tree.
    Progress {
        build_id: u64,
        cursor: u64,
        n_keys: u64,
    },
    /// Side tree is complete, from here on the build is finalized even
    /// across a crash.
    Commit { build_id: u64 },
    /// Index is durable in its collection's data file.
    Done { build_id: u64 },
    Abort { build_id: u64, reason: String },
}

impl BuildOp {
    const ID: u32 = 0x0;

    pub fn to_build_id(&self) -> u64 {
        match self {
            BuildOp::Start { build_id, .. } => *build_id,
            BuildOp::Progress { build_id, .. } => *build_id,
            BuildOp::Commit { build_id } => *build_id,
            BuildOp::Done { build_id } => *build_id,
            BuildOp::Abort { build_id, .. } => *build_id,
        }
    }

    /// Progress entries are flushed lazily, all other entries are flushed
    /// as soon as they are added.
    pub fn is_progress(&self) -> bool {
        matches!(self, BuildOp::Progress { .. })
    }

    /// Whether this entry closes its build.
    pub fn is_final(&self) -> bool {
        matches!(self, BuildOp::Done { .. } | BuildOp::Abort { .. })
    }
}

/// Single journal entry, `seqno` is monotonically increasing within a
/// journal.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct Entry {
    pub seqno: u64,
    pub op: BuildOp,
}

impl Entry {
    const ID: u32 = 0x0;

    pub fn new(seqno: u64, op: BuildOp) -> Entry {
        Entry { seqno, op }
    }
}

// Entries are flushed to disk in batches.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
struct Batch {
    first_seqno: u64,
    last_seqno: u64,
    entries: Vec<Entry>,
}

impl Batch {
    const ID: u32 = 0x0;
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "batch<{}..{}]>", self.first_seqno, self.last_seqno)
    }
}

/// Append only journal of [BuildOp] entries, shared by all index builds of
/// a database. The journal is truncated whenever the last open build is
/// done or aborted.
pub struct Journal {
    location: ffi::OsString,
    file: fs::File,
    seqno: u64,
    // entries yet to be flushed.
    entries: Vec<Entry>,
    // builds started and not yet done or aborted.
    open_builds: BTreeSet<u64>,
    n_progress: usize,
    flush_every: usize,
    fsync: bool,
    killed: Arc<AtomicBool>,
    #[cfg(test)]
    fail_flush: bool,
}

impl fmt::Display for Journal {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "journal<{:?}>", self.location)
    }
}

impl Journal {
    fn to_location(dir: &ffi::OsStr) -> ffi::OsString {
        let loc: path::PathBuf = [dir, ffi::OsStr::new(JOURNAL_FILE)].iter().collect();
        loc.into_os_string()
    }

    /// Start a new and empty journal under `config.dir`, an older journal
    /// is removed. Once `killed` is set, nothing more is written to the
    /// journal.
    pub fn start(config: &Config, killed: Arc<AtomicBool>) -> Result<Journal> {
        let location = Journal::to_location(&config.dir);
        let file = files::create_file_a(&location)?;

        Ok(Journal {
            location,
            file,
            seqno: 0,
            entries: vec![],
            open_builds: BTreeSet::new(),
            n_progress: 0,
            flush_every: usize::max(config.journal_flush_every, 1),
            fsync: config.fsync,
            killed,
            #[cfg(test)]
            fail_flush: false,
        })
    }

    /// Load all durable entries from the journal under `dir`. A missing
    /// journal has no entries, and a torn trailing batch is ignored.
    pub fn load(dir: &ffi::OsStr) -> Result<Vec<Entry>> {
        let location = Journal::to_location(dir);
        if !path::Path::new(&location).exists() {
            return Ok(vec![]);
        }

        let data = {
            let mut file = files::open_file_r(&location)?;
            let mut data = vec![];
            err_at!(IOError, file.read_to_end(&mut data))?;
            data
        };

        let (mut entries, mut fpos) = (vec![], 0_usize);
        while fpos < data.len() {
            match util::from_cbor_bytes::<Batch>(&data[fpos..]) {
                Ok((batch, n)) => {
                    debug!(target: "recovery", "{:?}, loaded {}", location, batch);
                    entries.extend(batch.entries.into_iter());
                    fpos += n;
                }
                Err(err) => {
                    warn!(
                        target: "recovery",
                        "{:?}, ignoring torn batch at {}/{}: {}",
                        location, fpos, data.len(), err
                    );
                    break;
                }
            }
        }

        Ok(entries)
    }

    /// Add an operation to the journal, return its seqno.
    pub fn add_op(&mut self, op: BuildOp) -> Result<u64> {
        if self.killed.load(SeqCst) {
            err_at!(Aborted, msg: "{} database is shut down", self)?
        }

        self.seqno += 1;
        let (progress, last) = (op.is_progress(), op.is_final());
        match &op {
            BuildOp::Start { build_id, .. } => {
                self.open_builds.insert(*build_id);
            }
            op if last => {
                self.open_builds.remove(&op.to_build_id());
            }
            _ => (),
        }
        self.entries.push(Entry::new(self.seqno, op));

        if progress {
            self.n_progress += 1;
            if self.n_progress >= self.flush_every {
                self.flush()?;
            }
        } else {
            self.flush()?;
        }

        if last && self.open_builds.is_empty() {
            self.truncate()?;
        }

        Ok(self.seqno)
    }

    // every build in the journal is resolved, nothing to recover.
    fn truncate(&mut self) -> Result<()> {
        err_at!(IOError, self.file.set_len(0), "{:?}", self.location)?;
        if self.fsync {
            err_at!(IOError, self.file.sync_all(), "{:?}", self.location)?;
        }
        debug!(target: "idxbld", "{}, truncated at seqno {}", self, self.seqno);
        Ok(())
    }

    /// Flush pending entries as a single batch.
    pub fn flush(&mut self) -> Result<()> {
        if self.killed.load(SeqCst) {
            err_at!(Aborted, msg: "{} database is shut down", self)?
        }
        #[cfg(test)]
        {
            if self.fail_flush {
                err_at!(IOError, msg: "{} injected flush failure", self)?
            }
        }

        let (first_seqno, last_seqno) = match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => (first.seqno, last.seqno),
            _ => return Ok(()),
        };
        let batch = Batch {
            first_seqno,
            last_seqno,
            entries: self.entries.drain(..).collect(),
        };
        let data = util::into_cbor_bytes(batch)?;
        files::sync_write(&mut self.file, &data, self.fsync)?;
        self.n_progress = 0;

        Ok(())
    }

    pub fn to_seqno(&self) -> u64 {
        self.seqno
    }

    pub fn len_unflushed(&self) -> usize {
        self.entries.len()
    }

    pub fn len_open_builds(&self) -> usize {
        self.open_builds.len()
    }

    #[cfg(test)]
    pub(crate) fn set_fail_flush(&mut self, fail: bool) {
        self.fail_flush = fail;
    }
}

#[cfg(test)]
#[path = "journal_test.rs"]
mod journal_test;
