use fs2::FileExt;
use log::{error, info, warn};
use serde_json::Value;

use std::{
    collections::BTreeMap,
    ffi, fmt, fs, path, result,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::SeqCst},
        Arc, Mutex, RwLock,
    },
};

use crate::{
    build::{
        replay, run_foreground, BuildHandle, BuildOp, BuildRecord, IndexBuild, Journal,
        RecoveryPlan,
    },
    diag,
    index::IndexSpec,
    store::Collection,
    Config, Result,
};

/// Name of the advisory lock file under the database directory.
pub const LOCK_FILE: &str = "LOCK";
/// File extension for collection data files.
pub const DATA_EXT: &str = "data";

/// Database is a directory of collections, and the index-build journal
/// shared by all of them. Only one `Database` value can own a directory at
/// any given time.
pub struct Database {
    config: Config,
    // advisory lock is released when the file is closed.
    _lock_file: fs::File,

    collections: RwLock<BTreeMap<String, Arc<Collection>>>,
    journal: Arc<Mutex<Journal>>,
    killed: Arc<AtomicBool>,
    next_build_id: AtomicU64,
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "database<{:?}>", self.config.dir)
    }
}

impl Database {
    /// Open the database under `config.dir`, creating the directory if
    /// missing. Collections are loaded from their data files and
    /// index builds interrupted by a crash are recovered: builds that
    /// committed are finalized, all others are discarded.
    pub fn open(config: Config) -> Result<Database> {
        err_at!(IOError, fs::create_dir_all(&config.dir), "{:?}", config.dir)?;
        let lock_file = lock_dir(&config.dir)?;
        let killed = Arc::new(AtomicBool::new(false));

        let mut collections = BTreeMap::new();
        for name in to_collection_names(&config.dir)?.into_iter() {
            let coll = Collection::load(&config, &name, Arc::clone(&killed))?;
            collections.insert(name, Arc::new(coll));
        }

        let plan = replay(&Journal::load(&config.dir)?);
        let unresolved = recover(&collections, &plan);
        let mut journal = Journal::start(&config, Arc::clone(&killed))?;
        rejournal(&mut journal, &unresolved)?;

        let db = Database {
            config,
            _lock_file: lock_file,

            collections: RwLock::new(collections),
            journal: Arc::new(Mutex::new(journal)),
            killed,
            next_build_id: AtomicU64::new(plan.max_build_id + 1),
        };

        info!(
            target: "storage",
            "{}, opened with {} collections", db, db.to_collection_names()?.len()
        );
        Ok(db)
    }

    /// Flush the journal and close the database.
    pub fn close(self) -> Result<()> {
        err_at!(Fatal, self.journal.lock())?.flush()?;
        info!(target: "storage", "{}, closed", self);
        Ok(())
    }

    /// Simulate a hard kill. Nothing is written to data files and the
    /// journal hereafter, in-flight builds abort at their next yield point.
    pub fn crash(self) {
        self.killed.store(true, SeqCst);
        warn!(target: "storage", "{}, crashed", self);
    }

    pub fn as_config(&self) -> &Config {
        &self.config
    }

    pub fn to_collection_names(&self) -> Result<Vec<String>> {
        Ok(err_at!(Fatal, self.collections.read())?.keys().cloned().collect())
    }
}

impl Database {
    /// Create a new collection. `capped` is the size limit in bytes for
    /// capped collections.
    pub fn create_collection(&self, name: &str, capped: Option<u64>) -> Result<Arc<Collection>> {
        let mut collections = err_at!(Fatal, self.collections.write())?;
        if collections.contains_key(name) {
            err_at!(Conflict, msg: "collection {} already exists", name)?
        }

        let coll = Collection::create(&self.config, name, capped, Arc::clone(&self.killed))?;
        let coll = Arc::new(coll);
        collections.insert(name.to_string(), Arc::clone(&coll));
        Ok(coll)
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        match err_at!(Fatal, self.collections.read())?.get(name) {
            Some(coll) => Ok(Arc::clone(coll)),
            None => err_at!(NotFound, msg: "collection {} not found", name),
        }
    }

    /// Drop a collection and remove its data file. Index builds on the
    /// collection are aborted.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let coll = match err_at!(Fatal, self.collections.write())?.remove(name) {
            Some(coll) => coll,
            None => err_at!(NotFound, msg: "collection {} not found", name)?,
        };
        coll.purge()?;
        info!(target: "storage", "{}, dropped {}", self, coll);
        Ok(())
    }

    /// Build an index in the foreground, writers on the collection block
    /// until the build completes. Creating an index that already exists,
    /// with the same key pattern, is a no-op.
    pub fn create_index(&self, ns: &str, spec: &Value) -> Result<()> {
        let coll = self.collection(ns)?;
        let spec = IndexSpec::from_json(spec)?;
        if self.is_existing_index(&coll, &spec)? {
            return Ok(());
        }

        run_foreground(self.to_index_build(coll, spec, false))
    }

    /// Build an index in the background. Return None if the index already
    /// exists with the same key pattern.
    pub fn create_index_background(&self, ns: &str, spec: &Value) -> Result<Option<BuildHandle>> {
        let coll = self.collection(ns)?;
        let spec = IndexSpec::from_json(spec)?;
        if self.is_existing_index(&coll, &spec)? {
            return Ok(None);
        }

        let handle = BuildHandle::spawn(self.to_index_build(coll, spec, true))?;
        Ok(Some(handle))
    }

    /// Drop an index, or cancel its build if it is still being built.
    pub fn drop_index(&self, ns: &str, name: &str) -> Result<()> {
        self.collection(ns)?.drop_index(name)
    }

    /// Run a diagnostic command, refer to [diag] module for details.
    pub fn run_command(&self, cmd: &Value) -> Value {
        diag::run_command(self, cmd)
    }

    fn is_existing_index(&self, coll: &Collection, spec: &IndexSpec) -> Result<bool> {
        match coll.as_catalog().to_index(spec.as_name())? {
            Some(tree) if tree.as_spec().is_same_pattern(spec) => Ok(true),
            Some(_) => err_at!(
                Conflict,
                msg: "index {} already exists with a different key pattern", spec.as_name()
            ),
            None => Ok(false),
        }
    }

    fn to_index_build(&self, coll: Arc<Collection>, spec: IndexSpec, bg: bool) -> IndexBuild {
        let build_id = self.next_build_id.fetch_add(1, SeqCst);
        let journal = Arc::clone(&self.journal);
        IndexBuild::new(build_id, coll, spec, bg, journal, self.config.build_batch_size)
    }
}

fn lock_dir(dir: &ffi::OsStr) -> Result<fs::File> {
    let loc: path::PathBuf = [dir, ffi::OsStr::new(LOCK_FILE)].iter().collect();
    let file = err_at!(
        IOError,
        fs::OpenOptions::new().create(true).write(true).open(&loc),
        "{:?}", loc
    )?;
    match file.try_lock_exclusive() {
        Ok(_) => Ok(file),
        Err(_) => err_at!(IOError, msg: "{:?} is locked by another database", dir),
    }
}

fn to_collection_names(dir: &ffi::OsStr) -> Result<Vec<String>> {
    let mut names = vec![];
    for entry in err_at!(IOError, fs::read_dir(dir))? {
        let loc = err_at!(IOError, entry)?.path();
        if loc.extension().and_then(|x| x.to_str()) != Some(DATA_EXT) {
            continue;
        }
        match loc.file_stem().and_then(|x| x.to_str()) {
            Some(name) => names.push(name.to_string()),
            None => warn!(target: "storage", "ignoring data file {:?}", loc),
        }
    }
    names.sort();
    Ok(names)
}

// Apply the recovery plan, return the committed builds that could not be
// finalized.
fn recover(
    collections: &BTreeMap<String, Arc<Collection>>,
    plan: &RecoveryPlan,
) -> Vec<BuildRecord> {
    info!(
        target: "recovery",
        "journal entries:{} skipped:{} finalize:{} discard:{}",
        plan.n_entries,
        plan.n_skipped,
        plan.finalize.len(),
        plan.discard.len()
    );

    let mut unresolved = vec![];
    for record in plan.finalize.iter() {
        let coll = match collections.get(&record.ns) {
            Some(coll) => coll,
            None => {
                warn!(target: "recovery", "build {}, {} is dropped", record.build_id, record.ns);
                continue;
            }
        };
        let res = IndexSpec::from_json(&record.spec).and_then(|spec| coll.finalize_index(spec));
        match res {
            Ok(true) => info!(target: "recovery", "build {}, finalized in {}", record.build_id, coll),
            Ok(false) => info!(target: "recovery", "build {}, already durable", record.build_id),
            Err(err) => {
                error!(target: "recovery", "build {}, {}: {}", record.build_id, coll, err);
                unresolved.push(record.clone());
            }
        }
    }

    for record in plan.discard.iter() {
        info!(
            target: "recovery",
            "build {}, discarded {} {} at cursor {}, reissue the build",
            record.build_id,
            record.ns,
            record.spec,
            record.cursor
        );
    }

    unresolved
}

// Carry committed builds that failed to finalize into the new journal, so
// that the next recovery retries them.
fn rejournal(journal: &mut Journal, records: &[BuildRecord]) -> Result<()> {
    for record in records.iter() {
        let op = BuildOp::Start {
            build_id: record.build_id,
            ns: record.ns.clone(),
            spec: err_at!(FailConvert, serde_json::to_vec(&record.spec))?,
            background: record.background,
        };
        journal.add_op(op)?;
        journal.add_op(BuildOp::Commit {
            build_id: record.build_id,
        })?;
        warn!(
            target: "recovery",
            "build {}, {} {} is carried over to the next recovery",
            record.build_id, record.ns, record.spec
        );
    }
    Ok(())
}

#[cfg(test)]
#[path = "database_test.rs"]
mod database_test;
