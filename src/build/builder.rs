use log::{error, info, warn};

use std::{
    fmt, result,
    sync::{mpsc, Arc, Mutex},
    thread,
};

use crate::{
    build::{BuildOp, Journal},
    index::{self, IndexSpec, PendingBuild},
    store::{Collection, Op, Storage},
    util::{self, Thread},
    Error, Result,
};

/// Life cycle of an index build.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildState {
    NotStarted,
    Building,
    Committing,
    Complete,
    Aborted,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{:?}", self)
    }
}

/// Cooperative index build task. Index entries for existing records are
/// generated in batches, ordered by record seqno, into a side tree that is
/// not visible to reads until the build commits.
///
/// Every call to [IndexBuild::step] is a yield point, where collection drop,
/// index drop and database shutdown are checked for.
pub struct IndexBuild {
    build_id: u64,
    coll: Arc<Collection>,
    spec: IndexSpec,
    background: bool,
    batch_size: usize,

    pending: Arc<PendingBuild>,
    journal: Arc<Mutex<Journal>>,
    state: Arc<Mutex<BuildState>>,
    n_keys: u64,
}

impl fmt::Display for IndexBuild {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "build<{},{},{}>", self.build_id, self.coll.to_name(), self.spec.as_name())
    }
}

impl Drop for IndexBuild {
    fn drop(&mut self) {
        // an unfinished build leaves nothing behind, its journal entries
        // are discarded on next recovery.
        if let Ok(BuildState::NotStarted) | Ok(BuildState::Building) = self.to_state() {
            self.coll.as_catalog().remove_pending(self.build_id).ok();
        }
    }
}

impl IndexBuild {
    pub fn new(
        build_id: u64,
        coll: Arc<Collection>,
        spec: IndexSpec,
        background: bool,
        journal: Arc<Mutex<Journal>>,
        batch_size: usize,
    ) -> IndexBuild {
        let pending = Arc::new(PendingBuild::new(build_id, spec.clone()));
        IndexBuild {
            build_id,
            coll,
            spec,
            background,
            batch_size: usize::max(batch_size, 1),

            pending,
            journal,
            state: Arc::new(Mutex::new(BuildState::NotStarted)),
            n_keys: 0,
        }
    }

    /// Register the side tree with the collection's catalog and journal the
    /// start of this build.
    pub fn start(&mut self) -> Result<()> {
        self.coll.check_blocked()?;
        if self.coll.is_dropped() {
            err_at!(NotFound, msg: "{} is dropped", self.coll)?
        }

        self.coll.as_catalog().add_pending(Arc::clone(&self.pending))?;
        self.set_state(BuildState::Building)?;

        let op = BuildOp::Start {
            build_id: self.build_id,
            ns: self.coll.to_name(),
            spec: err_at!(FailConvert, serde_json::to_vec(&self.spec.to_json()))?,
            background: self.background,
        };
        let res = err_at!(Fatal, self.journal.lock())?.add_op(op);
        match res {
            Ok(_) => (),
            Err(err) => return Err(self.abort(err, false)),
        }

        info!(target: "idxbld", "{}, started background:{}", self, self.background);
        Ok(())
    }

    /// Process one batch of records, return true if all records in the
    /// collection are indexed.
    pub fn step(&mut self) -> Result<bool> {
        let coll = Arc::clone(&self.coll);
        let storage = coll.read_storage()?;
        self.step_with(&storage)
    }

    /// Same as [IndexBuild::step], with the collection's storage already
    /// locked by the caller.
    pub fn step_with(&mut self, storage: &Storage) -> Result<bool> {
        match self.to_state()? {
            BuildState::Building => (),
            state => err_at!(InvalidInput, msg: "{} cannot step in {} state", self, state)?,
        }
        self.check_interrupts()?;

        let cursor = self.pending.to_cursor();
        let records = storage.to_records_after(cursor, self.batch_size)?;
        let caught_up = records.len() < self.batch_size;

        let mut last_seqno = cursor;
        for (loc, record) in records.into_iter() {
            let key = match self.spec.to_key(&record.doc) {
                Ok(key) => key,
                Err(err) => return Err(self.abort(err, true)),
            };
            match self.pending.as_tree().insert(key.clone(), loc) {
                Ok(()) => (),
                Err(Error::Conflict(_, _)) => {
                    let err = index::duplicate_key(&self.spec, &key, &record.doc["_id"]);
                    return Err(self.abort(err, true));
                }
                Err(err) => return Err(self.abort(err, true)),
            }
            self.n_keys += 1;
            last_seqno = record.seqno;
        }

        if last_seqno > cursor {
            self.pending.set_cursor(last_seqno);
            let op = BuildOp::Progress {
                build_id: self.build_id,
                cursor: last_seqno,
                n_keys: self.n_keys,
            };
            let res = err_at!(Fatal, self.journal.lock())?.add_op(op);
            if let Err(err) = res {
                return Err(self.abort(err, true));
            }
        }

        Ok(caught_up)
    }

    /// Catch up with the collection, and make the index visible to reads.
    pub fn commit(&mut self) -> Result<()> {
        let coll = Arc::clone(&self.coll);
        let storage = coll.read_storage()?;
        self.commit_with(&storage)
    }

    /// Same as [IndexBuild::commit], with the collection's storage already
    /// locked by the caller.
    pub fn commit_with(&mut self, storage: &Storage) -> Result<()> {
        while !self.step_with(storage)? {}
        self.check_interrupts()?;

        self.set_state(BuildState::Committing)?;
        let op = BuildOp::Commit {
            build_id: self.build_id,
        };
        let res = err_at!(Fatal, self.journal.lock())?.add_op(op);
        if let Err(err) = res {
            return Err(self.abort(err, true));
        }

        let tree = self.coll.as_catalog().commit(self.build_id)?;

        let spec = err_at!(FailConvert, serde_json::to_vec(&self.spec.to_json()))?;
        let op = Op::CreateIndex { spec };
        if let Err(err) = self.coll.append_op(op.clone()) {
            error!(target: "idxbld", "{}, commit failed, blocking index ops: {}", self, err);
            self.coll.set_blocked(err.to_errmsg(), op)?;
            return Err(err);
        }

        let op = BuildOp::Done {
            build_id: self.build_id,
        };
        if let Err(err) = err_at!(Fatal, self.journal.lock())?.add_op(op) {
            // index is durable, recovery will find it in the data file.
            warn!(target: "idxbld", "{}, journal done: {}", self, err);
        }
        self.set_state(BuildState::Complete)?;

        info!(
            target: "idxbld",
            "{}, complete with {} keys depth {}",
            self,
            tree.len()?,
            tree.to_depth()?
        );
        Ok(())
    }

    // interrupts are checked at every yield point.
    fn check_interrupts(&mut self) -> Result<()> {
        let err = if self.coll.is_killed() {
            // nothing can be written anymore, recovery shall discard.
            self.set_state(BuildState::Aborted)?;
            return err_at!(Aborted, msg: "{} database is shut down", self);
        } else if self.coll.is_dropped() {
            Error::Aborted(String::default(), "collection dropped".to_string())
        } else if self.pending.is_cancelled() {
            Error::Aborted(String::default(), "index dropped".to_string())
        } else if let Some(err) = self.pending.to_failure() {
            err
        } else {
            return Ok(());
        };

        Err(self.abort(err, true))
    }

    // discard the side tree, and return `err` back to the caller.
    fn abort(&mut self, err: Error, journal: bool) -> Error {
        self.coll.as_catalog().remove_pending(self.build_id).ok();
        self.set_state(BuildState::Aborted).ok();

        if journal {
            let op = BuildOp::Abort {
                build_id: self.build_id,
                reason: err.to_errmsg(),
            };
            match self.journal.lock() {
                Ok(mut journal) => {
                    journal.add_op(op).ok();
                }
                Err(err) => error!(target: "idxbld", "{}, journal: {}", self, err),
            }
        }

        warn!(target: "idxbld", "{}, aborted: {}", self, err.to_errmsg());
        err
    }

    fn set_state(&self, state: BuildState) -> Result<()> {
        *err_at!(Fatal, self.state.lock())? = state;
        Ok(())
    }

    pub fn to_state(&self) -> Result<BuildState> {
        Ok(*err_at!(Fatal, self.state.lock())?)
    }

    pub fn to_build_id(&self) -> u64 {
        self.build_id
    }

    pub fn as_spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn to_n_keys(&self) -> u64 {
        self.n_keys
    }

    pub fn as_pending(&self) -> &Arc<PendingBuild> {
        &self.pending
    }
}

/// Run `build` in the foreground. The collection's storage is locked for
/// the whole build, blocking writers.
pub fn run_foreground(mut build: IndexBuild) -> Result<()> {
    build.start()?;

    let coll = Arc::clone(&build.coll);
    let storage = coll.read_storage()?;
    build.commit_with(&storage)
}

/// Messages handled by a background build.
pub enum Msg {
    Cancel,
}

/// Handle to a build running in the background.
pub struct BuildHandle {
    thread: Thread<Msg, Result<()>>,
    state: Arc<Mutex<BuildState>>,
}

impl BuildHandle {
    /// Start `build` and spawn a thread to run it in the background.
    /// Writers proceed between batches.
    pub fn spawn(mut build: IndexBuild) -> Result<BuildHandle> {
        build.start()?;

        let name = format!("{}", build);
        let state = Arc::clone(&build.state);
        let thread = Thread::new(&name, move |rx| move || background_loop(build, rx));

        Ok(BuildHandle { thread, state })
    }

    /// Wait for the build to complete.
    pub fn wait(self) -> Result<()> {
        self.thread.join()?
    }

    /// Request the build to abort at its next yield point. Cancelling a
    /// build that has already finished is a no-op.
    pub fn cancel(&self) -> Result<()> {
        match self.thread.to_tx()?.post(Msg::Cancel) {
            Ok(()) => Ok(()),
            // main loop has returned, nothing to cancel.
            Err(Error::IPCFail(_, _)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn to_state(&self) -> Result<BuildState> {
        Ok(*err_at!(Fatal, self.state.lock())?)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn to_name(&self) -> String {
        self.thread.to_name()
    }
}

fn background_loop(mut build: IndexBuild, rx: util::thread::Rx<Msg>) -> Result<()> {
    loop {
        match rx.try_recv() {
            Ok(Msg::Cancel) => build.pending.cancel(),
            Err(mpsc::TryRecvError::Empty) => (),
            // handle dropped, keep building till done.
            Err(mpsc::TryRecvError::Disconnected) => (),
        }

        if build.step()? {
            break;
        }
        thread::yield_now();
    }

    build.commit()
}

#[cfg(test)]
#[path = "builder_test.rs"]
mod builder_test;
