use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering::SeqCst},
    Arc, Mutex, RwLock,
};

use crate::{
    index::{IndexSpec, Tree},
    Error, Result,
};

/// Side tree of an index build in progress. Writers keep it up to date for
/// records at or below the build's cursor, records beyond the cursor are
/// picked up by the build itself. Pending trees are never visible to reads.
pub struct PendingBuild {
    build_id: u64,
    tree: Arc<Tree>,
    // last record seqno processed by the build.
    cursor: AtomicU64,
    cancel: AtomicBool,
    // first failure seen by a writer while updating the side tree.
    failure: Mutex<Option<Error>>,
}

impl PendingBuild {
    pub fn new(build_id: u64, spec: IndexSpec) -> PendingBuild {
        PendingBuild {
            build_id,
            tree: Arc::new(Tree::new(spec)),
            cursor: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub fn to_build_id(&self) -> u64 {
        self.build_id
    }

    pub fn as_tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn as_spec(&self) -> &IndexSpec {
        self.tree.as_spec()
    }

    pub fn to_cursor(&self) -> u64 {
        self.cursor.load(SeqCst)
    }

    pub fn set_cursor(&self, seqno: u64) {
        self.cursor.store(seqno, SeqCst)
    }

    /// Request the build to stop at its next yield point.
    pub fn cancel(&self) {
        self.cancel.store(true, SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(SeqCst)
    }

    /// Record a failure, only the first one is kept.
    pub fn set_failure(&self, err: Error) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(err);
        }
    }

    pub fn to_failure(&self) -> Option<Error> {
        match self.failure.lock() {
            Ok(failure) => failure.clone(),
            Err(err) => Some(Error::Fatal(String::default(), err.to_string())),
        }
    }
}

/// Indexes of a single collection, ready indexes are visible to reads,
/// pending indexes are being built.
pub struct Catalog {
    ready: RwLock<Vec<Arc<Tree>>>,
    pending: RwLock<Vec<Arc<PendingBuild>>>,
}

impl Default for Catalog {
    fn default() -> Catalog {
        Catalog::new()
    }
}

impl Catalog {
    /// Create a catalog with the `_id_` index.
    pub fn new() -> Catalog {
        let id_index = Arc::new(Tree::new(IndexSpec::new_id_index()));
        Catalog {
            ready: RwLock::new(vec![id_index]),
            pending: RwLock::new(vec![]),
        }
    }

    pub fn to_index(&self, name: &str) -> Result<Option<Arc<Tree>>> {
        let ready = err_at!(Fatal, self.ready.read())?;
        Ok(ready.iter().find(|t| t.as_spec().as_name() == name).cloned())
    }

    /// Ready indexes, `_id_` first and the rest in creation order.
    pub fn to_indexes(&self) -> Result<Vec<Arc<Tree>>> {
        Ok(err_at!(Fatal, self.ready.read())?.clone())
    }

    pub fn to_pending(&self) -> Result<Vec<Arc<PendingBuild>>> {
        Ok(err_at!(Fatal, self.pending.read())?.clone())
    }

    pub fn to_pending_index(&self, name: &str) -> Result<Option<Arc<PendingBuild>>> {
        let pending = err_at!(Fatal, self.pending.read())?;
        Ok(pending.iter().find(|p| p.as_spec().as_name() == name).cloned())
    }

    /// Add a ready index, used when replaying a collection's data file.
    pub fn add_index(&self, tree: Arc<Tree>) -> Result<()> {
        let mut ready = err_at!(Fatal, self.ready.write())?;
        let name = tree.as_spec().as_name();
        if ready.iter().any(|t| t.as_spec().as_name() == name) {
            err_at!(Conflict, msg: "index {} already exists", name)?
        }
        ready.push(tree);
        Ok(())
    }

    /// Register a side tree for a new build.
    pub fn add_pending(&self, build: Arc<PendingBuild>) -> Result<()> {
        let ready = err_at!(Fatal, self.ready.read())?;
        let mut pending = err_at!(Fatal, self.pending.write())?;

        let name = build.as_spec().as_name();
        if ready.iter().any(|t| t.as_spec().as_name() == name) {
            err_at!(Conflict, msg: "index {} already exists", name)?
        }
        if pending.iter().any(|p| p.as_spec().as_name() == name) {
            err_at!(Conflict, msg: "index {} is already being built", name)?
        }
        pending.push(build);
        Ok(())
    }

    pub fn remove_pending(&self, build_id: u64) -> Result<Option<Arc<PendingBuild>>> {
        let mut pending = err_at!(Fatal, self.pending.write())?;
        match pending.iter().position(|p| p.to_build_id() == build_id) {
            Some(off) => Ok(Some(pending.remove(off))),
            None => Ok(None),
        }
    }

    /// Make the side tree for `build_id` visible to reads. Both lists are
    /// locked exclusively for the duration of the swap.
    pub fn commit(&self, build_id: u64) -> Result<Arc<Tree>> {
        let mut ready = err_at!(Fatal, self.ready.write())?;
        let mut pending = err_at!(Fatal, self.pending.write())?;

        match pending.iter().position(|p| p.to_build_id() == build_id) {
            Some(off) => {
                let build = pending.remove(off);
                let tree = Arc::clone(build.as_tree());
                ready.push(Arc::clone(&tree));
                Ok(tree)
            }
            None => err_at!(NotFound, msg: "index build {} is not pending", build_id),
        }
    }

    /// Remove a ready index, the `_id_` index cannot be dropped.
    pub fn drop_index(&self, name: &str) -> Result<Option<Arc<Tree>>> {
        let mut ready = err_at!(Fatal, self.ready.write())?;
        match ready.iter().position(|t| t.as_spec().as_name() == name) {
            Some(_) if name == crate::index::ID_INDEX_NAME => {
                err_at!(InvalidInput, msg: "cannot drop {} index", name)
            }
            Some(off) => Ok(Some(ready.remove(off))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[path = "catalog_test.rs"]
mod catalog_test;
