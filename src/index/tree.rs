use log::debug;

use std::{
    fmt, result,
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    index::{bucket::MAX_KEY_SIZE, Bucket, BucketId, IndexSpec, Key, KeyNode},
    store::RecordLoc,
    Result,
};

// Result of inserting into a subtree, a separator and a new right sibling
// when the subtree's top bucket was split.
type Split = Option<(KeyNode, BucketId)>;

enum Step {
    Visit(BucketId),
    Hit(RecordLoc),
}

/// Btree index, buckets are held in an arena and refer to their children by
/// [BucketId].
///
/// Readers lock one bucket at a time. Writers are serialized with respect
/// to each other, but do not block readers for longer than a single bucket
/// update.
pub struct Tree {
    spec: IndexSpec,
    arena: RwLock<Vec<Arc<RwLock<Bucket>>>>,
    root: RwLock<BucketId>,
    writer: Mutex<()>,
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "tree<{}>", self.spec)
    }
}

impl Tree {
    /// Create an empty tree, a single empty leaf bucket as root.
    pub fn new(spec: IndexSpec) -> Tree {
        let root = Arc::new(RwLock::new(Bucket::default()));
        Tree {
            spec,
            arena: RwLock::new(vec![root]),
            root: RwLock::new(0),
            writer: Mutex::new(()),
        }
    }

    pub fn as_spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn to_root(&self) -> Result<BucketId> {
        Ok(*err_at!(Fatal, self.root.read())?)
    }

    pub fn to_bucket(&self, id: BucketId) -> Result<Arc<RwLock<Bucket>>> {
        match err_at!(Fatal, self.arena.read())?.get(id) {
            Some(bucket) => Ok(Arc::clone(bucket)),
            None => err_at!(Fatal, msg: "{} missing bucket {}", self, id),
        }
    }

    pub fn len_buckets(&self) -> Result<usize> {
        Ok(err_at!(Fatal, self.arena.read())?.len())
    }

    fn alloc_bucket(&self, bucket: Bucket) -> Result<BucketId> {
        let mut arena = err_at!(Fatal, self.arena.write())?;
        arena.push(Arc::new(RwLock::new(bucket)));
        Ok(arena.len() - 1)
    }
}

impl Tree {
    /// Insert entry `(key, loc)`. For unique indexes, fail with
    /// [Error::Conflict] if `key` is already indexed.
    ///
    /// [Error::Conflict]: crate::Error::Conflict
    pub fn insert(&self, key: Key, loc: RecordLoc) -> Result<()> {
        let _w = err_at!(Fatal, self.writer.lock())?;

        if key.to_size() > MAX_KEY_SIZE {
            err_at!(InvalidInput, msg: "key too large to index, size {}", key.to_size())?
        }
        if self.spec.is_unique() && !self.find(&key)?.is_empty() {
            err_at!(Conflict, msg: "duplicate key {} in index {}", key, self.spec.as_name())?
        }

        let root = self.to_root()?;
        if let Some((mut sep, right)) = self.insert_at(root, KeyNode::new(key, loc))? {
            sep.prev_child = Some(root);
            let new_root = self.alloc_bucket(Bucket::new(vec![sep], Some(right)))?;
            *err_at!(Fatal, self.root.write())? = new_root;
            debug!(target: "storage", "{} new root {} over {}", self, new_root, root);
        }

        Ok(())
    }

    fn insert_at(&self, id: BucketId, node: KeyNode) -> Result<Split> {
        let bucket = self.to_bucket(id)?;

        let (pos, child) = {
            let b = err_at!(Fatal, bucket.read())?;
            match b.search(&node.key, node.loc) {
                Ok(i) => (Ok(i), None),
                Err(i) => (Err(i), b.child_at(i)),
            }
        };

        let (mut b, rightmost) = match (pos, child) {
            // entry was removed earlier, and is now back.
            (Ok(i), _) => {
                err_at!(Fatal, bucket.write())?.set_used(i, true);
                return Ok(None);
            }
            (Err(i), None) => {
                let mut b = err_at!(Fatal, bucket.write())?;
                let rightmost = i == b.len_keys();
                b.insert_node(i, node);
                (b, rightmost)
            }
            (Err(i), Some(child)) => match self.insert_at(child, node)? {
                None => return Ok(None),
                Some((mut sep, right)) => {
                    let mut b = err_at!(Fatal, bucket.write())?;
                    let rightmost = i == b.len_keys();
                    sep.prev_child = Some(child);
                    b.insert_node(i, sep);
                    b.set_child_at(i + 1, right);
                    (b, rightmost)
                }
            },
        };

        if !b.is_overflow() || b.len_keys() < 3 {
            return Ok(None);
        }

        // right-most appends leave the left bucket mostly full, sequential
        // inserts then pack buckets tightly.
        let n = b.len_keys();
        let at = if rightmost { n * 9 / 10 } else { n / 2 };
        let at = usize::max(1, usize::min(at, n - 2));

        match b.split_at(at) {
            Some((sep, right)) => {
                let right = self.alloc_bucket(right)?;
                Ok(Some((sep, right)))
            }
            None => err_at!(Fatal, msg: "{} fail split bucket {} at {}", self, id, at),
        }
    }

    /// Mark entry `(key, loc)` as unused. Return false if the entry is not
    /// found.
    pub fn remove(&self, key: &Key, loc: RecordLoc) -> Result<bool> {
        let _w = err_at!(Fatal, self.writer.lock())?;

        let mut id = self.to_root()?;
        loop {
            let bucket = self.to_bucket(id)?;
            let child = {
                let b = err_at!(Fatal, bucket.read())?;
                match b.search(key, loc) {
                    Ok(i) if b.as_nodes()[i].used => Ok(i),
                    Ok(_) => return Ok(false),
                    Err(i) => Err(b.child_at(i)),
                }
            };
            match child {
                Ok(i) => {
                    err_at!(Fatal, bucket.write())?.set_used(i, false);
                    break Ok(true);
                }
                Err(Some(child)) => id = child,
                Err(None) => break Ok(false),
            }
        }
    }

    /// Return locations of all used entries indexed under `key`, in index
    /// order.
    pub fn find(&self, key: &Key) -> Result<Vec<RecordLoc>> {
        let mut locs = vec![];
        self.find_in(self.to_root()?, key, &mut locs)?;
        Ok(locs)
    }

    fn find_in(&self, id: BucketId, key: &Key, locs: &mut Vec<RecordLoc>) -> Result<()> {
        let steps = {
            let bucket = self.to_bucket(id)?;
            let b = err_at!(Fatal, bucket.read())?;

            let mut steps = vec![];
            let mut done = false;
            for node in b.as_nodes().iter() {
                match node.key.cmp(key) {
                    std::cmp::Ordering::Less => continue,
                    ord => {
                        steps.extend(node.prev_child.map(Step::Visit));
                        if ord == std::cmp::Ordering::Greater {
                            done = true;
                            break;
                        }
                        if node.used {
                            steps.push(Step::Hit(node.loc));
                        }
                    }
                }
            }
            if !done {
                steps.extend(b.to_next_child().map(Step::Visit));
            }
            steps
        };

        for step in steps.into_iter() {
            match step {
                Step::Visit(child) => self.find_in(child, key, locs)?,
                Step::Hit(loc) => locs.push(loc),
            }
        }
        Ok(())
    }

    /// Number of used entries in this index.
    pub fn len(&self) -> Result<usize> {
        let mut n = 0;
        let mut stack = vec![self.to_root()?];
        while let Some(id) = stack.pop() {
            let bucket = self.to_bucket(id)?;
            let b = err_at!(Fatal, bucket.read())?;
            n += b.len_used_keys();
            stack.extend(b.to_children());
        }
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Height of the tree, following the left-most path, root is at depth
    /// ZERO.
    pub fn to_depth(&self) -> Result<usize> {
        let (mut depth, mut id) = (0, self.to_root()?);
        loop {
            let bucket = self.to_bucket(id)?;
            let child = err_at!(Fatal, bucket.read())?.child_at(0);
            match child {
                Some(child) => {
                    depth += 1;
                    id = child;
                }
                None => break Ok(depth),
            }
        }
    }
}

#[cfg(test)]
#[path = "tree_test.rs"]
mod tree_test;
