use std::cmp;

use crate::{index::Key, store::RecordLoc};

/// Size of a single bucket.
pub const BUCKET_SIZE: usize = 8192;
/// Bytes reserved at the beginning of every bucket.
pub const BUCKET_HEADER_SIZE: usize = 32;
/// Usable bytes in a bucket, for key nodes and keys.
pub const BUCKET_BODY_SIZE: usize = BUCKET_SIZE - BUCKET_HEADER_SIZE;
/// Fixed cost of every key node in a bucket, child pointer, record
/// location and key offset, excluding the key itself.
pub const KEY_NODE_SIZE: usize = 16;
/// Keys larger than this are not indexed.
pub const MAX_KEY_SIZE: usize = 1024;

/// Buckets are identified by their position in the tree's arena.
pub type BucketId = usize;

/// Entry in a bucket. Every key node owns the subtree of keys smaller than
/// itself through `prev_child`.
#[derive(Clone, Debug)]
pub struct KeyNode {
    pub key: Key,
    pub loc: RecordLoc,
    /// Removed entries are only marked as unused.
    pub used: bool,
    pub prev_child: Option<BucketId>,
}

impl KeyNode {
    pub fn new(key: Key, loc: RecordLoc) -> KeyNode {
        KeyNode {
            key,
            loc,
            used: true,
            prev_child: None,
        }
    }
}

/// Node of an index tree. A bucket holds key nodes in sort order, and, for
/// interior buckets, one child per key node plus the right-most child.
#[derive(Clone, Debug, Default)]
pub struct Bucket {
    nodes: Vec<KeyNode>,
    next_child: Option<BucketId>,
    key_bytes: usize,
}

impl Bucket {
    pub fn new(nodes: Vec<KeyNode>, next_child: Option<BucketId>) -> Bucket {
        let key_bytes = nodes.iter().map(|n| n.key.to_size()).sum();
        Bucket {
            nodes,
            next_child,
            key_bytes,
        }
    }

    pub fn as_nodes(&self) -> &[KeyNode] {
        &self.nodes
    }

    pub fn to_next_child(&self) -> Option<BucketId> {
        self.next_child
    }

    /// Number of key nodes, used or otherwise.
    pub fn len_keys(&self) -> usize {
        self.nodes.len()
    }

    pub fn len_used_keys(&self) -> usize {
        self.nodes.iter().filter(|n| n.used).count()
    }

    /// Serialized size of all keys in this bucket.
    pub fn to_key_bytes(&self) -> usize {
        self.key_bytes
    }

    /// Unused bytes in bucket body.
    pub fn to_empty_size(&self) -> usize {
        BUCKET_BODY_SIZE.saturating_sub(self.to_body_used())
    }

    fn to_body_used(&self) -> usize {
        self.nodes.len() * KEY_NODE_SIZE + self.key_bytes
    }

    pub fn is_overflow(&self) -> bool {
        self.to_body_used() > BUCKET_BODY_SIZE
    }

    pub fn is_leaf(&self) -> bool {
        self.next_child.is_none()
    }

    /// Children in key order, right-most child last.
    pub fn to_children(&self) -> Vec<BucketId> {
        let mut children: Vec<BucketId> =
            self.nodes.iter().filter_map(|n| n.prev_child).collect();
        children.extend(self.next_child);
        children
    }

    /// Search for the entry `(key, loc)`. Return `Ok(index)` if found,
    /// otherwise `Err(index)` where the entry would be inserted.
    pub fn search(&self, key: &Key, loc: RecordLoc) -> Result<usize, usize> {
        self.nodes
            .binary_search_by(|n| match n.key.cmp(key) {
                cmp::Ordering::Equal => n.loc.cmp(&loc),
                ord => ord,
            })
    }

    /// Child covering the gap before key node `i`, or the right-most child
    /// when `i` equals the number of key nodes.
    pub fn child_at(&self, i: usize) -> Option<BucketId> {
        match self.nodes.get(i) {
            Some(node) => node.prev_child,
            None => self.next_child,
        }
    }

    pub fn set_child_at(&mut self, i: usize, child: BucketId) {
        match self.nodes.get_mut(i) {
            Some(node) => node.prev_child = Some(child),
            None => self.next_child = Some(child),
        }
    }

    pub fn insert_node(&mut self, i: usize, node: KeyNode) {
        self.key_bytes += node.key.to_size();
        self.nodes.insert(i, node);
    }

    pub fn set_used(&mut self, i: usize, used: bool) {
        if let Some(node) = self.nodes.get_mut(i) {
            node.used = used;
        }
    }

    /// Split this bucket at key node `at`. Nodes after `at` move into the
    /// returned bucket, the node at `at` is returned as separator and its
    /// child becomes the right-most child of this bucket.
    pub fn split_at(&mut self, at: usize) -> Option<(KeyNode, Bucket)> {
        if at >= self.nodes.len() {
            return None;
        }

        let right_nodes = self.nodes.split_off(at + 1);
        let sep = self.nodes.pop()?;

        let right = Bucket::new(right_nodes, self.next_child);
        self.next_child = sep.prev_child;
        self.key_bytes = self.nodes.iter().map(|n| n.key.to_size()).sum();
        Some((sep, right))
    }
}

#[cfg(test)]
#[path = "bucket_test.rs"]
mod bucket_test;
