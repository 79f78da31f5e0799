use log::debug;
use serde_json::{json, Map, Value};

use std::collections::VecDeque;

use crate::{
    index::{Bucket, BucketId, IndexSpec, Key, Tree, BUCKET_BODY_SIZE, KEY_NODE_SIZE},
    stats::SummaryEstimators,
    store::Collection,
    Result,
};

/// Parameters for `indexStats`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexStatsParams {
    pub index_name: String,
    /// Child number to expand at every depth, starting from the root.
    pub expand_nodes: Vec<i64>,
}

impl IndexStatsParams {
    /// Parse `{index | name: string, expandNodes?: [number]}`.
    pub fn from_command(cmd: &Value) -> Result<IndexStatsParams> {
        let index_name = match (cmd.get("index"), cmd.get("name")) {
            (Some(Value::String(name)), _) | (None, Some(Value::String(name))) => name.clone(),
            _ => err_at!(
                InvalidInput,
                msg: "an index name is required, use {{index: \"indexname\"}}"
            )?,
        };

        let mut expand_nodes = vec![];
        match cmd.get("expandNodes") {
            Some(Value::Array(items)) => {
                for item in items.iter() {
                    match item.as_f64() {
                        Some(n) => expand_nodes.push(n as i64),
                        None => err_at!(InvalidInput, msg: "expandNodes must be an array of numbers")?,
                    }
                }
            }
            Some(_) => err_at!(InvalidInput, msg: "expandNodes must be an array of numbers")?,
            None => (),
        }

        Ok(IndexStatsParams {
            index_name,
            expand_nodes,
        })
    }
}

/// Information about a single expanded bucket, not its subtree.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub bucket_id: BucketId,
    pub child_num: usize,
    pub key_count: usize,
    pub used_key_count: usize,
    pub depth: usize,
    pub fill_ratio: f64,
    pub first_key: Option<Value>,
    pub last_key: Option<Value>,
}

impl NodeInfo {
    fn to_json(&self) -> Value {
        let mut val = json!({
            "childNum": self.child_num,
            "keyCount": self.key_count,
            "usedKeyCount": self.used_key_count,
            "bucket": self.bucket_id,
            "depth": self.depth,
            "fillRatio": self.fill_ratio,
        });
        if let Some(key) = &self.first_key {
            val["firstKey"] = key.clone();
        }
        if let Some(key) = &self.last_key {
            val["lastKey"] = key.clone();
        }
        val
    }
}

/// Statistics for some part of the tree, the whole tree, a level or a
/// subtree.
#[derive(Clone, Debug, Default)]
pub struct AreaStats {
    pub node_info: Option<NodeInfo>,
    pub num_buckets: u64,
    pub bson_ratio: SummaryEstimators,
    pub fill_ratio: SummaryEstimators,
    pub key_node_ratio: SummaryEstimators,
    pub key_count: SummaryEstimators,
    pub used_key_count: SummaryEstimators,
}

impl AreaStats {
    fn add_stats(&mut self, sample: &BucketSample) {
        let body = BUCKET_BODY_SIZE as f64;

        self.num_buckets += 1;
        self.bson_ratio.sample(sample.key_bytes as f64 / body);
        self.key_node_ratio
            .sample((KEY_NODE_SIZE * sample.key_count) as f64 / body);
        self.fill_ratio.sample(sample.to_fill_ratio());
        self.key_count.sample(sample.key_count as f64);
        self.used_key_count.sample(sample.used_key_count as f64);
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        if let Some(node_info) = &self.node_info {
            map.insert("nodeInfo".to_string(), node_info.to_json());
        }
        map.insert("numBuckets".to_string(), json!(self.num_buckets));
        map.insert("keyCount".to_string(), self.key_count.to_json());
        map.insert("usedKeyCount".to_string(), self.used_key_count.to_json());
        map.insert("bsonRatio".to_string(), self.bson_ratio.to_json());
        map.insert("keyNodeRatio".to_string(), self.key_node_ratio.to_json());
        map.insert("fillRatio".to_string(), self.fill_ratio.to_json());
        Value::Object(map)
    }
}

/// Statistics for the entire tree and its parts.
#[derive(Clone, Debug)]
pub struct TreeStats {
    pub bucket_body_bytes: usize,
    pub depth: usize,
    pub overall: AreaStats,
    pub per_level: Vec<AreaStats>,
    /// One entry per expanded depth, `branch[d][k]` holds the statistics
    /// for the subtree under the `k`th child of the expanded bucket at
    /// depth `d - 1`. The root is `branch[0][0]`.
    pub branch: Vec<Vec<AreaStats>>,
}

impl Default for TreeStats {
    fn default() -> TreeStats {
        TreeStats {
            bucket_body_bytes: BUCKET_BODY_SIZE,
            depth: 0,
            overall: AreaStats::default(),
            per_level: vec![],
            branch: vec![vec![AreaStats::default()]],
        }
    }
}

impl TreeStats {
    fn node_at(&mut self, depth: usize, child_num: usize) -> Result<&mut AreaStats> {
        match self.branch.get_mut(depth).and_then(|b| b.get_mut(child_num)) {
            Some(stats) => Ok(stats),
            None => err_at!(Fatal, msg: "missing branch node {}/{}", depth, child_num),
        }
    }

    fn new_branch_level(&mut self, depth: usize, n_children: usize) -> Result<()> {
        if self.branch.len() != depth + 1 {
            err_at!(Fatal, msg: "branch level {} after {}", depth, self.branch.len())?
        }
        self.branch.push(vec![AreaStats::default(); n_children]);
        Ok(())
    }

    /// Return `{bucketBodyBytes, depth, overall, perLevel, expandedNodes?}`.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("bucketBodyBytes".to_string(), json!(self.bucket_body_bytes));
        map.insert("depth".to_string(), json!(self.depth));
        map.insert("overall".to_string(), self.overall.to_json());
        let levels: Vec<Value> = self.per_level.iter().map(|s| s.to_json()).collect();
        map.insert("perLevel".to_string(), Value::Array(levels));
        if self.branch.len() > 1 {
            let expanded: Vec<Value> = self
                .branch
                .iter()
                .map(|children| Value::Array(children.iter().map(|s| s.to_json()).collect()))
                .collect();
            map.insert("expandedNodes".to_string(), Value::Array(expanded));
        }
        Value::Object(map)
    }
}

// Numbers gathered from a bucket while holding its read lock.
struct BucketSample {
    key_count: usize,
    used_key_count: usize,
    key_bytes: usize,
    empty_size: usize,
    children: Vec<BucketId>,
    first_key: Option<Key>,
    last_key: Option<Key>,
}

impl BucketSample {
    fn new(bucket: &Bucket) -> BucketSample {
        let nodes = bucket.as_nodes();
        let first_key = nodes.first().filter(|n| n.used).map(|n| n.key.clone());
        let last_key = match nodes.len() {
            n if n > 1 => nodes.last().filter(|n| n.used).map(|n| n.key.clone()),
            _ => None,
        };
        BucketSample {
            key_count: bucket.len_keys(),
            used_key_count: bucket.len_used_keys(),
            key_bytes: bucket.to_key_bytes(),
            empty_size: bucket.to_empty_size(),
            children: (0..=bucket.len_keys())
                .filter_map(|i| bucket.child_at(i))
                .collect(),
            first_key,
            last_key,
        }
    }

    fn to_fill_ratio(&self) -> f64 {
        1.0 - (self.empty_size as f64 / BUCKET_BODY_SIZE as f64)
    }
}

struct Visit {
    id: BucketId,
    depth: usize,
    child_num: usize,
    parent_expanded: bool,
    // if the d-th element is k, the k-th child of the expanded bucket at
    // depth d - 1 is an ancestor of this bucket.
    ancestors: Vec<usize>,
}

/// Walk an index tree level by level and gather [TreeStats].
///
/// Buckets are read-locked one at a time, writers are blocked no longer
/// than it takes to sample a single bucket.
pub struct Inspector {
    expand_nodes: Vec<i64>,
}

impl Inspector {
    pub fn new(expand_nodes: Vec<i64>) -> Inspector {
        Inspector { expand_nodes }
    }

    pub fn inspect(&self, tree: &Tree) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        let mut leaf_depth: Option<usize> = None;

        let mut queue = VecDeque::new();
        queue.push_back(Visit {
            id: tree.to_root()?,
            depth: 0,
            child_num: 0,
            parent_expanded: true,
            ancestors: vec![],
        });

        while let Some(visit) = queue.pop_front() {
            let sample = {
                let bucket = tree.to_bucket(visit.id)?;
                let b = err_at!(Fatal, bucket.read())?;
                BucketSample::new(&b)
            };
            let Visit {
                id,
                depth,
                child_num,
                parent_expanded,
                ancestors,
            } = visit;

            stats.depth = usize::max(stats.depth, depth);
            if sample.children.is_empty() {
                match leaf_depth {
                    None => leaf_depth = Some(depth),
                    Some(d) if d == depth => (),
                    Some(d) => err_at!(
                        Fatal, msg: "{} leaf bucket {} at depth {}, expected {}", tree, id, depth, d
                    )?,
                }
            }

            let (expanded, child_ancestors) = if parent_expanded {
                let mut child_ancestors = ancestors.clone();
                child_ancestors.push(child_num);
                let expanded = self.expand_nodes.get(depth) == Some(&(child_num as i64));
                if expanded {
                    stats.new_branch_level(depth, sample.key_count + 1)?;
                }
                (expanded, child_ancestors)
            } else {
                (false, ancestors.clone())
            };

            for (i, child) in sample.children.iter().enumerate() {
                queue.push_back(Visit {
                    id: *child,
                    depth: depth + 1,
                    child_num: i,
                    parent_expanded: expanded,
                    ancestors: child_ancestors.clone(),
                });
            }

            for (d, k) in ancestors.iter().enumerate() {
                stats.node_at(d, *k)?.add_stats(&sample);
            }
            stats.overall.add_stats(&sample);
            while stats.per_level.len() < depth + 1 {
                stats.per_level.push(AreaStats::default());
            }
            stats.per_level[depth].add_stats(&sample);

            if parent_expanded {
                let spec = tree.as_spec();
                let node_info = NodeInfo {
                    bucket_id: id,
                    child_num,
                    key_count: sample.key_count,
                    used_key_count: sample.used_key_count,
                    depth,
                    fill_ratio: sample.to_fill_ratio(),
                    first_key: sample.first_key.as_ref().map(|k| key_to_doc(spec, k)),
                    last_key: sample.last_key.as_ref().map(|k| key_to_doc(spec, k)),
                };
                stats.node_at(depth, child_num)?.node_info = Some(node_info);
            }
        }

        debug!(
            target: "diag",
            "{}, inspected {} buckets depth {}",
            tree, stats.overall.num_buckets, stats.depth
        );
        Ok(stats)
    }
}

// key values under their field names, in key pattern order.
fn key_to_doc(spec: &IndexSpec, key: &Key) -> Value {
    let mut doc = Map::new();
    if let Value::Object(pattern) = spec.to_key_pattern() {
        for (field, part) in pattern.keys().zip(key.as_parts().iter()) {
            doc.insert(field.clone(), part.to_json());
        }
    }
    Value::Object(doc)
}

/// Compute `indexStats` for `coll`, the response carries the index
/// description followed by [TreeStats].
pub fn index_stats(coll: &Collection, params: &IndexStatsParams) -> Result<Value> {
    let tree = match coll.as_catalog().to_index(&params.index_name)? {
        Some(tree) => tree,
        None => err_at!(
            NotFound, msg: "the requested index does not exist, {}", params.index_name
        )?,
    };

    let stats = Inspector::new(params.expand_nodes.clone()).inspect(&tree)?;

    let spec = tree.as_spec();
    let mut map = Map::new();
    map.insert("index".to_string(), json!(spec.as_name()));
    map.insert("name".to_string(), json!(spec.as_name()));
    map.insert("version".to_string(), json!(1));
    map.insert("isIdIndex".to_string(), json!(spec.is_id_index()));
    map.insert("keyPattern".to_string(), spec.to_key_pattern());
    map.insert("storageNs".to_string(), json!(coll.to_storage_ns(spec.as_name())));
    if let Value::Object(items) = stats.to_json() {
        map.extend(items.into_iter());
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
#[path = "index_stats_test.rs"]
mod index_stats_test;
