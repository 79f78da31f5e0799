//! Startup recovery of index builds.
//!
//! Recovery is a pure function over the durable journal entries. It does
//! not touch collections, the caller applies the resulting [RecoveryPlan].

use log::{debug, warn};
use serde_json::Value;

use std::collections::BTreeMap;

use crate::build::{BuildOp, Entry};

/// State of a single build, as reconstructed from the journal.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildRecord {
    pub build_id: u64,
    pub ns: String,
    pub spec: Value,
    pub background: bool,
    /// Last record seqno known to be in the side tree.
    pub cursor: u64,
    pub n_keys: u64,
    pub committed: bool,
}

/// Outcome of replaying the journal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecoveryPlan {
    /// Committed builds whose index may not be durable yet, they shall be
    /// finalized.
    pub finalize: Vec<BuildRecord>,
    /// Builds interrupted before commit, their side trees are lost and
    /// the client shall reissue the build.
    pub discard: Vec<BuildRecord>,
    /// Largest build id seen in the journal.
    pub max_build_id: u64,
    pub n_entries: usize,
    /// Entries ignored for being out of order, or referring to an unknown
    /// build.
    pub n_skipped: usize,
}

/// Replay journal entries into a recovery plan.
pub fn replay(entries: &[Entry]) -> RecoveryPlan {
    let mut plan = RecoveryPlan::default();
    let mut builds: BTreeMap<u64, BuildRecord> = BTreeMap::new();
    let mut last_seqno = 0;

    for entry in entries.iter() {
        plan.n_entries += 1;
        if entry.seqno <= last_seqno {
            debug!(target: "recovery", "skip entry {} after {}", entry.seqno, last_seqno);
            plan.n_skipped += 1;
            continue;
        }
        last_seqno = entry.seqno;

        let build_id = entry.op.to_build_id();
        plan.max_build_id = u64::max(plan.max_build_id, build_id);

        let ok = match (&entry.op, builds.get_mut(&build_id)) {
            (BuildOp::Start { ns, spec, background, .. }, None) => {
                match serde_json::from_slice::<Value>(spec) {
                    Ok(spec) => {
                        let record = BuildRecord {
                            build_id,
                            ns: ns.clone(),
                            spec,
                            background: *background,
                            cursor: 0,
                            n_keys: 0,
                            committed: false,
                        };
                        builds.insert(build_id, record);
                        true
                    }
                    Err(err) => {
                        warn!(target: "recovery", "build {} bad spec: {}", build_id, err);
                        false
                    }
                }
            }
            (BuildOp::Progress { cursor, n_keys, .. }, Some(record)) => {
                record.cursor = u64::max(record.cursor, *cursor);
                record.n_keys = *n_keys;
                true
            }
            (BuildOp::Commit { .. }, Some(record)) => {
                record.committed = true;
                true
            }
            (BuildOp::Done { .. }, Some(_)) | (BuildOp::Abort { .. }, Some(_)) => {
                builds.remove(&build_id);
                true
            }
            (_, _) => false,
        };
        if !ok {
            plan.n_skipped += 1;
        }
    }

    for (_, record) in builds.into_iter() {
        if record.committed {
            plan.finalize.push(record)
        } else {
            plan.discard.push(record)
        }
    }

    plan
}

#[cfg(test)]
#[path = "recovery_test.rs"]
mod recovery_test;
