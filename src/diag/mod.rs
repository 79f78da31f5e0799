//! Module `diag` implement read-only diagnostic commands on collections and
//! their indexes.
//!
//! Commands are JSON documents, whose first field names the command and
//! carries the collection's namespace:
//!
//! * `{indexStats: ns, index: name, expandNodes: [..]}`, btree statistics
//!   computed by [Inspector].
//! * `{diskStorageStats: ns, extent?, range?, granularity?, numberOfChunks?,
//!   charactField?, showRecords?}`, record layout computed by [Walker].
//! * `{pagesInRAM: ns, ...}`, page residency per extent and chunk.
//! * `{storageDetails: ns, analyze: 'diskStorage' | 'memInCore', extent,
//!   granularity | numberOfChunks}`, single extent form of the above.
//!
//! Responses are `{ok: 1, ...}` on success and `{ok: 0, errmsg, code}` on
//! failure. Commands are available only with the `diagnostics` feature,
//! and when enabled in [Config][crate::Config].

use log::debug;
use serde_json::{json, Value};

use std::sync::Arc;

use crate::{store::Collection, Database, Error, Result};

mod index_stats;
mod storage_details;

pub use index_stats::{index_stats, AreaStats, IndexStatsParams, Inspector, NodeInfo, TreeStats};
pub use storage_details::{
    disk_storage_stats, pages_in_ram_stats, storage_details, Analyze, AnalyzeParams, ChunkParams,
    Iter, Walker,
};

/// List of supported commands.
pub const COMMANDS: [&str; 4] = ["indexStats", "diskStorageStats", "pagesInRAM", "storageDetails"];

/// Execute a diagnostic command against `db`, errors are reported in the
/// response document.
pub fn run_command(db: &Database, cmd: &Value) -> Value {
    let name = match cmd.as_object().and_then(|obj| obj.keys().next()) {
        Some(name) => name.clone(),
        None => return json!({"ok": 0, "errmsg": "empty command", "code": 2}),
    };

    if !is_enabled(db) || !COMMANDS.contains(&name.as_str()) {
        return json!({
            "ok": 0,
            "errmsg": format!("no such cmd: {}", name),
            "code": 115,
            "bad cmd": true,
        });
    }

    debug!(target: "diag", "run command {}", name);
    match do_command(db, &name, cmd) {
        Ok(val) => val,
        Err(err) => {
            debug!(target: "diag", "command {} failed: {}", name, err);
            to_error_response(&err)
        }
    }
}

fn do_command(db: &Database, name: &str, cmd: &Value) -> Result<Value> {
    let coll = to_collection(db, &cmd[name])?;
    match name {
        "indexStats" => {
            let params = IndexStatsParams::from_command(cmd)?;
            index_stats(&coll, &params)
        }
        "diskStorageStats" => disk_storage_stats(coll, cmd),
        "pagesInRAM" => pages_in_ram_stats(coll, cmd),
        "storageDetails" => storage_details(coll, cmd),
        _ => err_at!(Unsupported, msg: "no such cmd: {}", name),
    }
}

fn to_collection(db: &Database, ns: &Value) -> Result<Arc<Collection>> {
    match ns.as_str() {
        Some(ns) => match db.collection(ns) {
            Ok(coll) => Ok(coll),
            Err(Error::NotFound(_, _)) => err_at!(NotFound, msg: "ns not found"),
            Err(err) => Err(err),
        },
        None => err_at!(InvalidInput, msg: "collection name must be a string"),
    }
}

fn to_error_response(err: &Error) -> Value {
    json!({"ok": 0, "errmsg": err.to_errmsg(), "code": err.to_code()})
}

#[cfg(feature = "diagnostics")]
fn is_enabled(db: &Database) -> bool {
    db.as_config().diagnostics
}

#[cfg(not(feature = "diagnostics"))]
fn is_enabled(_db: &Database) -> bool {
    false
}
