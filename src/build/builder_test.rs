use serde_json::json;

use std::{env, sync::atomic::AtomicBool, time};

use super::*;
use crate::{build::replay, Config};

struct Setup {
    config: Config,
    coll: Arc<Collection>,
    journal: Arc<Mutex<Journal>>,
    killed: Arc<AtomicBool>,
}

fn setup(name: &str, n_docs: u64) -> Setup {
    let dir = env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    let mut config = Config::new(dir.as_os_str());
    config
        .set_fsync(false)
        .set_journal_flush_every(1)
        .set_build_batch_size(100);

    let killed = Arc::new(AtomicBool::new(false));
    let coll = Collection::create(&config, "test.docs", None, Arc::clone(&killed)).unwrap();
    for i in 0..n_docs {
        coll.insert(json!({"a": i % 50, "b": i})).unwrap();
    }
    let journal = Journal::start(&config, Arc::clone(&killed)).unwrap();

    Setup {
        config,
        coll: Arc::new(coll),
        journal: Arc::new(Mutex::new(journal)),
        killed,
    }
}

fn make_build(s: &Setup, build_id: u64, spec: serde_json::Value, background: bool) -> IndexBuild {
    let spec = IndexSpec::from_json(&spec).unwrap();
    let journal = Arc::clone(&s.journal);
    let coll = Arc::clone(&s.coll);
    IndexBuild::new(build_id, coll, spec, background, journal, s.config.build_batch_size)
}

fn journal_ops(s: &Setup) -> Vec<BuildOp> {
    let entries = Journal::load(&s.config.dir).unwrap();
    entries.into_iter().map(|e| e.op).collect()
}

#[test]
fn test_build_foreground() {
    let s = setup("test_build_foreground", 1000);
    // an open build keeps the journal from being truncated.
    let mut other = make_build(&s, 100, json!({"key": {"b": 1}}), true);
    other.start().unwrap();

    let build = make_build(&s, 1, json!({"key": {"a": 1}}), false);
    assert_eq!(build.to_state().unwrap(), BuildState::NotStarted);
    run_foreground(build).unwrap();

    let tree = s.coll.as_catalog().to_index("a_1").unwrap().unwrap();
    assert_eq!(tree.len().unwrap(), 1000);
    assert_eq!(s.coll.find("a_1", &[json!(7)]).unwrap().len(), 20);
    assert!(s.coll.as_catalog().to_pending().unwrap().is_empty());

    let ops = journal_ops(&s);
    assert!(matches!(ops.first(), Some(BuildOp::Start { .. })));
    let n_progress = ops.iter().filter(|op| op.is_progress()).count();
    assert_eq!(n_progress, 10);
    assert_eq!(ops[ops.len() - 2], BuildOp::Commit { build_id: 1 });
    assert_eq!(ops[ops.len() - 1], BuildOp::Done { build_id: 1 });

    let plan = replay(&Journal::load(&s.config.dir).unwrap());
    assert!(plan.finalize.is_empty());
    assert_eq!(plan.discard.len(), 1);
    assert_eq!(plan.discard[0].build_id, 100);
    std::mem::drop(other);

    // index is durable in the data file.
    let coll = Collection::load(&s.config, "test.docs", Arc::new(AtomicBool::new(false)));
    let coll = coll.unwrap();
    assert_eq!(coll.find("a_1", &[json!(7)]).unwrap().len(), 20);
}

#[test]
fn test_build_steps() {
    let s = setup("test_build_steps", 450);
    let mut build = make_build(&s, 2, json!({"key": {"b": -1}}), true);
    build.start().unwrap();
    assert_eq!(build.to_state().unwrap(), BuildState::Building);

    assert!(!build.step().unwrap());
    assert_eq!(build.as_pending().to_cursor(), 100);

    // writes below the cursor are applied to the side tree, above the
    // cursor are picked up by the build.
    let docs = s.coll.find("_id_", &[json!(10)]).unwrap();
    assert_eq!(docs.len(), 1);
    assert!(s.coll.remove(10).unwrap());
    assert!(s.coll.remove(300).unwrap());
    s.coll.insert(json!({"b": 1000})).unwrap();

    // pending index is not visible.
    assert!(s.coll.find("b_-1", &[json!(1)]).is_err());

    assert!(!build.step().unwrap());
    build.commit().unwrap();
    assert_eq!(build.to_state().unwrap(), BuildState::Complete);
    assert_eq!(build.to_n_keys(), 450);

    let tree = s.coll.as_catalog().to_index("b_-1").unwrap().unwrap();
    assert_eq!(tree.len().unwrap(), 449);
    assert!(s.coll.find("b_-1", &[json!(9)]).unwrap().is_empty());
    assert_eq!(s.coll.find("b_-1", &[json!(1000)]).unwrap().len(), 1);

    // step after commit is an error.
    assert!(build.step().is_err());
}

#[test]
fn test_build_unique_dup() {
    let s = setup("test_build_unique_dup", 200);
    let build = make_build(&s, 3, json!({"key": {"a": 1}, "unique": true}), false);
    match run_foreground(build) {
        Err(Error::Conflict(_, msg)) => {
            assert!(msg.contains("dup key"), "{}", msg);
            assert!(msg.contains("_id"), "{}", msg);
        }
        res => panic!("unexpected {:?}", res),
    }
    assert!(s.coll.as_catalog().to_index("a_1").unwrap().is_none());
    assert!(s.coll.as_catalog().to_pending().unwrap().is_empty());

    // aborted build was the only one, journal is truncated.
    assert!(journal_ops(&s).is_empty());
    let plan = replay(&Journal::load(&s.config.dir).unwrap());
    assert!(plan.discard.is_empty());
}

#[test]
fn test_build_background() {
    let s = setup("test_build_background", 5000);
    let build = make_build(&s, 4, json!({"key": {"b": 1}}), true);
    let handle = BuildHandle::spawn(build).unwrap();

    for i in 0..500_u64 {
        s.coll.insert(json!({ "b": 10_000 + i })).unwrap();
    }
    let name = handle.to_name();
    assert!(name.contains("b_1"), "{}", name);
    handle.wait().unwrap();

    let tree = s.coll.as_catalog().to_index("b_1").unwrap().unwrap();
    assert_eq!(tree.len().unwrap(), 5500);
    assert_eq!(s.coll.find("b_1", &[json!(10_499)]).unwrap().len(), 1);
}

#[test]
fn test_build_cancel() {
    let s = setup("test_build_cancel", 5000);
    let mut build = make_build(&s, 5, json!({"key": {"a": 1}}), true);
    build.start().unwrap();
    build.step().unwrap();

    s.coll.drop_index("a_1").unwrap();
    match build.step() {
        Err(Error::Aborted(_, msg)) => assert_eq!(msg, "index dropped"),
        res => panic!("unexpected {:?}", res),
    }
    assert_eq!(build.to_state().unwrap(), BuildState::Aborted);
    assert!(s.coll.as_catalog().to_pending().unwrap().is_empty());

    // background build, cancelled through its handle.
    let build = make_build(&s, 6, json!({"key": {"a": 1}}), true);
    let handle = BuildHandle::spawn(build).unwrap();
    handle.cancel().unwrap();
    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    while !handle.is_finished() && time::Instant::now() < deadline {
        std::thread::sleep(time::Duration::from_millis(1));
    }
    let state = handle.to_state().unwrap();
    match handle.wait() {
        Ok(()) => assert_eq!(state, BuildState::Complete),
        Err(Error::Aborted(_, _)) => assert_eq!(state, BuildState::Aborted),
        res => panic!("unexpected {:?}", res),
    }

    // cancelling a finished build is a no-op.
    let build = make_build(&s, 10, json!({"key": {"b": 1}}), true);
    let handle = BuildHandle::spawn(build).unwrap();
    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    while !handle.is_finished() && time::Instant::now() < deadline {
        std::thread::sleep(time::Duration::from_millis(1));
    }
    assert!(handle.is_finished());
    handle.cancel().unwrap();
    handle.wait().unwrap();
    assert!(s.coll.as_catalog().to_index("b_1").unwrap().is_some());
}

#[test]
fn test_build_killed() {
    let s = setup("test_build_killed", 1000);
    let mut build = make_build(&s, 7, json!({"key": {"a": 1}}), true);
    build.start().unwrap();
    build.step().unwrap();

    s.killed.store(true, std::sync::atomic::Ordering::SeqCst);
    match build.step() {
        Err(Error::Aborted(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    std::mem::drop(build);

    // no abort entry, the build is discarded on recovery.
    let plan = replay(&Journal::load(&s.config.dir).unwrap());
    assert_eq!(plan.discard.len(), 1);
    assert_eq!(plan.discard[0].build_id, 7);
    assert_eq!(plan.discard[0].cursor, 100);
}

#[test]
fn test_build_blocked() {
    let s = setup("test_build_blocked", 100);
    let build = make_build(&s, 8, json!({"key": {"a": 1}}), false);
    s.coll.set_fail_appends(true);
    match run_foreground(build) {
        Err(Error::IOError(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    assert!(s.coll.is_blocked());
    // catalog is ahead of the data file.
    assert!(s.coll.as_catalog().to_index("a_1").unwrap().is_some());

    let build = make_build(&s, 9, json!({"key": {"b": 1}}), false);
    assert!(matches!(run_foreground(build), Err(Error::IOError(_, _))));
    assert!(s.coll.drop_index("a_1").is_err());

    // commit without done is finalized by recovery.
    let plan = replay(&Journal::load(&s.config.dir).unwrap());
    assert_eq!(plan.finalize.len(), 1);
    assert_eq!(plan.finalize[0].build_id, 8);

    s.coll.set_fail_appends(false);
    s.coll.resolve_blocked().unwrap();
    assert!(!s.coll.is_blocked());
    s.coll.drop_index("a_1").unwrap();
}
