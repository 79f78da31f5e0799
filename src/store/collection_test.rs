use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};
use serde_json::json;

use std::env;

use super::*;
use crate::index::PendingBuild;

fn make_config(name: &str) -> Config {
    let dir = env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    let mut config = Config::new(dir.as_os_str());
    config.set_fsync(false).set_extent_size(4096, 2, 64 * 1024);
    config
}

fn make_killed() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[test]
fn test_collection_insert() {
    let config = make_config("test_collection_insert");
    let coll = Collection::create(&config, "test.docs", None, make_killed()).unwrap();
    assert!(coll.is_empty().unwrap());

    for i in 0..1000_u64 {
        let seqno = coll.insert(json!({"a": i % 10, "b": "hello world"})).unwrap();
        assert_eq!(seqno, i + 1);
    }
    assert_eq!(coll.len().unwrap(), 1000);

    let docs = coll.scan().unwrap();
    assert_eq!(docs.len(), 1000);
    // `_id` is assigned and placed first.
    let first = docs[0].as_object().unwrap();
    assert_eq!(first.keys().next().unwrap(), "_id");
    assert_eq!(docs[0]["_id"], json!(1));

    let id_index = coll.as_catalog().to_index("_id_").unwrap().unwrap();
    assert_eq!(id_index.len().unwrap(), 1000);
    let docs = coll.find("_id_", &[json!(500)]).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["a"], json!(9));

    // extents grow geometrically, sum of extents is the storage size.
    let extents = coll.to_extents().unwrap();
    assert!(extents.len() > 1);
    let total: usize = extents.iter().map(|e| e.read().unwrap().to_length()).sum();
    assert_eq!(coll.storage_size().unwrap(), total as u64);

    match coll.insert(json!({"_id": 10})) {
        Err(Error::Conflict(_, msg)) => assert!(msg.contains("dup key"), "{}", msg),
        res => panic!("unexpected {:?}", res),
    }
    assert!(coll.insert(json!([1, 2])).is_err());
    match coll.find("a_1", &[json!(1)]) {
        Err(Error::NotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    assert_eq!(coll.len().unwrap(), 1000);
    assert_eq!(coll.to_storage_ns("_id_"), "test.docs.$_id_");
}

#[test]
fn test_collection_reload() {
    let seed: u64 = random();
    println!("test_collection_reload seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let config = make_config("test_collection_reload");
    let coll = Collection::create(&config, "docs", None, make_killed()).unwrap();

    let mut live = vec![];
    for i in 0..2000_u64 {
        let pad = "x".repeat(rng.gen::<usize>() % 200);
        live.push(coll.insert(json!({"n": i, "pad": pad})).unwrap());
        if rng.gen::<u8>() % 4 == 0 {
            let off = rng.gen::<usize>() % live.len();
            assert!(coll.remove(live.remove(off)).unwrap());
        }
    }
    assert!(!coll.remove(u64::MAX).unwrap());

    let layout = |coll: &Collection| -> Vec<(usize, Vec<(usize, u64)>, Vec<(usize, usize)>)> {
        let mut layout = vec![];
        for extent in coll.to_extents().unwrap().iter() {
            let e = extent.read().unwrap();
            let records = e.iter_records().map(|(o, r)| (*o, r.seqno)).collect();
            layout.push((e.to_length(), records, e.iter_free().collect()));
        }
        layout
    };

    let before = layout(&coll);
    let scan = coll.scan().unwrap();
    std::mem::drop(coll);

    let coll = Collection::load(&config, "docs", make_killed()).unwrap();
    assert_eq!(layout(&coll), before);
    assert_eq!(coll.scan().unwrap(), scan);
    assert_eq!(coll.len().unwrap(), live.len());

    // pages are not resident after load.
    for extent in coll.to_extents().unwrap().iter() {
        assert_eq!(extent.read().unwrap().to_resident_pages(), 0);
    }

    let seqno = coll.insert(json!({"n": "last"})).unwrap();
    assert!(seqno > *live.last().unwrap());
}

#[test]
fn test_collection_capped() {
    let config = make_config("test_collection_capped");
    let coll = Collection::create(&config, "capped", Some(16 * 1024), make_killed()).unwrap();
    assert!(coll.is_capped());
    assert_eq!(coll.storage_size().unwrap(), 16 * 1024);

    let pad = "y".repeat(100);
    for i in 0..1000_u64 {
        coll.insert(json!({"i": i, "pad": pad})).unwrap();
    }
    // storage does not grow, oldest records are evicted.
    assert_eq!(coll.storage_size().unwrap(), 16 * 1024);
    let docs = coll.scan().unwrap();
    assert!(docs.len() < 1000);
    assert_eq!(docs.last().unwrap()["i"], json!(999));
    let id_index = coll.as_catalog().to_index("_id_").unwrap().unwrap();
    assert_eq!(id_index.len().unwrap(), docs.len());

    let large = "z".repeat(32 * 1024);
    match coll.insert(json!({ "large": large })) {
        Err(Error::InvalidInput(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    std::mem::drop(coll);

    let coll = Collection::load(&config, "capped", make_killed()).unwrap();
    assert_eq!(coll.to_capped(), Some(16 * 1024));
    assert_eq!(coll.scan().unwrap(), docs);
}

#[test]
fn test_collection_indexes() {
    let config = make_config("test_collection_indexes");
    let coll = Collection::create(&config, "docs", None, make_killed()).unwrap();
    for i in 0..100_u64 {
        coll.insert(json!({"a": i % 10, "b": {"c": i}})).unwrap();
    }

    let spec = IndexSpec::from_json(&json!({"key": {"a": 1}})).unwrap();
    let tree = {
        let storage = coll.read_storage().unwrap();
        coll.to_full_index(&storage, spec.clone()).unwrap()
    };
    let data = serde_json::to_vec(&spec.to_json()).unwrap();
    coll.append_op(Op::CreateIndex { spec: data }).unwrap();
    coll.as_catalog().add_index(tree).unwrap();

    assert_eq!(coll.find("a_1", &[json!(3)]).unwrap().len(), 10);
    coll.insert(json!({"a": 3})).unwrap();
    assert_eq!(coll.find("a_1", &[json!(3)]).unwrap().len(), 11);

    let unique = IndexSpec::from_json(&json!({"key": {"a": 1}, "unique": true, "name": "u"}));
    let storage = coll.read_storage().unwrap();
    match coll.to_full_index(&storage, unique.unwrap()) {
        Err(Error::Conflict(_, msg)) => assert!(msg.contains("_id"), "{}", msg),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }
    std::mem::drop(storage);
    std::mem::drop(coll);

    let coll = Collection::load(&config, "docs", make_killed()).unwrap();
    assert_eq!(coll.find("a_1", &[json!(3)]).unwrap().len(), 11);

    coll.drop_index("a_1").unwrap();
    assert!(coll.drop_index("a_1").is_err());
    assert!(coll.drop_index("_id_").is_err());
    std::mem::drop(coll);

    let coll = Collection::load(&config, "docs", make_killed()).unwrap();
    assert!(coll.as_catalog().to_index("a_1").unwrap().is_none());
}

#[test]
fn test_collection_pending() {
    let config = make_config("test_collection_pending");
    let coll = Collection::create(&config, "docs", None, make_killed()).unwrap();
    for i in 0..10_u64 {
        coll.insert(json!({ "a": i })).unwrap();
    }

    let spec = IndexSpec::from_json(&json!({"key": {"a": 1}, "unique": true})).unwrap();
    let build = Arc::new(PendingBuild::new(1, spec));
    coll.as_catalog().add_pending(Arc::clone(&build)).unwrap();
    build.set_cursor(20);

    // writes below the cursor go to the side tree.
    coll.insert(json!({"a": 100})).unwrap();
    assert_eq!(build.as_tree().len().unwrap(), 1);
    assert!(build.to_failure().is_none());

    coll.insert(json!({"a": 100})).unwrap();
    match build.to_failure() {
        Some(Error::Conflict(_, msg)) => assert!(msg.contains("dup key"), "{}", msg),
        res => panic!("unexpected {:?}", res),
    }

    // pending index is not visible to reads.
    assert!(coll.find("a_1", &[json!(100)]).is_err());

    coll.drop_index("a_1").unwrap();
    assert!(build.is_cancelled());
}

#[test]
fn test_collection_blocked() {
    let config = make_config("test_collection_blocked");
    let coll = Collection::create(&config, "docs", None, make_killed()).unwrap();
    coll.insert(json!({"a": 1})).unwrap();

    coll.set_fail_appends(true);
    match coll.insert(json!({"a": 2})) {
        Err(Error::IOError(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    assert_eq!(coll.len().unwrap(), 1);

    let spec = IndexSpec::from_json(&json!({"key": {"a": 1}})).unwrap();
    let data = serde_json::to_vec(&spec.to_json()).unwrap();
    coll.set_blocked("injected".to_string(), Op::CreateIndex { spec: data })
        .unwrap();
    assert!(coll.is_blocked());
    assert!(coll.drop_index("a_1").is_err());
    assert!(coll.resolve_blocked().is_err());
    assert!(coll.is_blocked());

    coll.set_fail_appends(false);
    coll.resolve_blocked().unwrap();
    assert!(!coll.is_blocked());
    coll.check_blocked().unwrap();
}

#[test]
fn test_collection_killed() {
    let config = make_config("test_collection_killed");
    let killed = make_killed();
    let coll = Collection::create(&config, "docs", None, Arc::clone(&killed)).unwrap();
    coll.insert(json!({"a": 1})).unwrap();

    killed.store(true, SeqCst);
    assert!(coll.is_killed());
    match coll.insert(json!({"a": 2})) {
        Err(Error::Aborted(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    coll.purge().unwrap();
    assert!(coll.is_dropped());
    let loc = Collection::to_location(&config, "docs").unwrap();
    assert!(!std::path::Path::new(&loc).exists());
    assert!(Collection::to_location(&config, "a/b").is_err());
}
