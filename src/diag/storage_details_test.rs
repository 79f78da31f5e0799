use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};
use serde_json::json;

use std::{env, sync::atomic::AtomicBool};

use super::*;
use crate::{Config, Error};

fn make_collection(name: &str, capped: Option<u64>) -> Arc<Collection> {
    let dir = env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    let mut config = Config::new(dir.as_os_str());
    config.set_fsync(false);

    let killed = Arc::new(AtomicBool::new(false));
    Arc::new(Collection::create(&config, "test.docs", capped, killed).unwrap())
}

fn sum_field(extents: &[Value], field: &str) -> f64 {
    extents.iter().map(|e| e[field].as_f64().unwrap()).sum()
}

#[test]
fn test_analyze_params() {
    let params = AnalyzeParams::from_command(&json!({"diskStorageStats": "c"})).unwrap();
    assert_eq!(params, AnalyzeParams::default());
    assert_eq!(params.charact_field, "_id");

    let cmd = json!({
        "extent": 2, "range": [100, 2000], "numberOfChunks": 4,
        "charactField": {"name": "ts", "isStdObjId": true}, "showRecords": true,
    });
    let params = AnalyzeParams::from_command(&cmd).unwrap();
    assert_eq!(params.extent, Some(2));
    assert_eq!(params.range, Some((100, 2000)));
    assert_eq!(params.number_of_chunks, Some(4));
    assert_eq!(params.charact_field, "ts");
    assert!(params.charact_is_obj_id && params.show_records);

    let bad = vec![
        (json!({"extent": "a"}), "extent must be a number"),
        (json!({"granularity": "1k"}), "granularity must be a number"),
        (json!({"numberOfChunks": [1]}), "numberOfChunks must be a number"),
        (json!({"numberOfChunks": 0}), "numberOfChunks must be a positive number"),
        (
            json!({"range": [0, 10]}),
            "range is only allowed in combination with extent",
        ),
        (
            json!({"extent": 0, "range": [0]}),
            "range must be an array with exactly two numeric elements",
        ),
        (
            json!({"extent": 0, "range": [0, "x"]}),
            "range must be an array with exactly two numeric elements",
        ),
        (json!({"charactField": "a"}), "charactField must be an object"),
        (json!({"showRecords": 1}), "showRecords must be a boolean"),
    ];
    for (cmd, expected) in bad.into_iter() {
        match AnalyzeParams::from_command(&cmd) {
            Err(Error::InvalidInput(_, msg)) => assert_eq!(msg, expected, "{}", cmd),
            res => panic!("unexpected {:?} for {}", res, cmd),
        }
    }
}

#[test]
fn test_chunk_params() {
    let params = AnalyzeParams::default();
    let cp = ChunkParams::new(65536, &params).unwrap();
    assert_eq!((cp.start, cp.end), (0, 65536));
    assert_eq!(cp.granularity, MIN_GRANULARITY);
    assert_eq!(cp.number_of_chunks, 16);
    assert_eq!(cp.last_chunk_length, 4096);

    let cp = ChunkParams::new(1024 * 1024 * 1024, &params).unwrap();
    assert_eq!(cp.granularity, MAX_GRANULARITY);

    let params = AnalyzeParams {
        number_of_chunks: Some(3),
        granularity: Some(10),
        ..AnalyzeParams::default()
    };
    let cp = ChunkParams::new(65536, &params).unwrap();
    assert_eq!(cp.granularity, 21846);
    assert_eq!(cp.number_of_chunks, 3);
    assert_eq!(cp.last_chunk_length, 65536 - 2 * 21846);

    let params = AnalyzeParams {
        extent: Some(0),
        range: Some((100, 100_000)),
        granularity: Some(1000),
        ..AnalyzeParams::default()
    };
    let cp = ChunkParams::new(2500, &params).unwrap();
    assert_eq!((cp.start, cp.end, cp.to_length()), (100, 2500, 2400));
    assert_eq!((cp.number_of_chunks, cp.last_chunk_length), (3, 400));

    assert_eq!(cp.to_overlaps(0, 50), vec![]);
    assert_eq!(cp.to_overlaps(0, 200), vec![(0, 100)]);
    assert_eq!(cp.to_overlaps(1000, 200), vec![(0, 100), (1, 100)]);
    assert_eq!(cp.to_overlaps(2000, 1000), vec![(1, 100), (2, 400)]);
    assert_eq!(cp.to_overlaps(2500, 10), vec![]);

    let params = AnalyzeParams {
        extent: Some(0),
        range: Some((5000, 6000)),
        ..AnalyzeParams::default()
    };
    assert!(ChunkParams::new(2500, &params).is_err());
}

#[test]
fn test_chunk_params_bounds() {
    let cmd = json!({"extent": 0, "range": [200, 1000], "granularity": 1e20});
    let params = AnalyzeParams::from_command(&cmd).unwrap();
    assert_eq!(params.granularity, Some(usize::MAX));

    let cp = ChunkParams::new(65536, &params).unwrap();
    assert_eq!((cp.start, cp.end, cp.granularity), (200, 1000, 800));
    assert_eq!((cp.number_of_chunks, cp.last_chunk_length), (1, 800));
    assert_eq!(cp.to_chunk(0), (200, 1000));
    assert_eq!(cp.to_overlaps(0, 4096), vec![(0, 800)]);
    assert_eq!(cp.to_overlaps(usize::MAX - 10, 100), vec![]);

    let cmd = json!({"extent": 0, "range": [1e20, 2e20]});
    let params = AnalyzeParams::from_command(&cmd).unwrap();
    assert!(ChunkParams::new(65536, &params).is_err());

    let params = AnalyzeParams::from_command(&json!({"numberOfChunks": 1e12})).unwrap();
    let cp = ChunkParams::new(16 * 1024 * 1024, &params).unwrap();
    assert!(cp.number_of_chunks <= MAX_CHUNKS, "{}", cp.number_of_chunks);
    assert_eq!(cp.to_chunk(cp.number_of_chunks - 1).1, cp.end);

    let params = AnalyzeParams::from_command(&json!({"granularity": 1})).unwrap();
    let cp = ChunkParams::new(16 * 1024 * 1024, &params).unwrap();
    assert!(cp.number_of_chunks <= MAX_CHUNKS, "{}", cp.number_of_chunks);
}

#[test]
fn test_disk_storage_huge_granularity() {
    let coll = make_collection("test_disk_storage_huge_granularity", None);
    for i in 0..100_u64 {
        coll.insert(json!({"a": i})).unwrap();
    }

    let cmd = json!({
        "diskStorageStats": "c", "extent": 0, "range": [200, 1000], "granularity": 1e20
    });
    let res = disk_storage_stats(Arc::clone(&coll), &cmd).unwrap();
    assert_eq!(res["ok"], json!(1), "{}", res);
    let chunks = res["extents"][0]["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["onDiskSize"], json!(800));
}

#[test]
fn test_disk_storage() {
    let seed: u64 = random();
    println!("test_disk_storage seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let coll = make_collection("test_disk_storage", None);
    let mut seqnos = vec![];
    for i in 0..2000_u64 {
        let pad = "x".repeat(rng.gen::<usize>() % 200);
        seqnos.push(coll.insert(json!({"b": i, "pad": pad})).unwrap());
    }
    for seqno in seqnos.iter().filter(|_| rng.gen::<u8>() % 4 == 0) {
        coll.remove(*seqno).unwrap();
    }

    let walker = Walker::new(Arc::clone(&coll), Analyze::DiskStorage, AnalyzeParams::default());
    let val = walker.unwrap().to_json().unwrap();
    assert_eq!(val["ok"], json!(1));
    assert_eq!(val["storageSize"], json!(coll.storage_size().unwrap()));

    let extents = val["extents"].as_array().unwrap().clone();
    assert_eq!(val["numExtents"], json!(extents.len()));
    assert_eq!(extents.len(), coll.to_extents().unwrap().len());

    let on_disk = sum_field(&extents, "onDiskSize") as u64;
    assert_eq!(on_disk, coll.storage_size().unwrap());
    let entries = sum_field(&extents, "numEntries");
    assert!((entries - coll.len().unwrap() as f64).abs() < 1e-6, "{}", entries);

    for (extent, report) in coll.to_extents().unwrap().iter().zip(extents.iter()) {
        let extent = extent.read().unwrap();
        assert_eq!(report["extentHeaderSize"], json!(EXTENT_HEADER_SIZE));
        assert_eq!(report["recordHeaderSize"], json!(RECORD_HEADER_SIZE));
        assert_eq!(report["range"], json!([0, extent.to_length()]));
        assert_eq!(report["recSize"], json!(extent.to_used_size()));
        assert!(report.get("records").is_none());

        // chunks partition the extent.
        let chunks = report["chunks"].as_array().unwrap();
        let n: f64 = chunks.iter().map(|c| c["numEntries"].as_f64().unwrap()).sum();
        assert!((n - extent.len_records() as f64).abs() < 1e-6);
        let size: u64 = chunks.iter().map(|c| c["recSize"].as_u64().unwrap()).sum();
        assert_eq!(size, extent.to_used_size() as u64);
        let size: u64 = chunks.iter().map(|c| c["onDiskSize"].as_u64().unwrap()).sum();
        assert_eq!(size, extent.to_length() as u64);

        let free: f64 = report["freeRecsPerBucket"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .sum();
        assert!((free - extent.len_free() as f64).abs() < 1e-6);
    }

    // walking does not change residency.
    coll.evict_pages().unwrap();
    let walker = Walker::new(Arc::clone(&coll), Analyze::DiskStorage, AnalyzeParams::default());
    walker.unwrap().to_json().unwrap();
    let walker = Walker::new(Arc::clone(&coll), Analyze::PagesInRam, AnalyzeParams::default());
    let val = walker.unwrap().to_json().unwrap();
    for extent in val["extents"].as_array().unwrap().iter() {
        assert_eq!(extent["inMem"], json!(0));
    }
}

#[test]
fn test_disk_storage_records() {
    let coll = make_collection("test_disk_storage_records", None);
    for i in 0..100_u64 {
        coll.insert(json!({"b": i})).unwrap();
    }
    coll.remove(10).unwrap();

    let cmd = json!({"extent": 0, "showRecords": true, "charactField": {"name": "b"}});
    let params = AnalyzeParams::from_command(&cmd).unwrap();
    let walker = Walker::new(Arc::clone(&coll), Analyze::DiskStorage, params).unwrap();
    let reports: Vec<Value> = walker.iter().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(reports.len(), 1);

    let report = &reports[0];
    let records = report["records"].as_array().unwrap();
    assert_eq!(records.len(), 99);
    assert_eq!(records[0]["id"], json!(1));
    assert_eq!(records[0]["charact"], json!(0.0));
    assert!(!report["deletedRecords"].as_array().unwrap().is_empty());

    // sum of b over 0..100, less the removed record with b = 9.
    assert_eq!(report["charactCount"].as_f64().unwrap().round(), 99.0);
    assert_eq!(report["charactSum"].as_f64().unwrap().round(), 4950.0 - 9.0);
    assert_eq!(report["outOfOrderRecs"], json!(0));
}

#[test]
fn test_disk_storage_errors() {
    let coll = make_collection("test_disk_storage_errors", Some(64 * 1024));
    match Walker::new(Arc::clone(&coll), Analyze::DiskStorage, AnalyzeParams::default()) {
        Err(Error::Unsupported(_, msg)) => assert_eq!(msg, "capped collections are not supported"),
        Err(err) => panic!("unexpected {}", err),
        Ok(_) => panic!("expected error"),
    }
    // pages of capped collections can be analyzed.
    let walker = Walker::new(Arc::clone(&coll), Analyze::PagesInRam, AnalyzeParams::default());
    assert!(walker.unwrap().to_json().is_ok());

    let coll = make_collection("test_disk_storage_errors_1", None);
    coll.insert(json!({"a": 1})).unwrap();
    let params = AnalyzeParams {
        extent: Some(10),
        ..AnalyzeParams::default()
    };
    match Walker::new(Arc::clone(&coll), Analyze::DiskStorage, params) {
        Err(Error::NotFound(_, msg)) => assert_eq!(msg, "extent 10 does not exist"),
        Err(err) => panic!("unexpected {}", err),
        Ok(_) => panic!("expected error"),
    }
}

#[test]
fn test_pages_in_ram() {
    let coll = make_collection("test_pages_in_ram", None);
    for i in 0..500_u64 {
        coll.insert(json!({ "b": i })).unwrap();
    }

    let val = pages_in_ram_stats(Arc::clone(&coll), &json!({"pagesInRAM": "c"})).unwrap();
    assert_eq!(val["pageSize"], json!(PAGE_SIZE));
    let extent = &val["extents"][0];
    assert!(extent["inMem"].as_u64().unwrap() > 0);
    let chunks = extent["chunks"].as_array().unwrap();
    let sum: u64 = chunks.iter().map(|c| c.as_u64().unwrap()).sum();
    assert_eq!(extent["inMem"], json!(sum));
    assert!(extent["pageBytes"].as_u64().unwrap() >= extent["onDiskSize"].as_u64().unwrap());

    coll.evict_pages().unwrap();
    let val = pages_in_ram_stats(Arc::clone(&coll), &json!({"pagesInRAM": "c"})).unwrap();
    assert!(val["extents"]
        .as_array()
        .unwrap()
        .iter()
        .all(|e| e["inMem"] == json!(0)));

    // reading a record brings its page back.
    coll.find("_id_", &[json!(1)]).unwrap();
    let cmd = json!({"storageDetails": "c", "analyze": "memInCore", "extent": 0, "granularity": 4096});
    let val = storage_details(Arc::clone(&coll), &cmd).unwrap();
    assert_eq!(val["ok"], json!(1));
    let chunks = val["chunks"].as_array().unwrap();
    assert_eq!(chunks[0], json!(1.0));
    assert!(chunks.iter().skip(1).any(|c| c == &json!(0.0)));
}

#[test]
fn test_storage_details() {
    let coll = make_collection("test_storage_details", None);
    for i in 0..200_u64 {
        coll.insert(json!({ "b": i })).unwrap();
    }

    let cmd = json!({"storageDetails": "c", "analyze": "diskStorage", "extent": 0, "numberOfChunks": 8});
    let val = storage_details(Arc::clone(&coll), &cmd).unwrap();
    assert_eq!(val["ok"], json!(1));
    assert_eq!(val["chunks"].as_array().unwrap().len(), 8);
    assert!((val["numEntries"].as_f64().unwrap() - 200.0).abs() < 1e-6);

    let bad = vec![
        (
            json!({"storageDetails": "c"}),
            "no subcommand specified, use {analyze: 'diskStorage' | 'memInCore'}",
        ),
        (
            json!({"analyze": "pages"}),
            "\"pages\" is not a valid subcommand, use 'diskStorage' or 'memInCore'",
        ),
        (
            json!({"analyze": "diskStorage", "granularity": 100}),
            "no extent specified, use {extent: extentNum}",
        ),
        (
            json!({"analyze": "diskStorage", "extent": 0}),
            "either granularity or numberOfChunks must be specified in options",
        ),
    ];
    for (cmd, expected) in bad.into_iter() {
        match storage_details(Arc::clone(&coll), &cmd) {
            Err(Error::InvalidInput(_, msg)) => assert_eq!(msg, expected),
            res => panic!("unexpected {:?}", res),
        }
    }
}
