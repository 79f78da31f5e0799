use serde_json::json;

use super::*;

fn start(build_id: u64, ns: &str) -> BuildOp {
    BuildOp::Start {
        build_id,
        ns: ns.to_string(),
        spec: br#"{"key":{"a":1}}"#.to_vec(),
        background: build_id % 2 == 0,
    }
}

fn entries(ops: Vec<BuildOp>) -> Vec<Entry> {
    ops.into_iter()
        .enumerate()
        .map(|(i, op)| Entry::new(i as u64 + 1, op))
        .collect()
}

#[test]
fn test_replay() {
    let ops = vec![
        start(1, "test.a"),
        start(2, "test.b"),
        BuildOp::Progress {
            build_id: 1,
            cursor: 100,
            n_keys: 100,
        },
        start(3, "test.c"),
        BuildOp::Commit { build_id: 1 },
        BuildOp::Progress {
            build_id: 2,
            cursor: 50,
            n_keys: 40,
        },
        start(4, "test.d"),
        BuildOp::Commit { build_id: 3 },
        BuildOp::Done { build_id: 3 },
        BuildOp::Abort {
            build_id: 4,
            reason: "index dropped".to_string(),
        },
    ];
    let plan = replay(&entries(ops));

    assert_eq!(plan.n_entries, 10);
    assert_eq!(plan.n_skipped, 0);
    assert_eq!(plan.max_build_id, 4);

    assert_eq!(plan.finalize.len(), 1);
    let record = &plan.finalize[0];
    assert_eq!(record.build_id, 1);
    assert_eq!(record.ns, "test.a");
    assert_eq!(record.spec, json!({"key": {"a": 1}}));
    assert_eq!(record.cursor, 100);
    assert!(record.committed);

    assert_eq!(plan.discard.len(), 1);
    let record = &plan.discard[0];
    assert_eq!(record.build_id, 2);
    assert_eq!((record.cursor, record.n_keys), (50, 40));
    assert!(record.background);
    assert!(!record.committed);

    // replay is a pure function.
    assert_eq!(replay(&entries(vec![])), RecoveryPlan::default());
}

#[test]
fn test_replay_skip() {
    let mut items = entries(vec![start(1, "test.a"), BuildOp::Commit { build_id: 1 }]);
    // out of order entry, is ignored.
    items.push(Entry::new(1, BuildOp::Done { build_id: 1 }));
    // unknown build.
    items.push(Entry::new(5, BuildOp::Commit { build_id: 9 }));
    // bad spec.
    items.push(Entry::new(
        6,
        BuildOp::Start {
            build_id: 10,
            ns: "test.x".to_string(),
            spec: b"{bad".to_vec(),
            background: false,
        },
    ));

    let plan = replay(&items);
    assert_eq!(plan.n_entries, 5);
    assert_eq!(plan.n_skipped, 3);
    assert_eq!(plan.max_build_id, 10);
    assert_eq!(plan.finalize.len(), 1);
    assert_eq!(plan.finalize[0].build_id, 1);
    assert!(plan.discard.is_empty());
}
