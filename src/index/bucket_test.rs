use super::*;
use crate::index::KeyPart;

fn make_node(n: i64) -> KeyNode {
    let key = Key::new(vec![KeyPart::Number(n as f64)], 0);
    KeyNode::new(key, RecordLoc::new(0, n as usize))
}

#[test]
fn test_bucket_sizes() {
    let mut bucket = Bucket::default();
    assert!(bucket.is_leaf());
    assert_eq!(bucket.len_keys(), 0);
    assert_eq!(bucket.to_empty_size(), BUCKET_BODY_SIZE);

    for i in 0..10 {
        let node = make_node(i);
        let pos = bucket.search(&node.key, node.loc).unwrap_err();
        bucket.insert_node(pos, node);
    }
    let key_size = make_node(0).key.to_size();
    assert_eq!(bucket.len_keys(), 10);
    assert_eq!(bucket.to_key_bytes(), 10 * key_size);
    assert_eq!(
        bucket.to_empty_size(),
        BUCKET_BODY_SIZE - 10 * (KEY_NODE_SIZE + key_size)
    );

    bucket.set_used(3, false);
    assert_eq!(bucket.len_used_keys(), 9);
    let node = make_node(3);
    assert_eq!(bucket.search(&node.key, node.loc), Ok(3));

    let mut n = 0;
    while !bucket.is_overflow() {
        let node = make_node(100 + n);
        bucket.insert_node(bucket.len_keys(), node);
        n += 1;
    }
    assert_eq!(bucket.to_empty_size(), 0);
}

#[test]
fn test_bucket_split() {
    let nodes: Vec<KeyNode> = (0..10)
        .map(|i| {
            let mut node = make_node(i);
            node.prev_child = Some(i as usize + 1);
            node
        })
        .collect();
    let mut bucket = Bucket::new(nodes, Some(11));
    assert!(!bucket.is_leaf());
    assert_eq!(bucket.to_children(), (1..=11).collect::<Vec<usize>>());
    assert_eq!(bucket.child_at(4), Some(5));
    assert_eq!(bucket.child_at(10), Some(11));

    let (sep, right) = bucket.split_at(6).unwrap();
    assert_eq!(sep.loc, RecordLoc::new(0, 6));
    assert_eq!(bucket.len_keys(), 6);
    assert_eq!(bucket.to_children(), vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(right.len_keys(), 3);
    assert_eq!(right.to_children(), vec![8, 9, 10, 11]);
    assert_eq!(
        bucket.to_key_bytes() + right.to_key_bytes() + sep.key.to_size(),
        10 * sep.key.to_size()
    );

    bucket.set_child_at(6, 100);
    assert_eq!(bucket.to_next_child(), Some(100));
    assert!(bucket.split_at(6).is_none());
}
