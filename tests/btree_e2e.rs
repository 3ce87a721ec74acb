use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use rand::prelude::*;
use tempfile::TempDir;

use blocktree::buffer::{Acquired, BlockId, BufferCache};
use blocktree::config::{BufferCacheConfig, TreeOptions};
use blocktree::tree::codec::{NodeCodec, SuperblockCodec};
use blocktree::tree::node::Node;
use blocktree::tree::BTree;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_tree(dir: &TempDir) -> BTree {
    BTree::open(dir.path().join("tree.blk")).unwrap()
}

fn decode_block<T>(cache: &BufferCache, block_id: BlockId, decode: impl Fn(&[u8]) -> T) -> T {
    let frame_id = match cache.acquire(block_id).unwrap() {
        Acquired::Ready(frame_id) => frame_id,
        Acquired::Pending(fetch) => {
            let data = fetch.receiver.recv().unwrap().unwrap();
            cache.complete_fetch(fetch, data).unwrap()
        }
    };
    let value = decode(cache.read_guard(frame_id).data());
    cache.release(block_id, false).unwrap();
    value
}

#[test]
fn fill_one_leaf_then_split_on_the_seventeenth_key() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir);

    for k in 0..Node::ORDER as u64 {
        tree.insert(k, k * 3).unwrap();
    }
    for k in 0..Node::ORDER as u64 {
        assert_eq!(tree.lookup(k).unwrap(), Some(k * 3));
    }
    assert_eq!(tree.lookup(Node::ORDER as u64).unwrap(), None);

    // The 17th key forces the root leaf to split; the median of keys
    // 0..16 is 8, so 7 must land left of it and 8 right of it.
    tree.insert(16, 48).unwrap();
    for k in 0..=16u64 {
        assert_eq!(tree.lookup(k).unwrap(), Some(k * 3));
    }

    // The split must have grown an internal root with the median as its
    // single separator and both halves reachable as leaves.
    let cache = tree.cache();
    let root_id = decode_block(&cache, tree.superblock_id(), |bytes| {
        SuperblockCodec::decode(bytes).unwrap()
    });
    let root = decode_block(&cache, root_id, |bytes| NodeCodec::decode(bytes).unwrap());
    let root = match root {
        Node::Internal(internal) => internal,
        Node::Leaf(_) => panic!("root did not split into an internal node"),
    };
    assert_eq!(root.keys, vec![8]);
    assert_eq!(root.children.len(), 2);
    let left = decode_block(&cache, root.children[0], |bytes| {
        NodeCodec::decode(bytes).unwrap()
    });
    let right = decode_block(&cache, root.children[1], |bytes| {
        NodeCodec::decode(bytes).unwrap()
    });
    match (left, right) {
        (Node::Leaf(left), Node::Leaf(right)) => {
            assert!(left.keys.iter().all(|k| *k < 8));
            assert!(right.keys.iter().all(|k| *k >= 8));
            assert_eq!(left.keys.len() + right.keys.len(), 17);
        }
        _ => panic!("both root children should still be leaves"),
    }
}

#[test]
fn ascending_and_descending_bulk_inserts() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir);
    for k in 0..500u64 {
        tree.insert(k, k).unwrap();
    }
    for k in (500..1000u64).rev() {
        tree.insert(k, k).unwrap();
    }
    for k in 0..1000u64 {
        assert_eq!(tree.lookup(k).unwrap(), Some(k), "key {}", k);
    }
    assert_eq!(tree.lookup(1000).unwrap(), None);
}

#[test]
fn removes_shrink_back_to_empty() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir);
    for k in 0..300u64 {
        tree.insert(k, k + 1).unwrap();
    }
    for k in 0..300u64 {
        assert!(tree.remove(k).unwrap(), "key {}", k);
        assert_eq!(tree.lookup(k).unwrap(), None);
    }
    assert!(!tree.remove(0).unwrap());
    // Reinsert after full drain.
    tree.insert(42, 424).unwrap();
    assert_eq!(tree.lookup(42).unwrap(), Some(424));
}

#[test]
fn randomized_workload_against_a_model() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let mut options = TreeOptions::default();
    options.cache = BufferCacheConfig {
        cache_size: 32,
        lru_k: 2,
    };
    let tree = BTree::open_with_options(dir.path().join("tree.blk"), options).unwrap();

    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut model: BTreeMap<u64, u64> = BTreeMap::new();

    for round in 0..4000u64 {
        let key = rng.random_range(0..600);
        match rng.random_range(0..10) {
            0..=5 => {
                let value = round;
                tree.insert(key, value).unwrap();
                model.insert(key, value);
            }
            6..=8 => {
                let expected = model.remove(&key).is_some();
                assert_eq!(tree.remove(key).unwrap(), expected, "remove {}", key);
            }
            _ => {
                assert_eq!(tree.lookup(key).unwrap(), model.get(&key).copied());
            }
        }
    }
    for (key, value) in &model {
        assert_eq!(tree.lookup(*key).unwrap(), Some(*value), "key {}", key);
    }
}

#[test]
fn concurrent_readers_during_inserts() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let tree = Arc::new(open_tree(&dir));
    for k in 0..200u64 {
        tree.insert(k, k).unwrap();
    }

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let tree = tree.clone();
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(t);
            for _ in 0..500 {
                let key = rng.random_range(0..200);
                // Keys 0..200 are never removed, so readers must always
                // see a value regardless of concurrent writers.
                assert_eq!(tree.lookup(key).unwrap(), Some(key));
            }
        }));
    }
    let writer = {
        let tree = tree.clone();
        thread::spawn(move || {
            for k in 200..400u64 {
                tree.insert(k, k).unwrap();
            }
        })
    };
    for handle in handles {
        handle.join().unwrap();
    }
    writer.join().unwrap();
    for k in 0..400u64 {
        assert_eq!(tree.lookup(k).unwrap(), Some(k));
    }
}

#[test]
fn values_survive_reopen_after_mixed_workload() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tree.blk");
    {
        let tree = BTree::open(&path).unwrap();
        for k in 0..128u64 {
            tree.insert(k, k * 7).unwrap();
        }
        for k in (0..128u64).step_by(3) {
            assert!(tree.remove(k).unwrap());
        }
    }
    let tree = BTree::open(&path).unwrap();
    for k in 0..128u64 {
        let expected = if k % 3 == 0 { None } else { Some(k * 7) };
        assert_eq!(tree.lookup(k).unwrap(), expected, "key {}", k);
    }
}
