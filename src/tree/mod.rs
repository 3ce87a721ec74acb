//! Block-structured B-tree over a buffer cache.
//!
//! [`BTree`] wires the store, scheduler, cache and lock table together
//! and hands out resumable operations. Callers that do not multiplex
//! suspended operations themselves can use the run-to-completion
//! `lookup`/`insert`/`remove` wrappers, which pump `wait_event` back
//! into `resume` until the operation completes.

pub mod codec;
pub mod node;
pub mod ops;

pub use node::{InternalNode, LeafInsert, LeafNode, Node};
pub use ops::{InsertOp, LookupOp, OpStatus, RemoveOp, TreeEvent, TreeOutcome};

use std::path::Path;
use std::sync::Arc;

use crate::buffer::{is_block_id_null, BlockId, BufferCache, INVALID_BLOCK_ID};
use crate::config::TreeOptions;
use crate::error::{BlockTreeError, BlockTreeResult};
use crate::lock::LockTable;
use crate::storage::{BlockScheduler, BlockStore};
use crate::tree::codec::SuperblockCodec;

pub struct BTree {
    cache: Arc<BufferCache>,
    locks: Arc<LockTable>,
    superblock_id: BlockId,
    rebalance_on_remove: bool,
}

impl BTree {
    pub fn open(path: impl AsRef<Path>) -> BlockTreeResult<Self> {
        Self::open_with_options(path, TreeOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: TreeOptions,
    ) -> BlockTreeResult<Self> {
        let store = Arc::new(BlockStore::try_new(path)?);
        let scheduler = Arc::new(BlockScheduler::new_with_config(store.clone(), options.io));
        let cache = Arc::new(BufferCache::new_with_config(options.cache, scheduler));
        let locks = Arc::new(LockTable::new());
        let superblock_id = Self::ensure_superblock(&store, &cache)?;
        log::info!("opened tree, superblock at block {}", superblock_id);
        Ok(BTree {
            cache,
            locks,
            superblock_id,
            rebalance_on_remove: options.tree.rebalance_on_remove,
        })
    }

    /// First open of a fresh store: allocate the superblock with a null
    /// root and persist its id in the store metadata.
    fn ensure_superblock(
        store: &Arc<BlockStore>,
        cache: &Arc<BufferCache>,
    ) -> BlockTreeResult<BlockId> {
        let existing = store.superblock_id();
        if !is_block_id_null(existing) {
            return Ok(existing);
        }
        let (block_id, frame_id) = cache.allocate()?;
        {
            let mut guard = cache.write_guard(frame_id);
            SuperblockCodec::encode(INVALID_BLOCK_ID, guard.data_mut());
        }
        if let Some(ticket) = cache.release(block_id, true)? {
            ticket
                .receiver
                .recv()
                .map_err(|e| BlockTreeError::Internal(format!("Channel disconnected: {}", e)))??;
        }
        store.set_superblock_id(block_id)?;
        Ok(block_id)
    }

    pub fn superblock_id(&self) -> BlockId {
        self.superblock_id
    }

    pub fn cache(&self) -> Arc<BufferCache> {
        self.cache.clone()
    }

    pub(crate) fn lock_table(&self) -> Arc<LockTable> {
        self.locks.clone()
    }

    pub fn init_lookup(&self, key: u64) -> LookupOp {
        LookupOp::new(
            self.cache.clone(),
            self.locks.clone(),
            self.superblock_id,
            key,
        )
    }

    pub fn init_insert(&self, key: u64, value: u64) -> InsertOp {
        InsertOp::new(
            self.cache.clone(),
            self.locks.clone(),
            self.superblock_id,
            key,
            value,
        )
    }

    pub fn init_remove(&self, key: u64) -> RemoveOp {
        RemoveOp::new(
            self.cache.clone(),
            self.locks.clone(),
            self.superblock_id,
            key,
            self.rebalance_on_remove,
        )
    }

    pub fn lookup(&self, key: u64) -> BlockTreeResult<Option<u64>> {
        let mut op = self.init_lookup(key);
        let mut status = op.resume(None)?;
        while status == OpStatus::Pending {
            let event = op.wait_event()?;
            status = op.resume(Some(event))?;
        }
        match status {
            OpStatus::Complete(TreeOutcome::Found { value }) => Ok(Some(value)),
            OpStatus::Complete(TreeOutcome::NotFound) => Ok(None),
            other => Err(BlockTreeError::Internal(format!(
                "unexpected lookup outcome {:?}",
                other
            ))),
        }
    }

    pub fn insert(&self, key: u64, value: u64) -> BlockTreeResult<()> {
        let mut op = self.init_insert(key, value);
        let mut status = op.resume(None)?;
        while status == OpStatus::Pending {
            let event = op.wait_event()?;
            status = op.resume(Some(event))?;
        }
        match status {
            OpStatus::Complete(TreeOutcome::Inserted) => Ok(()),
            other => Err(BlockTreeError::Internal(format!(
                "unexpected insert outcome {:?}",
                other
            ))),
        }
    }

    /// Returns whether the key was present.
    pub fn remove(&self, key: u64) -> BlockTreeResult<bool> {
        let mut op = self.init_remove(key);
        let mut status = op.resume(None)?;
        while status == OpStatus::Pending {
            let event = op.wait_event()?;
            status = op.resume(Some(event))?;
        }
        match status {
            OpStatus::Complete(TreeOutcome::Removed) => Ok(true),
            OpStatus::Complete(TreeOutcome::NotFound) => Ok(false),
            other => Err(BlockTreeError::Internal(format!(
                "unexpected remove outcome {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferCacheConfig, TreeOptions};
    use tempfile::TempDir;

    fn open_tree(dir: &TempDir) -> BTree {
        BTree::open(dir.path().join("tree.blk")).unwrap()
    }

    #[test]
    fn lookup_on_empty_tree_misses() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        assert_eq!(tree.lookup(7).unwrap(), None);
    }

    #[test]
    fn insert_then_lookup_round_trip() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        tree.insert(7, 700).unwrap();
        tree.insert(3, 300).unwrap();
        assert_eq!(tree.lookup(7).unwrap(), Some(700));
        assert_eq!(tree.lookup(3).unwrap(), Some(300));
        assert_eq!(tree.lookup(4).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_overwrites() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        tree.insert(9, 1).unwrap();
        tree.insert(9, 2).unwrap();
        assert_eq!(tree.lookup(9).unwrap(), Some(2));
    }

    #[test]
    fn remove_round_trip() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        tree.insert(1, 10).unwrap();
        tree.insert(2, 20).unwrap();
        assert!(tree.remove(1).unwrap());
        assert!(!tree.remove(1).unwrap());
        assert_eq!(tree.lookup(1).unwrap(), None);
        assert_eq!(tree.lookup(2).unwrap(), Some(20));
    }

    #[test]
    fn remove_last_key_empties_the_tree() {
        let dir = TempDir::new().unwrap();
        let tree = open_tree(&dir);
        tree.insert(5, 50).unwrap();
        assert!(tree.remove(5).unwrap());
        assert_eq!(tree.lookup(5).unwrap(), None);
        // The tree is usable again after the root is nulled.
        tree.insert(6, 60).unwrap();
        assert_eq!(tree.lookup(6).unwrap(), Some(60));
    }

    #[test]
    fn tree_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.blk");
        {
            let tree = BTree::open(&path).unwrap();
            for k in 0..40u64 {
                tree.insert(k, k + 1000).unwrap();
            }
        }
        let tree = BTree::open(&path).unwrap();
        for k in 0..40u64 {
            assert_eq!(tree.lookup(k).unwrap(), Some(k + 1000));
        }
        assert_eq!(tree.lookup(40).unwrap(), None);
    }

    #[test]
    fn works_with_a_tiny_cache() {
        let dir = TempDir::new().unwrap();
        let mut options = TreeOptions::default();
        options.cache = BufferCacheConfig {
            cache_size: 8,
            lru_k: 2,
        };
        let tree = BTree::open_with_options(dir.path().join("tree.blk"), options).unwrap();
        for k in 0..200u64 {
            tree.insert(k, k * 2).unwrap();
        }
        for k in 0..200u64 {
            assert_eq!(tree.lookup(k).unwrap(), Some(k * 2));
        }
    }
}
