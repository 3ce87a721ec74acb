//! BufferCache mediates all access to block bytes: allocate/acquire/release
//! with asynchronous misses and dirty write-back through the scheduler.

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::buffer::frame_pool::{FrameId, FrameMeta, FramePool};
use crate::buffer::guard::{self, BlockReadGuard, BlockWriteGuard};
use crate::buffer::{BlockId, INVALID_BLOCK_ID};
use crate::config::BufferCacheConfig;
use crate::error::{BlockTreeError, BlockTreeResult};
use crate::storage::block_scheduler::{BlockResultReceiver, BlockScheduler};
use crate::utils::cache::{LruKReplacer, Replacer};

/// Handle for an acquire that missed: the read is in flight and the frame
/// is reserved. Resolve with [`BufferCache::complete_fetch`] or return the
/// frame with [`BufferCache::abort_fetch`].
#[derive(Debug)]
pub struct PendingFetch {
    pub block_id: BlockId,
    frame_id: FrameId,
    pub receiver: BlockResultReceiver<BytesMut>,
}

/// Acknowledgement handle for a dirty-block write scheduled at release.
/// The releasing operation is not complete until every ticket it holds
/// has been acknowledged.
#[derive(Debug)]
pub struct WriteTicket {
    pub block_id: BlockId,
    pub receiver: BlockResultReceiver<()>,
}

#[derive(Debug)]
pub enum Acquired {
    /// Block resident; frame pinned on return.
    Ready(FrameId),
    /// Block fetch scheduled; suspend and resolve via `complete_fetch`.
    Pending(PendingFetch),
}

#[derive(Debug)]
pub struct BufferCache {
    pool: Arc<FramePool>,
    replacer: RwLock<LruKReplacer>,
    scheduler: Arc<BlockScheduler>,
}

impl BufferCache {
    pub fn new(scheduler: Arc<BlockScheduler>) -> Self {
        Self::new_with_config(BufferCacheConfig::default(), scheduler)
    }

    pub fn new_with_config(config: BufferCacheConfig, scheduler: Arc<BlockScheduler>) -> Self {
        BufferCache {
            pool: Arc::new(FramePool::new(config.cache_size)),
            replacer: RwLock::new(LruKReplacer::new(config.lru_k)),
            scheduler,
        }
    }

    pub fn pool(&self) -> Arc<FramePool> {
        self.pool.clone()
    }

    pub fn scheduler(&self) -> Arc<BlockScheduler> {
        self.scheduler.clone()
    }

    /// Reserves a fresh block and a zeroed frame for it. The block is
    /// implicitly acquired: the caller owns it until the matching release.
    pub fn allocate(&self) -> BlockTreeResult<(BlockId, FrameId)> {
        let block_id = self
            .scheduler
            .schedule_allocate()?
            .recv()
            .map_err(|e| BlockTreeError::Internal(format!("Channel disconnected: {}", e)))??;
        let frame_id = self.claim_frame()?;
        self.pool.reset_frame(frame_id);
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.block_id = block_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        self.pool.insert_mapping(block_id, frame_id);
        {
            let mut rep = self.replacer.write();
            rep.record_access(frame_id);
            rep.set_evictable(frame_id, false);
        }
        Ok((block_id, frame_id))
    }

    /// Pins `block_id` if resident; otherwise reserves a frame, schedules
    /// the read, and hands back a [`PendingFetch`] for the caller to
    /// suspend on. Acquired frames are never reclaimed before release.
    pub fn acquire(&self, block_id: BlockId) -> BlockTreeResult<Acquired> {
        if block_id == INVALID_BLOCK_ID {
            return Err(BlockTreeError::Storage(
                "acquire: null block id".to_string(),
            ));
        }
        if let Some(frame_id) = self.pool.lookup_frame(block_id) {
            if self.pin_resident(frame_id, block_id) {
                return Ok(Acquired::Ready(frame_id));
            }
            // The mapping went stale between lookup and pin; fall
            // through and treat the acquire as a miss.
        }

        // Reserved frame is unmapped and unregistered with the replacer, so
        // eviction cannot touch it while the read is in flight.
        let frame_id = self.claim_frame()?;
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.block_id = block_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        let receiver = self.scheduler.schedule_read(block_id)?;
        Ok(Acquired::Pending(PendingFetch {
            block_id,
            frame_id,
            receiver,
        }))
    }

    /// Installs fetched bytes into the reserved frame. If the block became
    /// resident through a concurrent acquire in the meantime, the reserved
    /// frame is recycled and the winning frame is pinned instead.
    pub fn complete_fetch(&self, fetch: PendingFetch, data: BytesMut) -> BlockTreeResult<FrameId> {
        {
            let _lock = self.pool.frame_lock(fetch.frame_id).write();
            let slice = unsafe { self.pool.frame_slice_mut(fetch.frame_id) };
            let len = slice.len().min(data.len());
            slice[..len].copy_from_slice(&data[..len]);
            if len < slice.len() {
                slice[len..].fill(0);
            }
        }
        // The mapping install decides the race between two fetches of the
        // same block: exactly one insert succeeds, every loser adopts the
        // winner's frame and recycles its own.
        loop {
            match self.pool.try_insert_mapping(fetch.block_id, fetch.frame_id) {
                Ok(()) => {
                    let mut rep = self.replacer.write();
                    rep.record_access(fetch.frame_id);
                    rep.set_evictable(fetch.frame_id, false);
                    return Ok(fetch.frame_id);
                }
                Err(existing) => {
                    if self.pin_resident(existing, fetch.block_id) {
                        self.pool.clear_frame_meta(fetch.frame_id);
                        self.pool.push_free_frame(fetch.frame_id);
                        return Ok(existing);
                    }
                    // The winner was evicted before we could pin it;
                    // contend for the mapping again.
                }
            }
        }
    }

    /// Returns the reserved frame after a failed fetch.
    pub fn abort_fetch(&self, fetch: PendingFetch) {
        self.pool.clear_frame_meta(fetch.frame_id);
        self.pool.push_free_frame(fetch.frame_id);
    }

    /// Ends an acquisition. A dirty release snapshots the frame and
    /// schedules the write; the caller must drain the returned ticket
    /// before reporting completion. The frame pointer obtained through a
    /// guard must not be used after release.
    pub fn release(&self, block_id: BlockId, dirty: bool) -> BlockTreeResult<Option<WriteTicket>> {
        let frame_id = self.pool.lookup_frame(block_id).ok_or_else(|| {
            BlockTreeError::Internal(format!("release: block {} is not resident", block_id))
        })?;

        let ticket = if dirty {
            let bytes = {
                let _lock = self.pool.frame_lock(frame_id).read();
                Bytes::copy_from_slice(unsafe { self.pool.frame_slice(frame_id) })
            };
            self.pool.frame_meta(frame_id).is_dirty = true;
            let receiver = self.scheduler.schedule_write(block_id, bytes)?;
            Some(WriteTicket { block_id, receiver })
        } else {
            None
        };

        let mut meta = self.pool.frame_meta(frame_id);
        if meta.pin_count > 0 {
            meta.pin_count -= 1;
        }
        let unpinned = meta.pin_count == 0;
        drop(meta);
        if unpinned {
            self.replacer.write().set_evictable(frame_id, true);
        }
        Ok(ticket)
    }

    /// Drops a block the caller has acquired and no longer wants cached
    /// (merged-away nodes). The caller keeps responsibility for
    /// deallocating the block id in the store.
    pub fn discard(&self, block_id: BlockId) {
        if let Some(frame_id) = self.pool.lookup_frame(block_id) {
            self.pool.remove_mapping(block_id);
            self.replacer.write().remove(frame_id);
            self.pool.clear_frame_meta(frame_id);
            self.pool.reset_frame(frame_id);
            self.pool.push_free_frame(frame_id);
        }
    }

    pub fn read_guard(&self, frame_id: FrameId) -> BlockReadGuard {
        guard::new_read_guard(self.pool.clone(), frame_id)
    }

    pub fn write_guard(&self, frame_id: FrameId) -> BlockWriteGuard {
        guard::new_write_guard(self.pool.clone(), frame_id)
    }

    pub fn pin_count(&self, block_id: BlockId) -> Option<u32> {
        let frame_id = self.pool.lookup_frame(block_id)?;
        Some(self.pool.frame_meta(frame_id).pin_count)
    }

    /// Pins `frame_id` if it still carries `block_id`. The check and the
    /// increment happen under the meta lock, the same lock eviction holds
    /// while it reclaims a victim, so a successful pin can never land on
    /// a reclaimed frame.
    fn pin_resident(&self, frame_id: FrameId, block_id: BlockId) -> bool {
        {
            let mut meta = self.pool.frame_meta(frame_id);
            if meta.block_id != block_id {
                return false;
            }
            meta.pin_count += 1;
        }
        let mut rep = self.replacer.write();
        rep.record_access(frame_id);
        rep.set_evictable(frame_id, false);
        true
    }

    fn claim_frame(&self) -> BlockTreeResult<FrameId> {
        if let Some(frame_id) = self.pool.pop_free_frame() {
            return Ok(frame_id);
        }
        self.evict_victim()
    }

    fn evict_victim(&self) -> BlockTreeResult<FrameId> {
        loop {
            let victim = match self.replacer.write().evict() {
                Some(frame_id) => frame_id,
                None => {
                    return Err(BlockTreeError::ResourceExhausted(
                        "cannot claim frame: every frame is acquired".to_string(),
                    ))
                }
            };

            let (block_id, pin_count, is_dirty) = {
                let meta = self.pool.frame_meta(victim);
                (meta.block_id, meta.pin_count, meta.is_dirty)
            };

            if pin_count > 0 {
                let mut rep = self.replacer.write();
                rep.record_access(victim);
                rep.set_evictable(victim, false);
                continue;
            }

            if block_id != INVALID_BLOCK_ID && is_dirty {
                let bytes = {
                    let _lock = self.pool.frame_lock(victim).read();
                    Bytes::copy_from_slice(unsafe { self.pool.frame_slice(victim) })
                };
                self.scheduler
                    .schedule_write(block_id, bytes)?
                    .recv()
                    .map_err(|e| {
                        BlockTreeError::Internal(format!("Channel disconnected: {}", e))
                    })??;
            }

            // Commit under the meta lock. The block stays mapped while the
            // write-back above waits, so a concurrent acquire may have
            // pinned the frame; in that case it is no longer a victim.
            {
                let mut meta = self.pool.frame_meta(victim);
                if meta.pin_count > 0 || meta.block_id != block_id {
                    continue;
                }
                if block_id != INVALID_BLOCK_ID {
                    self.pool.remove_mapping(block_id);
                }
                *meta = FrameMeta::default();
            }
            self.pool.reset_frame(victim);
            return Ok(victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BLOCK_SIZE;
    use crate::config::BufferCacheConfig;
    use crate::storage::block_store::BlockStore;
    use tempfile::TempDir;

    fn setup_cache(cache_size: usize) -> (TempDir, Arc<BufferCache>) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(BlockStore::try_new(temp_dir.path().join("test.blk")).unwrap());
        let scheduler = Arc::new(BlockScheduler::new(store));
        let cache = Arc::new(BufferCache::new_with_config(
            BufferCacheConfig {
                cache_size,
                lru_k: 2,
            },
            scheduler,
        ));
        (temp_dir, cache)
    }

    fn fetch_to_ready(cache: &BufferCache, block_id: BlockId) -> FrameId {
        match cache.acquire(block_id).unwrap() {
            Acquired::Ready(frame_id) => frame_id,
            Acquired::Pending(fetch) => {
                let data = fetch.receiver.recv().unwrap().unwrap();
                cache.complete_fetch(fetch, data).unwrap()
            }
        }
    }

    #[test]
    fn allocate_pins_a_zeroed_frame() {
        let (_tmp, cache) = setup_cache(2);
        let (block_id, frame_id) = cache.allocate().unwrap();
        assert_ne!(block_id, INVALID_BLOCK_ID);
        assert_eq!(cache.pin_count(block_id), Some(1));
        assert!(cache.read_guard(frame_id).data().iter().all(|b| *b == 0));
        cache.release(block_id, false).unwrap();
        assert_eq!(cache.pin_count(block_id), Some(0));
    }

    #[test]
    fn dirty_release_persists_and_miss_refetches() {
        let (_tmp, cache) = setup_cache(2);
        let (block_id, frame_id) = cache.allocate().unwrap();
        cache.write_guard(frame_id).data_mut()[0] = 0x5A;
        let ticket = cache.release(block_id, true).unwrap().expect("ticket");
        ticket.receiver.recv().unwrap().unwrap();

        // Force the block out with two fresh allocations, then re-acquire:
        // the read must go through the scheduler and see the written byte.
        let (b1, _) = cache.allocate().unwrap();
        let (b2, _) = cache.allocate().unwrap();
        cache.release(b1, false).unwrap();
        cache.release(b2, false).unwrap();
        let frame_id = fetch_to_ready(&cache, block_id);
        assert_eq!(cache.read_guard(frame_id).data()[0], 0x5A);
        cache.release(block_id, false).unwrap();
    }

    #[test]
    fn acquire_hit_pins_without_io() {
        let (_tmp, cache) = setup_cache(2);
        let (block_id, _) = cache.allocate().unwrap();
        match cache.acquire(block_id).unwrap() {
            Acquired::Ready(_) => {}
            Acquired::Pending(_) => panic!("resident block must not schedule a read"),
        }
        assert_eq!(cache.pin_count(block_id), Some(2));
        cache.release(block_id, false).unwrap();
        cache.release(block_id, false).unwrap();
    }

    #[test]
    fn acquired_blocks_are_not_evicted() {
        let (_tmp, cache) = setup_cache(1);
        let (block_id, _) = cache.allocate().unwrap();
        // Pool is size 1 and the only frame is pinned.
        let err = cache.allocate().unwrap_err();
        assert!(matches!(err, BlockTreeError::ResourceExhausted(_)));
        cache.release(block_id, false).unwrap();
        // Now the frame is reclaimable.
        let (b2, _) = cache.allocate().unwrap();
        cache.release(b2, false).unwrap();
    }

    #[test]
    fn lost_fetch_race_recycles_reserved_frame() {
        let (_tmp, cache) = setup_cache(3);
        let (block_id, frame_id) = cache.allocate().unwrap();
        cache.write_guard(frame_id).data_mut()[7] = 9;
        let ticket = cache.release(block_id, true).unwrap().unwrap();
        ticket.receiver.recv().unwrap().unwrap();
        // Three fresh allocations push the block out of the pool.
        let (b1, _) = cache.allocate().unwrap();
        let (b2, _) = cache.allocate().unwrap();
        let (b3, _) = cache.allocate().unwrap();
        for b in [b1, b2, b3] {
            cache.release(b, false).unwrap();
        }

        // Two concurrent misses for the same block: resolve the second
        // first, then the first must adopt the winner's frame.
        let fetch_a = match cache.acquire(block_id).unwrap() {
            Acquired::Pending(f) => f,
            Acquired::Ready(_) => panic!("expected a miss"),
        };
        let fetch_b = match cache.acquire(block_id).unwrap() {
            Acquired::Pending(f) => f,
            Acquired::Ready(_) => panic!("expected a miss"),
        };
        let data_b = fetch_b.receiver.recv().unwrap().unwrap();
        let winner = cache.complete_fetch(fetch_b, data_b).unwrap();
        let data_a = fetch_a.receiver.recv().unwrap().unwrap();
        let adopted = cache.complete_fetch(fetch_a, data_a).unwrap();
        assert_eq!(winner, adopted);
        assert_eq!(cache.pin_count(block_id), Some(2));
        assert_eq!(cache.read_guard(winner).data()[7], 9);
        cache.release(block_id, false).unwrap();
        cache.release(block_id, false).unwrap();
    }

    #[test]
    fn eviction_churn_never_surfaces_foreign_bytes() {
        // Twice as many blocks as frames, each stamped with its own byte.
        // Readers hammer the cache from several threads so evictions keep
        // racing against acquires; a hit that lands on a reclaimed frame
        // would show another block's stamp.
        let (_tmp, cache) = setup_cache(8);
        let mut blocks = Vec::new();
        for i in 0..16u8 {
            let (block_id, frame_id) = cache.allocate().unwrap();
            cache.write_guard(frame_id).data_mut()[0] = 0xA0 + i;
            let ticket = cache.release(block_id, true).unwrap().unwrap();
            ticket.receiver.recv().unwrap().unwrap();
            blocks.push((block_id, 0xA0 + i));
        }

        let blocks = Arc::new(blocks);
        let mut handles = Vec::new();
        for offset in 0..4usize {
            let cache = cache.clone();
            let blocks = blocks.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..300usize {
                    let (block_id, stamp) = blocks[(offset * 5 + round) % blocks.len()];
                    let frame_id = match cache.acquire(block_id).unwrap() {
                        Acquired::Ready(frame_id) => frame_id,
                        Acquired::Pending(fetch) => {
                            let data = fetch.receiver.recv().unwrap().unwrap();
                            cache.complete_fetch(fetch, data).unwrap()
                        }
                    };
                    assert_eq!(cache.read_guard(frame_id).data()[0], stamp);
                    cache.release(block_id, false).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn discard_frees_the_frame() {
        let (_tmp, cache) = setup_cache(1);
        let (block_id, _) = cache.allocate().unwrap();
        cache.discard(block_id);
        assert_eq!(cache.pin_count(block_id), None);
        // Frame is immediately reusable.
        let (b2, frame) = cache.allocate().unwrap();
        assert_eq!(cache.read_guard(frame).data().len(), BLOCK_SIZE);
        cache.release(b2, false).unwrap();
    }
}
