//! Fixed arena of block frames plus the block table and free list.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::cell::UnsafeCell;
use std::collections::VecDeque;

use crate::buffer::{BlockId, BLOCK_SIZE};

pub type FrameId = usize;

#[derive(Debug, Default, Clone)]
pub struct FrameMeta {
    pub block_id: BlockId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

#[derive(Debug)]
pub struct FramePool {
    arena: Box<[UnsafeCell<u8>]>,
    locks: Vec<RwLock<()>>,
    meta: Vec<Mutex<FrameMeta>>,
    block_table: DashMap<BlockId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
}

unsafe impl Sync for FramePool {}

impl FramePool {
    pub fn new(num_frames: usize) -> Self {
        let mut free_list = VecDeque::with_capacity(num_frames);
        let mut meta = Vec::with_capacity(num_frames);
        let mut locks = Vec::with_capacity(num_frames);
        for frame_id in 0..num_frames {
            free_list.push_back(frame_id);
            meta.push(Mutex::new(FrameMeta::default()));
            locks.push(RwLock::new(()));
        }
        let mut arena_vec: Vec<UnsafeCell<u8>> = Vec::with_capacity(num_frames * BLOCK_SIZE);
        arena_vec.resize_with(num_frames * BLOCK_SIZE, || UnsafeCell::new(0u8));

        FramePool {
            arena: arena_vec.into_boxed_slice(),
            locks,
            meta,
            block_table: DashMap::new(),
            free_list: Mutex::new(free_list),
        }
    }

    pub fn capacity(&self) -> usize {
        self.locks.len()
    }

    pub fn frame_lock(&self, frame_id: FrameId) -> &RwLock<()> {
        &self.locks[frame_id]
    }

    /// Returns an immutable view over the block bytes stored in `frame_id`.
    ///
    /// # Safety
    /// Caller must hold the frame lock for read or write and keep the frame
    /// pinned for the lifetime of the slice; otherwise a concurrent writer
    /// or eviction makes this undefined behavior.
    pub unsafe fn frame_slice(&self, frame_id: FrameId) -> &[u8] {
        let ptr = self.frame_ptr(frame_id) as *const u8;
        std::slice::from_raw_parts(ptr, BLOCK_SIZE)
    }

    /// Returns a mutable view over the block bytes stored in `frame_id`.
    ///
    /// # Safety
    /// Caller must hold the frame's write lock and ensure no other reference
    /// to the slice exists. The guard layer enforces this by taking the
    /// frame `RwLock` write guard first.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_slice_mut(&self, frame_id: FrameId) -> &mut [u8] {
        let ptr = self.frame_ptr(frame_id);
        std::slice::from_raw_parts_mut(ptr, BLOCK_SIZE)
    }

    /// # Safety
    /// Same contract as `frame_slice`/`frame_slice_mut`.
    unsafe fn frame_ptr(&self, frame_id: FrameId) -> *mut u8 {
        self.arena.as_ptr().add(frame_id * BLOCK_SIZE) as *mut u8
    }

    pub fn frame_meta(&self, frame_id: FrameId) -> MutexGuard<'_, FrameMeta> {
        self.meta[frame_id].lock()
    }

    pub fn clear_frame_meta(&self, frame_id: FrameId) {
        *self.meta[frame_id].lock() = FrameMeta::default();
    }

    pub fn pop_free_frame(&self) -> Option<FrameId> {
        self.free_list.lock().pop_front()
    }

    pub fn has_free_frame(&self) -> bool {
        !self.free_list.lock().is_empty()
    }

    pub fn push_free_frame(&self, frame_id: FrameId) {
        self.free_list.lock().push_back(frame_id);
    }

    pub fn insert_mapping(&self, block_id: BlockId, frame_id: FrameId) {
        self.block_table.insert(block_id, frame_id);
    }

    /// Maps `block_id` to `frame_id` unless a mapping already exists, in
    /// which case the established frame is returned. First writer wins;
    /// the entry guard makes check and install one step.
    pub fn try_insert_mapping(&self, block_id: BlockId, frame_id: FrameId) -> Result<(), FrameId> {
        match self.block_table.entry(block_id) {
            Entry::Occupied(entry) => Err(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(frame_id);
                Ok(())
            }
        }
    }

    pub fn remove_mapping(&self, block_id: BlockId) {
        self.block_table.remove(&block_id);
    }

    pub fn lookup_frame(&self, block_id: BlockId) -> Option<FrameId> {
        self.block_table.get(&block_id).map(|entry| *entry.value())
    }

    pub fn reset_frame(&self, frame_id: FrameId) {
        unsafe {
            self.frame_slice_mut(frame_id).fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_list_hands_out_every_frame_once() {
        let pool = FramePool::new(3);
        assert_eq!(pool.capacity(), 3);
        let mut seen = vec![];
        while let Some(frame_id) = pool.pop_free_frame() {
            seen.push(frame_id);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(!pool.has_free_frame());

        pool.push_free_frame(1);
        assert_eq!(pool.pop_free_frame(), Some(1));
    }

    #[test]
    fn block_table_insert_lookup_remove() {
        let pool = FramePool::new(2);
        pool.insert_mapping(7, 0);
        assert_eq!(pool.lookup_frame(7), Some(0));
        pool.remove_mapping(7);
        assert_eq!(pool.lookup_frame(7), None);
    }

    #[test]
    fn mapping_install_is_first_come_first_served() {
        let pool = FramePool::new(2);
        assert_eq!(pool.try_insert_mapping(9, 0), Ok(()));
        // A second installer for the same block must see the winner.
        assert_eq!(pool.try_insert_mapping(9, 1), Err(0));
        assert_eq!(pool.lookup_frame(9), Some(0));

        pool.remove_mapping(9);
        assert_eq!(pool.try_insert_mapping(9, 1), Ok(()));
        assert_eq!(pool.lookup_frame(9), Some(1));
    }

    #[test]
    fn reset_frame_zeroes_bytes_and_meta_clears() {
        let pool = FramePool::new(1);
        {
            let mut meta = pool.frame_meta(0);
            meta.block_id = 9;
            meta.pin_count = 2;
            meta.is_dirty = true;
        }
        unsafe { pool.frame_slice_mut(0).fill(0xAB) };

        pool.reset_frame(0);
        pool.clear_frame_meta(0);

        assert!(unsafe { pool.frame_slice(0) }.iter().all(|b| *b == 0));
        let meta = pool.frame_meta(0);
        assert_eq!(meta.block_id, 0);
        assert_eq!(meta.pin_count, 0);
        assert!(!meta.is_dirty);
    }
}
