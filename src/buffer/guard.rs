use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::mem::{self, ManuallyDrop};
use std::sync::Arc;

use crate::buffer::{FrameId, FramePool};

/// Shared view over a pinned frame's bytes. Dropping only releases the
/// frame latch; the pin itself lives from `acquire` to `release` on the
/// buffer cache.
#[derive(Debug)]
pub struct BlockReadGuard {
    pool: Arc<FramePool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockReadGuard<'static, ()>>,
}

impl BlockReadGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Drop for BlockReadGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
    }
}

/// Exclusive view over a pinned frame's bytes.
#[derive(Debug)]
pub struct BlockWriteGuard {
    pool: Arc<FramePool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockWriteGuard<'static, ()>>,
}

impl BlockWriteGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { self.pool.frame_slice_mut(self.frame_id) }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Drop for BlockWriteGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
    }
}

pub(crate) fn new_read_guard(pool: Arc<FramePool>, frame_id: FrameId) -> BlockReadGuard {
    let lock = pool.frame_lock(frame_id).read();
    let static_guard =
        unsafe { mem::transmute::<RwLockReadGuard<'_, ()>, RwLockReadGuard<'static, ()>>(lock) };
    BlockReadGuard {
        pool,
        frame_id,
        guard: ManuallyDrop::new(static_guard),
    }
}

pub(crate) fn new_write_guard(pool: Arc<FramePool>, frame_id: FrameId) -> BlockWriteGuard {
    let lock = pool.frame_lock(frame_id).write();
    let static_guard =
        unsafe { mem::transmute::<RwLockWriteGuard<'_, ()>, RwLockWriteGuard<'static, ()>>(lock) };
    BlockWriteGuard {
        pool,
        frame_id,
        guard: ManuallyDrop::new(static_guard),
    }
}
