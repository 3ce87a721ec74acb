mod cache;
mod frame_pool;
mod guard;

pub use cache::{Acquired, BufferCache, PendingFetch, WriteTicket};
pub use frame_pool::{FrameId, FrameMeta, FramePool};
pub use guard::{BlockReadGuard, BlockWriteGuard};

pub type BlockId = u32;

pub const INVALID_BLOCK_ID: BlockId = 0;
pub const BLOCK_SIZE: usize = 4096;

pub fn is_block_id_null(block_id: BlockId) -> bool {
    block_id == INVALID_BLOCK_ID
}
