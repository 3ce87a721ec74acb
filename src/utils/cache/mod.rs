use crate::buffer::FrameId;

pub mod lru_k;

pub use lru_k::LruKReplacer;

/// Frame replacement policy used by the buffer cache to pick eviction
/// victims among unpinned frames.
pub trait Replacer {
    fn record_access(&mut self, frame_id: FrameId);

    fn evict(&mut self) -> Option<FrameId>;

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool);

    fn remove(&mut self, frame_id: FrameId);

    fn size(&self) -> usize;
}
