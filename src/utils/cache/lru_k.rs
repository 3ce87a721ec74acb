use std::collections::{HashMap, HashSet, VecDeque};

use crate::buffer::FrameId;
use crate::utils::cache::Replacer;

/// LRU-K replacer: evicts the evictable frame with the largest backward
/// K-distance; frames with fewer than K recorded accesses count as
/// infinitely distant and are preferred, oldest first access winning.
///
/// A logical access counter stands in for wall-clock timestamps.
#[derive(Debug)]
pub struct LruKReplacer {
    k: usize,
    clock: u64,
    access_history: HashMap<FrameId, VecDeque<u64>>,
    evictable_frames: HashSet<FrameId>,
}

impl LruKReplacer {
    pub fn new(k: usize) -> Self {
        assert!(k > 0, "k must be greater than 0");
        LruKReplacer {
            k,
            clock: 0,
            access_history: HashMap::new(),
            evictable_frames: HashSet::new(),
        }
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&mut self, frame_id: FrameId) {
        self.clock += 1;
        let history = self.access_history.entry(frame_id).or_default();
        history.push_back(self.clock);
        if history.len() > self.k {
            history.pop_front();
        }
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if evictable {
            if self.access_history.contains_key(&frame_id) {
                self.evictable_frames.insert(frame_id);
            }
        } else {
            self.evictable_frames.remove(&frame_id);
        }
    }

    fn remove(&mut self, frame_id: FrameId) {
        self.evictable_frames.remove(&frame_id);
        self.access_history.remove(&frame_id);
    }

    fn evict(&mut self) -> Option<FrameId> {
        let mut victim: Option<FrameId> = None;
        let mut victim_kth: u64 = u64::MAX;
        let mut cold_victim: Option<FrameId> = None;
        let mut cold_first: u64 = u64::MAX;

        for &frame_id in &self.evictable_frames {
            let history = match self.access_history.get(&frame_id) {
                Some(h) => h,
                None => continue,
            };
            if history.len() < self.k {
                // Infinite K-distance; tie-break on oldest first access.
                if let Some(&first) = history.front() {
                    if first < cold_first {
                        cold_first = first;
                        cold_victim = Some(frame_id);
                    }
                }
            } else if let Some(&kth) = history.front() {
                if kth < victim_kth {
                    victim_kth = kth;
                    victim = Some(frame_id);
                }
            }
        }

        let chosen = cold_victim.or(victim);
        if let Some(frame_id) = chosen {
            self.remove(frame_id);
        }
        chosen
    }

    fn size(&self) -> usize {
        self.evictable_frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_cold_frame_first() {
        let mut replacer = LruKReplacer::new(2);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(3);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);
        replacer.set_evictable(3, true);
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.size(), 2);

        // 2 and 3 gain a second access; 4 stays cold and wins next.
        replacer.record_access(2);
        replacer.record_access(3);
        replacer.record_access(4);
        replacer.set_evictable(4, true);
        assert_eq!(replacer.evict(), Some(4));

        // Among fully-warmed frames the oldest Kth access loses.
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn pinned_frames_are_not_victims() {
        let mut replacer = LruKReplacer::new(2);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);

        replacer.set_evictable(1, false);
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(1, true);
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn remove_clears_all_state() {
        let mut replacer = LruKReplacer::new(1);
        replacer.record_access(1);
        replacer.set_evictable(1, true);
        replacer.remove(1);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }
}
