#[derive(Debug, Clone, Copy)]
pub struct IoSchedulerConfig {
    /// Number of I/O worker threads.
    pub workers: usize,
    /// Per-worker request backlog before the dispatcher blocks.
    pub queue_depth: usize,
}

impl IoSchedulerConfig {
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for IoSchedulerConfig {
    fn default() -> Self {
        IoSchedulerConfig {
            workers: Self::default_workers(),
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferCacheConfig {
    /// Number of block frames the cache holds resident.
    pub cache_size: usize,
    /// K parameter of the LRU-K replacer.
    pub lru_k: usize,
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        BufferCacheConfig {
            cache_size: 1024,
            lru_k: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Rebalance underfull leaves (level/merge with a sibling) on remove.
    pub rebalance_on_remove: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            rebalance_on_remove: true,
        }
    }
}

/// Bundle handed to [`crate::tree::BTree::open_with_options`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeOptions {
    pub io: IoSchedulerConfig,
    pub cache: BufferCacheConfig,
    pub tree: TreeConfig,
}
