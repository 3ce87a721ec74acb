pub mod block_scheduler;
pub mod block_store;

pub use block_scheduler::{BlockResultReceiver, BlockResultSender, BlockScheduler};
pub use block_store::BlockStore;
