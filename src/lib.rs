//! blocktree: an embedded key/value storage engine.
//!
//! Keys map to values through a fixed-fanout B-tree whose nodes live in
//! fixed-size blocks. Blocks are owned by a buffer cache backed by an
//! asynchronous block scheduler, and concurrent traversals are arbitrated
//! by a per-block read/write/intent lock. Tree operations are resumable
//! state machines that suspend at unfinished block fetches, lock waits,
//! and outstanding write acknowledgements.

pub mod buffer;
pub mod config;
pub mod error;
pub mod lock;
pub mod storage;
pub mod tree;
pub mod utils;
