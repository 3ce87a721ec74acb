use bytes::{Bytes, BytesMut};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread;

use crate::buffer::BlockId;
use crate::config::IoSchedulerConfig;
use crate::error::{BlockTreeError, BlockTreeResult};
use crate::storage::block_store::BlockStore;

pub type BlockResultSender<T> = Sender<BlockTreeResult<T>>;
pub type BlockResultReceiver<T> = Receiver<BlockTreeResult<T>>;

/// Requests handed to the scheduler; each carries the sender half of the
/// completion channel its caller is waiting on.
#[derive(Debug)]
pub enum BlockRequest {
    Read {
        block_id: BlockId,
        result_sender: BlockResultSender<BytesMut>,
    },
    Write {
        block_id: BlockId,
        data: Bytes,
        result_sender: BlockResultSender<()>,
    },
    Allocate {
        result_sender: BlockResultSender<BlockId>,
    },
    Deallocate {
        block_id: BlockId,
        result_sender: BlockResultSender<()>,
    },
    Shutdown,
}

enum WorkerMessage {
    Request(BlockRequest),
    Shutdown,
}

/// Asynchronous transport between the buffer cache and the block store:
/// a dispatcher thread fans requests out to a pool of I/O workers, and
/// completions are delivered out-of-order on per-request channels.
#[derive(Debug)]
pub struct BlockScheduler {
    request_sender: Sender<BlockRequest>,
    dispatcher_thread: Option<thread::JoinHandle<()>>,
    worker_threads: Vec<thread::JoinHandle<()>>,
    pub config: IoSchedulerConfig,
}

impl BlockScheduler {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self::new_with_config(store, IoSchedulerConfig::default())
    }

    pub fn new_with_config(store: Arc<BlockStore>, config: IoSchedulerConfig) -> Self {
        let (request_sender, request_receiver) = mpsc::channel::<BlockRequest>();

        let mut worker_senders = Vec::with_capacity(config.workers);
        let mut worker_threads = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let (tx, rx) = mpsc::sync_channel::<WorkerMessage>(config.queue_depth);
            worker_senders.push(tx);
            let store = store.clone();
            let handle = thread::Builder::new()
                .name(format!("block-io-worker-{}", i))
                .spawn(move || worker_loop(rx, store))
                .expect("Failed to spawn block scheduler worker thread");
            worker_threads.push(handle);
        }

        let dispatcher_thread = thread::Builder::new()
            .name("block-io-dispatcher".to_string())
            .spawn(move || dispatcher_loop(request_receiver, worker_senders))
            .expect("Failed to spawn block scheduler dispatcher thread");

        BlockScheduler {
            request_sender,
            dispatcher_thread: Some(dispatcher_thread),
            worker_threads,
            config,
        }
    }

    pub fn schedule_read(&self, block_id: BlockId) -> BlockTreeResult<BlockResultReceiver<BytesMut>> {
        let (tx, rx) = mpsc::channel();
        self.request_sender
            .send(BlockRequest::Read {
                block_id,
                result_sender: tx,
            })
            .map_err(|e| BlockTreeError::Internal(format!("Failed to send Read request: {}", e)))?;
        Ok(rx)
    }

    pub fn schedule_write(
        &self,
        block_id: BlockId,
        data: Bytes,
    ) -> BlockTreeResult<BlockResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.request_sender
            .send(BlockRequest::Write {
                block_id,
                data,
                result_sender: tx,
            })
            .map_err(|e| BlockTreeError::Internal(format!("Failed to send Write request: {}", e)))?;
        Ok(rx)
    }

    pub fn schedule_allocate(&self) -> BlockTreeResult<BlockResultReceiver<BlockId>> {
        let (tx, rx) = mpsc::channel();
        self.request_sender
            .send(BlockRequest::Allocate { result_sender: tx })
            .map_err(|e| {
                BlockTreeError::Internal(format!("Failed to send Allocate request: {}", e))
            })?;
        Ok(rx)
    }

    pub fn schedule_deallocate(&self, block_id: BlockId) -> BlockTreeResult<BlockResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.request_sender
            .send(BlockRequest::Deallocate {
                block_id,
                result_sender: tx,
            })
            .map_err(|e| {
                BlockTreeError::Internal(format!("Failed to send Deallocate request: {}", e))
            })?;
        Ok(rx)
    }
}

impl Drop for BlockScheduler {
    fn drop(&mut self) {
        // Ignore send errors: the channel may already be closed.
        let _ = self.request_sender.send(BlockRequest::Shutdown);

        if let Some(handle) = self.dispatcher_thread.take() {
            if let Err(e) = handle.join() {
                log::error!("block scheduler dispatcher thread panicked: {:?}", e);
            }
        }
        for handle in self.worker_threads.drain(..) {
            if let Err(e) = handle.join() {
                log::error!("block scheduler worker thread panicked: {:?}", e);
            }
        }
    }
}

fn dispatcher_loop(receiver: Receiver<BlockRequest>, worker_senders: Vec<SyncSender<WorkerMessage>>) {
    log::debug!("block scheduler dispatcher started");
    let mut rr_idx: usize = 0;
    while let Ok(request) = receiver.recv() {
        match request {
            BlockRequest::Shutdown => {
                for tx in &worker_senders {
                    let _ = tx.send(WorkerMessage::Shutdown);
                }
                break;
            }
            other => {
                let n = worker_senders.len();
                // Requests naming a block always land on the same worker,
                // so writes to one block apply in schedule order. Only
                // allocations rotate freely.
                let idx = match route_key(&other) {
                    Some(block_id) => block_id as usize % n,
                    None => {
                        rr_idx = rr_idx.wrapping_add(1);
                        rr_idx % n
                    }
                };
                if worker_senders[idx]
                    .send(WorkerMessage::Request(other))
                    .is_err()
                {
                    log::error!("block scheduler worker {} is gone; dropping request", idx);
                    break;
                }
            }
        }
    }
    log::debug!("block scheduler dispatcher finished");
}

fn route_key(request: &BlockRequest) -> Option<BlockId> {
    match request {
        BlockRequest::Read { block_id, .. }
        | BlockRequest::Write { block_id, .. }
        | BlockRequest::Deallocate { block_id, .. } => Some(*block_id),
        BlockRequest::Allocate { .. } | BlockRequest::Shutdown => None,
    }
}

fn worker_loop(receiver: Receiver<WorkerMessage>, store: Arc<BlockStore>) {
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Shutdown => break,
            WorkerMessage::Request(request) => execute_request(&store, request),
        }
    }
}

fn execute_request(store: &BlockStore, request: BlockRequest) {
    match request {
        BlockRequest::Read {
            block_id,
            result_sender,
        } => {
            let result = store
                .read_block(block_id)
                .map(|data| BytesMut::from(&data[..]));
            let _ = result_sender.send(result);
        }
        BlockRequest::Write {
            block_id,
            data,
            result_sender,
        } => {
            let _ = result_sender.send(store.write_block(block_id, &data));
        }
        BlockRequest::Allocate { result_sender } => {
            let _ = result_sender.send(store.allocate_block());
        }
        BlockRequest::Deallocate {
            block_id,
            result_sender,
        } => {
            let _ = result_sender.send(store.deallocate_block(block_id));
        }
        BlockRequest::Shutdown => {}
    }
}
