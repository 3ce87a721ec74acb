//! Resumable tree operations.
//!
//! An operation is a value: `resume(event)` drives it forward until it
//! either completes or suspends on an unfinished block fetch, a parked
//! lock request, or an unacknowledged write. While suspended it holds no
//! thread; `wait_event` blocks on whichever channel the suspension is
//! parked on and yields the event to feed back into `resume`.
//!
//! Within one operation blocks are locked strictly root-to-leaf and a
//! child is always locked and acquired before its parent is released, so
//! an operation cannot deadlock against itself. Across operations the
//! per-block lock table is the only safety mechanism.

use bytes::BytesMut;
use std::mem;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use crate::buffer::{
    is_block_id_null, Acquired, BlockId, BufferCache, FrameId, PendingFetch, WriteTicket,
    INVALID_BLOCK_ID,
};
use crate::error::{BlockTreeError, BlockTreeResult};
use crate::lock::{
    IntentGuard, LockMode, LockTable, ReadLockGuard, RwiLock, UpgradeOutcome, WriteLockGuard,
};
use crate::tree::codec::{NodeCodec, SuperblockCodec};
use crate::tree::node::{InternalNode, LeafInsert, LeafNode, Node};

/// Completion event fed into [`resume`](LookupOp::resume). Produced by
/// `wait_event` on the op itself, or by whatever reactor the embedding
/// uses to multiplex many suspended operations.
#[derive(Debug)]
pub enum TreeEvent {
    BlockLoaded { block_id: BlockId, data: BytesMut },
    LockGranted { block_id: BlockId },
    WriteAcked { block_id: BlockId },
    IoFailed { block_id: BlockId, error: BlockTreeError },
}

#[derive(Debug, PartialEq, Eq)]
pub enum TreeOutcome {
    Found { value: u64 },
    NotFound,
    Inserted,
    Removed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum OpStatus {
    /// Suspended; feed the next event into `resume`.
    Pending,
    Complete(TreeOutcome),
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

enum HeldLock {
    Read(ReadLockGuard),
    Intent(IntentGuard),
    Write(WriteLockGuard),
    /// The Intent hold is owned by a parked upgrade; on grant it becomes
    /// Write without a release in between.
    Upgrading,
}

enum BlockContent {
    Superblock { root: BlockId },
    Node(Node),
}

/// One locked, acquired, decoded block. Releasing re-encodes the content
/// into the frame when dirty, then unlocks.
struct HeldBlock {
    block_id: BlockId,
    frame_id: FrameId,
    lock: Arc<RwiLock>,
    guard: HeldLock,
    content: BlockContent,
    dirty: bool,
}

impl HeldBlock {
    fn root(&self) -> BlockId {
        match &self.content {
            BlockContent::Superblock { root } => *root,
            BlockContent::Node(_) => unreachable!("superblock accessor on a node"),
        }
    }

    fn set_root(&mut self, root: BlockId) {
        match &mut self.content {
            BlockContent::Superblock { root: slot } => {
                *slot = root;
                self.dirty = true;
            }
            BlockContent::Node(_) => unreachable!("superblock accessor on a node"),
        }
    }

    fn node(&self) -> &Node {
        match &self.content {
            BlockContent::Node(node) => node,
            BlockContent::Superblock { .. } => unreachable!("node accessor on the superblock"),
        }
    }

    fn node_mut(&mut self) -> &mut Node {
        self.dirty = true;
        match &mut self.content {
            BlockContent::Node(node) => node,
            BlockContent::Superblock { .. } => unreachable!("node accessor on the superblock"),
        }
    }

    fn is_write_held(&self) -> bool {
        matches!(self.guard, HeldLock::Write(_))
    }
}

#[derive(Clone, Copy)]
enum BlockKind {
    Superblock,
    Node,
}

enum AccessPhase {
    /// Lock request parked; waiting for `LockGranted`.
    Locking,
    /// Lock held, fetch in flight; waiting for `BlockLoaded`.
    Fetching(PendingFetch),
}

/// In-flight lock-then-fetch of one block.
struct BlockAccess {
    block_id: BlockId,
    mode: LockMode,
    kind: BlockKind,
    lock: Arc<RwiLock>,
    phase: AccessPhase,
}

enum AccessResult {
    Ready(HeldBlock),
    Wait(BlockAccess),
}

struct OpCore {
    cache: Arc<BufferCache>,
    locks: Arc<LockTable>,
    superblock_id: BlockId,
    key: u64,
    event_tx: Sender<TreeEvent>,
    event_rx: Receiver<TreeEvent>,
    /// Acks still owed for writes and deallocations scheduled by this op.
    tickets: Vec<WriteTicket>,
}

impl OpCore {
    fn new(cache: Arc<BufferCache>, locks: Arc<LockTable>, superblock_id: BlockId, key: u64) -> Self {
        let (event_tx, event_rx) = mpsc::channel();
        OpCore {
            cache,
            locks,
            superblock_id,
            key,
            event_tx,
            event_rx,
            tickets: Vec::new(),
        }
    }

    fn grant_waiter(&self, block_id: BlockId) -> Box<dyn FnOnce() + Send> {
        let tx = self.event_tx.clone();
        Box::new(move || {
            // The op may already have failed and dropped its receiver.
            let _ = tx.send(TreeEvent::LockGranted { block_id });
        })
    }

    /// Starts the lock-then-fetch of one block.
    fn begin_access(
        &self,
        block_id: BlockId,
        mode: LockMode,
        kind: BlockKind,
    ) -> BlockTreeResult<AccessResult> {
        let lock = self.locks.lock_for(block_id);
        let access = BlockAccess {
            block_id,
            mode,
            kind,
            lock: lock.clone(),
            phase: AccessPhase::Locking,
        };
        if lock.lock(mode, Some(self.grant_waiter(block_id))) {
            self.access_locked(access)
        } else {
            Ok(AccessResult::Wait(access))
        }
    }

    /// Lock is held; pin the frame or park on the fetch.
    fn access_locked(&self, mut access: BlockAccess) -> BlockTreeResult<AccessResult> {
        match self.cache.acquire(access.block_id) {
            Ok(Acquired::Ready(frame_id)) => Ok(AccessResult::Ready(self.hold(access, frame_id)?)),
            Ok(Acquired::Pending(fetch)) => {
                access.phase = AccessPhase::Fetching(fetch);
                Ok(AccessResult::Wait(access))
            }
            Err(err) => {
                access.lock.unlock(access.mode);
                self.locks.prune(access.block_id);
                Err(err)
            }
        }
    }

    /// Applies a completion event to an in-flight access.
    fn access_event(&self, access: BlockAccess, event: TreeEvent) -> BlockTreeResult<AccessResult> {
        let BlockAccess {
            block_id,
            mode,
            kind,
            lock,
            phase,
        } = access;
        match phase {
            AccessPhase::Locking => match event {
                TreeEvent::LockGranted { block_id: granted } if granted == block_id => self
                    .access_locked(BlockAccess {
                        block_id,
                        mode,
                        kind,
                        lock,
                        phase: AccessPhase::Locking,
                    }),
                other => Err(BlockTreeError::Internal(format!(
                    "unexpected resume event {:?} while locking block {}",
                    other, block_id
                ))),
            },
            AccessPhase::Fetching(fetch) => match event {
                TreeEvent::BlockLoaded {
                    block_id: loaded,
                    data,
                } if loaded == block_id => {
                    let frame_id = match self.cache.complete_fetch(fetch, data) {
                        Ok(frame_id) => frame_id,
                        Err(err) => {
                            lock.unlock(mode);
                            self.locks.prune(block_id);
                            return Err(err);
                        }
                    };
                    Ok(AccessResult::Ready(self.hold(
                        BlockAccess {
                            block_id,
                            mode,
                            kind,
                            lock,
                            phase: AccessPhase::Locking,
                        },
                        frame_id,
                    )?))
                }
                TreeEvent::IoFailed { error, .. } => {
                    // Fail closed: return the reserved frame, drop the lock.
                    self.cache.abort_fetch(fetch);
                    lock.unlock(mode);
                    self.locks.prune(block_id);
                    Err(error)
                }
                other => {
                    self.cache.abort_fetch(fetch);
                    lock.unlock(mode);
                    self.locks.prune(block_id);
                    Err(BlockTreeError::Internal(format!(
                        "unexpected resume event {:?} while fetching block {}",
                        other, block_id
                    )))
                }
            },
        }
    }

    /// Decodes the pinned frame into a held block. The frame is released
    /// and the lock dropped if the bytes do not decode.
    fn hold(&self, access: BlockAccess, frame_id: FrameId) -> BlockTreeResult<HeldBlock> {
        let decoded = {
            let guard = self.cache.read_guard(frame_id);
            match access.kind {
                BlockKind::Superblock => {
                    SuperblockCodec::decode(guard.data()).map(|root| BlockContent::Superblock { root })
                }
                BlockKind::Node => NodeCodec::decode(guard.data()).map(BlockContent::Node),
            }
        };
        match decoded {
            Ok(content) => Ok(HeldBlock {
                block_id: access.block_id,
                frame_id,
                guard: adopt_guard(access.mode, &access.lock),
                lock: access.lock,
                content,
                dirty: false,
            }),
            Err(err) => {
                if let Err(release_err) = self.cache.release(access.block_id, false) {
                    log::warn!("release after decode failure: {}", release_err);
                }
                access.lock.unlock(access.mode);
                self.locks.prune(access.block_id);
                Err(err)
            }
        }
    }

    /// Ends an acquisition. A dirty block is re-encoded into its frame and
    /// its write scheduled; the ack is owed before the op completes.
    fn release(&mut self, held: HeldBlock) -> BlockTreeResult<()> {
        if held.dirty {
            {
                let mut guard = self.cache.write_guard(held.frame_id);
                match &held.content {
                    BlockContent::Node(node) => NodeCodec::encode(node, guard.data_mut()),
                    BlockContent::Superblock { root } => {
                        SuperblockCodec::encode(*root, guard.data_mut())
                    }
                }
            }
            if let Some(ticket) = self.cache.release(held.block_id, true)? {
                self.tickets.push(ticket);
            }
        } else {
            self.cache.release(held.block_id, false)?;
        }
        drop_guard(held.guard, &held.lock);
        self.locks.prune(held.block_id);
        Ok(())
    }

    /// Best-effort clean release for failure paths: no write-back, errors
    /// logged rather than propagated.
    fn release_clean(&mut self, mut held: HeldBlock) {
        held.dirty = false;
        if let Err(err) = self.release(held) {
            log::warn!("release while failing closed: {}", err);
        }
    }

    /// Releases a chain of held blocks in order. When one release fails
    /// the rest of the chain is released clean so no frame stays pinned.
    fn release_chain(&mut self, blocks: Vec<HeldBlock>) -> BlockTreeResult<()> {
        let mut blocks = blocks.into_iter();
        while let Some(held) = blocks.next() {
            if let Err(err) = self.release(held) {
                for held in blocks {
                    self.release_clean(held);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drops a block that is no longer reachable from the tree: the frame
    /// is discarded and the on-store block deallocated. The dealloc ack is
    /// owed like a write ack.
    fn deallocate(&mut self, held: HeldBlock) -> BlockTreeResult<()> {
        self.cache.discard(held.block_id);
        let receiver = self.cache.scheduler().schedule_deallocate(held.block_id)?;
        self.tickets.push(WriteTicket {
            block_id: held.block_id,
            receiver,
        });
        drop_guard(held.guard, &held.lock);
        self.locks.prune(held.block_id);
        Ok(())
    }

    /// Reserves a fresh block, already write-locked and pinned, carrying
    /// `node` as its content.
    fn allocate_node(&self, node: Node) -> BlockTreeResult<HeldBlock> {
        let (block_id, frame_id) = self.cache.allocate()?;
        let lock = self.locks.lock_for(block_id);
        // Nobody else knows this id yet.
        let granted = lock.lock(LockMode::Write, None);
        debug_assert!(granted);
        Ok(HeldBlock {
            block_id,
            frame_id,
            guard: HeldLock::Write(WriteLockGuard::adopt(lock.clone())),
            lock,
            content: BlockContent::Node(node),
            dirty: true,
        })
    }

    /// Starts an Intent-to-Write upgrade on a held block. Returns `true`
    /// when the hold is already exclusive; otherwise the guard parks as
    /// `Upgrading` and a `LockGranted` event follows.
    fn start_upgrade(&self, held: &mut HeldBlock) -> bool {
        if held.is_write_held() {
            return true;
        }
        match mem::replace(&mut held.guard, HeldLock::Upgrading) {
            HeldLock::Intent(intent) => {
                match intent.upgrade(Some(self.grant_waiter(held.block_id))) {
                    UpgradeOutcome::Upgraded(write) => {
                        held.guard = HeldLock::Write(write);
                        true
                    }
                    UpgradeOutcome::Pending => false,
                }
            }
            other => {
                held.guard = other;
                unreachable!("upgrade without an Intent hold")
            }
        }
    }

    fn finish_upgrade(&self, held: &mut HeldBlock) {
        debug_assert!(matches!(held.guard, HeldLock::Upgrading));
        held.guard = HeldLock::Write(WriteLockGuard::adopt(held.lock.clone()));
    }

    /// Blocks until the in-flight access produces its next event.
    fn wait_access(&self, access: &BlockAccess) -> BlockTreeResult<TreeEvent> {
        match &access.phase {
            AccessPhase::Locking => self.recv_event(),
            AccessPhase::Fetching(fetch) => match fetch.receiver.recv() {
                Ok(Ok(data)) => Ok(TreeEvent::BlockLoaded {
                    block_id: fetch.block_id,
                    data,
                }),
                Ok(Err(error)) => Ok(TreeEvent::IoFailed {
                    block_id: fetch.block_id,
                    error,
                }),
                Err(err) => Err(BlockTreeError::Internal(format!(
                    "fetch channel disconnected: {}",
                    err
                ))),
            },
        }
    }

    fn recv_event(&self) -> BlockTreeResult<TreeEvent> {
        self.event_rx.recv().map_err(|err| {
            BlockTreeError::Internal(format!("event channel disconnected: {}", err))
        })
    }

    /// Blocks until one outstanding write or dealloc acknowledges.
    fn wait_ack(&self) -> BlockTreeResult<TreeEvent> {
        let ticket = self.tickets.first().ok_or_else(|| {
            BlockTreeError::Internal("wait for ack with no outstanding writes".to_string())
        })?;
        match ticket.receiver.recv() {
            Ok(Ok(())) => Ok(TreeEvent::WriteAcked {
                block_id: ticket.block_id,
            }),
            Ok(Err(error)) => Ok(TreeEvent::IoFailed {
                block_id: ticket.block_id,
                error,
            }),
            Err(err) => Err(BlockTreeError::Internal(format!(
                "ack channel disconnected: {}",
                err
            ))),
        }
    }

    fn ack(&mut self, block_id: BlockId) -> BlockTreeResult<()> {
        match self.tickets.iter().position(|t| t.block_id == block_id) {
            Some(idx) => {
                self.tickets.remove(idx);
                Ok(())
            }
            None => Err(BlockTreeError::Internal(format!(
                "ack for block {} with no matching write",
                block_id
            ))),
        }
    }

    /// Tears down an access that will never be resumed. A parked lock
    /// request is waited out (the grant is on its way by construction)
    /// and then released.
    fn dispose_access(&mut self, access: BlockAccess) {
        match access.phase {
            AccessPhase::Locking => loop {
                match self.event_rx.recv() {
                    Ok(TreeEvent::LockGranted { block_id }) if block_id == access.block_id => {
                        access.lock.unlock(access.mode);
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            },
            AccessPhase::Fetching(fetch) => {
                self.cache.abort_fetch(fetch);
                access.lock.unlock(access.mode);
            }
        }
        self.locks.prune(access.block_id);
    }

    /// Resolves an `Upgrading` hold on a failure path, then releases.
    fn dispose_upgrading(&mut self, mut held: HeldBlock) {
        if matches!(held.guard, HeldLock::Upgrading) {
            held.guard = if held.lock.cancel_upgrade() {
                HeldLock::Intent(IntentGuard::adopt(held.lock.clone()))
            } else {
                HeldLock::Write(WriteLockGuard::adopt(held.lock.clone()))
            };
        }
        self.release_clean(held);
    }
}

fn adopt_guard(mode: LockMode, lock: &Arc<RwiLock>) -> HeldLock {
    match mode {
        LockMode::Read => HeldLock::Read(ReadLockGuard::adopt(lock.clone())),
        LockMode::Intent => HeldLock::Intent(IntentGuard::adopt(lock.clone())),
        LockMode::Write => HeldLock::Write(WriteLockGuard::adopt(lock.clone())),
    }
}

fn drop_guard(guard: HeldLock, lock: &Arc<RwiLock>) {
    match guard {
        HeldLock::Read(g) => drop(g),
        HeldLock::Intent(g) => drop(g),
        HeldLock::Write(g) => drop(g),
        HeldLock::Upgrading => {
            // Failure paths resolve this before release.
            if lock.cancel_upgrade() {
                lock.unlock(LockMode::Intent);
            } else {
                lock.unlock(LockMode::Write);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

enum LookupState {
    Start,
    Access {
        parent: Option<HeldBlock>,
        access: BlockAccess,
    },
    Done,
}

/// Read-only descent: superblock, root, then down under Read locks,
/// releasing each parent once its child is locked and acquired.
pub struct LookupOp {
    core: OpCore,
    state: LookupState,
}

impl LookupOp {
    pub(crate) fn new(
        cache: Arc<BufferCache>,
        locks: Arc<LockTable>,
        superblock_id: BlockId,
        key: u64,
    ) -> Self {
        LookupOp {
            core: OpCore::new(cache, locks, superblock_id, key),
            state: LookupState::Start,
        }
    }

    pub fn resume(&mut self, event: Option<TreeEvent>) -> BlockTreeResult<OpStatus> {
        match self.step(event) {
            Ok(status) => Ok(status),
            Err(err) => {
                self.fail_closed();
                Err(err)
            }
        }
    }

    /// Blocks until the event the suspension is parked on arrives.
    pub fn wait_event(&self) -> BlockTreeResult<TreeEvent> {
        match &self.state {
            LookupState::Access { access, .. } => self.core.wait_access(access),
            _ => Err(BlockTreeError::Internal(
                "wait_event on an operation that is not suspended".to_string(),
            )),
        }
    }

    fn step(&mut self, event: Option<TreeEvent>) -> BlockTreeResult<OpStatus> {
        let mut position = match mem::replace(&mut self.state, LookupState::Done) {
            LookupState::Start => {
                if is_block_id_null(self.core.superblock_id) {
                    return Ok(OpStatus::Complete(TreeOutcome::NotFound));
                }
                match self
                    .core
                    .begin_access(self.core.superblock_id, LockMode::Read, BlockKind::Superblock)?
                {
                    AccessResult::Ready(held) => (None, held),
                    AccessResult::Wait(access) => {
                        self.state = LookupState::Access {
                            parent: None,
                            access,
                        };
                        return Ok(OpStatus::Pending);
                    }
                }
            }
            LookupState::Access { parent, access } => {
                let event = event.ok_or_else(|| {
                    BlockTreeError::Internal("suspended operation resumed without event".to_string())
                })?;
                match self.core.access_event(access, event) {
                    Ok(AccessResult::Ready(held)) => (parent, held),
                    Ok(AccessResult::Wait(access)) => {
                        self.state = LookupState::Access { parent, access };
                        return Ok(OpStatus::Pending);
                    }
                    Err(err) => {
                        if let Some(parent) = parent {
                            self.core.release_clean(parent);
                        }
                        return Err(err);
                    }
                }
            }
            LookupState::Done => {
                return Err(BlockTreeError::Internal(
                    "resume on a completed operation".to_string(),
                ))
            }
        };

        loop {
            let (parent, held) = position;
            // Child is locked and acquired; crab past the parent.
            if let Some(parent) = parent {
                if let Err(err) = self.core.release(parent) {
                    self.core.release_clean(held);
                    return Err(err);
                }
            }
            let next_id = match &held.content {
                BlockContent::Superblock { root } => {
                    let root = *root;
                    if is_block_id_null(root) {
                        self.core.release(held)?;
                        return Ok(OpStatus::Complete(TreeOutcome::NotFound));
                    }
                    root
                }
                BlockContent::Node(Node::Internal(internal)) => internal.child_for(self.core.key),
                BlockContent::Node(Node::Leaf(leaf)) => {
                    let outcome = match leaf.lookup(self.core.key) {
                        Some(value) => TreeOutcome::Found { value },
                        None => TreeOutcome::NotFound,
                    };
                    self.core.release(held)?;
                    return Ok(OpStatus::Complete(outcome));
                }
            };
            match self
                .core
                .begin_access(next_id, LockMode::Read, BlockKind::Node)
            {
                Ok(AccessResult::Ready(child)) => position = (Some(held), child),
                Ok(AccessResult::Wait(access)) => {
                    self.state = LookupState::Access {
                        parent: Some(held),
                        access,
                    };
                    return Ok(OpStatus::Pending);
                }
                Err(err) => {
                    self.core.release_clean(held);
                    return Err(err);
                }
            }
        }
    }

    fn fail_closed(&mut self) {
        match mem::replace(&mut self.state, LookupState::Done) {
            LookupState::Access { parent, access } => {
                if let Some(parent) = parent {
                    self.core.release_clean(parent);
                }
                self.core.dispose_access(access);
            }
            LookupState::Start | LookupState::Done => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------------

enum InsertState {
    Start,
    Access {
        parent: Option<HeldBlock>,
        access: BlockAccess,
    },
    /// Empty tree: waiting for the superblock's Write upgrade before
    /// installing the first root leaf.
    RootInitUpgrade { superblock: HeldBlock },
    /// Full node on the path: waiting for the parent's Write upgrade.
    SplitUpgradeParent { parent: HeldBlock, node: HeldBlock },
    /// Waiting for the full node's own Write upgrade.
    SplitUpgradeNode { parent: HeldBlock, node: HeldBlock },
    /// Waiting for the target leaf's Write upgrade before the final insert.
    LeafUpgrade { leaf: HeldBlock },
    Flushing,
    Done,
}

/// Insert position after event application: ready to examine a node.
enum InsertPosition {
    AtNode {
        parent: Option<HeldBlock>,
        node: HeldBlock,
    },
    RootInit {
        superblock: HeldBlock,
    },
    Split {
        parent: HeldBlock,
        node: HeldBlock,
    },
}

/// Top-down insert with proactive splitting: a full node is split before
/// it is descended into, under Write upgrades of it and its parent, so
/// the eventual leaf insert always has room.
pub struct InsertOp {
    core: OpCore,
    value: u64,
    state: InsertState,
}

impl InsertOp {
    pub(crate) fn new(
        cache: Arc<BufferCache>,
        locks: Arc<LockTable>,
        superblock_id: BlockId,
        key: u64,
        value: u64,
    ) -> Self {
        InsertOp {
            core: OpCore::new(cache, locks, superblock_id, key),
            value,
            state: InsertState::Start,
        }
    }

    pub fn resume(&mut self, event: Option<TreeEvent>) -> BlockTreeResult<OpStatus> {
        match self.step(event) {
            Ok(status) => Ok(status),
            Err(err) => {
                self.fail_closed();
                Err(err)
            }
        }
    }

    pub fn wait_event(&self) -> BlockTreeResult<TreeEvent> {
        match &self.state {
            InsertState::Access { access, .. } => self.core.wait_access(access),
            InsertState::RootInitUpgrade { .. }
            | InsertState::SplitUpgradeParent { .. }
            | InsertState::SplitUpgradeNode { .. }
            | InsertState::LeafUpgrade { .. } => self.core.recv_event(),
            InsertState::Flushing => self.core.wait_ack(),
            _ => Err(BlockTreeError::Internal(
                "wait_event on an operation that is not suspended".to_string(),
            )),
        }
    }

    fn step(&mut self, event: Option<TreeEvent>) -> BlockTreeResult<OpStatus> {
        let mut position = match mem::replace(&mut self.state, InsertState::Done) {
            InsertState::Start => {
                match self.core.begin_access(
                    self.core.superblock_id,
                    LockMode::Intent,
                    BlockKind::Superblock,
                )? {
                    AccessResult::Ready(held) => InsertPosition::AtNode {
                        parent: None,
                        node: held,
                    },
                    AccessResult::Wait(access) => {
                        self.state = InsertState::Access {
                            parent: None,
                            access,
                        };
                        return Ok(OpStatus::Pending);
                    }
                }
            }
            InsertState::Access { parent, access } => {
                let event = require_event(event)?;
                match self.core.access_event(access, event) {
                    Ok(AccessResult::Ready(held)) => InsertPosition::AtNode {
                        parent,
                        node: held,
                    },
                    Ok(AccessResult::Wait(access)) => {
                        self.state = InsertState::Access { parent, access };
                        return Ok(OpStatus::Pending);
                    }
                    Err(err) => {
                        if let Some(parent) = parent {
                            self.core.release_clean(parent);
                        }
                        return Err(err);
                    }
                }
            }
            InsertState::RootInitUpgrade { mut superblock } => {
                expect_grant(event, superblock.block_id)?;
                self.core.finish_upgrade(&mut superblock);
                InsertPosition::RootInit { superblock }
            }
            InsertState::SplitUpgradeParent { mut parent, mut node } => {
                expect_grant(event, parent.block_id)?;
                self.core.finish_upgrade(&mut parent);
                if self.core.start_upgrade(&mut node) {
                    InsertPosition::Split { parent, node }
                } else {
                    self.state = InsertState::SplitUpgradeNode { parent, node };
                    return Ok(OpStatus::Pending);
                }
            }
            InsertState::SplitUpgradeNode { parent, mut node } => {
                expect_grant(event, node.block_id)?;
                self.core.finish_upgrade(&mut node);
                InsertPosition::Split { parent, node }
            }
            InsertState::LeafUpgrade { mut leaf } => {
                expect_grant(event, leaf.block_id)?;
                self.core.finish_upgrade(&mut leaf);
                self.leaf_insert(leaf)?;
                return self.finish();
            }
            InsertState::Flushing => {
                match require_event(event)? {
                    TreeEvent::WriteAcked { block_id } => self.core.ack(block_id)?,
                    TreeEvent::IoFailed { error, .. } => return Err(error),
                    other => {
                        return Err(BlockTreeError::Internal(format!(
                            "unexpected resume event {:?} while flushing",
                            other
                        )))
                    }
                }
                if self.core.tickets.is_empty() {
                    return Ok(OpStatus::Complete(TreeOutcome::Inserted));
                }
                self.state = InsertState::Flushing;
                return Ok(OpStatus::Pending);
            }
            InsertState::Done => {
                return Err(BlockTreeError::Internal(
                    "resume on a completed operation".to_string(),
                ))
            }
        };

        loop {
            position = match position {
                InsertPosition::AtNode { parent, node } => {
                    match self.at_node(parent, node)? {
                        Progress::Next(position) => position,
                        Progress::Suspended => return Ok(OpStatus::Pending),
                        Progress::Finished => return self.finish(),
                    }
                }
                InsertPosition::RootInit { superblock } => {
                    self.root_init(superblock)?;
                    return self.finish();
                }
                InsertPosition::Split { parent, node } => {
                    let node = self.split_node(parent, node)?;
                    InsertPosition::AtNode { parent: None, node }
                }
            };
        }
    }

    /// Examine a freshly held node (or the superblock) and move down.
    fn at_node(
        &mut self,
        parent: Option<HeldBlock>,
        node: HeldBlock,
    ) -> BlockTreeResult<Progress<InsertPosition>> {
        // Superblock: go to the root, or install one.
        if let BlockContent::Superblock { root } = &node.content {
            let root = *root;
            debug_assert!(parent.is_none());
            if is_block_id_null(root) {
                let mut superblock = node;
                if self.core.start_upgrade(&mut superblock) {
                    return Ok(Progress::Next(InsertPosition::RootInit { superblock }));
                }
                self.state = InsertState::RootInitUpgrade { superblock };
                return Ok(Progress::Suspended);
            }
            return self.descend(node, root);
        }

        if node.node().is_full() {
            // Proactive split; the parent (possibly the superblock) is
            // still held and has room by induction.
            let mut parent = parent.ok_or_else(|| {
                BlockTreeError::Internal("full node with no held parent".to_string())
            })?;
            let mut node = node;
            if !self.core.start_upgrade(&mut parent) {
                self.state = InsertState::SplitUpgradeParent { parent, node };
                return Ok(Progress::Suspended);
            }
            if !self.core.start_upgrade(&mut node) {
                self.state = InsertState::SplitUpgradeNode { parent, node };
                return Ok(Progress::Suspended);
            }
            return Ok(Progress::Next(InsertPosition::Split { parent, node }));
        }

        // Room here; the parent is no longer needed.
        if let Some(parent) = parent {
            if let Err(err) = self.core.release(parent) {
                self.core.release_clean(node);
                return Err(err);
            }
        }
        match node.node() {
            Node::Internal(internal) => {
                let child = internal.child_for(self.core.key);
                self.descend(node, child)
            }
            Node::Leaf(_) => {
                let mut node = node;
                // Mutation only under Write: upgrade and let any readers
                // admitted under the Intent hold drain first.
                if !self.core.start_upgrade(&mut node) {
                    self.state = InsertState::LeafUpgrade { leaf: node };
                    return Ok(Progress::Suspended);
                }
                self.leaf_insert(node)?;
                Ok(Progress::Finished)
            }
        }
    }

    fn descend(
        &mut self,
        node: HeldBlock,
        child: BlockId,
    ) -> BlockTreeResult<Progress<InsertPosition>> {
        match self
            .core
            .begin_access(child, LockMode::Intent, BlockKind::Node)
        {
            Ok(AccessResult::Ready(held)) => Ok(Progress::Next(InsertPosition::AtNode {
                parent: Some(node),
                node: held,
            })),
            Ok(AccessResult::Wait(access)) => {
                self.state = InsertState::Access {
                    parent: Some(node),
                    access,
                };
                Ok(Progress::Suspended)
            }
            Err(err) => {
                self.core.release_clean(node);
                Err(err)
            }
        }
    }

    /// Empty tree: allocate the first leaf as root, superblock Write held.
    fn root_init(&mut self, mut superblock: HeldBlock) -> BlockTreeResult<()> {
        let mut leaf = LeafNode::new();
        leaf.insert(self.core.key, self.value);
        let held_leaf = match self.core.allocate_node(Node::Leaf(leaf)) {
            Ok(held) => held,
            Err(err) => {
                self.core.release_clean(superblock);
                return Err(err);
            }
        };
        superblock.set_root(held_leaf.block_id);
        if let Err(err) = self.core.release(held_leaf) {
            self.core.release_clean(superblock);
            return Err(err);
        }
        self.core.release(superblock)?;
        Ok(())
    }

    /// Both the full node and its parent are Write-held: split, wire the
    /// median into the parent (growing a new root when the parent is the
    /// superblock), release everything but the half the key descends into.
    fn split_node(
        &mut self,
        mut parent: HeldBlock,
        mut node: HeldBlock,
    ) -> BlockTreeResult<HeldBlock> {
        let (median, right) = match node.node_mut() {
            Node::Leaf(leaf) => {
                let (median, right) = leaf.split();
                (median, Node::Leaf(right))
            }
            Node::Internal(internal) => {
                let (median, right) = internal.split();
                (median, Node::Internal(right))
            }
        };
        let sibling = match self.core.allocate_node(right) {
            Ok(held) => held,
            Err(err) => {
                self.core.release_clean(node);
                self.core.release_clean(parent);
                return Err(err);
            }
        };

        let mut new_root_held = None;
        match &mut parent.content {
            BlockContent::Superblock { .. } => {
                // The root itself split: grow a new root above both halves.
                let mut new_root = InternalNode::new();
                new_root.children.push(node.block_id);
                new_root.insert_split(0, median, sibling.block_id);
                let root_held = match self.core.allocate_node(Node::Internal(new_root)) {
                    Ok(held) => held,
                    Err(err) => {
                        self.core.release_clean(sibling);
                        self.core.release_clean(node);
                        self.core.release_clean(parent);
                        return Err(err);
                    }
                };
                parent.set_root(root_held.block_id);
                new_root_held = Some(root_held);
            }
            BlockContent::Node(Node::Internal(_)) => {
                let idx = match parent.node() {
                    Node::Internal(internal) => internal.child_index(self.core.key),
                    Node::Leaf(_) => unreachable!(),
                };
                match parent.node_mut() {
                    Node::Internal(internal) => {
                        internal.insert_split(idx, median, sibling.block_id)
                    }
                    Node::Leaf(_) => unreachable!(),
                }
            }
            BlockContent::Node(Node::Leaf(_)) => {
                unreachable!("a leaf cannot be a parent")
            }
        }
        if let Some(root_held) = new_root_held {
            if let Err(err) = self.core.release(root_held) {
                self.core.release_clean(sibling);
                self.core.release_clean(node);
                self.core.release_clean(parent);
                return Err(err);
            }
        }
        if let Err(err) = self.core.release(parent) {
            self.core.release_clean(sibling);
            self.core.release_clean(node);
            return Err(err);
        }

        // Descend into the half that now covers the key.
        if self.core.key >= median {
            if let Err(err) = self.core.release(node) {
                self.core.release_clean(sibling);
                return Err(err);
            }
            Ok(sibling)
        } else {
            if let Err(err) = self.core.release(sibling) {
                self.core.release_clean(node);
                return Err(err);
            }
            Ok(node)
        }
    }

    fn leaf_insert(&mut self, mut leaf: HeldBlock) -> BlockTreeResult<()> {
        let key = self.core.key;
        let value = self.value;
        let result = match leaf.node_mut() {
            Node::Leaf(node) => node.insert(key, value),
            Node::Internal(_) => unreachable!("descent ended on an internal node"),
        };
        match result {
            LeafInsert::Inserted | LeafInsert::Updated => {
                self.core.release(leaf)?;
                Ok(())
            }
            LeafInsert::Full => {
                // Pre-splitting on the way down is sized to prevent this.
                debug_assert!(false, "full leaf after pre-split");
                self.core.release_clean(leaf);
                Err(BlockTreeError::Internal(
                    "leaf full after proactive split".to_string(),
                ))
            }
        }
    }

    fn finish(&mut self) -> BlockTreeResult<OpStatus> {
        if self.core.tickets.is_empty() {
            self.state = InsertState::Done;
            return Ok(OpStatus::Complete(TreeOutcome::Inserted));
        }
        self.state = InsertState::Flushing;
        Ok(OpStatus::Pending)
    }

    fn fail_closed(&mut self) {
        match mem::replace(&mut self.state, InsertState::Done) {
            InsertState::Access { parent, access } => {
                if let Some(parent) = parent {
                    self.core.release_clean(parent);
                }
                self.core.dispose_access(access);
            }
            InsertState::RootInitUpgrade { superblock } => {
                self.core.dispose_upgrading(superblock);
            }
            InsertState::SplitUpgradeParent { parent, node } => {
                self.core.release_clean(node);
                self.core.dispose_upgrading(parent);
            }
            InsertState::SplitUpgradeNode { parent, node } => {
                self.core.dispose_upgrading(node);
                self.core.release_clean(parent);
            }
            InsertState::LeafUpgrade { leaf } => {
                self.core.dispose_upgrading(leaf);
            }
            InsertState::Start | InsertState::Flushing | InsertState::Done => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

enum RemoveState {
    Start,
    AccessSuper(BlockAccess),
    AccessNode {
        sb: HeldBlock,
        grandparent: Option<HeldBlock>,
        parent: Option<HeldBlock>,
        access: BlockAccess,
    },
    /// Simple removal: waiting for the leaf's Write upgrade.
    LeafUpgrade {
        sb: HeldBlock,
        parent: Option<HeldBlock>,
        leaf: HeldBlock,
    },
    /// Rebalancing removal: waiting for the parent's Write upgrade.
    RebalanceUpgradeParent {
        sb: HeldBlock,
        parent: HeldBlock,
        leaf: HeldBlock,
    },
    /// Waiting for the leaf's Write upgrade, parent already exclusive.
    RebalanceUpgradeLeaf {
        sb: HeldBlock,
        parent: HeldBlock,
        leaf: HeldBlock,
    },
    AccessSibling {
        sb: HeldBlock,
        parent: HeldBlock,
        leaf: HeldBlock,
        access: BlockAccess,
        sep_idx: usize,
        leaf_is_left: bool,
    },
    /// Root change: waiting for the superblock's Write upgrade with the
    /// finished leaf-level work parked alongside.
    SuperUpgrade {
        sb: HeldBlock,
        new_root: BlockId,
        releases: Vec<HeldBlock>,
        deallocs: Vec<HeldBlock>,
    },
    Flushing,
    Done,
}

enum RemovePosition {
    AtNode {
        sb: HeldBlock,
        parent: Option<HeldBlock>,
        node: HeldBlock,
    },
    SimpleRemove {
        sb: HeldBlock,
        parent: Option<HeldBlock>,
        leaf: HeldBlock,
    },
    SiblingPick {
        sb: HeldBlock,
        parent: HeldBlock,
        leaf: HeldBlock,
    },
    Rebalance {
        sb: HeldBlock,
        parent: HeldBlock,
        leaf: HeldBlock,
        sibling: HeldBlock,
        sep_idx: usize,
        leaf_is_left: bool,
    },
    Collapse {
        sb: HeldBlock,
        new_root: BlockId,
        releases: Vec<HeldBlock>,
        deallocs: Vec<HeldBlock>,
    },
}

/// Removal with leaf-level rebalancing.
///
/// The superblock's Intent is held for the whole operation. Since every
/// mutating operation opens by taking superblock Intent and Intent
/// excludes Intent, mutators are serialized per tree while readers keep
/// flowing; it also means a root collapse never has to re-lock upward.
pub struct RemoveOp {
    core: OpCore,
    state: RemoveState,
    rebalance: bool,
    /// Whether the leaf's parent is the root, maintained during descent.
    parent_is_root: bool,
}

impl RemoveOp {
    pub(crate) fn new(
        cache: Arc<BufferCache>,
        locks: Arc<LockTable>,
        superblock_id: BlockId,
        key: u64,
        rebalance: bool,
    ) -> Self {
        RemoveOp {
            core: OpCore::new(cache, locks, superblock_id, key),
            state: RemoveState::Start,
            rebalance,
            parent_is_root: false,
        }
    }

    pub fn resume(&mut self, event: Option<TreeEvent>) -> BlockTreeResult<OpStatus> {
        match self.step(event) {
            Ok(status) => Ok(status),
            Err(err) => {
                self.fail_closed();
                Err(err)
            }
        }
    }

    pub fn wait_event(&self) -> BlockTreeResult<TreeEvent> {
        match &self.state {
            RemoveState::AccessSuper(access) => self.core.wait_access(access),
            RemoveState::AccessNode { access, .. } | RemoveState::AccessSibling { access, .. } => {
                self.core.wait_access(access)
            }
            RemoveState::LeafUpgrade { .. }
            | RemoveState::RebalanceUpgradeParent { .. }
            | RemoveState::RebalanceUpgradeLeaf { .. }
            | RemoveState::SuperUpgrade { .. } => self.core.recv_event(),
            RemoveState::Flushing => self.core.wait_ack(),
            _ => Err(BlockTreeError::Internal(
                "wait_event on an operation that is not suspended".to_string(),
            )),
        }
    }

    fn step(&mut self, event: Option<TreeEvent>) -> BlockTreeResult<OpStatus> {
        let mut position = match mem::replace(&mut self.state, RemoveState::Done) {
            RemoveState::Start => {
                if is_block_id_null(self.core.superblock_id) {
                    return Ok(OpStatus::Complete(TreeOutcome::NotFound));
                }
                match self.core.begin_access(
                    self.core.superblock_id,
                    LockMode::Intent,
                    BlockKind::Superblock,
                )? {
                    AccessResult::Ready(sb) => match self.enter_root(sb)? {
                        Progress::Next(position) => position,
                        Progress::Suspended => return Ok(OpStatus::Pending),
                        Progress::Finished => return self.finish(TreeOutcome::NotFound),
                    },
                    AccessResult::Wait(access) => {
                        self.state = RemoveState::AccessSuper(access);
                        return Ok(OpStatus::Pending);
                    }
                }
            }
            RemoveState::AccessSuper(access) => {
                let event = require_event(event)?;
                let sb = match self.core.access_event(access, event)? {
                    AccessResult::Ready(sb) => sb,
                    AccessResult::Wait(access) => {
                        self.state = RemoveState::AccessSuper(access);
                        return Ok(OpStatus::Pending);
                    }
                };
                match self.enter_root(sb)? {
                    Progress::Next(position) => position,
                    Progress::Suspended => return Ok(OpStatus::Pending),
                    Progress::Finished => return self.finish(TreeOutcome::NotFound),
                }
            }
            RemoveState::AccessNode {
                sb,
                grandparent,
                parent,
                access,
            } => {
                let event = require_event(event)?;
                match self.core.access_event(access, event) {
                    Ok(AccessResult::Ready(node)) => {
                        if let Some(grandparent) = grandparent {
                            if let Err(err) = self.core.release(grandparent) {
                                self.core.release_clean(node);
                                if let Some(parent) = parent {
                                    self.core.release_clean(parent);
                                }
                                self.core.release_clean(sb);
                                return Err(err);
                            }
                        }
                        RemovePosition::AtNode { sb, parent, node }
                    }
                    Ok(AccessResult::Wait(access)) => {
                        self.state = RemoveState::AccessNode {
                            sb,
                            grandparent,
                            parent,
                            access,
                        };
                        return Ok(OpStatus::Pending);
                    }
                    Err(err) => {
                        if let Some(grandparent) = grandparent {
                            self.core.release_clean(grandparent);
                        }
                        if let Some(parent) = parent {
                            self.core.release_clean(parent);
                        }
                        self.core.release_clean(sb);
                        return Err(err);
                    }
                }
            }
            RemoveState::LeafUpgrade {
                sb,
                parent,
                mut leaf,
            } => {
                expect_grant(event, leaf.block_id)?;
                self.core.finish_upgrade(&mut leaf);
                RemovePosition::SimpleRemove { sb, parent, leaf }
            }
            RemoveState::RebalanceUpgradeParent {
                sb,
                mut parent,
                mut leaf,
            } => {
                expect_grant(event, parent.block_id)?;
                self.core.finish_upgrade(&mut parent);
                if self.core.start_upgrade(&mut leaf) {
                    RemovePosition::SiblingPick { sb, parent, leaf }
                } else {
                    self.state = RemoveState::RebalanceUpgradeLeaf { sb, parent, leaf };
                    return Ok(OpStatus::Pending);
                }
            }
            RemoveState::RebalanceUpgradeLeaf {
                sb,
                parent,
                mut leaf,
            } => {
                expect_grant(event, leaf.block_id)?;
                self.core.finish_upgrade(&mut leaf);
                RemovePosition::SiblingPick { sb, parent, leaf }
            }
            RemoveState::AccessSibling {
                sb,
                parent,
                leaf,
                access,
                sep_idx,
                leaf_is_left,
            } => {
                let event = require_event(event)?;
                match self.core.access_event(access, event) {
                    Ok(AccessResult::Ready(sibling)) => RemovePosition::Rebalance {
                        sb,
                        parent,
                        leaf,
                        sibling,
                        sep_idx,
                        leaf_is_left,
                    },
                    Ok(AccessResult::Wait(access)) => {
                        self.state = RemoveState::AccessSibling {
                            sb,
                            parent,
                            leaf,
                            access,
                            sep_idx,
                            leaf_is_left,
                        };
                        return Ok(OpStatus::Pending);
                    }
                    Err(err) => {
                        self.core.release_clean(leaf);
                        self.core.release_clean(parent);
                        self.core.release_clean(sb);
                        return Err(err);
                    }
                }
            }
            RemoveState::SuperUpgrade {
                mut sb,
                new_root,
                releases,
                deallocs,
            } => {
                expect_grant(event, sb.block_id)?;
                self.core.finish_upgrade(&mut sb);
                RemovePosition::Collapse {
                    sb,
                    new_root,
                    releases,
                    deallocs,
                }
            }
            RemoveState::Flushing => {
                match require_event(event)? {
                    TreeEvent::WriteAcked { block_id } => self.core.ack(block_id)?,
                    TreeEvent::IoFailed { error, .. } => return Err(error),
                    other => {
                        return Err(BlockTreeError::Internal(format!(
                            "unexpected resume event {:?} while flushing",
                            other
                        )))
                    }
                }
                if self.core.tickets.is_empty() {
                    return Ok(OpStatus::Complete(TreeOutcome::Removed));
                }
                self.state = RemoveState::Flushing;
                return Ok(OpStatus::Pending);
            }
            RemoveState::Done => {
                return Err(BlockTreeError::Internal(
                    "resume on a completed operation".to_string(),
                ))
            }
        };

        loop {
            position = match position {
                RemovePosition::AtNode { sb, parent, node } => {
                    match self.at_node(sb, parent, node)? {
                        Progress::Next(position) => position,
                        Progress::Suspended => return Ok(OpStatus::Pending),
                        Progress::Finished => return self.finish(TreeOutcome::NotFound),
                    }
                }
                RemovePosition::SimpleRemove { sb, parent, leaf } => {
                    match self.simple_remove(sb, parent, leaf)? {
                        Progress::Next(position) => position,
                        Progress::Suspended => return Ok(OpStatus::Pending),
                        Progress::Finished => return self.finish(TreeOutcome::Removed),
                    }
                }
                RemovePosition::SiblingPick { sb, parent, leaf } => {
                    match self.pick_sibling(sb, parent, leaf)? {
                        Progress::Next(position) => position,
                        Progress::Suspended => return Ok(OpStatus::Pending),
                        Progress::Finished => unreachable!("sibling pick cannot finish the op"),
                    }
                }
                RemovePosition::Rebalance {
                    sb,
                    parent,
                    leaf,
                    sibling,
                    sep_idx,
                    leaf_is_left,
                } => match self.rebalance(sb, parent, leaf, sibling, sep_idx, leaf_is_left)? {
                    Progress::Next(position) => position,
                    Progress::Suspended => return Ok(OpStatus::Pending),
                    Progress::Finished => return self.finish(TreeOutcome::Removed),
                },
                RemovePosition::Collapse {
                    sb,
                    new_root,
                    releases,
                    deallocs,
                } => {
                    self.collapse(sb, new_root, releases, deallocs)?;
                    return self.finish(TreeOutcome::Removed);
                }
            };
        }
    }

    /// Superblock held: step to the root, or report the miss on an empty
    /// tree. `Finished` here always means not-found.
    fn enter_root(&mut self, sb: HeldBlock) -> BlockTreeResult<Progress<RemovePosition>> {
        let root = sb.root();
        if is_block_id_null(root) {
            self.core.release(sb)?;
            return Ok(Progress::Finished);
        }
        self.parent_is_root = false;
        match self
            .core
            .begin_access(root, LockMode::Intent, BlockKind::Node)
        {
            Ok(AccessResult::Ready(node)) => Ok(Progress::Next(RemovePosition::AtNode {
                sb,
                parent: None,
                node,
            })),
            Ok(AccessResult::Wait(access)) => {
                self.state = RemoveState::AccessNode {
                    sb,
                    grandparent: None,
                    parent: None,
                    access,
                };
                Ok(Progress::Suspended)
            }
            Err(err) => {
                self.core.release_clean(sb);
                Err(err)
            }
        }
    }

    fn at_node(
        &mut self,
        sb: HeldBlock,
        parent: Option<HeldBlock>,
        node: HeldBlock,
    ) -> BlockTreeResult<Progress<RemovePosition>> {
        match node.node() {
            Node::Internal(internal) => {
                let child = internal.child_for(self.core.key);
                self.parent_is_root = parent.is_none();
                match self
                    .core
                    .begin_access(child, LockMode::Intent, BlockKind::Node)
                {
                    Ok(AccessResult::Ready(held)) => {
                        if let Some(parent) = parent {
                            if let Err(err) = self.core.release(parent) {
                                self.core.release_clean(held);
                                self.core.release_clean(node);
                                self.core.release_clean(sb);
                                return Err(err);
                            }
                        }
                        Ok(Progress::Next(RemovePosition::AtNode {
                            sb,
                            parent: Some(node),
                            node: held,
                        }))
                    }
                    Ok(AccessResult::Wait(access)) => {
                        self.state = RemoveState::AccessNode {
                            sb,
                            grandparent: parent,
                            parent: Some(node),
                            access,
                        };
                        Ok(Progress::Suspended)
                    }
                    Err(err) => {
                        if let Some(parent) = parent {
                            self.core.release_clean(parent);
                        }
                        self.core.release_clean(node);
                        self.core.release_clean(sb);
                        Err(err)
                    }
                }
            }
            Node::Leaf(leaf_node) => {
                if leaf_node.lookup(self.core.key).is_none() {
                    let mut chain = vec![node];
                    chain.extend(parent);
                    chain.push(sb);
                    self.core.release_chain(chain)?;
                    return Ok(Progress::Finished);
                }
                // Rebalancing needs an adjacent sibling; a parent left
                // with a single child (tolerated underflow above the
                // leaf level) cannot offer one.
                let has_sibling = parent
                    .as_ref()
                    .and_then(|p| p.node().as_internal())
                    .map(|internal| internal.children.len() > 1)
                    .unwrap_or(false);
                let needs_rebalance = self.rebalance
                    && has_sibling
                    && leaf_node.keys.len() - 1 < Node::MIN_KEYS;
                let mut leaf = node;
                if needs_rebalance {
                    let mut parent = parent.unwrap_or_else(|| unreachable!());
                    if self.core.start_upgrade(&mut parent) {
                        if self.core.start_upgrade(&mut leaf) {
                            Ok(Progress::Next(RemovePosition::SiblingPick {
                                sb,
                                parent,
                                leaf,
                            }))
                        } else {
                            self.state = RemoveState::RebalanceUpgradeLeaf { sb, parent, leaf };
                            Ok(Progress::Suspended)
                        }
                    } else {
                        self.state = RemoveState::RebalanceUpgradeParent { sb, parent, leaf };
                        Ok(Progress::Suspended)
                    }
                } else if self.core.start_upgrade(&mut leaf) {
                    Ok(Progress::Next(RemovePosition::SimpleRemove {
                        sb,
                        parent,
                        leaf,
                    }))
                } else {
                    self.state = RemoveState::LeafUpgrade { sb, parent, leaf };
                    Ok(Progress::Suspended)
                }
            }
        }
    }

    /// Leaf Write-held, no sibling work: take the key out and, when the
    /// root leaf empties, null the root.
    fn simple_remove(
        &mut self,
        mut sb: HeldBlock,
        parent: Option<HeldBlock>,
        mut leaf: HeldBlock,
    ) -> BlockTreeResult<Progress<RemovePosition>> {
        let key = self.core.key;
        let (removed, now_empty) = match leaf.node_mut() {
            Node::Leaf(node) => (node.remove(key).is_some(), node.keys.is_empty()),
            Node::Internal(_) => unreachable!("descent ended on an internal node"),
        };
        debug_assert!(removed, "key vanished under the superblock intent hold");

        if parent.is_none() && now_empty {
            // Last key of the root leaf: the tree becomes empty.
            if self.core.start_upgrade(&mut sb) {
                return Ok(Progress::Next(RemovePosition::Collapse {
                    sb,
                    new_root: INVALID_BLOCK_ID,
                    releases: Vec::new(),
                    deallocs: vec![leaf],
                }));
            }
            self.state = RemoveState::SuperUpgrade {
                sb,
                new_root: INVALID_BLOCK_ID,
                releases: Vec::new(),
                deallocs: vec![leaf],
            };
            return Ok(Progress::Suspended);
        }

        let mut chain = vec![leaf];
        chain.extend(parent);
        chain.push(sb);
        self.core.release_chain(chain)?;
        Ok(Progress::Finished)
    }

    /// Parent and leaf Write-held: choose the adjacent sibling (left when
    /// one exists) and lock-and-fetch it exclusively.
    fn pick_sibling(
        &mut self,
        sb: HeldBlock,
        parent: HeldBlock,
        leaf: HeldBlock,
    ) -> BlockTreeResult<Progress<RemovePosition>> {
        let (sibling_id, sep_idx, leaf_is_left) = match parent.node() {
            Node::Internal(internal) => {
                let idx = internal.child_index(self.core.key);
                debug_assert_eq!(internal.children[idx], leaf.block_id);
                if idx > 0 {
                    (internal.children[idx - 1], idx - 1, false)
                } else {
                    (internal.children[idx + 1], idx, true)
                }
            }
            Node::Leaf(_) => unreachable!("a leaf cannot be a parent"),
        };
        match self
            .core
            .begin_access(sibling_id, LockMode::Write, BlockKind::Node)
        {
            Ok(AccessResult::Ready(sibling)) => Ok(Progress::Next(RemovePosition::Rebalance {
                sb,
                parent,
                leaf,
                sibling,
                sep_idx,
                leaf_is_left,
            })),
            Ok(AccessResult::Wait(access)) => {
                self.state = RemoveState::AccessSibling {
                    sb,
                    parent,
                    leaf,
                    access,
                    sep_idx,
                    leaf_is_left,
                };
                Ok(Progress::Suspended)
            }
            Err(err) => {
                self.core.release_clean(leaf);
                self.core.release_clean(parent);
                self.core.release_clean(sb);
                Err(err)
            }
        }
    }

    /// Everything is exclusive: remove the key, then level with the
    /// sibling when it can spare an entry, merge otherwise. A merge that
    /// empties a root parent collapses the root into the merged child.
    fn rebalance(
        &mut self,
        sb: HeldBlock,
        mut parent: HeldBlock,
        mut leaf: HeldBlock,
        mut sibling: HeldBlock,
        sep_idx: usize,
        leaf_is_left: bool,
    ) -> BlockTreeResult<Progress<RemovePosition>> {
        let key = self.core.key;
        let removed = match leaf.node_mut() {
            Node::Leaf(node) => node.remove(key).is_some(),
            Node::Internal(_) => unreachable!("descent ended on an internal node"),
        };
        debug_assert!(removed, "key vanished under the superblock intent hold");

        if !matches!(sibling.node(), Node::Leaf(_)) {
            self.core.release_clean(leaf);
            self.core.release_clean(sibling);
            self.core.release_clean(parent);
            self.core.release_clean(sb);
            return Err(BlockTreeError::Corruption(
                "leaf sibling decoded as internal".to_string(),
            ));
        }

        let sibling_spare = sibling.node().nkeys() > Node::MIN_KEYS;
        if sibling_spare {
            let separator = match (leaf.node_mut(), sibling.node_mut()) {
                (Node::Leaf(leaf_node), Node::Leaf(sibling_node)) => {
                    if leaf_is_left {
                        leaf_node.level_from_right(sibling_node)
                    } else {
                        sibling_node.level_into_right(leaf_node)
                    }
                }
                _ => unreachable!(),
            };
            match parent.node_mut() {
                Node::Internal(internal) => internal.set_separator(sep_idx, separator),
                Node::Leaf(_) => unreachable!(),
            }
            self.core.release_chain(vec![leaf, sibling, parent, sb])?;
            return Ok(Progress::Finished);
        }

        // Merge the pair into its left member and drop the right one.
        let (mut left, mut right) = if leaf_is_left {
            (leaf, sibling)
        } else {
            (sibling, leaf)
        };
        let right_node = match mem::replace(right.node_mut(), Node::Leaf(LeafNode::new())) {
            Node::Leaf(node) => node,
            Node::Internal(_) => unreachable!(),
        };
        match left.node_mut() {
            Node::Leaf(node) => node.merge(right_node),
            Node::Internal(_) => unreachable!(),
        }
        match parent.node_mut() {
            Node::Internal(internal) => internal.remove_merged(sep_idx),
            Node::Leaf(_) => unreachable!(),
        }

        let parent_empty = match parent.node() {
            Node::Internal(internal) => internal.keys.is_empty(),
            Node::Leaf(_) => unreachable!(),
        };
        if self.parent_is_root && parent_empty {
            // The root lost its last separator: its single remaining
            // child becomes the root.
            let new_root = left.block_id;
            let mut sb = sb;
            let releases = vec![left];
            let deallocs = vec![right, parent];
            if self.core.start_upgrade(&mut sb) {
                return Ok(Progress::Next(RemovePosition::Collapse {
                    sb,
                    new_root,
                    releases,
                    deallocs,
                }));
            }
            self.state = RemoveState::SuperUpgrade {
                sb,
                new_root,
                releases,
                deallocs,
            };
            return Ok(Progress::Suspended);
        }

        if let Err(err) = self.core.release(left) {
            self.core.release_clean(right);
            self.core.release_clean(parent);
            self.core.release_clean(sb);
            return Err(err);
        }
        if let Err(err) = self.core.deallocate(right) {
            self.core.release_clean(parent);
            self.core.release_clean(sb);
            return Err(err);
        }
        self.core.release_chain(vec![parent, sb])?;
        Ok(Progress::Finished)
    }

    /// Superblock Write-held: point it at the new root and retire the
    /// parked blocks.
    fn collapse(
        &mut self,
        mut sb: HeldBlock,
        new_root: BlockId,
        releases: Vec<HeldBlock>,
        deallocs: Vec<HeldBlock>,
    ) -> BlockTreeResult<()> {
        sb.set_root(new_root);
        let mut releases = releases.into_iter();
        while let Some(held) = releases.next() {
            if let Err(err) = self.core.release(held) {
                for held in releases {
                    self.core.release_clean(held);
                }
                for held in deallocs {
                    self.core.release_clean(held);
                }
                self.core.release_clean(sb);
                return Err(err);
            }
        }
        let mut deallocs = deallocs.into_iter();
        while let Some(held) = deallocs.next() {
            if let Err(err) = self.core.deallocate(held) {
                for held in deallocs {
                    self.core.release_clean(held);
                }
                self.core.release_clean(sb);
                return Err(err);
            }
        }
        self.core.release(sb)?;
        Ok(())
    }

    fn finish(&mut self, outcome: TreeOutcome) -> BlockTreeResult<OpStatus> {
        if self.core.tickets.is_empty() {
            self.state = RemoveState::Done;
            return Ok(OpStatus::Complete(outcome));
        }
        // Only successful removals schedule writes, so a flush always
        // resolves to Removed.
        debug_assert_eq!(outcome, TreeOutcome::Removed);
        self.state = RemoveState::Flushing;
        Ok(OpStatus::Pending)
    }

    fn fail_closed(&mut self) {
        match mem::replace(&mut self.state, RemoveState::Done) {
            RemoveState::AccessSuper(access) => self.core.dispose_access(access),
            RemoveState::AccessNode {
                sb,
                grandparent,
                parent,
                access,
            } => {
                self.core.dispose_access(access);
                if let Some(grandparent) = grandparent {
                    self.core.release_clean(grandparent);
                }
                if let Some(parent) = parent {
                    self.core.release_clean(parent);
                }
                self.core.release_clean(sb);
            }
            RemoveState::LeafUpgrade { sb, parent, leaf } => {
                self.core.dispose_upgrading(leaf);
                if let Some(parent) = parent {
                    self.core.release_clean(parent);
                }
                self.core.release_clean(sb);
            }
            RemoveState::RebalanceUpgradeParent { sb, parent, leaf } => {
                self.core.release_clean(leaf);
                self.core.dispose_upgrading(parent);
                self.core.release_clean(sb);
            }
            RemoveState::RebalanceUpgradeLeaf { sb, parent, leaf } => {
                self.core.dispose_upgrading(leaf);
                self.core.release_clean(parent);
                self.core.release_clean(sb);
            }
            RemoveState::AccessSibling {
                sb,
                parent,
                leaf,
                access,
                ..
            } => {
                self.core.dispose_access(access);
                self.core.release_clean(leaf);
                self.core.release_clean(parent);
                self.core.release_clean(sb);
            }
            RemoveState::SuperUpgrade {
                sb,
                releases,
                deallocs,
                ..
            } => {
                for held in releases.into_iter().chain(deallocs) {
                    self.core.release_clean(held);
                }
                self.core.dispose_upgrading(sb);
            }
            RemoveState::Start | RemoveState::Flushing | RemoveState::Done => {}
        }
    }
}

enum Progress<P> {
    Next(P),
    Suspended,
    Finished,
}

fn require_event(event: Option<TreeEvent>) -> BlockTreeResult<TreeEvent> {
    event.ok_or_else(|| {
        BlockTreeError::Internal("suspended operation resumed without event".to_string())
    })
}

fn expect_grant(event: Option<TreeEvent>, block_id: BlockId) -> BlockTreeResult<()> {
    match require_event(event)? {
        TreeEvent::LockGranted { block_id: granted } if granted == block_id => Ok(()),
        other => Err(BlockTreeError::Internal(format!(
            "expected lock grant for block {}, got {:?}",
            block_id, other
        ))),
    }
}
