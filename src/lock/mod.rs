//! Per-block read/write/intent locks.
//!
//! An Intent hold admits concurrent readers but excludes other writers and
//! intent holders, which lets a mutating tree descent pin its claim on a
//! block early and upgrade to Write only when a structural change is
//! certain. Denied requests park a waiter continuation in a FIFO queue;
//! the waiter runs after the lock state has already been transitioned on
//! its behalf, so the woken operation adopts the hold instead of retrying.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::BlockId;

/// Continuation invoked when a parked request is granted.
pub type LockWaiter = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Intent,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Read(usize),
    Intent { readers: usize },
    Write,
}

struct LockInner {
    state: LockState,
    queue: VecDeque<(LockMode, LockWaiter)>,
    /// Parked intent-to-write upgrade. Takes priority over the queue so a
    /// stream of readers cannot starve the upgrading holder.
    upgrade: Option<LockWaiter>,
}

pub struct RwiLock {
    inner: Mutex<LockInner>,
}

impl Default for RwiLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwiLock {
    pub fn new() -> Self {
        RwiLock {
            inner: Mutex::new(LockInner {
                state: LockState::Unlocked,
                queue: VecDeque::new(),
                upgrade: None,
            }),
        }
    }

    pub fn state(&self) -> LockState {
        self.inner.lock().state
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == LockState::Unlocked && inner.queue.is_empty() && inner.upgrade.is_none()
    }

    /// Requests `mode`. Returns `true` when granted immediately. A denied
    /// request with a waiter is queued and the waiter is invoked exactly
    /// once, after this lock has been transitioned into the granted state;
    /// a denied request without a waiter is simply refused.
    pub fn lock(&self, mode: LockMode, waiter: Option<LockWaiter>) -> bool {
        let mut inner = self.inner.lock();
        if inner.queue.is_empty() && inner.upgrade.is_none() && compatible(inner.state, mode) {
            inner.state = granted(inner.state, mode);
            return true;
        }
        if let Some(waiter) = waiter {
            inner.queue.push_back((mode, waiter));
        }
        false
    }

    /// Converts the caller's Intent hold into a Write hold. Grants
    /// immediately when no readers remain; otherwise parks with priority
    /// over the FIFO queue and fires the waiter when the last reader
    /// unlocks. Only the intent holder may call this, and at most one
    /// upgrade can be outstanding.
    pub fn upgrade_intent_to_write(&self, waiter: Option<LockWaiter>) -> bool {
        let mut inner = self.inner.lock();
        debug_assert!(matches!(inner.state, LockState::Intent { .. }));
        debug_assert!(inner.upgrade.is_none());
        match inner.state {
            LockState::Intent { readers: 0 } => {
                inner.state = LockState::Write;
                true
            }
            LockState::Intent { .. } => {
                if let Some(waiter) = waiter {
                    inner.upgrade = Some(waiter);
                }
                false
            }
            _ => false,
        }
    }

    /// Withdraws a parked upgrade. Returns `true` when the upgrade was
    /// still pending (the caller keeps its Intent hold); `false` means the
    /// grant already fired and the caller now holds Write.
    pub fn cancel_upgrade(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.upgrade.take().is_some()
    }

    /// Releases one hold of `mode`, then grants the pending upgrade or as
    /// many queued requests as the new state admits. Waiters run after the
    /// internal mutex is dropped.
    pub fn unlock(&self, mode: LockMode) {
        let woken = {
            let mut inner = self.inner.lock();
            inner.state = released(inner.state, mode);
            drain(&mut inner)
        };
        for waiter in woken {
            waiter();
        }
    }
}

fn compatible(state: LockState, mode: LockMode) -> bool {
    match (state, mode) {
        (LockState::Unlocked, _) => true,
        (LockState::Read(_), LockMode::Read) => true,
        (LockState::Read(_), LockMode::Intent) => true,
        (LockState::Intent { .. }, LockMode::Read) => true,
        _ => false,
    }
}

fn granted(state: LockState, mode: LockMode) -> LockState {
    match (state, mode) {
        (LockState::Unlocked, LockMode::Read) => LockState::Read(1),
        (LockState::Unlocked, LockMode::Intent) => LockState::Intent { readers: 0 },
        (LockState::Unlocked, LockMode::Write) => LockState::Write,
        (LockState::Read(n), LockMode::Read) => LockState::Read(n + 1),
        (LockState::Read(n), LockMode::Intent) => LockState::Intent { readers: n },
        (LockState::Intent { readers }, LockMode::Read) => LockState::Intent {
            readers: readers + 1,
        },
        (state, mode) => unreachable!("grant of {:?} over {:?}", mode, state),
    }
}

fn released(state: LockState, mode: LockMode) -> LockState {
    match (state, mode) {
        (LockState::Read(1), LockMode::Read) => LockState::Unlocked,
        (LockState::Read(n), LockMode::Read) if n > 1 => LockState::Read(n - 1),
        (LockState::Intent { readers }, LockMode::Read) if readers > 0 => LockState::Intent {
            readers: readers - 1,
        },
        (LockState::Intent { readers: 0 }, LockMode::Intent) => LockState::Unlocked,
        (LockState::Intent { readers }, LockMode::Intent) => LockState::Read(readers),
        (LockState::Write, LockMode::Write) => LockState::Unlocked,
        (state, mode) => unreachable!("unlock of {:?} over {:?}", mode, state),
    }
}

fn drain(inner: &mut LockInner) -> Vec<LockWaiter> {
    let mut woken = Vec::new();
    if inner.upgrade.is_some() {
        if let LockState::Intent { readers: 0 } = inner.state {
            inner.state = LockState::Write;
            if let Some(waiter) = inner.upgrade.take() {
                woken.push(waiter);
            }
        }
        // Queue stays parked behind an unresolved upgrade.
        return woken;
    }
    while let Some((mode, _)) = inner.queue.front() {
        if !compatible(inner.state, *mode) {
            break;
        }
        let (mode, waiter) = match inner.queue.pop_front() {
            Some(entry) => entry,
            None => break,
        };
        inner.state = granted(inner.state, mode);
        woken.push(waiter);
    }
    woken
}

/// Read hold on one block. Dropping releases the share and wakes waiters.
pub struct ReadLockGuard {
    lock: Arc<RwiLock>,
}

impl ReadLockGuard {
    /// Wraps a Read hold that was already granted, either inline by
    /// [`RwiLock::lock`] or on the caller's behalf before its waiter ran.
    pub fn adopt(lock: Arc<RwiLock>) -> Self {
        ReadLockGuard { lock }
    }
}

impl Drop for ReadLockGuard {
    fn drop(&mut self) {
        self.lock.unlock(LockMode::Read);
    }
}

pub enum UpgradeOutcome {
    Upgraded(WriteLockGuard),
    /// Upgrade parked; the Intent hold persists and the waiter fires when
    /// the last reader drains. Adopt the Write hold at that point.
    Pending,
}

/// Intent hold on one block. The only way through to Write is
/// [`IntentGuard::upgrade`], which consumes the guard.
pub struct IntentGuard {
    lock: Arc<RwiLock>,
}

impl IntentGuard {
    pub fn adopt(lock: Arc<RwiLock>) -> Self {
        IntentGuard { lock }
    }

    pub fn upgrade(self, waiter: Option<LockWaiter>) -> UpgradeOutcome {
        let lock = self.into_lock();
        if lock.upgrade_intent_to_write(waiter) {
            UpgradeOutcome::Upgraded(WriteLockGuard { lock })
        } else {
            UpgradeOutcome::Pending
        }
    }

    fn into_lock(self) -> Arc<RwiLock> {
        let lock = self.lock.clone();
        std::mem::forget(self);
        lock
    }
}

impl Drop for IntentGuard {
    fn drop(&mut self) {
        self.lock.unlock(LockMode::Intent);
    }
}

/// Exclusive hold on one block.
pub struct WriteLockGuard {
    lock: Arc<RwiLock>,
}

impl WriteLockGuard {
    pub fn adopt(lock: Arc<RwiLock>) -> Self {
        WriteLockGuard { lock }
    }
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        self.lock.unlock(LockMode::Write);
    }
}

/// BlockId -> lock map shared by all operations on one tree.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<BlockId, Arc<RwiLock>>,
}

impl LockTable {
    pub fn new() -> Self {
        LockTable {
            locks: DashMap::new(),
        }
    }

    pub fn lock_for(&self, block_id: BlockId) -> Arc<RwiLock> {
        self.locks
            .entry(block_id)
            .or_insert_with(|| Arc::new(RwiLock::new()))
            .clone()
    }

    /// Drops the entry when nobody holds or waits on it. Safe to call
    /// after every release; a racing `lock_for` just re-creates the entry.
    pub fn prune(&self, block_id: BlockId) {
        self.locks
            .remove_if(&block_id, |_, lock| Arc::strong_count(lock) == 1 && lock.is_idle());
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn readers_share() {
        let lock = RwiLock::new();
        assert!(lock.lock(LockMode::Read, None));
        assert!(lock.lock(LockMode::Read, None));
        assert_eq!(lock.state(), LockState::Read(2));
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Read);
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn intent_admits_readers_but_not_intent_or_write() {
        let lock = RwiLock::new();
        assert!(lock.lock(LockMode::Intent, None));
        assert!(lock.lock(LockMode::Read, None));
        assert!(!lock.lock(LockMode::Intent, None));
        assert!(!lock.lock(LockMode::Write, None));
        assert_eq!(lock.state(), LockState::Intent { readers: 1 });
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Intent);
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn intent_over_readers_then_readers_drain() {
        let lock = RwiLock::new();
        assert!(lock.lock(LockMode::Read, None));
        assert!(lock.lock(LockMode::Read, None));
        assert!(lock.lock(LockMode::Intent, None));
        assert_eq!(lock.state(), LockState::Intent { readers: 2 });
        // Releasing the intent with readers still present demotes to Read.
        lock.unlock(LockMode::Intent);
        assert_eq!(lock.state(), LockState::Read(2));
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Read);
    }

    #[test]
    fn write_excludes_everything() {
        let lock = RwiLock::new();
        assert!(lock.lock(LockMode::Write, None));
        assert!(!lock.lock(LockMode::Read, None));
        assert!(!lock.lock(LockMode::Intent, None));
        assert!(!lock.lock(LockMode::Write, None));
        lock.unlock(LockMode::Write);
        assert!(lock.lock(LockMode::Read, None));
        lock.unlock(LockMode::Read);
    }

    #[test]
    fn queued_waiter_fires_after_state_transition() {
        let lock = Arc::new(RwiLock::new());
        assert!(lock.lock(LockMode::Write, None));
        let (tx, rx) = mpsc::channel();
        let observer = lock.clone();
        let granted = lock.lock(
            LockMode::Read,
            Some(Box::new(move || {
                tx.send(observer.state()).unwrap();
            })),
        );
        assert!(!granted);
        lock.unlock(LockMode::Write);
        // The waiter observed the already-granted state.
        assert_eq!(rx.recv().unwrap(), LockState::Read(1));
        lock.unlock(LockMode::Read);
    }

    #[test]
    fn queue_is_fifo_and_grants_batch_of_compatible_requests() {
        let lock = Arc::new(RwiLock::new());
        assert!(lock.lock(LockMode::Write, None));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            assert!(!lock.lock(
                LockMode::Read,
                Some(Box::new(move || order.lock().push(i)))
            ));
        }
        // A write parked behind the readers must not be granted with them.
        let write_fired = Arc::new(AtomicUsize::new(0));
        {
            let write_fired = write_fired.clone();
            assert!(!lock.lock(
                LockMode::Write,
                Some(Box::new(move || {
                    write_fired.fetch_add(1, Ordering::SeqCst);
                }))
            ));
        }
        lock.unlock(LockMode::Write);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(lock.state(), LockState::Read(3));
        assert_eq!(write_fired.load(Ordering::SeqCst), 0);
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Read);
        assert_eq!(write_fired.load(Ordering::SeqCst), 1);
        assert_eq!(lock.state(), LockState::Write);
        lock.unlock(LockMode::Write);
    }

    #[test]
    fn upgrade_waits_for_readers_and_beats_the_queue() {
        let lock = Arc::new(RwiLock::new());
        assert!(lock.lock(LockMode::Read, None));
        assert!(lock.lock(LockMode::Intent, None));

        let upgraded = Arc::new(AtomicUsize::new(0));
        {
            let upgraded = upgraded.clone();
            assert!(!lock.upgrade_intent_to_write(Some(Box::new(move || {
                upgraded.fetch_add(1, Ordering::SeqCst);
            }))));
        }
        // A reader arriving while the upgrade is parked must wait behind it.
        let late_reader = Arc::new(AtomicUsize::new(0));
        {
            let late_reader = late_reader.clone();
            assert!(!lock.lock(
                LockMode::Read,
                Some(Box::new(move || {
                    late_reader.fetch_add(1, Ordering::SeqCst);
                }))
            ));
        }

        lock.unlock(LockMode::Read);
        assert_eq!(upgraded.load(Ordering::SeqCst), 1);
        assert_eq!(lock.state(), LockState::Write);
        assert_eq!(late_reader.load(Ordering::SeqCst), 0);

        lock.unlock(LockMode::Write);
        assert_eq!(late_reader.load(Ordering::SeqCst), 1);
        lock.unlock(LockMode::Read);
    }

    #[test]
    fn immediate_upgrade_with_no_readers() {
        let lock = RwiLock::new();
        assert!(lock.lock(LockMode::Intent, None));
        assert!(lock.upgrade_intent_to_write(None));
        assert_eq!(lock.state(), LockState::Write);
        lock.unlock(LockMode::Write);
    }

    #[test]
    fn guards_release_on_drop() {
        let lock = Arc::new(RwiLock::new());
        assert!(lock.lock(LockMode::Intent, None));
        let guard = IntentGuard::adopt(lock.clone());
        match guard.upgrade(None) {
            UpgradeOutcome::Upgraded(write) => {
                assert_eq!(lock.state(), LockState::Write);
                drop(write);
            }
            UpgradeOutcome::Pending => panic!("no readers, upgrade must be immediate"),
        }
        assert_eq!(lock.state(), LockState::Unlocked);

        assert!(lock.lock(LockMode::Read, None));
        drop(ReadLockGuard::adopt(lock.clone()));
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn cancel_upgrade_keeps_intent() {
        let lock = Arc::new(RwiLock::new());
        assert!(lock.lock(LockMode::Read, None));
        assert!(lock.lock(LockMode::Intent, None));
        assert!(!lock.upgrade_intent_to_write(Some(Box::new(|| {}))));
        assert!(lock.cancel_upgrade());
        lock.unlock(LockMode::Read);
        // No grant fired; the holder still releases Intent normally.
        assert_eq!(lock.state(), LockState::Intent { readers: 0 });
        lock.unlock(LockMode::Intent);
        assert!(lock.is_idle());
    }

    #[test]
    fn table_prunes_idle_entries_only() {
        let table = LockTable::new();
        let lock = table.lock_for(7);
        assert!(lock.lock(LockMode::Read, None));
        drop(lock);
        table.prune(7);
        // Still held, so the entry survives.
        assert_eq!(table.len(), 1);
        table.lock_for(7).unlock(LockMode::Read);
        table.prune(7);
        assert!(table.is_empty());
    }
}
