//! Backend Wait Entries
//!
//! Every backend that can commit owns one slot in a fixed table. The slot
//! carries its wait state, the position it waits for, its wake latch and
//! its pending interrupts.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::syncrep::latch::Latch;
use crate::syncrep::mode::{SyncCommitLevel, WaitMode};
use crate::syncrep::SharedState;

/// Index of a backend slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BackendId(pub usize);

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// Where a backend is in its commit wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum WaitState {
    /// Not in any queue
    NotWaiting = 0,
    /// Linked into a queue, blocked on its latch
    Waiting = 1,
    /// Detached and released by a standby; the backend resets it
    WaitComplete = 2,
}

impl WaitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WaitState::Waiting,
            2 => WaitState::WaitComplete,
            _ => WaitState::NotWaiting,
        }
    }
}

impl std::fmt::Display for WaitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitState::NotWaiting => write!(f, "NOT_WAITING"),
            WaitState::Waiting => write!(f, "WAITING"),
            WaitState::WaitComplete => write!(f, "WAIT_COMPLETE"),
        }
    }
}

/// Shared part of a backend slot.
///
/// `state` and `wait_lsn` are only written while holding the `SyncRep`
/// lock exclusively. Reads without the lock are optimistic.
#[derive(Debug, Default)]
pub(crate) struct ProcSlot {
    pub(crate) latch: Latch,
    /// Bumped every time the slot is freed, so stale interrupt handles
    /// never reach the next owner
    generation: AtomicU64,
    state: AtomicU8,
    wait_lsn: AtomicU64,
    die_pending: AtomicBool,
    cancel_pending: AtomicBool,
    output_suppressed: AtomicBool,
    in_signal_handler: AtomicBool,
}

impl ProcSlot {
    pub(crate) fn load_state(&self) -> WaitState {
        WaitState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn store_state(&self, state: WaitState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn wait_lsn(&self) -> Lsn {
        Lsn::new(self.wait_lsn.load(Ordering::Relaxed))
    }

    pub(crate) fn set_wait_lsn(&self, lsn: Lsn) {
        self.wait_lsn.store(lsn.as_u64(), Ordering::Relaxed);
    }

    pub(crate) fn die_pending(&self) -> bool {
        self.die_pending.load(Ordering::SeqCst)
    }

    pub(crate) fn set_die_pending(&self) {
        self.die_pending.store(true, Ordering::SeqCst);
    }

    /// Consume a pending cancel request
    pub(crate) fn take_cancel_pending(&self) -> bool {
        self.cancel_pending.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn cancel_pending(&self) -> bool {
        self.cancel_pending.load(Ordering::SeqCst)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn suppress_output(&self) {
        self.output_suppressed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn in_signal_handler(&self) -> bool {
        self.in_signal_handler.load(Ordering::SeqCst)
    }

    fn reset_for_reuse(&self) {
        self.store_state(WaitState::NotWaiting);
        self.set_wait_lsn(Lsn::INVALID);
        self.die_pending.store(false, Ordering::SeqCst);
        self.cancel_pending.store(false, Ordering::SeqCst);
        self.output_suppressed.store(false, Ordering::SeqCst);
        self.in_signal_handler.store(false, Ordering::SeqCst);
        self.latch.reset();
    }
}

/// Fixed table of backend slots plus supervisor liveness
#[derive(Debug)]
pub(crate) struct ProcArray {
    slots: Vec<Arc<ProcSlot>>,
    free: Mutex<Vec<usize>>,
    supervisor_alive: AtomicBool,
}

impl ProcArray {
    pub(crate) fn new(max_backends: usize) -> Self {
        Self {
            slots: (0..max_backends).map(|_| Arc::new(ProcSlot::default())).collect(),
            // Popped from the back, so the lowest slot is handed out first
            free: Mutex::new((0..max_backends).rev().collect()),
            supervisor_alive: AtomicBool::new(true),
        }
    }

    pub(crate) fn allocate(&self) -> Result<(BackendId, Arc<ProcSlot>)> {
        let index = self.free.lock().pop().ok_or(Error::NoFreeSlot {
            kind: "backend",
            limit: self.slots.len(),
        })?;
        let slot = Arc::clone(&self.slots[index]);
        slot.reset_for_reuse();
        Ok((BackendId(index), slot))
    }

    pub(crate) fn release(&self, id: BackendId) {
        let mut free = self.free.lock();
        if !free.contains(&id.0) {
            self.slots[id.0].generation.fetch_add(1, Ordering::SeqCst);
            free.push(id.0);
        }
    }

    pub(crate) fn get(&self, id: BackendId) -> &ProcSlot {
        &self.slots[id.0]
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.slots.len() - self.free.lock().len()
    }

    pub(crate) fn supervisor_alive(&self) -> bool {
        self.supervisor_alive.load(Ordering::SeqCst)
    }

    /// Record supervisor death and wake every backend so it notices
    pub(crate) fn mark_supervisor_dead(&self) {
        self.supervisor_alive.store(false, Ordering::SeqCst);
        for slot in &self.slots {
            slot.latch.set();
        }
    }
}

/// A registered backend: the exclusive owner of one wait entry.
///
/// Obtained from [`SyncRep::register_backend`](crate::syncrep::SyncRep::register_backend).
/// Dropping it unlinks the entry if it is still queued and frees the slot;
/// [`SyncRep::cleanup_at_exit`](crate::syncrep::SyncRep::cleanup_at_exit)
/// does the same explicitly.
#[derive(Debug)]
pub struct Backend {
    pub(crate) id: BackendId,
    pub(crate) proc: Arc<ProcSlot>,
    synchronous_commit: SyncCommitLevel,
    shared: Arc<RwLock<SharedState>>,
    procs: Arc<ProcArray>,
}

impl Backend {
    pub(crate) fn new(
        id: BackendId,
        proc: Arc<ProcSlot>,
        level: SyncCommitLevel,
        shared: Arc<RwLock<SharedState>>,
        procs: Arc<ProcArray>,
    ) -> Self {
        Self {
            id,
            proc,
            synchronous_commit: level,
            shared,
            procs,
        }
    }

    /// Slot index of this backend
    pub fn id(&self) -> BackendId {
        self.id
    }

    /// Durability level this backend's commits request
    pub fn synchronous_commit(&self) -> SyncCommitLevel {
        self.synchronous_commit
    }

    /// Change the durability level for subsequent commits
    pub fn set_synchronous_commit(&mut self, level: SyncCommitLevel) {
        self.synchronous_commit = level;
    }

    /// Current wait state (unlocked read)
    pub fn wait_state(&self) -> WaitState {
        self.proc.load_state()
    }

    /// Position currently waited for, invalid when not waiting
    pub fn wait_lsn(&self) -> Lsn {
        self.proc.wait_lsn()
    }

    /// Whether this backend has been marked for termination
    pub fn is_die_pending(&self) -> bool {
        self.proc.die_pending()
    }

    /// Whether output to the client has been shut off
    pub fn output_suppressed(&self) -> bool {
        self.proc.output_suppressed.load(Ordering::SeqCst)
    }

    /// Handle other threads use to interrupt this backend
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            id: self.id,
            generation: self.proc.generation(),
            proc: Arc::clone(&self.proc),
        }
    }

    /// Mark this backend as running inside the wake-up signal path.
    ///
    /// While the guard lives, commit waits return immediately instead of
    /// blocking on the latch the signal path itself would have to set.
    pub fn enter_signal_handler(&self) -> SignalHandlerGuard<'_> {
        self.proc.in_signal_handler.store(true, Ordering::SeqCst);
        SignalHandlerGuard { proc: &self.proc }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        // Linked exactly while WAITING; anything else needs no lock
        if self.proc.load_state() == WaitState::Waiting {
            let mut shared = self.shared.write();
            for mode in WaitMode::ALL {
                shared.queue_mut(mode).remove(self.id);
            }
            self.proc.store_state(WaitState::NotWaiting);
        }
        self.proc.set_wait_lsn(Lsn::INVALID);
        tracing::trace!("{} exited", self.id);
        self.procs.release(self.id);
    }
}

/// Clears the in-signal-handler mark on drop
pub struct SignalHandlerGuard<'a> {
    proc: &'a ProcSlot,
}

impl Drop for SignalHandlerGuard<'_> {
    fn drop(&mut self) {
        self.proc.in_signal_handler.store(false, Ordering::SeqCst);
    }
}

/// Cloneable handle for delivering interrupts to a backend.
///
/// A handle only reaches the backend it was taken from. Once that backend
/// exits, requests through the handle are dropped.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    id: BackendId,
    generation: u64,
    proc: Arc<ProcSlot>,
}

impl InterruptHandle {
    /// Backend this handle interrupts
    pub fn backend(&self) -> BackendId {
        self.id
    }

    /// Whether the backend this handle was taken from still owns the slot
    pub fn is_current(&self) -> bool {
        self.proc.generation() == self.generation
    }

    /// Request termination by administrator command. Returns false if the
    /// backend has already exited.
    pub fn request_shutdown(&self) -> bool {
        if !self.is_current() {
            tracing::debug!("{} has exited, dropping shutdown request", self.id);
            return false;
        }
        self.proc.set_die_pending();
        self.proc.latch.set();
        true
    }

    /// Request cancellation of the running statement. Returns false if the
    /// backend has already exited.
    pub fn request_cancel(&self) -> bool {
        if !self.is_current() {
            tracing::debug!("{} has exited, dropping cancel request", self.id);
            return false;
        }
        self.proc.cancel_pending.store(true, Ordering::SeqCst);
        self.proc.latch.set();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(procs: &Arc<ProcArray>, shared: &Arc<RwLock<SharedState>>) -> Backend {
        let (id, slot) = procs.allocate().unwrap();
        Backend::new(id, slot, SyncCommitLevel::On, Arc::clone(shared), Arc::clone(procs))
    }

    fn table(slots: usize) -> (Arc<ProcArray>, Arc<RwLock<SharedState>>) {
        (
            Arc::new(ProcArray::new(slots)),
            Arc::new(RwLock::new(SharedState::default())),
        )
    }

    #[test]
    fn test_allocate_lowest_slot_first_and_reuse() {
        let procs = ProcArray::new(2);
        let (a, _) = procs.allocate().unwrap();
        let (b, _) = procs.allocate().unwrap();
        assert_eq!((a, b), (BackendId(0), BackendId(1)));
        assert!(matches!(procs.allocate(), Err(Error::NoFreeSlot { limit: 2, .. })));

        procs.release(a);
        procs.release(a);
        assert_eq!(procs.in_use(), 1);
        assert_eq!(procs.allocate().unwrap().0, BackendId(0));
    }

    #[test]
    fn test_reuse_clears_interrupts() {
        let (procs, shared) = table(1);
        let backend = register(&procs, &shared);
        backend.interrupt_handle().request_shutdown();
        assert!(backend.is_die_pending());
        assert!(backend.proc.latch.is_set());

        drop(backend);
        let backend = register(&procs, &shared);
        assert!(!backend.is_die_pending());
        assert!(!backend.proc.latch.is_set());
    }

    #[test]
    fn test_drop_frees_slot() {
        let (procs, shared) = table(1);
        let backend = register(&procs, &shared);
        assert!(matches!(procs.allocate(), Err(Error::NoFreeSlot { .. })));

        drop(backend);
        assert_eq!(procs.in_use(), 0);
        let again = register(&procs, &shared);
        assert_eq!(again.id(), BackendId(0));
    }

    #[test]
    fn test_drop_unlinks_waiting_entry() {
        let (procs, shared) = table(2);
        let backend = register(&procs, &shared);
        let id = backend.id();
        {
            let mut shared = shared.write();
            backend.proc.set_wait_lsn(Lsn::new(10));
            backend.proc.store_state(WaitState::Waiting);
            shared.queue_mut(WaitMode::Flush).insert(id, Lsn::new(10));
        }

        drop(backend);
        assert!(!shared.read().queue(WaitMode::Flush).contains(id));
        assert_eq!(procs.get(id).load_state(), WaitState::NotWaiting);
        assert_eq!(procs.get(id).wait_lsn(), Lsn::INVALID);
    }

    #[test]
    fn test_stale_interrupt_handle_misses_next_owner() {
        let (procs, shared) = table(1);
        let first = register(&procs, &shared);
        let stale = first.interrupt_handle();
        assert!(stale.is_current());
        drop(first);
        assert!(!stale.is_current());

        let second = register(&procs, &shared);
        assert_eq!(second.id(), stale.backend());
        assert!(!stale.request_shutdown());
        assert!(!stale.request_cancel());
        assert!(!second.is_die_pending());
        assert!(!second.proc.cancel_pending());
        assert!(!second.proc.latch.is_set());

        assert!(second.interrupt_handle().request_shutdown());
        assert!(second.is_die_pending());
    }

    #[test]
    fn test_cancel_is_consumed_once() {
        let (procs, shared) = table(1);
        let backend = register(&procs, &shared);

        backend.interrupt_handle().request_cancel();
        assert!(backend.proc.cancel_pending());
        assert!(backend.proc.take_cancel_pending());
        assert!(!backend.proc.take_cancel_pending());
        assert!(!backend.proc.cancel_pending());
    }

    #[test]
    fn test_signal_handler_guard() {
        let (procs, shared) = table(1);
        let backend = register(&procs, &shared);
        {
            let _guard = backend.enter_signal_handler();
            assert!(backend.proc.in_signal_handler());
        }
        assert!(!backend.proc.in_signal_handler());
    }

    #[test]
    fn test_supervisor_death_sets_every_latch() {
        let procs = ProcArray::new(3);
        assert!(procs.supervisor_alive());
        procs.mark_supervisor_dead();
        assert!(!procs.supervisor_alive());
        assert!((0..3).all(|i| procs.get(BackendId(i)).latch.is_set()));
    }
}
