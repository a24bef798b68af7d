//! Synchronous Replication Module
//!
//! Commits that request remote durability wait here until the synchronous
//! standby confirms their WAL position. All waiting and releasing logic
//! lives on the primary; standbys only report how far they have written
//! and flushed.
//!
//! A single lock guards both wait queues, both watermarks and the
//! "standbys defined" flag. Per-backend wait state is written under that
//! lock and signalled through the backend's own latch.

mod gate;
pub mod latch;
pub mod mode;
pub mod names;
pub mod proc;
pub mod queue;
mod release;
pub mod standby;
mod waiter;

pub use latch::Latch;
pub use mode::{SyncCommitLevel, WaitMode};
pub use names::StandbyNames;
pub use proc::{Backend, BackendId, InterruptHandle, SignalHandlerGuard, WaitState};
pub use queue::{QueuedWaiter, WaitQueue};
pub use release::ReleaseSummary;
pub use standby::{StandbyHandle, StandbyInfo, WalSndState, STANDBY_PRIORITY};
pub use waiter::WaitOutcome;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::{NodeRole, ReplicationConfig, SyncRepConfig};
use crate::error::Result;
use crate::lsn::Lsn;
use proc::ProcArray;
use standby::StandbySlot;

/// State guarded by the sync rep lock
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    /// One queue per wait mode
    queues: [WaitQueue; 2],
    /// Highest position confirmed by the synchronous standby, per mode
    lsn: [Lsn; 2],
    /// Whether any standby is eligible; waiters may only join while set
    standbys_defined: bool,
}

impl SharedState {
    fn queue(&self, mode: WaitMode) -> &WaitQueue {
        &self.queues[mode.index()]
    }

    fn queue_mut(&mut self, mode: WaitMode) -> &mut WaitQueue {
        &mut self.queues[mode.index()]
    }

    fn watermark(&self, mode: WaitMode) -> Lsn {
        self.lsn[mode.index()]
    }

    /// Move the watermark forward. Returns false if `lsn` is not ahead.
    fn advance(&mut self, mode: WaitMode, lsn: Lsn) -> bool {
        let current = &mut self.lsn[mode.index()];
        if *current < lsn {
            *current = lsn;
            true
        } else {
            false
        }
    }
}

/// Process-wide synchronous replication coordinator
#[derive(Debug)]
pub struct SyncRep {
    role: NodeRole,
    max_wal_senders: usize,
    catchup_within_range: AtomicU64,
    default_level: RwLock<SyncCommitLevel>,
    shared: Arc<RwLock<SharedState>>,
    procs: Arc<ProcArray>,
    standbys: Vec<Mutex<StandbySlot>>,
    names: Mutex<StandbyNames>,
}

impl SyncRep {
    /// Create the coordinator from the replication settings
    pub fn new(role: NodeRole, config: &ReplicationConfig) -> Result<Self> {
        let names = StandbyNames::parse(&config.synchronous_standby_names)?;
        let shared = SharedState {
            standbys_defined: !names.is_empty(),
            ..SharedState::default()
        };

        tracing::debug!(
            "synchronous replication initialised: role {}, {} standby slots, {} backend slots",
            role,
            config.max_wal_senders,
            config.max_backends
        );

        Ok(Self {
            role,
            max_wal_senders: config.max_wal_senders,
            catchup_within_range: AtomicU64::new(config.catchup_within_range),
            default_level: RwLock::new(config.synchronous_commit),
            shared: Arc::new(RwLock::new(shared)),
            procs: Arc::new(ProcArray::new(config.max_backends)),
            standbys: (0..config.max_wal_senders)
                .map(|_| Mutex::new(StandbySlot::vacant()))
                .collect(),
            names: Mutex::new(names),
        })
    }

    /// Create the coordinator from a full configuration
    pub fn from_config(config: &SyncRepConfig) -> Result<Self> {
        Self::new(config.node.role, &config.replication)
    }

    /// Role of this process in the deployment
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Number of standby session slots
    pub fn max_wal_senders(&self) -> usize {
        self.max_wal_senders
    }

    /// Lag in bytes under which a catching-up standby counts as active
    pub fn catchup_within_range(&self) -> u64 {
        self.catchup_within_range.load(Ordering::Relaxed)
    }

    /// Level given to newly registered backends
    pub fn default_commit_level(&self) -> SyncCommitLevel {
        *self.default_level.read()
    }

    /// Confirmed watermark for a mode
    pub fn watermark(&self, mode: WaitMode) -> Lsn {
        self.shared.read().watermark(mode)
    }

    /// Number of backends waiting in a mode's queue
    pub fn queue_len(&self, mode: WaitMode) -> usize {
        self.shared.read().queue(mode).len()
    }

    /// Positions currently queued for a mode, head first
    pub fn queued_positions(&self, mode: WaitMode) -> Vec<QueuedWaiter> {
        self.shared.read().queue(mode).iter().copied().collect()
    }

    /// Whether a backend is linked into any queue
    pub fn is_queued(&self, backend: BackendId) -> bool {
        let shared = self.shared.read();
        WaitMode::ALL
            .iter()
            .any(|&mode| shared.queue(mode).contains(backend))
    }

    /// Register a backend that may wait for commits.
    ///
    /// The backend starts with the configured default commit level. Its
    /// slot is freed when it is dropped.
    pub fn register_backend(&self) -> Result<Backend> {
        let (id, proc) = self.procs.allocate()?;
        tracing::trace!("{} registered", id);
        Ok(Backend::new(
            id,
            proc,
            self.default_commit_level(),
            Arc::clone(&self.shared),
            Arc::clone(&self.procs),
        ))
    }

    /// Number of registered backends
    pub fn backends_in_use(&self) -> usize {
        self.procs.in_use()
    }

    /// Number of backend slots
    pub fn max_backends(&self) -> usize {
        self.procs.capacity()
    }

    /// Record that the supervising process has died.
    ///
    /// Every blocked waiter is woken and fails its wait.
    pub fn mark_supervisor_dead(&self) {
        tracing::error!("supervisor process is gone, waking all commit waiters");
        self.procs.mark_supervisor_dead();
    }

    /// Whether the supervising process is still alive
    pub fn supervisor_alive(&self) -> bool {
        self.procs.supervisor_alive()
    }

    /// Re-apply replication settings after a configuration reload
    pub fn reload(&self, config: &ReplicationConfig) -> Result<()> {
        *self.default_level.write() = config.synchronous_commit;
        self.catchup_within_range
            .store(config.catchup_within_range, Ordering::Relaxed);
        let applied = self.set_standby_names(&config.synchronous_standby_names);

        let priority = self.standby_priority();
        for (i, slot) in self.standbys.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.in_use && slot.priority != priority {
                slot.priority = priority;
                tracing::debug!(
                    "standby \"{}\" in slot {} now has synchronous standby priority {}",
                    slot.application_name,
                    i,
                    priority
                );
            }
        }

        applied
    }

    /// Serializable view of the current state. The elected standby is
    /// recomputed for this call.
    pub fn snapshot(&self) -> SyncRepSnapshot {
        let standby_names = self.names.lock().to_vec();
        let shared = self.shared.read();
        let elected = self.elect();
        let standbys = self
            .standbys
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let slot = slot.lock();
                slot.in_use.then(|| slot.info(i, elected == Some(i)))
            })
            .collect();

        SyncRepSnapshot {
            role: self.role,
            standbys_defined: shared.standbys_defined,
            standby_names,
            write_lsn: shared.watermark(WaitMode::Write),
            flush_lsn: shared.watermark(WaitMode::Flush),
            write_waiters: shared.queue(WaitMode::Write).len(),
            flush_waiters: shared.queue(WaitMode::Flush).len(),
            backends: self.procs.in_use(),
            standbys,
        }
    }
}

/// Point-in-time view of the synchronous replication state
#[derive(Debug, Clone, Serialize)]
pub struct SyncRepSnapshot {
    pub role: NodeRole,
    pub standbys_defined: bool,
    pub standby_names: Vec<String>,
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub write_waiters: usize,
    pub flush_waiters: usize,
    pub backends: usize,
    pub standbys: Vec<StandbyInfo>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Coordinator with four standby slots and eight backend slots
    pub(crate) fn sync_rep(role: NodeRole, names: &str) -> SyncRep {
        let config = ReplicationConfig {
            synchronous_standby_names: names.to_string(),
            max_wal_senders: 4,
            max_backends: 8,
            ..ReplicationConfig::default()
        };
        SyncRep::new(role, &config).unwrap()
    }

    /// Connected session in the streaming state with the given positions
    pub(crate) fn streaming(rep: &SyncRep, name: &str, write: u64, flush: u64) -> StandbyHandle {
        let handle = rep.connect_standby(name).unwrap();
        rep.set_standby_state(&handle, WalSndState::Streaming);
        rep.report_positions(&handle, Lsn::new(write), Lsn::new(flush));
        handle
    }

    /// Poll until `cond` holds, panicking after a few seconds
    pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Link a fresh backend into `mode`'s queue as if it were waiting
    fn enqueue(rep: &SyncRep, mode: WaitMode, lsn: u64) -> Backend {
        let backend = rep.register_backend().unwrap();
        let mut shared = rep.shared.write();
        backend.proc.set_wait_lsn(Lsn::new(lsn));
        backend.proc.store_state(WaitState::Waiting);
        shared.queue_mut(mode).insert(backend.id(), Lsn::new(lsn));
        backend
    }

    #[test]
    fn test_new_rejects_bad_standby_list() {
        let config = ReplicationConfig {
            synchronous_standby_names: "a,,b".into(),
            ..ReplicationConfig::default()
        };
        assert!(SyncRep::new(NodeRole::Segment, &config).is_err());
    }

    #[test]
    fn test_wake_releases_satisfied_prefix_in_order() {
        let rep = sync_rep(NodeRole::Segment, "s1");
        let b100 = enqueue(&rep, WaitMode::Flush, 100);
        let b50 = enqueue(&rep, WaitMode::Flush, 50);
        let b80 = enqueue(&rep, WaitMode::Flush, 80);

        let order: Vec<u64> = rep
            .queued_positions(WaitMode::Flush)
            .iter()
            .map(|w| w.lsn.as_u64())
            .collect();
        assert_eq!(order, vec![50, 80, 100]);

        let woken = {
            let mut shared = rep.shared.write();
            shared.advance(WaitMode::Flush, Lsn::new(80));
            rep.wake_queue(&mut shared, WaitMode::Flush, false)
        };
        assert_eq!(woken, 2);
        assert_eq!(b50.wait_state(), WaitState::WaitComplete);
        assert_eq!(b80.wait_state(), WaitState::WaitComplete);
        assert!(b50.proc.latch.is_set());
        assert_eq!(b100.wait_state(), WaitState::Waiting);
        assert!(!b100.proc.latch.is_set());
        assert_eq!(rep.queued_positions(WaitMode::Flush)[0].backend, b100.id());
    }

    #[test]
    fn test_wake_all_empties_queue() {
        let rep = sync_rep(NodeRole::Segment, "s1");
        let waiters: Vec<_> = [30, 10, 20]
            .iter()
            .map(|&lsn| enqueue(&rep, WaitMode::Write, lsn))
            .collect();

        let woken = {
            let mut shared = rep.shared.write();
            rep.wake_queue(&mut shared, WaitMode::Write, true)
        };
        assert_eq!(woken, 3);
        assert_eq!(rep.queue_len(WaitMode::Write), 0);
        assert!(waiters
            .iter()
            .all(|b| b.wait_state() == WaitState::WaitComplete));
    }

    #[test]
    fn test_watermark_never_moves_back() {
        let rep = sync_rep(NodeRole::Segment, "s1");
        let mut shared = rep.shared.write();
        assert!(shared.advance(WaitMode::Write, Lsn::new(200)));
        assert!(!shared.advance(WaitMode::Write, Lsn::new(150)));
        assert!(!shared.advance(WaitMode::Write, Lsn::new(200)));
        assert_eq!(shared.watermark(WaitMode::Write), Lsn::new(200));
        assert_eq!(shared.watermark(WaitMode::Flush), Lsn::INVALID);
    }

    #[test]
    fn test_flush_report_releases_blocked_waiter() {
        let rep = Arc::new(sync_rep(NodeRole::Segment, "s1"));
        let standby = streaming(&rep, "s1", 150, 150);
        assert!(rep.release_waiters(&standby).elected);
        assert_eq!(rep.watermark(WaitMode::Flush), Lsn::new(150));

        let backend = rep.register_backend().unwrap();
        let id = backend.id();
        let waiter = {
            let rep = Arc::clone(&rep);
            thread::spawn(move || {
                let outcome = rep.wait_for_lsn(&backend, Lsn::new(200)).unwrap();
                (outcome, backend)
            })
        };

        wait_until(|| rep.is_queued(id));
        let summary = rep.process_reply(&standby, Lsn::new(200), Lsn::new(200));
        assert_eq!(summary.released_flush, 1);
        assert_eq!(rep.watermark(WaitMode::Flush), Lsn::new(200));

        let (outcome, backend) = waiter.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Confirmed);
        assert_eq!(backend.wait_state(), WaitState::NotWaiting);
        assert_eq!(backend.wait_lsn(), Lsn::INVALID);
        assert!(!rep.is_queued(id));
    }

    #[test]
    fn test_snapshot_reports_elected_standby() {
        let rep = sync_rep(NodeRole::Segment, "s1, s2");
        let _a = streaming(&rep, "s1", 10, 10);
        let _b = streaming(&rep, "s2", 20, 20);

        let snapshot = rep.snapshot();
        assert!(snapshot.standbys_defined);
        assert_eq!(snapshot.standby_names, vec!["s1", "s2"]);
        assert_eq!(snapshot.standbys.len(), 2);
        assert!(snapshot.standbys[0].elected);
        assert!(!snapshot.standbys[1].elected);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["standbys"][0]["state"], "streaming");
        assert_eq!(json["role"], "segment");
    }

    #[test]
    fn test_reload_applies_defaults_and_names() {
        let rep = sync_rep(NodeRole::Segment, "s1");
        let config = ReplicationConfig {
            synchronous_commit: SyncCommitLevel::RemoteWrite,
            synchronous_standby_names: String::new(),
            catchup_within_range: 42,
            ..ReplicationConfig::default()
        };
        rep.reload(&config).unwrap();

        assert_eq!(rep.default_commit_level(), SyncCommitLevel::RemoteWrite);
        assert_eq!(rep.catchup_within_range(), 42);
        assert!(!rep.standbys_defined());
        assert_eq!(
            rep.register_backend().unwrap().synchronous_commit(),
            SyncCommitLevel::RemoteWrite
        );
    }
}
