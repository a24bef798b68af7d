//! Commit Waiter
//!
//! Blocks a committing backend until the synchronous standby confirms its
//! commit position.
//!
//! A backend moves NOT_WAITING -> WAITING when it links itself into a queue.
//! A releasing standby session detaches it and sets WAIT_COMPLETE, then sets
//! its latch. The backend resets the state to NOT_WAITING on the way out.
//! A cancelled wait goes straight from WAITING back to NOT_WAITING.

use serde::Serialize;

use crate::config::NodeRole;
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::syncrep::mode::WaitMode;
use crate::syncrep::proc::{Backend, WaitState};
use crate::syncrep::SyncRep;

/// How a commit wait ended without the backend having to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitOutcome {
    /// Called from the wake-up signal path, which cannot block on itself
    InSignalHandler,
    /// The transaction did not ask for remote durability
    NotRequested,
    /// Coordinator with no streaming or nearly caught-up standby
    NoActiveStandby,
    /// No standby is eligible to become synchronous
    NoStandbysDefined,
    /// The position was already confirmed before queueing
    AlreadyConfirmed,
    /// The synchronous standby confirmed the position
    Confirmed,
    /// Shutdown was requested while waiting on a coordinator. The commit
    /// stands; the backend terminates once commit cleanup is done.
    ShutdownPending,
}

impl WaitOutcome {
    /// Whether the backend actually waited in a queue
    pub fn waited(self) -> bool {
        matches!(self, WaitOutcome::Confirmed | WaitOutcome::ShutdownPending)
    }
}

impl SyncRep {
    /// Wait until the synchronous standby has confirmed `lsn` at the
    /// durability level the backend requests.
    ///
    /// Returns an error only when the backend must terminate: on
    /// administrative shutdown of a non-coordinator, or when the supervisor
    /// is gone. The transaction is already committed locally in both cases.
    /// Whatever the outcome, the backend's entry is unlinked and back in
    /// NOT_WAITING when this returns.
    pub fn wait_for_lsn(&self, backend: &Backend, lsn: Lsn) -> Result<WaitOutcome> {
        let proc = &backend.proc;

        // The latch we would wait on is set from the signal path itself
        if proc.in_signal_handler() {
            tracing::debug!(
                "{}: canceling wait for synchronous replication as we are in the signal handler",
                backend.id
            );
            return Ok(WaitOutcome::InSignalHandler);
        }
        tracing::debug!("{}: commit LSN for synchronous replication is {}", backend.id, lsn);

        let Some(mode) = self.requested_mode(backend) else {
            return Ok(WaitOutcome::NotRequested);
        };

        {
            let mut shared = self.shared.write();
            debug_assert_eq!(proc.load_state(), WaitState::NotWaiting);

            if self.role == NodeRole::Coordinator && !self.any_standby_active() {
                tracing::debug!(
                    "{}: not waiting, no active synchronous standby connected",
                    backend.id
                );
                return Ok(WaitOutcome::NoActiveStandby);
            }

            // Checked under the same lock the gate clears it with, so a
            // waiter can never join a queue that was just flushed for good
            if !shared.standbys_defined {
                return Ok(WaitOutcome::NoStandbysDefined);
            }

            let confirmed = shared.watermark(mode);
            if lsn <= confirmed {
                tracing::debug!(
                    "{}: not waiting, {} already replicated up to {}",
                    backend.id,
                    mode,
                    confirmed
                );
                return Ok(WaitOutcome::AlreadyConfirmed);
            }

            proc.set_wait_lsn(lsn);
            proc.store_state(WaitState::Waiting);
            shared.queue_mut(mode).insert(backend.id, lsn);
        }
        tracing::debug!("{}: waiting for {} replication of {}", backend.id, mode, lsn);

        let outcome = self.wait_until_released(backend, mode);

        // Unlinked by whoever ended the wait, so no lock needed: releasers
        // ignore entries that are not queued
        debug_assert!(!self.is_queued(backend.id));
        proc.store_state(WaitState::NotWaiting);
        proc.set_wait_lsn(Lsn::INVALID);

        outcome
    }

    fn requested_mode(&self, backend: &Backend) -> Option<WaitMode> {
        if self.max_wal_senders == 0 {
            return None;
        }
        backend.synchronous_commit().wait_mode()
    }

    fn wait_until_released(&self, backend: &Backend, mode: WaitMode) -> Result<WaitOutcome> {
        let proc = &backend.proc;
        loop {
            // Reset before testing state, so a release after the test is
            // still seen by the wait below
            proc.latch.reset();

            // A stale WAITING is possible without the lock; WAIT_COMPLETE is
            // final once seen, since nothing writes the state after it
            let mut state = proc.load_state();
            if state == WaitState::Waiting {
                let _shared = self.shared.read();
                state = proc.load_state();
            }
            if state == WaitState::WaitComplete {
                tracing::debug!("{}: synchronous replication wait complete", backend.id);
                return Ok(WaitOutcome::Confirmed);
            }

            // Neither acknowledging nor failing the commit is right here: it
            // is committed locally but maybe not replicated. Stop talking to
            // the client and leave the die request pending.
            if proc.die_pending() {
                proc.suppress_output();
                self.cancel_wait(backend, mode);
                return match self.role {
                    NodeRole::Coordinator => {
                        tracing::warn!(
                            "{}: canceling the wait for synchronous replication and terminating connection due to administrator command; \
                             the transaction has already committed locally, but might not have been replicated to the standby",
                            backend.id
                        );
                        Ok(WaitOutcome::ShutdownPending)
                    }
                    NodeRole::Segment => {
                        tracing::error!(
                            "{}: canceling the wait for synchronous replication and terminating connection due to administrator command; \
                             the transaction has already committed locally, but might not have been replicated to the standby",
                            backend.id
                        );
                        Err(Error::AdministrativeShutdown)
                    }
                };
            }

            if proc.take_cancel_pending() {
                tracing::warn!(
                    "{}: ignoring query cancel request for synchronous replication to ensure cluster consistency; \
                     the transaction has already changed locally, it has to be replicated to standby",
                    backend.id
                );
            }

            // Without the supervisor no standby session will ever reply
            if !self.procs.supervisor_alive() {
                proc.set_die_pending();
                proc.suppress_output();
                self.cancel_wait(backend, mode);
                tracing::error!(
                    "{}: supervisor process died while waiting for synchronous replication",
                    backend.id
                );
                return Err(Error::SupervisorDown);
            }

            tracing::trace!("{}: still waiting, sleeping on latch", backend.id);
            proc.latch.wait();
        }
    }

    /// Detach the backend and reset it to NOT_WAITING
    fn cancel_wait(&self, backend: &Backend, mode: WaitMode) {
        let mut shared = self.shared.write();
        shared.queue_mut(mode).remove(backend.id);
        backend.proc.store_state(WaitState::NotWaiting);
    }

    /// Give a backend's slot back, unlinking it first if it is still queued.
    ///
    /// Same as dropping the backend.
    pub fn cleanup_at_exit(&self, backend: Backend) {
        tracing::trace!("{}: cleaning up at exit", backend.id);
        drop(backend);
    }
}
