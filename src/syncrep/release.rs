//! Waiter release, driven by standby replies

use serde::Serialize;

use crate::syncrep::mode::WaitMode;
use crate::syncrep::proc::WaitState;
use crate::syncrep::standby::StandbyHandle;
use crate::syncrep::{SharedState, SyncRep};

/// What one call to [`SyncRep::release_waiters`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseSummary {
    /// Whether the calling session is the synchronous standby
    pub elected: bool,
    /// Backends released from the write queue
    pub released_write: usize,
    /// Backends released from the flush queue
    pub released_flush: usize,
}

impl ReleaseSummary {
    /// Total backends released
    pub fn released(&self) -> usize {
        self.released_write + self.released_flush
    }
}

impl SyncRep {
    /// Release every backend the session's reported positions satisfy.
    ///
    /// Only the elected synchronous standby releases anything. Other
    /// sessions remember to announce themselves if they get elected later.
    pub fn release_waiters(&self, handle: &StandbyHandle) -> ReleaseSummary {
        let (write, flush, priority, name) = {
            let slot = self.standbys[handle.slot].lock();
            if !slot.in_use
                || !slot.state.can_release()
                || slot.priority == 0
                || !slot.flush.is_valid()
            {
                return ReleaseSummary::default();
            }
            (slot.write, slot.flush, slot.priority, slot.application_name.clone())
        };

        let mut shared = self.shared.write();
        if self.elect() != Some(handle.slot) {
            drop(shared);
            self.standbys[handle.slot].lock().announce_next_takeover = true;
            return ReleaseSummary::default();
        }

        let mut summary = ReleaseSummary {
            elected: true,
            ..ReleaseSummary::default()
        };
        if shared.advance(WaitMode::Write, write) {
            summary.released_write = self.wake_queue(&mut shared, WaitMode::Write, false);
        }
        if shared.advance(WaitMode::Flush, flush) {
            summary.released_flush = self.wake_queue(&mut shared, WaitMode::Flush, false);
        }
        drop(shared);

        tracing::debug!(
            "released {} procs up to write {}, {} procs up to flush {}",
            summary.released_write,
            write,
            summary.released_flush,
            flush
        );

        let announce = std::mem::take(&mut self.standbys[handle.slot].lock().announce_next_takeover);
        if announce {
            tracing::info!(
                "standby \"{}\" is now the synchronous standby with priority {}",
                name,
                priority
            );
        }

        summary
    }

    /// Detach and wake waiters from the head of `mode`'s queue.
    ///
    /// With `all` unset only those at or below the mode's watermark are
    /// woken. Must be called with the sync rep lock held exclusively.
    pub(crate) fn wake_queue(&self, shared: &mut SharedState, mode: WaitMode, all: bool) -> usize {
        debug_assert!(shared.queue(mode).is_ordered(), "{} queue out of LSN order", mode);
        let upto = shared.watermark(mode);
        let mut woken = 0;
        for waiter in shared.queue_mut(mode).drain_satisfied(upto, all) {
            let proc = self.procs.get(waiter.backend);
            // State first: the waiter trusts WAIT_COMPLETE once it sees it
            proc.store_state(WaitState::WaitComplete);
            proc.latch.set();
            tracing::trace!("woke {} waiting for {} at {}", waiter.backend, mode, waiter.lsn);
            woken += 1;
        }
        woken
    }
}
