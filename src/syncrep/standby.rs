//! Standby Sessions
//!
//! One record per connected standby, written by the process serving that
//! standby and scanned by every release to find the synchronous one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::syncrep::SyncRep;

/// Election priority of every eligible standby.
///
/// A single constant priority means at most one standby is ever treated
/// as synchronous: the first eligible one in slot order.
pub const STANDBY_PRIORITY: u32 = 1;

/// Replication state of a standby session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSndState {
    /// Connection established, replication not started
    Starting,
    /// Streaming history the standby is missing
    CatchingUp,
    /// Caught up and streaming new WAL
    Streaming,
    /// Shutting down after sending the final WAL
    Stopping,
    /// Disconnected
    Down,
}

impl WalSndState {
    /// States from which a session may release waiters
    pub fn can_release(self) -> bool {
        matches!(self, WalSndState::Streaming | WalSndState::Stopping)
    }
}

impl std::fmt::Display for WalSndState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalSndState::Starting => write!(f, "STARTING"),
            WalSndState::CatchingUp => write!(f, "CATCHUP"),
            WalSndState::Streaming => write!(f, "STREAMING"),
            WalSndState::Stopping => write!(f, "STOPPING"),
            WalSndState::Down => write!(f, "DOWN"),
        }
    }
}

/// Per-session record, guarded by its own mutex
#[derive(Debug)]
pub(crate) struct StandbySlot {
    pub(crate) in_use: bool,
    pub(crate) application_name: String,
    pub(crate) priority: u32,
    pub(crate) state: WalSndState,
    pub(crate) write: Lsn,
    pub(crate) flush: Lsn,
    pub(crate) caught_up_within_range: bool,
    pub(crate) announce_next_takeover: bool,
    pub(crate) connected_at: Option<DateTime<Utc>>,
}

impl StandbySlot {
    pub(crate) fn vacant() -> Self {
        Self {
            in_use: false,
            application_name: String::new(),
            priority: 0,
            state: WalSndState::Down,
            write: Lsn::INVALID,
            flush: Lsn::INVALID,
            caught_up_within_range: false,
            announce_next_takeover: true,
            connected_at: None,
        }
    }

    /// Whether this session can satisfy a coordinator's wait soon
    pub(crate) fn is_active(&self) -> bool {
        self.in_use
            && (self.state == WalSndState::Streaming
                || (self.state == WalSndState::CatchingUp && self.caught_up_within_range))
    }

    /// Whether this session may take part in the election
    pub(crate) fn is_candidate(&self) -> bool {
        self.in_use && self.state.can_release() && self.priority > 0 && self.flush.is_valid()
    }

    pub(crate) fn info(&self, slot: usize, elected: bool) -> StandbyInfo {
        StandbyInfo {
            slot,
            application_name: self.application_name.clone(),
            state: self.state,
            priority: self.priority,
            write: self.write,
            flush: self.flush,
            caught_up_within_range: self.caught_up_within_range,
            elected,
            connected_at: self.connected_at,
        }
    }
}

/// Ownership token for a connected standby session.
///
/// Handed out by [`SyncRep::connect_standby`] and consumed by
/// [`SyncRep::disconnect_standby`].
#[derive(Debug)]
pub struct StandbyHandle {
    pub(crate) slot: usize,
    application_name: String,
}

impl StandbyHandle {
    /// Slot index of this session
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Name the standby connected with
    pub fn application_name(&self) -> &str {
        &self.application_name
    }
}

/// Point-in-time view of a standby session
#[derive(Debug, Clone, Serialize)]
pub struct StandbyInfo {
    pub slot: usize,
    pub application_name: String,
    pub state: WalSndState,
    pub priority: u32,
    pub write: Lsn,
    pub flush: Lsn,
    pub caught_up_within_range: bool,
    pub elected: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

impl SyncRep {
    /// Register a newly connected standby in the first free slot
    pub fn connect_standby(&self, application_name: &str) -> Result<StandbyHandle> {
        let slot = self
            .standbys
            .iter()
            .position(|s| {
                let mut s = s.lock();
                if s.in_use {
                    return false;
                }
                *s = StandbySlot::vacant();
                s.in_use = true;
                s.application_name = application_name.to_string();
                s.state = WalSndState::Starting;
                s.connected_at = Some(Utc::now());
                true
            })
            .ok_or(Error::NoFreeSlot {
                kind: "standby",
                limit: self.standbys.len(),
            })?;

        let handle = StandbyHandle {
            slot,
            application_name: application_name.to_string(),
        };
        tracing::info!("standby \"{}\" connected in slot {}", application_name, slot);
        self.init_config(&handle);
        Ok(handle)
    }

    /// Free a session's slot
    pub fn disconnect_standby(&self, handle: StandbyHandle) {
        *self.standbys[handle.slot].lock() = StandbySlot::vacant();
        tracing::info!(
            "standby \"{}\" disconnected from slot {}",
            handle.application_name,
            handle.slot
        );
    }

    /// (Re)compute the session's election priority from configuration
    pub fn init_config(&self, handle: &StandbyHandle) {
        let priority = self.standby_priority();
        let changed = {
            let mut slot = self.standbys[handle.slot].lock();
            let changed = slot.priority != priority;
            slot.priority = priority;
            changed
        };
        if changed {
            tracing::debug!(
                "standby \"{}\" now has synchronous standby priority {}",
                handle.application_name,
                priority
            );
        }
    }

    /// Priority a standby gets when it is not matched by name.
    ///
    /// At most one standby is streaming at a time in this design, so every
    /// session gets the same constant priority.
    pub(crate) fn standby_priority(&self) -> u32 {
        STANDBY_PRIORITY
    }

    /// Record a state transition reported by the transport
    pub fn set_standby_state(&self, handle: &StandbyHandle, state: WalSndState) {
        let previous = {
            let mut slot = self.standbys[handle.slot].lock();
            std::mem::replace(&mut slot.state, state)
        };
        if previous != state {
            tracing::debug!(
                "standby \"{}\" state {} -> {}",
                handle.application_name,
                previous,
                state
            );
        }
    }

    /// Record the write and flush positions the standby reported
    pub fn report_positions(&self, handle: &StandbyHandle, write: Lsn, flush: Lsn) {
        let mut slot = self.standbys[handle.slot].lock();
        slot.write = write;
        slot.flush = flush;
        tracing::trace!(
            "standby \"{}\" reports write {} flush {}",
            handle.application_name,
            write,
            flush
        );
    }

    /// Record how far the standby still lags behind while catching up
    pub fn report_catchup_lag(&self, handle: &StandbyHandle, lag_bytes: u64) {
        let within = lag_bytes <= self.catchup_within_range();
        self.standbys[handle.slot].lock().caught_up_within_range = within;
    }

    /// Record a reply from the standby and release whatever it confirms
    pub fn process_reply(
        &self,
        handle: &StandbyHandle,
        write: Lsn,
        flush: Lsn,
    ) -> crate::syncrep::ReleaseSummary {
        self.report_positions(handle, write, flush);
        self.release_waiters(handle)
    }

    /// Whether any session could satisfy a commit wait soon
    pub(crate) fn any_standby_active(&self) -> bool {
        self.standbys.iter().any(|s| s.lock().is_active())
    }

    /// Slot of the session currently allowed to release waiters: the lowest
    /// positive priority among candidates, first in slot order on ties.
    pub(crate) fn elect(&self) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (i, slot) in self.standbys.iter().enumerate() {
            let slot = slot.lock();
            if slot.is_candidate() && best.map_or(true, |(_, p)| p > slot.priority) {
                best = Some((i, slot.priority));
            }
        }
        best.map(|(i, _)| i)
    }
}
