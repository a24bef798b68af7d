//! Configuration gate
//!
//! Tracks whether any standby is eligible. Waiters only join a queue while
//! the gate is open; closing it releases everyone already queued.

use crate::error::Result;
use crate::syncrep::mode::WaitMode;
use crate::syncrep::names::StandbyNames;
use crate::syncrep::SyncRep;

impl SyncRep {
    /// Apply a new `synchronous_standby_names` value.
    ///
    /// A value that does not parse is treated as an empty list: the gate
    /// closes and queued waiters are released, then the error is returned.
    pub fn set_standby_names(&self, raw: &str) -> Result<()> {
        let (names, result) = match StandbyNames::parse(raw) {
            Ok(names) => (names, Ok(())),
            Err(e) => {
                tracing::error!("invalid synchronous_standby_names, treating as empty: {}", e);
                (StandbyNames::default(), Err(e))
            }
        };

        // Names lock first, held across the update, so concurrent reloads
        // cannot leave the flag out of step with the list
        let mut current = self.names.lock();
        let defined = !names.is_empty();
        *current = names;
        self.update_standbys_defined(defined);
        drop(current);

        result
    }

    /// Publish whether standbys are defined. Returns how many waiters were
    /// released by closing the gate.
    pub(crate) fn update_standbys_defined(&self, defined: bool) -> usize {
        let mut shared = self.shared.write();
        if shared.standbys_defined == defined {
            return 0;
        }

        // Release everyone before closing, all under one hold of the lock,
        // so no backend is left queued with nothing to release it
        let mut released = 0;
        if !defined {
            for mode in WaitMode::ALL {
                released += self.wake_queue(&mut shared, mode, true);
            }
        }
        shared.standbys_defined = defined;
        drop(shared);

        if defined {
            tracing::info!("synchronous standbys defined, commits will wait for replication");
        } else {
            tracing::info!(
                "synchronous standbys no longer defined, released {} waiting backends",
                released
            );
        }
        released
    }

    /// Whether any standby is currently eligible
    pub fn standbys_defined(&self) -> bool {
        self.shared.read().standbys_defined
    }

    /// Currently applied standby names
    pub fn standby_names(&self) -> StandbyNames {
        self.names.lock().clone()
    }
}
