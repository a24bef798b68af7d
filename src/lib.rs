//! syncrep - Synchronous Replication Commit Wait
//!
//! The primary-side half of synchronous streaming replication: committing
//! backends block until a standby confirms it has written or flushed their
//! commit record, and standby sessions release them as their replies arrive.
//!
//! # Architecture
//!
//! One process-wide [`SyncRep`] owns two position-ordered wait queues (one
//! per durability mode), the confirmed watermarks, and a fixed table of
//! backend wait slots and standby session slots. Backends block on their own
//! latch; the elected synchronous standby wakes them under a single lock.
//!
//! # Features
//!
//! - `remote_write` and `on` commit levels, waiting for write or flush
//! - Lowest-priority election among streaming standbys, recomputed per reply
//! - Configuration gate that releases every waiter when standbys go away
//! - Coordinator and segment roles with their shutdown semantics
//! - Serializable state snapshots and an in-process simulation

pub mod config;
pub mod error;
pub mod lsn;
pub mod simulator;
pub mod syncrep;

pub use config::SyncRepConfig;
pub use error::{Error, Result};
pub use syncrep::SyncRep;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{NodeRole, ReplicationConfig, SyncRepConfig};
    pub use crate::error::{Error, Result};
    pub use crate::lsn::Lsn;
    pub use crate::syncrep::{
        Backend, ReleaseSummary, StandbyHandle, SyncCommitLevel, SyncRep, WaitMode, WaitOutcome,
        WalSndState,
    };
}
