//! Durability Modes
//!
//! What "confirmed" means for a waiting commit, and the per-transaction
//! setting that selects it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a standby has to confirm before a commit is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Standby has received and written the WAL
    Write,
    /// Standby has written and flushed the WAL to durable storage
    Flush,
}

impl WaitMode {
    /// Every mode, in queue index order
    pub const ALL: [WaitMode; 2] = [WaitMode::Write, WaitMode::Flush];

    pub(crate) fn index(self) -> usize {
        match self {
            WaitMode::Write => 0,
            WaitMode::Flush => 1,
        }
    }
}

impl std::fmt::Display for WaitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitMode::Write => write!(f, "write"),
            WaitMode::Flush => write!(f, "flush"),
        }
    }
}

/// Commit durability level requested by a transaction.
///
/// Deserialized through [`FromStr`], so configuration values are matched
/// case-insensitively and accept the boolean spellings of `on` and `off`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum SyncCommitLevel {
    /// Do not wait for the local flush either
    Off,
    /// Wait for the local flush only
    Local,
    /// Wait for the standby to write
    RemoteWrite,
    /// Wait for the standby to flush
    #[default]
    On,
}

impl TryFrom<String> for SyncCommitLevel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl SyncCommitLevel {
    /// The queue a commit at this level waits in, if any
    pub fn wait_mode(self) -> Option<WaitMode> {
        match self {
            SyncCommitLevel::RemoteWrite => Some(WaitMode::Write),
            SyncCommitLevel::On => Some(WaitMode::Flush),
            SyncCommitLevel::Off | SyncCommitLevel::Local => None,
        }
    }
}

impl FromStr for SyncCommitLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "false" | "no" | "0" => Ok(SyncCommitLevel::Off),
            "local" => Ok(SyncCommitLevel::Local),
            "remote_write" => Ok(SyncCommitLevel::RemoteWrite),
            "on" | "true" | "yes" | "1" => Ok(SyncCommitLevel::On),
            _ => Err(Error::InvalidCommitLevel(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncCommitLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommitLevel::Off => write!(f, "off"),
            SyncCommitLevel::Local => write!(f, "local"),
            SyncCommitLevel::RemoteWrite => write!(f, "remote_write"),
            SyncCommitLevel::On => write!(f, "on"),
        }
    }
}
