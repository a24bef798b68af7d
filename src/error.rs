//! syncrep Error Types

use thiserror::Error;

/// Result type alias for syncrep operations
pub type Result<T> = std::result::Result<T, Error>;

/// syncrep error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid value for synchronous_standby_names \"{value}\": {detail}")]
    ConfigSyntax { value: String, detail: String },

    #[error("Invalid synchronous_commit value: {0}")]
    InvalidCommitLevel(String),

    // Slot errors
    #[error("No free {kind} slot (limit {limit})")]
    NoFreeSlot { kind: &'static str, limit: usize },

    // Commit wait termination
    #[error(
        "canceling the wait for synchronous replication and terminating connection due to administrator command"
    )]
    AdministrativeShutdown,

    #[error("canceling the wait for synchronous replication: supervisor process is no longer running")]
    SupervisorDown,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means the backend must terminate.
    ///
    /// The transaction is already committed locally when these are
    /// returned; the caller must not report it as aborted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AdministrativeShutdown | Error::SupervisorDown)
    }

    /// Check if this error was caused by operator-supplied settings
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConfigParse(_)
                | Error::ConfigSyntax { .. }
                | Error::InvalidCommitLevel(_)
        )
    }
}
