//! syncrep Configuration
//!
//! This module provides configuration structures for the synchronous
//! replication coordinator.

use serde::{Deserialize, Serialize};

use crate::syncrep::{StandbyNames, SyncCommitLevel};

/// Main syncrep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRepConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Synchronous replication settings
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Role of this node in the deployment
    #[serde(default)]
    pub role: NodeRole,
}

/// Role of a node.
///
/// Decides how a waiting commit reacts to administrative shutdown and
/// whether it skips waiting when no standby is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Dispatches queries to segments
    Coordinator,
    /// Stores and serves data
    #[default]
    Segment,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Coordinator => write!(f, "coordinator"),
            NodeRole::Segment => write!(f, "segment"),
        }
    }
}

/// Synchronous replication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Default durability level of new backends
    #[serde(default)]
    pub synchronous_commit: SyncCommitLevel,

    /// Standbys eligible to become synchronous (empty disables waiting)
    #[serde(default)]
    pub synchronous_standby_names: String,

    /// Number of standby session slots (0 = synchronous replication off)
    #[serde(default = "default_max_wal_senders")]
    pub max_wal_senders: usize,

    /// Number of backend wait slots
    #[serde(default = "default_max_backends")]
    pub max_backends: usize,

    /// Lag in bytes under which a catching-up standby counts as active
    #[serde(default = "default_catchup_within_range")]
    pub catchup_within_range: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_max_wal_senders() -> usize {
    4
}

fn default_max_backends() -> usize {
    64
}

fn default_catchup_within_range() -> u64 {
    16 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            synchronous_commit: SyncCommitLevel::default(),
            synchronous_standby_names: String::new(),
            max_wal_senders: default_max_wal_senders(),
            max_backends: default_max_backends(),
            catchup_within_range: default_catchup_within_range(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SyncRepConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: SyncRepConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.replication.max_backends == 0 {
            return Err(crate::Error::Config(
                "replication.max_backends must be at least 1".into(),
            ));
        }

        StandbyNames::parse(&self.replication.synchronous_standby_names)?;

        Ok(())
    }

    /// Whether commits can wait for a standby at all
    pub fn sync_rep_enabled(&self) -> bool {
        self.replication.max_wal_senders > 0
            && self.replication.synchronous_commit.wait_mode().is_some()
    }

    /// Sample configuration written by `syncrep init`
    pub fn sample(node_id: &str, role: NodeRole) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.to_string(),
                role,
            },
            replication: ReplicationConfig {
                synchronous_standby_names: "standby1".to_string(),
                ..ReplicationConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }
}
