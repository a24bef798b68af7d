//! syncrep - Synchronous Replication Commit Wait
//!
//! Command-line front end: configuration management and an in-process
//! simulation of a primary with committing backends and standbys.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncrep::config::{NodeRole, SyncRepConfig};
use syncrep::error::Result;
use syncrep::simulator::{Simulation, SimulationConfig};
use syncrep::syncrep::StandbyNames;

/// syncrep - Synchronous Replication Commit Wait
#[derive(Parser)]
#[command(name = "syncrep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "syncrep.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "syncrep.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "primary-1")]
        node_id: String,

        /// Node role (coordinator or segment)
        #[arg(long, value_enum, ignore_case = true, default_value_t = NodeRole::Segment)]
        role: NodeRole,
    },

    /// Validate configuration file
    Validate,

    /// Show effective settings
    Info,

    /// Run an in-process primary with committing backends and standbys
    Simulate {
        /// Number of committing backends
        #[arg(short, long, default_value_t = 8)]
        backends: usize,

        /// Commits per backend
        #[arg(long, default_value_t = 100)]
        commits: usize,

        /// Number of standby sessions
        #[arg(short, long, default_value_t = 1)]
        standbys: usize,

        /// Milliseconds between standby replies
        #[arg(long, default_value_t = 5)]
        reply_interval_ms: u64,

        /// Largest WAL record per commit in bytes
        #[arg(long, default_value_t = 8192)]
        max_record_bytes: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Command-line level wins, then the config file, then "info"
    let level = match &cli.log_level {
        Some(level) => level.clone(),
        None => SyncRepConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string()),
    };
    init_logging(&level);

    match cli.command {
        Commands::Init {
            output,
            node_id,
            role,
        } => run_init(output, node_id, role),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Simulate {
            backends,
            commits,
            standbys,
            reply_interval_ms,
            max_record_bytes,
        } => {
            let sim = SimulationConfig {
                backends,
                commits_per_backend: commits,
                standbys,
                reply_interval_ms,
                max_record_bytes,
            };
            run_simulate(cli.config, sim).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Write a sample configuration file
fn run_init(output: PathBuf, node_id: String, role: NodeRole) -> Result<()> {
    let config_content = format!(
        r#"# syncrep Configuration
# Generated configuration file

[node]
id = "{node_id}"
role = "{role}"             # coordinator | segment

[replication]
# off | local | remote_write | on
synchronous_commit = "on"
# Standbys eligible to become synchronous; empty disables waiting
synchronous_standby_names = "standby1"
# Standby session slots; 0 turns synchronous replication off
max_wal_senders = 4
max_backends = 64
# Lag in bytes under which a catching-up standby counts as active
catchup_within_range = 16777216

[logging]
level = "info"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to name your synchronous standbys.");
    println!(
        "Then try it with: syncrep --config {} simulate",
        output.display()
    );

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match SyncRepConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Role: {}", config.node.role);
            println!(
                "  Synchronous Commit: {}",
                config.replication.synchronous_commit
            );
            println!(
                "  Standby Names: {:?}",
                config.replication.synchronous_standby_names
            );
            println!("  Sync Rep Enabled: {}", config.sync_rep_enabled());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show effective settings
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = SyncRepConfig::from_file(&config_path)?;
    let names = StandbyNames::parse(&config.replication.synchronous_standby_names)?;

    println!("syncrep Node Information");
    println!("========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Role:             {}", config.node.role);
    println!();
    println!("Replication Configuration:");
    println!("  Commit Level:   {}", config.replication.synchronous_commit);
    match config.replication.synchronous_commit.wait_mode() {
        Some(mode) => println!("  Waits For:      standby {}", mode),
        None => println!("  Waits For:      nothing"),
    }
    println!("  Standbys:       {:?}", names.to_vec());
    println!("  Standbys Defined: {}", !names.is_empty());
    println!("  WAL Senders:    {}", config.replication.max_wal_senders);
    println!("  Backends:       {}", config.replication.max_backends);
    println!(
        "  Catch-up Range: {} bytes",
        config.replication.catchup_within_range
    );
    println!();
    println!("Logging Level:    {}", config.logging.level);

    Ok(())
}

/// Run the in-process simulation and print its report as JSON
async fn run_simulate(config_path: PathBuf, sim: SimulationConfig) -> Result<()> {
    let config = if config_path.exists() {
        SyncRepConfig::from_file(&config_path)?
    } else {
        tracing::info!(
            "{} not found, simulating with the sample configuration",
            config_path.display()
        );
        SyncRepConfig::sample("primary-1", NodeRole::Segment)
    };

    let simulation = Simulation::new(&config, sim)?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let report = simulation.run(shutdown).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
