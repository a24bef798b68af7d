//! In-process Primary Simulation
//!
//! Runs committing backends on blocking threads against standby sessions
//! driven by tokio tasks. Every commit appends a record to a shared WAL
//! insert position and waits for it; every standby tick reports positions
//! and releases whatever they cover.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::{NodeRole, SyncRepConfig};
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::syncrep::{StandbyHandle, SyncRep, SyncRepSnapshot, WaitOutcome, WalSndState};

/// Simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of committing backends
    pub backends: usize,
    /// Commits each backend performs
    pub commits_per_backend: usize,
    /// Number of standby sessions
    pub standbys: usize,
    /// Interval between standby replies in milliseconds
    pub reply_interval_ms: u64,
    /// Largest WAL record a commit appends, in bytes
    pub max_record_bytes: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            backends: 8,
            commits_per_backend: 100,
            standbys: 1,
            reply_interval_ms: 5,
            max_record_bytes: 8192,
        }
    }
}

/// Commit outcomes of one backend
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendReport {
    pub backend: usize,
    /// Commits confirmed by the synchronous standby after waiting
    pub confirmed: usize,
    /// Commits whose position was already confirmed
    pub already_confirmed: usize,
    /// Commits that did not wait for another reason
    pub skipped: usize,
    /// Commits left pending by shutdown on a coordinator
    pub shutdown_pending: usize,
    /// Whether the backend was terminated while waiting
    pub terminated: bool,
}

impl BackendReport {
    fn record(&mut self, outcome: WaitOutcome) {
        match outcome {
            WaitOutcome::Confirmed => self.confirmed += 1,
            WaitOutcome::AlreadyConfirmed => self.already_confirmed += 1,
            WaitOutcome::ShutdownPending => self.shutdown_pending += 1,
            WaitOutcome::InSignalHandler
            | WaitOutcome::NotRequested
            | WaitOutcome::NoActiveStandby
            | WaitOutcome::NoStandbysDefined => self.skipped += 1,
        }
    }

    fn commits(&self) -> usize {
        self.confirmed + self.already_confirmed + self.skipped + self.shutdown_pending
    }
}

/// Activity of one standby session
#[derive(Debug, Clone, Serialize)]
pub struct StandbyReport {
    pub application_name: String,
    pub replies: u64,
    /// Replies sent while elected
    pub elected_replies: u64,
    /// Backends released by this session
    pub released: usize,
}

/// Summary printed by `syncrep simulate`
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub role: NodeRole,
    /// Whether the run was cut short by a shutdown request
    pub interrupted: bool,
    pub commits: usize,
    pub confirmed: usize,
    pub already_confirmed: usize,
    pub skipped: usize,
    pub shutdown_pending: usize,
    pub terminated_backends: usize,
    pub insert_lsn: Lsn,
    pub backends: Vec<BackendReport>,
    pub standbys: Vec<StandbyReport>,
    /// State after the last backend finished
    pub final_state: SyncRepSnapshot,
}

/// A primary with committing backends and streaming standbys
pub struct Simulation {
    sync_rep: Arc<SyncRep>,
    insert_lsn: Arc<AtomicU64>,
    config: SimulationConfig,
}

impl Simulation {
    /// Create a simulation from a node configuration
    pub fn new(node: &SyncRepConfig, config: SimulationConfig) -> Result<Self> {
        if config.max_record_bytes == 0 {
            return Err(Error::Config("max_record_bytes must be at least 1".into()));
        }
        Ok(Self {
            sync_rep: Arc::new(SyncRep::from_config(node)?),
            insert_lsn: Arc::new(AtomicU64::new(0)),
            config,
        })
    }

    /// Coordinator driven by this simulation
    pub fn sync_rep(&self) -> &Arc<SyncRep> {
        &self.sync_rep
    }

    /// Run until every backend has finished, or `shutdown` resolves.
    ///
    /// On shutdown every backend is asked to terminate, exactly as an
    /// administrator command would.
    pub async fn run<S>(&self, shutdown: S) -> Result<SimulationReport>
    where
        S: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let started = Instant::now();
        tracing::info!(
            "Starting simulation: {} backends x {} commits, {} standbys",
            self.config.backends,
            self.config.commits_per_backend,
            self.config.standbys
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut standby_tasks = Vec::with_capacity(self.config.standbys);
        for i in 0..self.config.standbys {
            let handle = self.sync_rep.connect_standby(&format!("standby{}", i + 1))?;
            standby_tasks.push(tokio::spawn(run_standby(
                Arc::clone(&self.sync_rep),
                handle,
                Arc::clone(&self.insert_lsn),
                Duration::from_millis(self.config.reply_interval_ms.max(1)),
                stop_rx.clone(),
            )));
        }

        // Register everything up front so a slot shortage fails before any
        // backend starts waiting
        let mut registered = Vec::with_capacity(self.config.backends);
        for _ in 0..self.config.backends {
            match self.sync_rep.register_backend() {
                Ok(backend) => registered.push(backend),
                Err(e) => {
                    for backend in registered {
                        self.sync_rep.cleanup_at_exit(backend);
                    }
                    let _ = stop_tx.send(true);
                    futures::future::join_all(standby_tasks).await;
                    return Err(e);
                }
            }
        }

        let interrupts: Vec<_> = registered.iter().map(|b| b.interrupt_handle()).collect();
        let mut backend_tasks = Vec::with_capacity(registered.len());
        for backend in registered {
            let sync_rep = Arc::clone(&self.sync_rep);
            let insert_lsn = Arc::clone(&self.insert_lsn);
            let commits = self.config.commits_per_backend;
            let max_record = self.config.max_record_bytes;
            backend_tasks.push(tokio::task::spawn_blocking(move || {
                let mut report = BackendReport {
                    backend: backend.id().0,
                    ..BackendReport::default()
                };
                let mut rng = rand::thread_rng();
                for _ in 0..commits {
                    let size = rng.gen_range(1..=max_record);
                    let lsn = Lsn::new(insert_lsn.fetch_add(size, Ordering::SeqCst) + size);
                    match sync_rep.wait_for_lsn(&backend, lsn) {
                        Ok(outcome) => {
                            report.record(outcome);
                            if backend.is_die_pending() {
                                break;
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            report.terminated = true;
                            break;
                        }
                        Err(e) => {
                            tracing::error!("{}: commit wait failed: {}", backend.id(), e);
                            break;
                        }
                    }
                }
                sync_rep.cleanup_at_exit(backend);
                report
            }));
        }

        let backends = futures::future::join_all(backend_tasks);
        tokio::pin!(backends);
        tokio::pin!(shutdown);

        let finished = tokio::select! {
            results = &mut backends => Some(results),
            _ = &mut shutdown => None,
        };
        let interrupted = finished.is_none();
        let results = match finished {
            Some(results) => results,
            None => {
                tracing::warn!("Received shutdown signal, terminating {} backends", interrupts.len());
                for interrupt in &interrupts {
                    interrupt.request_shutdown();
                }
                backends.await
            }
        };

        let backends = results
            .into_iter()
            .map(|r| r.map_err(|e| Error::Internal(format!("backend task failed: {}", e))))
            .collect::<Result<Vec<_>>>()?;
        let final_state = self.sync_rep.snapshot();

        let _ = stop_tx.send(true);
        let mut standbys = Vec::with_capacity(standby_tasks.len());
        for task in futures::future::join_all(standby_tasks).await {
            standbys
                .push(task.map_err(|e| Error::Internal(format!("standby task failed: {}", e)))?);
        }

        let report = SimulationReport {
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            role: self.sync_rep.role(),
            interrupted,
            commits: backends.iter().map(BackendReport::commits).sum(),
            confirmed: backends.iter().map(|b| b.confirmed).sum(),
            already_confirmed: backends.iter().map(|b| b.already_confirmed).sum(),
            skipped: backends.iter().map(|b| b.skipped).sum(),
            shutdown_pending: backends.iter().map(|b| b.shutdown_pending).sum(),
            terminated_backends: backends.iter().filter(|b| b.terminated).count(),
            insert_lsn: Lsn::new(self.insert_lsn.load(Ordering::SeqCst)),
            backends,
            standbys,
            final_state,
        };
        tracing::info!(
            "Simulation finished in {} ms: {} commits, {} confirmed after waiting",
            report.elapsed_ms,
            report.commits,
            report.confirmed
        );
        Ok(report)
    }
}

/// Drive one standby session: catch up, then stream and reply on every
/// tick with flush trailing write by one tick.
async fn run_standby(
    sync_rep: Arc<SyncRep>,
    handle: StandbyHandle,
    insert_lsn: Arc<AtomicU64>,
    reply_interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> StandbyReport {
    let mut report = StandbyReport {
        application_name: handle.application_name().to_string(),
        replies: 0,
        elected_replies: 0,
        released: 0,
    };

    sync_rep.set_standby_state(&handle, WalSndState::CatchingUp);
    let behind = Lsn::new(insert_lsn.load(Ordering::SeqCst)).bytes_since(Lsn::INVALID);
    sync_rep.report_catchup_lag(&handle, behind);
    sync_rep.set_standby_state(&handle, WalSndState::Streaming);

    let mut ticker = tokio::time::interval(reply_interval);
    let mut written = Lsn::INVALID;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let flushed = written;
                written = Lsn::new(insert_lsn.load(Ordering::SeqCst));
                let summary = sync_rep.process_reply(&handle, written, flushed);
                report.replies += 1;
                if summary.elected {
                    report.elected_replies += 1;
                    report.released += summary.released();
                }
            }
            _ = stop.changed() => break,
        }
    }

    // Final reply confirming everything before going away
    sync_rep.set_standby_state(&handle, WalSndState::Stopping);
    let end = Lsn::new(insert_lsn.load(Ordering::SeqCst));
    let summary = sync_rep.process_reply(&handle, end, end);
    if summary.elected {
        report.released += summary.released();
    }
    sync_rep.disconnect_standby(handle);
    report
}
