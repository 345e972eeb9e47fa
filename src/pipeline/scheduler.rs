//! Work distribution and scheduling for stage execution.
//!
//! The scheduler walks the stage graph: each round it claims and dispatches
//! every runnable (unit, stage) pair up to the concurrency limit, then
//! reaps one finished task and re-plans. Stage bodies run on the blocking
//! pool under a wall-clock timeout. Every transition is recorded in the
//! checkpoint store before the scheduler acts on it, so a killed process
//! resumes from the last durable state.
//!
//! A timed-out stage body cannot be interrupted; it is abandoned on the
//! blocking pool and its attempt is recorded as failed. Atomic artifact
//! writes keep a late finisher harmless.

use anyhow::{Context, Result};
use futures::future::select_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::checkpoint::{CheckpointStore, StageRecord, StageState, WriterClaim};
use crate::config::ProcessingConfig;
use crate::error::{StageError, StageErrorKind};
use crate::pipeline::graph::{StageGraph, StageKey};
use crate::pipeline::metrics::{Metrics, MetricsReporter};
use crate::pipeline::runner::StageExecutor;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of stages executed concurrently
    pub concurrency: usize,

    /// Maximum attempts per (unit, stage) before terminal failure
    pub max_attempts: u32,

    /// Wall-clock timeout per stage dispatch
    pub stage_timeout: Duration,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_attempts: 3,
            stage_timeout: Duration::from_secs(600),
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

impl From<&ProcessingConfig> for SchedulerConfig {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_attempts: config.retry.max_attempts,
            stage_timeout: Duration::from_secs(config.stage_timeout_secs),
            enable_metrics: config.enable_metrics,
            metrics_interval_secs: config.metrics_interval_secs,
            metrics_output_path: config.metrics_output_path.clone(),
        }
    }
}

/// Output of one dispatched stage task.
struct TaskOutput {
    key: StageKey,
    attempt: u32,
    result: Result<std::path::PathBuf, StageError>,
    claim: WriterClaim,
}

/// Scheduler for distributing stage execution across async tasks.
pub struct Scheduler<E: StageExecutor> {
    executor: Arc<E>,
    graph: StageGraph,
    store: Arc<CheckpointStore>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
    stop: Arc<AtomicBool>,
}

impl<E: StageExecutor> Scheduler<E> {
    /// Create a new scheduler.
    pub fn new(
        executor: Arc<E>,
        graph: StageGraph,
        store: Arc<CheckpointStore>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            graph,
            store,
            metrics,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for requesting a graceful stop: no new dispatches, in-flight
    /// stages run to completion.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Reconcile stale running records left by a killed process. The
    /// interruption is recorded as failed but not charged against the retry
    /// limit: the failed record carries the attempt count excluding the
    /// interrupted one, so the stage is re-dispatched at the same attempt
    /// number the killed process held and a restarted run reaches the same
    /// final states an uninterrupted run would.
    fn recover_interrupted(
        &self,
        states: &mut HashMap<StageKey, StageRecord>,
    ) -> Result<()> {
        let stale: Vec<StageRecord> = self
            .store
            .query_all()
            .into_iter()
            .filter(|r| r.state == StageState::Running)
            .collect();

        for record in stale {
            let key = record.key();
            tracing::warn!(stage = %key, attempt = record.attempt, "reconciling interrupted stage");
            let failed = self.store.record(
                &key,
                StageState::Failed,
                None,
                record.attempt.saturating_sub(1),
                Some(StageErrorKind::Interrupted),
            )?;
            states.insert(key, failed);
        }
        Ok(())
    }

    fn dispatch(&self, key: StageKey, attempt: u32, claim: WriterClaim) -> JoinHandle<TaskOutput> {
        let executor = Arc::clone(&self.executor);
        let timeout = self.config.stage_timeout;

        tokio::spawn(async move {
            let blocking_key = key.clone();
            let joined = tokio::time::timeout(
                timeout,
                tokio::task::spawn_blocking(move || executor.execute(&blocking_key, attempt)),
            )
            .await;

            let result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(StageError::Compute {
                    unit: key.unit.clone(),
                    stage: key.stage.name().to_string(),
                    message: format!("stage panicked: {}", join_err),
                }),
                Err(_) => Err(StageError::Timeout {
                    unit: key.unit.clone(),
                    stage: key.stage.name().to_string(),
                    seconds: timeout.as_secs(),
                }),
            };

            TaskOutput {
                key,
                attempt,
                result,
                claim,
            }
        })
    }

    /// Run all stages to completion, terminal failure, or stop request.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut states: HashMap<StageKey, StageRecord> = self
            .store
            .query_all()
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();
        self.recover_interrupted(&mut states)?;

        let total_stages = self.graph.nodes().len();
        tracing::info!(
            "Scheduling {} stages for execution ({} concurrent)",
            total_stages,
            self.config.concurrency
        );

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                total_stages as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut running: HashSet<StageKey> = HashSet::new();
        let mut inflight: Vec<JoinHandle<TaskOutput>> = Vec::new();
        let mut dispatched = 0u64;

        loop {
            if !self.stop.load(Ordering::Relaxed) {
                let runnable = self
                    .graph
                    .runnable(&states, &running, self.config.max_attempts);
                for key in runnable {
                    if running.len() >= self.config.concurrency {
                        break;
                    }
                    let claim = match self.store.claim_writer(&key) {
                        Ok(claim) => claim,
                        // Another writer still holds the key; re-planned
                        // next round.
                        Err(_) => continue,
                    };

                    let attempt = states.get(&key).map(|r| r.attempt + 1).unwrap_or(1);
                    let record =
                        self.store
                            .record(&key, StageState::Running, None, attempt, None)?;
                    states.insert(key.clone(), record);
                    running.insert(key.clone());

                    self.metrics.add_stage_dispatched();
                    if attempt > 1 {
                        self.metrics.add_retry();
                    }
                    dispatched += 1;

                    inflight.push(self.dispatch(key, attempt, claim));
                }
            }

            if inflight.is_empty() {
                break;
            }

            let (joined, _idx, rest) = select_all(inflight).await;
            inflight = rest;
            let out = joined.context("stage task aborted")?;
            running.remove(&out.key);

            match out.result {
                Ok(artifact) => {
                    let record = self.store.record(
                        &out.key,
                        StageState::Complete,
                        Some(artifact),
                        out.attempt,
                        None,
                    )?;
                    states.insert(out.key.clone(), record);
                    self.metrics.add_stage_completed();
                    tracing::info!(stage = %out.key, attempt = out.attempt, "stage complete");
                }
                Err(err) => {
                    self.metrics.add_stage_failed();
                    if matches!(err, StageError::Timeout { .. }) {
                        self.metrics.add_stage_timed_out();
                    }
                    let record = self.store.record(
                        &out.key,
                        StageState::Failed,
                        None,
                        out.attempt,
                        Some(err.kind()),
                    )?;
                    states.insert(out.key.clone(), record);

                    if out.attempt >= self.config.max_attempts {
                        tracing::error!(stage = %out.key, attempt = out.attempt, "stage terminally failed: {}", err);
                    } else {
                        tracing::warn!(stage = %out.key, attempt = out.attempt, "stage failed, will retry: {}", err);
                    }
                }
            }
            drop(out.claim);
        }

        // Shutdown metrics reporter
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        let summary = self.summarize(&states, dispatched);

        if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                total_stages as u64,
            );
            reporter.print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        Ok(summary)
    }

    fn summarize(&self, states: &HashMap<StageKey, StageRecord>, dispatched: u64) -> RunSummary {
        let complete = self
            .graph
            .nodes()
            .iter()
            .filter(|key| {
                matches!(
                    states.get(*key),
                    Some(record) if record.state == StageState::Complete
                )
            })
            .count();

        let terminal_failed: Vec<(StageKey, Option<StageErrorKind>)> = self
            .graph
            .nodes()
            .iter()
            .filter(|key| {
                self.graph
                    .is_terminal_failed(states, key, self.config.max_attempts)
            })
            .map(|key| {
                let kind = states.get(key).and_then(|r| r.error_kind);
                (key.clone(), kind)
            })
            .collect();

        let blocked = self.graph.blocked(states, self.config.max_attempts).len();

        RunSummary {
            total: self.graph.nodes().len(),
            complete,
            terminal_failed,
            blocked,
            stopped: self.stop.load(Ordering::Relaxed),
            dispatched,
        }
    }
}

/// Outcome of a scheduler run.
#[derive(Debug)]
pub struct RunSummary {
    /// Total stages in the graph
    pub total: usize,

    /// Stages in the complete state
    pub complete: usize,

    /// Terminally failed stages with their recorded error kind
    pub terminal_failed: Vec<(StageKey, Option<StageErrorKind>)>,

    /// Stages permanently blocked by a terminally failed ancestor
    pub blocked: usize,

    /// Whether a stop was requested during the run
    pub stopped: bool,

    /// Stage attempts dispatched by this run (includes retries)
    pub dispatched: u64,
}

impl RunSummary {
    pub fn all_complete(&self) -> bool {
        self.complete == self.total
    }

    /// Process exit code: 0 when every stage completed, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.all_complete() {
            0
        } else {
            1
        }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Complete: {}/{}, Failed: {}, Blocked: {}, Dispatched: {}{}",
            self.complete,
            self.total,
            self.terminal_failed.len(),
            self.blocked,
            self.dispatched,
            if self.stopped { " (stopped)" } else { "" }
        )
    }
}
