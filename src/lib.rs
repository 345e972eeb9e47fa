//! Ribocall Pipeline
//!
//! Predicts translated open reading frames from ribosome-profiling data by
//! exploiting the 3-nucleotide periodicity of elongating ribosomes.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **I/O**: Aligned-read and ORF-annotation parsing, atomic JSON artifacts
//! - **Features**: Read-density profiles and phase-bucket periodicity features
//! - **Classify**: Bayesian multinomial model comparison over phase counts
//! - **Checkpoint**: Durable append-only log of stage state for resume
//! - **Pipeline**: Dependency-graph scheduling with retries and timeouts
//!
//! # Usage
//!
//! ```no_run
//! use ribocall::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod error;
pub mod features;
pub mod io;
pub mod model;
pub mod pipeline;

pub use checkpoint::{CheckpointStore, StageRecord, StageState};
pub use config::Config;
pub use error::{CheckpointError, PipelineAborted, StageError, StageErrorKind};
pub use pipeline::{
    Metrics, RunSummary, Scheduler, SchedulerConfig, StageGraph, StageKey, StageKind, StageRunner,
};

use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::classify::ReferenceSets;

fn checkpoint_path(config: &Config) -> std::path::PathBuf {
    config.workdir.join("checkpoint.log")
}

/// Run the full translation-calling pipeline with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<RunSummary> {
    // Validate configuration
    config.validate()?;

    let config = Arc::new(config);

    tracing::info!("Starting ribocall pipeline");
    std::fs::create_dir_all(&config.workdir)
        .with_context(|| format!("cannot create workdir {}", config.workdir.display()))?;

    // Load the ORF annotation
    tracing::info!("Loading annotation from {}", config.annotation_path.display());
    let annotation = io::annotation::load_orfs(&config.annotation_path)?;
    if annotation.is_empty() {
        anyhow::bail!("Annotation contains no ORFs");
    }
    tracing::info!("Loaded {} candidate ORFs", annotation.len());
    let annotation = Arc::new(annotation);

    // Optional reference sets for empirical parameter fitting
    let reference_sets = ReferenceSets::load(
        config.classifier.reference_translated.as_deref(),
        config.classifier.reference_untranslated.as_deref(),
    )?;
    if let Some(refs) = &reference_sets {
        tracing::info!(
            "Loaded reference sets: {} translated, {} untranslated",
            refs.translated.len(),
            refs.untranslated.len()
        );
    }
    let reference_sets = Arc::new(reference_sets);

    // Open the checkpoint store and build the stage graph
    let store = CheckpointStore::open(&checkpoint_path(&config))?;

    let sample_ids: Vec<String> = config.samples.iter().map(|s| s.id.clone()).collect();
    let groups = config.groups();
    let graph = StageGraph::build(&sample_ids, &groups);
    tracing::info!(
        "Stage graph: {} stages over {} samples in {} groups",
        graph.nodes().len(),
        sample_ids.len(),
        groups.len()
    );

    // Create metrics
    let metrics = Metrics::new();

    // Create the stage runner
    let runner = Arc::new(StageRunner::new(
        config.clone(),
        annotation,
        metrics.clone(),
        reference_sets,
    ));

    // Create scheduler
    let scheduler_config = SchedulerConfig::from(&config.processing);
    let scheduler = Scheduler::new(runner, graph, store, metrics, scheduler_config);

    // Graceful stop on Ctrl-C: no new dispatches, in-flight stages finish
    // and are checkpointed.
    let stop = scheduler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Stop requested; letting in-flight stages finish");
            stop.store(true, Ordering::Relaxed);
        }
    });

    // Everything past this point is mid-run: a checkpoint-store failure or
    // aborted stage task here is not a configuration error.
    let summary = scheduler.run().await.context(PipelineAborted)?;
    tracing::info!("Pipeline finished: {}", summary);

    Ok(summary)
}

/// Per-run stage-state overview for the `status` command.
#[derive(Debug)]
pub struct StatusReport {
    pub total: usize,
    pub complete: usize,
    pub running: usize,
    pub failed: usize,
    pub pending: usize,

    /// (stage kind, complete, total) per stage kind, in pipeline order
    pub per_stage: Vec<(StageKind, usize, usize)>,

    /// Failed stages that are out of attempts
    pub terminal_failed: Vec<StageRecord>,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Stages: {} total | {} complete | {} running | {} failed | {} pending",
            self.total, self.complete, self.running, self.failed, self.pending
        )?;
        for (kind, complete, total) in &self.per_stage {
            writeln!(f, "  {}: {}/{}", kind, complete, total)?;
        }
        for record in &self.terminal_failed {
            writeln!(
                f,
                "  terminal: {}/{} after {} attempts ({})",
                record.unit,
                record.stage,
                record.attempt,
                record
                    .error_kind
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )?;
        }
        Ok(())
    }
}

/// Summarize checkpointed stage state against the configured graph.
pub fn pipeline_status(config: &Config) -> Result<StatusReport> {
    config.validate()?;

    let store = CheckpointStore::open(&checkpoint_path(config))?;
    let states: std::collections::HashMap<StageKey, StageRecord> = store
        .query_all()
        .into_iter()
        .map(|r| (r.key(), r))
        .collect();

    let sample_ids: Vec<String> = config.samples.iter().map(|s| s.id.clone()).collect();
    let graph = StageGraph::build(&sample_ids, &config.groups());
    let max_attempts = config.processing.retry.max_attempts;

    let mut report = StatusReport {
        total: graph.nodes().len(),
        complete: 0,
        running: 0,
        failed: 0,
        pending: 0,
        per_stage: StageKind::ALL.iter().map(|k| (*k, 0, 0)).collect(),
        terminal_failed: Vec::new(),
    };

    for key in graph.nodes() {
        let stage_complete = match states.get(key) {
            Some(record) => match record.state {
                StageState::Complete => {
                    report.complete += 1;
                    true
                }
                StageState::Running => {
                    report.running += 1;
                    false
                }
                StageState::Failed => {
                    report.failed += 1;
                    if record.attempt >= max_attempts {
                        report.terminal_failed.push(record.clone());
                    }
                    false
                }
                StageState::Pending => {
                    report.pending += 1;
                    false
                }
            },
            None => {
                report.pending += 1;
                false
            }
        };

        if let Some(entry) = report.per_stage.iter_mut().find(|e| e.0 == key.stage) {
            entry.2 += 1;
            if stage_complete {
                entry.1 += 1;
            }
        }
    }

    Ok(report)
}

/// Drop checkpoint records for one unit, or for the whole run. Artifacts
/// are left in place; re-run overwrites them atomically. Returns the
/// number of stage records removed.
pub fn reset_checkpoints(config: &Config, unit: Option<&str>) -> Result<usize> {
    let store = CheckpointStore::open(&checkpoint_path(config))?;
    Ok(store.reset(unit)?)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
