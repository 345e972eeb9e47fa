//! Error taxonomy for stage execution and the checkpoint store.
//!
//! Stage failures are recoverable per (unit, stage): the orchestrator retries
//! them up to the configured limit and then marks them terminally failed,
//! blocking only the dependent subgraph. Checkpoint store failures are fatal
//! to the whole run because resume correctness cannot be guaranteed without
//! a durable store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// A failure while executing one (unit, stage) pair.
#[derive(Debug, Error)]
pub enum StageError {
    /// A required upstream artifact is absent.
    #[error("missing input for {stage} of {unit}: {path}")]
    InputMissing {
        unit: String,
        stage: String,
        path: PathBuf,
    },

    /// The stage's computation failed (malformed input, numeric error).
    #[error("compute error in {stage} of {unit}: {message}")]
    Compute {
        unit: String,
        stage: String,
        message: String,
    },

    /// The output artifact could not be durably persisted.
    #[error("failed to write artifact for {stage} of {unit}: {message}")]
    Write {
        unit: String,
        stage: String,
        message: String,
    },

    /// The stage exceeded its wall-clock timeout.
    #[error("{stage} of {unit} timed out after {seconds}s")]
    Timeout {
        unit: String,
        stage: String,
        seconds: u64,
    },
}

impl StageError {
    /// The serializable kind recorded in the checkpoint log.
    pub fn kind(&self) -> StageErrorKind {
        match self {
            StageError::InputMissing { .. } => StageErrorKind::InputMissing,
            StageError::Compute { .. } => StageErrorKind::Compute,
            StageError::Write { .. } => StageErrorKind::Write,
            StageError::Timeout { .. } => StageErrorKind::Timeout,
        }
    }
}

/// Compact error classification persisted with failed stage records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageErrorKind {
    InputMissing,
    Compute,
    Write,
    Timeout,
    /// The process died while the stage was running; the record was
    /// reconciled on the next startup.
    Interrupted,
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageErrorKind::InputMissing => "input-missing",
            StageErrorKind::Compute => "compute",
            StageErrorKind::Write => "write",
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Marker context wrapped around errors that abort a run after stage
/// dispatch has begun, so the CLI can tell them apart from
/// configuration/input errors raised before any dispatch.
#[derive(Debug, Error)]
#[error("pipeline aborted mid-run")]
pub struct PipelineAborted;

/// Failures of the checkpoint store itself. Fatal to the run.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint log I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint record at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("writer already active for {unit}/{stage}")]
    WriterConflict { unit: String, stage: String },
}
