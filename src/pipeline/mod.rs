//! Pipeline orchestration for stage execution.

pub mod graph;
mod metrics;
mod runner;
mod scheduler;

#[cfg(test)]
mod pipeline_integration_tests;

pub use graph::{StageGraph, StageKey, StageKind};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use runner::{StageExecutor, StageRunner};
pub use scheduler::{RunSummary, Scheduler, SchedulerConfig};
