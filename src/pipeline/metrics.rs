//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::pipeline::graph::StageKind;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Aligned reads parsed from mapper output
    pub reads_parsed: AtomicU64,

    /// Reads kept after the length window
    pub reads_kept: AtomicU64,

    /// ORF density profiles built
    pub orfs_profiled: AtomicU64,

    /// ORFs classified (per-sample and merged)
    pub orfs_classified: AtomicU64,

    /// Stage dispatches (includes retries)
    pub stages_dispatched: AtomicU64,

    /// Stages completed
    pub stages_completed: AtomicU64,

    /// Stage failures (any attempt)
    pub stages_failed: AtomicU64,

    /// Stage timeouts
    pub stages_timed_out: AtomicU64,

    /// Retry dispatches (attempt > 1)
    pub retries: AtomicU64,

    /// Artifact bytes written
    pub bytes_written: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage wall time (microseconds, summed across workers)
    stage_us: [AtomicU64; StageKind::ALL.len()],
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_reads_parsed(&self, count: u64) {
        self.reads_parsed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_reads_kept(&self, count: u64) {
        self.reads_kept.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_orfs_profiled(&self, count: u64) {
        self.orfs_profiled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_orfs_classified(&self, count: u64) {
        self.orfs_classified.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_stage_dispatched(&self) {
        self.stages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_completed(&self) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_failed(&self) {
        self.stages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_timed_out(&self) {
        self.stages_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record wall time spent in one stage kind.
    pub fn add_stage_time(&self, stage: StageKind, duration: Duration) {
        let idx = StageKind::ALL
            .iter()
            .position(|k| *k == stage)
            .unwrap_or(0);
        self.stage_us[idx].fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get completed stages per second.
    pub fn stages_per_second(&self) -> f64 {
        let stages = self.stages_completed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            stages as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let stage_secs = StageKind::ALL
            .iter()
            .enumerate()
            .map(|(idx, kind)| {
                let secs = self.stage_us[idx].load(Ordering::Relaxed) as f64 / 1_000_000.0;
                (kind.name().to_string(), secs)
            })
            .collect();

        MetricsSnapshot {
            reads_parsed: self.reads_parsed.load(Ordering::Relaxed),
            reads_kept: self.reads_kept.load(Ordering::Relaxed),
            orfs_profiled: self.orfs_profiled.load(Ordering::Relaxed),
            orfs_classified: self.orfs_classified.load(Ordering::Relaxed),
            stages_dispatched: self.stages_dispatched.load(Ordering::Relaxed),
            stages_completed: self.stages_completed.load(Ordering::Relaxed),
            stages_failed: self.stages_failed.load(Ordering::Relaxed),
            stages_timed_out: self.stages_timed_out.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            stages_per_second: self.stages_per_second(),
            stage_secs,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub reads_parsed: u64,
    pub reads_kept: u64,
    pub orfs_profiled: u64,
    pub orfs_classified: u64,
    pub stages_dispatched: u64,
    pub stages_completed: u64,
    pub stages_failed: u64,
    pub stages_timed_out: u64,
    pub retries: u64,
    pub bytes_written: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub stages_per_second: f64,
    /// Wall time per stage kind (seconds, summed across workers)
    pub stage_secs: Vec<(String, f64)>,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stages: {} done, {} failed, {} timed out | Retries: {} | \
             Reads: {}/{} kept | ORFs: {} profiled, {} classified | \
             Rate: {:.2} stages/s | Elapsed: {:.1}s",
            self.stages_completed,
            self.stages_failed,
            self.stages_timed_out,
            self.retries,
            self.reads_kept,
            self.reads_parsed,
            self.orfs_profiled,
            self.orfs_classified,
            self.stages_per_second,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_stages: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_stages: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_stages,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_stages > 0 {
                        snapshot.stages_completed as f64 / self.total_stages as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    // Final report
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Stages completed: {}", snapshot.stages_completed);
        println!("Stage failures: {}", snapshot.stages_failed);
        println!("Stage timeouts: {}", snapshot.stages_timed_out);
        println!("Retries: {}", snapshot.retries);
        println!(
            "Reads kept: {} of {} parsed",
            snapshot.reads_kept, snapshot.reads_parsed
        );
        println!("ORFs profiled: {}", snapshot.orfs_profiled);
        println!("ORFs classified: {}", snapshot.orfs_classified);
        println!(
            "Artifacts written: {:.2} MB",
            snapshot.bytes_written as f64 / (1024.0 * 1024.0)
        );

        let total_stage: f64 = snapshot.stage_secs.iter().map(|(_, s)| s).sum();
        if total_stage > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            for (name, secs) in &snapshot.stage_secs {
                if *secs > 0.0 {
                    println!(
                        "{:<18} {:>7.1}s ({:>5.1}%)",
                        name,
                        secs,
                        secs / total_stage * 100.0
                    );
                }
            }
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_reads_parsed(1000);
        metrics.add_reads_parsed(500);

        assert_eq!(metrics.reads_parsed.load(Ordering::Relaxed), 1500);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.add_stage_completed();
        metrics.add_stage_completed();
        metrics.add_stage_failed();
        metrics.add_retry();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.stages_completed, 2);
        assert_eq!(snapshot.stages_failed, 1);
        assert_eq!(snapshot.retries, 1);
    }

    #[test]
    fn test_all_counters() {
        let metrics = Metrics::new();

        metrics.add_reads_parsed(100);
        metrics.add_reads_kept(80);
        metrics.add_orfs_profiled(10);
        metrics.add_orfs_classified(10);
        metrics.add_stage_dispatched();
        metrics.add_stage_completed();
        metrics.add_stage_failed();
        metrics.add_stage_timed_out();
        metrics.add_retry();
        metrics.add_bytes_written(2048);

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.reads_parsed, 100);
        assert_eq!(snapshot.reads_kept, 80);
        assert_eq!(snapshot.orfs_profiled, 10);
        assert_eq!(snapshot.orfs_classified, 10);
        assert_eq!(snapshot.stages_dispatched, 1);
        assert_eq!(snapshot.stages_completed, 1);
        assert_eq!(snapshot.stages_failed, 1);
        assert_eq!(snapshot.stages_timed_out, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.bytes_written, 2048);
    }

    #[test]
    fn test_stage_timing() {
        let metrics = Metrics::new();

        metrics.add_stage_time(StageKind::FilterReads, Duration::from_millis(100));
        metrics.add_stage_time(StageKind::Classify, Duration::from_millis(50));
        metrics.add_stage_time(StageKind::Classify, Duration::from_millis(25));

        let snapshot = metrics.snapshot();
        let secs = |name: &str| {
            snapshot
                .stage_secs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, s)| *s)
                .unwrap()
        };

        assert!((secs("filter-reads") - 0.1).abs() < 0.001);
        assert!((secs("classify") - 0.075).abs() < 0.001);
        assert_eq!(secs("rank-calls"), 0.0);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        metrics.add_stage_completed();
        metrics.add_stage_failed();
        metrics.add_reads_parsed(100);
        metrics.add_reads_kept(90);

        let display = format!("{}", metrics.snapshot());

        assert!(display.contains("1 done"));
        assert!(display.contains("1 failed"));
        assert!(display.contains("90/100 kept"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        // Create metrics without start_time to test zero elapsed case
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_stage_completed();

        assert_eq!(metrics.stages_per_second(), 0.0);
    }

    #[test]
    fn test_metrics_reporter_new() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 10, 1000);

        assert_eq!(reporter.interval_secs, 10);
        assert_eq!(reporter.total_stages, 1000);
    }
}
