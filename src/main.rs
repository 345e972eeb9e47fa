//! Ribocall CLI
//!
//! Predict translated ORFs from ribosome-profiling data.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ribocall::{
    build_runtime, init_rayon, pipeline_status, reset_checkpoints, run_pipeline, Config,
    PipelineAborted, RunSummary,
};

#[derive(Parser)]
#[command(name = "ribocall")]
#[command(about = "Predict translated ORFs from ribosome profiling data", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override concurrency level
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run {
        /// Discard existing checkpoints and recompute everything
        #[arg(long)]
        overwrite: bool,
    },

    /// Show checkpointed stage state
    Status,

    /// Drop checkpoint records so stages are recomputed on the next run
    Reset {
        /// Only reset one unit (sample id or group id)
        #[arg(long)]
        unit: Option<String>,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            // Configuration and input errors before any stage dispatch
            ExitCode::from(2)
        }
    }
}

fn execute(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        None => run_command(cli.config, cli.concurrency, false),

        Some(Commands::Run { overwrite }) => run_command(cli.config, cli.concurrency, overwrite),

        Some(Commands::Status) => {
            let config = Config::from_file(&cli.config)?;
            let report = pipeline_status(&config)?;
            print!("{}", report);
            Ok(ExitCode::SUCCESS)
        }

        Some(Commands::Reset { unit }) => {
            let config = Config::from_file(&cli.config)?;
            config.validate()?;
            let removed = reset_checkpoints(&config, unit.as_deref())?;
            println!("Removed {} checkpoint records", removed);
            Ok(ExitCode::SUCCESS)
        }

        Some(Commands::Validate) => {
            let config = Config::from_file(&cli.config)?;
            config.validate()?;
            println!("Configuration is valid");
            Ok(ExitCode::SUCCESS)
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_command(
    config_path: PathBuf,
    concurrency: Option<usize>,
    overwrite: bool,
) -> Result<ExitCode> {
    let mut config = Config::from_file(&config_path)?;

    // Apply overrides
    if let Some(c) = concurrency {
        config.processing.concurrency = c;
    }

    config.validate()?;

    if overwrite {
        let removed = reset_checkpoints(&config, None)?;
        tracing::info!("Overwrite requested; removed {} checkpoint records", removed);
    }

    // Initialize Rayon
    init_rayon(config.processing.rayon_threads)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    let result = runtime.block_on(async { run_pipeline(config).await });

    Ok(ExitCode::from(pipeline_exit_code(result)?))
}

/// Map a pipeline outcome to the process exit code: 0 when every stage
/// completed, 1 for stage failures or a fatal mid-run abort. Errors raised
/// before any dispatch (configuration, unreadable inputs) propagate to the
/// exit-2 handler in `main`.
fn pipeline_exit_code(result: Result<RunSummary>) -> Result<u8> {
    match result {
        Ok(summary) => Ok(summary.exit_code()),
        Err(err) if err.downcast_ref::<PipelineAborted>().is_some() => {
            eprintln!("Error: {:#}", err);
            Ok(1)
        }
        Err(err) => Err(err),
    }
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Ribocall Pipeline Configuration

# Working directory: holds the checkpoint log and per-unit stage artifacts
workdir: "/tmp/ribocall"

# ORF annotation TSV from the annotation provider, one ORF per line:
#   orf_id  transcript_id  start  end  strand  frame
annotation_path: "/data/orfs.tsv"

# === SAMPLES: one entry per sequencing run ===
# Samples sharing a group are merged (phase counts summed) before the
# group-level classification. Omitting group puts a sample in a group of
# its own.
samples:
  - id: "wt_rep1"
    reads_path: "/data/wt_rep1.reads.tsv"
    group: "wt"
  - id: "wt_rep2"
    reads_path: "/data/wt_rep2.reads.tsv"
    group: "wt"

# === FEATURES: read filtering and periodicity extraction ===
features:
  # Ribosome-footprint length window to keep
  min_read_len: 26
  max_read_len: 35

  # Offset from the 5' read end to the ribosomal P-site
  psite_offset: 12

  # Flanking context around each ORF, in nucleotides
  flank: 21

  # Moving-average smoothing span (odd)
  window_size: 3

  # ORFs with fewer total reads are called not-translated automatically
  min_reads: 10

# === CLASSIFIER: Bayesian model comparison ===
classifier:
  # Peak phase mass of the periodic models (must exceed 1/3)
  rho: 0.7

  # Minimum posterior for a confident phase call
  confidence_threshold: 0.5

  # Model priors [not-translated, phase-0, phase-1, phase-2]
  # (uniform when omitted)
  # priors: [0.25, 0.25, 0.25, 0.25]

  # Optional reference ORF id lists for empirical parameter fitting
  # reference_translated: "/data/known_coding.txt"
  # reference_untranslated: "/data/known_noncoding.txt"

# === PROCESSING: scheduling and performance ===
processing:
  # Number of stages executed concurrently
  concurrency: 8

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 16

  # Rayon thread pool size for per-ORF CPU work (null = num CPUs)
  # rayon_threads: 16

  # Wall-clock timeout per stage dispatch, in seconds
  stage_timeout_secs: 600

  # Retry configuration for failed stages
  retry:
    max_attempts: 3

  # Print progress metrics during processing
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Optional path to save metrics JSON after the run
  # metrics_output_path: "/tmp/ribocall-metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["ribocall"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["ribocall", "-c", "other.yaml"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_reset_unit() {
        let cli = Cli::try_parse_from(["ribocall", "reset", "--unit", "wt_rep1"]).unwrap();
        match cli.command {
            Some(Commands::Reset { unit }) => assert_eq!(unit.as_deref(), Some("wt_rep1")),
            _ => panic!("expected reset command"),
        }
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["ribocall", "validate", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    fn summary(total: usize, complete: usize) -> RunSummary {
        RunSummary {
            total,
            complete,
            terminal_failed: Vec::new(),
            blocked: 0,
            stopped: false,
            dispatched: complete as u64,
        }
    }

    #[test]
    fn test_exit_code_from_summary() {
        assert_eq!(pipeline_exit_code(Ok(summary(4, 4))).unwrap(), 0);
        assert_eq!(pipeline_exit_code(Ok(summary(4, 3))).unwrap(), 1);
    }

    #[test]
    fn test_mid_run_abort_exits_one() {
        // A checkpoint-store failure after dispatch began is not a
        // configuration error.
        let err = anyhow::anyhow!("checkpoint log I/O failure").context(PipelineAborted);
        assert_eq!(pipeline_exit_code(Err(err)).unwrap(), 1);
    }

    #[test]
    fn test_pre_dispatch_error_propagates_for_exit_two() {
        let err = anyhow::anyhow!("no samples configured");
        assert!(pipeline_exit_code(Err(err)).is_err());
    }
}
