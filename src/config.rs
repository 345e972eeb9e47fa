//! Configuration for the ribocall pipeline.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::model::Sample;

/// Unit id of the run-level ranking stage. Reserved.
pub const RUN_UNIT: &str = "__run__";

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Working directory for the checkpoint log and stage artifacts
    pub workdir: PathBuf,

    /// Path to the ORF annotation TSV from the annotation provider
    pub annotation_path: PathBuf,

    /// Registered samples
    pub samples: Vec<SampleConfig>,

    /// Feature extraction configuration
    #[serde(default)]
    pub features: FeatureConfig,

    /// Bayesian classifier configuration
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// One sample registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    /// Unique sample identifier
    pub id: String,

    /// Path to the aligned-read TSV for this sample
    pub reads_path: PathBuf,

    /// Replicate-group id; defaults to the sample id (group of one)
    #[serde(default)]
    pub group: Option<String>,
}

impl SampleConfig {
    /// The replicate group this sample belongs to.
    pub fn group_id(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.id)
    }

    /// Materialize the immutable sample record.
    pub fn to_sample(&self) -> Sample {
        Sample {
            id: self.id.clone(),
            reads_path: self.reads_path.clone(),
            group: self.group_id().to_string(),
        }
    }
}

/// Read filtering and feature extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Moving-average smoothing span in nucleotides (odd)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Minimum total reads for a non-degenerate feature vector
    #[serde(default = "default_min_reads")]
    pub min_reads: u64,

    /// Flanking context around each ORF, in nucleotides
    #[serde(default = "default_flank")]
    pub flank: u64,

    /// Minimum ribosome-footprint length to keep
    #[serde(default = "default_min_read_len")]
    pub min_read_len: u32,

    /// Maximum ribosome-footprint length to keep
    #[serde(default = "default_max_read_len")]
    pub max_read_len: u32,

    /// P-site offset applied to each read's 5' position
    #[serde(default = "default_psite_offset")]
    pub psite_offset: u64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            min_reads: default_min_reads(),
            flank: default_flank(),
            min_read_len: default_min_read_len(),
            max_read_len: default_max_read_len(),
            psite_offset: default_psite_offset(),
        }
    }
}

/// Bayesian classifier parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Peak phase mass of the periodic models M1..M3
    #[serde(default = "default_rho")]
    pub rho: f64,

    /// Model priors [not-translated, phase-0, phase-1, phase-2];
    /// defaults to uniform when omitted
    #[serde(default)]
    pub priors: Option<[f64; 4]>,

    /// Minimum posterior for a confident call
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Reference set of known-translated ORF ids (one per line), used for
    /// empirical-Bayes parameter fitting
    #[serde(default)]
    pub reference_translated: Option<PathBuf>,

    /// Reference set of known-non-translated ORF ids
    #[serde(default)]
    pub reference_untranslated: Option<PathBuf>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rho: default_rho(),
            priors: None,
            confidence_threshold: default_confidence_threshold(),
            reference_translated: None,
            reference_untranslated: None,
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of stages executed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for per-ORF CPU work
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Retry configuration for failed stages
    #[serde(default)]
    pub retry: RetryConfig,

    /// Wall-clock timeout per stage dispatch, in seconds
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Enable periodic metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            worker_threads: None,
            rayon_threads: None,
            retry: RetryConfig::default(),
            stage_timeout_secs: default_stage_timeout_secs(),
            enable_metrics: default_true(),
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Retry configuration for per-stage failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per (unit, stage) before it is terminally failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // YAML is a superset of JSON
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Replicate groups and their member sample ids, deterministically
    /// ordered.
    pub fn groups(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for sample in &self.samples {
            groups
                .entry(sample.group_id().to_string())
                .or_default()
                .push(sample.id.clone());
        }
        for members in groups.values_mut() {
            members.sort();
        }
        groups
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.samples.is_empty() {
            anyhow::bail!("At least one sample must be registered");
        }

        let mut seen = HashSet::new();
        for sample in &self.samples {
            if sample.id.is_empty() {
                anyhow::bail!("Sample id must not be empty");
            }
            if !seen.insert(sample.id.as_str()) {
                anyhow::bail!("Duplicate sample id '{}'", sample.id);
            }
            if sample.id == RUN_UNIT || sample.group_id() == RUN_UNIT {
                anyhow::bail!("'{}' is a reserved unit id", RUN_UNIT);
            }
        }

        if self.features.window_size == 0 || self.features.window_size % 2 == 0 {
            anyhow::bail!("Smoothing window_size must be a positive odd number");
        }
        if self.features.min_read_len > self.features.max_read_len {
            anyhow::bail!("min_read_len must not exceed max_read_len");
        }

        if !(self.classifier.rho > 1.0 / 3.0 && self.classifier.rho < 1.0) {
            anyhow::bail!("Classifier rho must lie in (1/3, 1)");
        }
        if !(self.classifier.confidence_threshold > 0.0
            && self.classifier.confidence_threshold < 1.0)
        {
            anyhow::bail!("confidence_threshold must lie in (0, 1)");
        }
        if let Some(priors) = &self.classifier.priors {
            if priors.iter().any(|&p| p <= 0.0) {
                anyhow::bail!("Model priors must be strictly positive");
            }
            let sum: f64 = priors.iter().sum();
            if (sum - 1.0).abs() > 1e-6 {
                anyhow::bail!("Model priors must sum to 1 (got {})", sum);
            }
        }

        if self.processing.concurrency == 0 {
            anyhow::bail!("Concurrency must be > 0");
        }
        if self.processing.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be > 0");
        }
        if self.processing.stage_timeout_secs == 0 {
            anyhow::bail!("stage_timeout_secs must be > 0");
        }

        Ok(())
    }
}

// Default value functions for serde
fn default_window_size() -> usize {
    3
}
fn default_min_reads() -> u64 {
    10
}
fn default_flank() -> u64 {
    21
}
fn default_min_read_len() -> u32 {
    26
}
fn default_max_read_len() -> u32 {
    35
}
fn default_psite_offset() -> u64 {
    12
}
fn default_rho() -> f64 {
    0.7
}
fn default_confidence_threshold() -> f64 {
    0.5
}
fn default_concurrency() -> usize {
    8
}
fn default_stage_timeout_secs() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_metrics_interval() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config {
            workdir: "/tmp/ribocall-test".into(),
            annotation_path: "/tmp/orfs.tsv".into(),
            samples: vec![SampleConfig {
                id: "s1".into(),
                reads_path: "/tmp/s1.tsv".into(),
                group: None,
            }],
            features: FeatureConfig::default(),
            classifier: ClassifierConfig::default(),
            processing: ProcessingConfig::default(),
        }
    }

    #[test]
    fn test_defaults() {
        let features = FeatureConfig::default();
        assert_eq!(features.window_size, 3);
        assert_eq!(features.min_reads, 10);
        assert_eq!(features.min_read_len, 26);
        assert_eq!(features.max_read_len, 35);
        assert_eq!(features.psite_offset, 12);

        let classifier = ClassifierConfig::default();
        assert!((classifier.rho - 0.7).abs() < 1e-12);
        assert!((classifier.confidence_threshold - 0.5).abs() < 1e-12);
        assert!(classifier.priors.is_none());
    }

    #[test]
    fn test_minimal_config_valid() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn test_group_defaults_to_sample_id() {
        let config = minimal_config();
        let groups = config.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["s1"], vec!["s1".to_string()]);
    }

    #[test]
    fn test_replicate_groups() {
        let mut config = minimal_config();
        config.samples = vec![
            SampleConfig {
                id: "a".into(),
                reads_path: "/tmp/a.tsv".into(),
                group: Some("wt".into()),
            },
            SampleConfig {
                id: "b".into(),
                reads_path: "/tmp/b.tsv".into(),
                group: Some("wt".into()),
            },
            SampleConfig {
                id: "c".into(),
                reads_path: "/tmp/c.tsv".into(),
                group: None,
            },
        ];
        let groups = config.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["wt"], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(groups["c"], vec!["c".to_string()]);
    }

    #[test]
    fn test_validation_rejects_duplicate_samples() {
        let mut config = minimal_config();
        config.samples.push(config.samples[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_even_window() {
        let mut config = minimal_config();
        config.features.window_size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_rho() {
        let mut config = minimal_config();
        config.classifier.rho = 0.2;
        assert!(config.validate().is_err());
        config.classifier.rho = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_priors() {
        let mut config = minimal_config();
        config.classifier.priors = Some([0.5, 0.5, 0.5, 0.5]);
        assert!(config.validate().is_err());
        config.classifier.priors = Some([0.25, 0.25, 0.25, 0.25]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_reserved_unit() {
        let mut config = minimal_config();
        config.samples[0].group = Some(RUN_UNIT.into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = minimal_config();
        let yaml = config.to_yaml().unwrap();
        let back = Config::from_yaml(&yaml).unwrap();
        assert_eq!(back.samples.len(), 1);
        assert_eq!(back.samples[0].id, "s1");
        assert_eq!(back.features.window_size, 3);
    }

    #[test]
    fn test_yaml_defaults_fill_in() {
        let yaml = r#"
workdir: /tmp/wd
annotation_path: /tmp/orfs.tsv
samples:
  - id: s1
    reads_path: /tmp/s1.tsv
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.processing.concurrency, 8);
        assert_eq!(config.processing.retry.max_attempts, 3);
        assert_eq!(config.features.flank, 21);
    }
}
