//! Per-sample stage bodies.
//!
//! `StageRunner` executes one (unit, stage) pair synchronously on the
//! calling thread; the scheduler moves it onto the blocking pool and
//! enforces the timeout. Each stage reads its declared upstream artifacts,
//! computes, and persists exactly one artifact atomically before returning,
//! so a stage that returns `Ok` is durably complete and a re-run of the
//! same key is idempotent.

use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::classify::{classify, fit_params, merge_features, ClassifierParams, ReferenceSets};
use crate::config::{Config, SampleConfig};
use crate::error::StageError;
use crate::features::{extract_features, FeatureParams};
use crate::io::artifacts::{read_json, write_json_atomic, ArtifactLayout};
use crate::io::reads::{filter_reads, load_aligned_reads, ReadFilter};
use crate::model::{
    AlignedRead, CallSet, FeatureSet, FilteredReads, OrfRecord, PhaseFeatures, ProfileSet,
    RankedCall, RankedCalls, ReadDensityProfile,
};
use crate::pipeline::graph::{StageKey, StageKind};
use crate::pipeline::metrics::Metrics;

/// Synchronous execution of one stage attempt. Implemented by the real
/// runner and by scripted executors in scheduler tests.
pub trait StageExecutor: Send + Sync + 'static {
    /// Execute the stage and return the path of its persisted artifact.
    fn execute(&self, key: &StageKey, attempt: u32) -> Result<PathBuf, StageError>;
}

/// The production stage runner: owns the loaded annotation, the artifact
/// layout, and the resolved parameters.
pub struct StageRunner {
    config: Arc<Config>,
    annotation: Arc<Vec<OrfRecord>>,
    layout: ArtifactLayout,
    metrics: Arc<Metrics>,
    reference_sets: Arc<Option<ReferenceSets>>,
}

impl StageRunner {
    pub fn new(
        config: Arc<Config>,
        annotation: Arc<Vec<OrfRecord>>,
        metrics: Arc<Metrics>,
        reference_sets: Arc<Option<ReferenceSets>>,
    ) -> Self {
        let layout = ArtifactLayout::new(&config.workdir);
        Self {
            config,
            annotation,
            layout,
            metrics,
            reference_sets,
        }
    }

    fn compute_err(key: &StageKey, err: impl std::fmt::Display) -> StageError {
        StageError::Compute {
            unit: key.unit.clone(),
            stage: key.stage.name().to_string(),
            message: err.to_string(),
        }
    }

    /// Read an upstream artifact; a missing file is an input error, not a
    /// compute error, so the checkpoint record reflects the true cause.
    fn read_input<T: serde::de::DeserializeOwned>(
        &self,
        key: &StageKey,
        unit: &str,
        stage: StageKind,
    ) -> Result<T, StageError> {
        let path = self.layout.stage_path(unit, stage);
        if !path.exists() {
            return Err(StageError::InputMissing {
                unit: key.unit.clone(),
                stage: key.stage.name().to_string(),
                path,
            });
        }
        read_json(&path).map_err(|e| Self::compute_err(key, format!("{:#}", e)))
    }

    fn write_output<T: serde::Serialize>(
        &self,
        key: &StageKey,
        value: &T,
    ) -> Result<PathBuf, StageError> {
        let path = self.layout.stage_path(&key.unit, key.stage);
        let bytes = write_json_atomic(&path, value).map_err(|e| StageError::Write {
            unit: key.unit.clone(),
            stage: key.stage.name().to_string(),
            message: format!("{:#}", e),
        })?;
        self.metrics.add_bytes_written(bytes);
        Ok(path)
    }

    fn sample(&self, key: &StageKey) -> Result<&SampleConfig, StageError> {
        self.config
            .samples
            .iter()
            .find(|s| s.id == key.unit)
            .ok_or_else(|| Self::compute_err(key, format!("unknown sample '{}'", key.unit)))
    }

    fn classifier_params(&self, features: &[PhaseFeatures]) -> ClassifierParams {
        let base = ClassifierParams::from_config(&self.config.classifier);
        match self.reference_sets.as_ref() {
            Some(refs) => fit_params(features, refs, &base),
            None => base,
        }
    }

    fn run_filter_reads(&self, key: &StageKey) -> Result<PathBuf, StageError> {
        let sample = self.sample(key)?;
        if !sample.reads_path.exists() {
            return Err(StageError::InputMissing {
                unit: key.unit.clone(),
                stage: key.stage.name().to_string(),
                path: sample.reads_path.clone(),
            });
        }

        let reads = load_aligned_reads(&sample.reads_path)
            .map_err(|e| Self::compute_err(key, format!("{:#}", e)))?;
        self.metrics.add_reads_parsed(reads.len() as u64);

        let filter = ReadFilter::from(&self.config.features);
        let kept = filter_reads(reads, &filter);
        self.metrics.add_reads_kept(kept.len() as u64);
        tracing::debug!(sample = %key.unit, kept = kept.len(), "filtered reads");

        self.write_output(
            key,
            &FilteredReads {
                sample_id: key.unit.clone(),
                reads: kept,
            },
        )
    }

    fn run_build_profiles(&self, key: &StageKey) -> Result<PathBuf, StageError> {
        let filtered: FilteredReads = self.read_input(key, &key.unit, StageKind::FilterReads)?;

        let mut by_transcript: HashMap<&str, Vec<&AlignedRead>> = HashMap::new();
        for read in &filtered.reads {
            by_transcript
                .entry(read.transcript_id.as_str())
                .or_default()
                .push(read);
        }

        let flank = self.config.features.flank;
        let profiles: Vec<ReadDensityProfile> = self
            .annotation
            .par_iter()
            .map(|orf| build_profile(orf, &by_transcript, flank))
            .collect();
        self.metrics.add_orfs_profiled(profiles.len() as u64);

        self.write_output(
            key,
            &ProfileSet {
                sample_id: key.unit.clone(),
                profiles,
            },
        )
    }

    fn run_extract_features(&self, key: &StageKey) -> Result<PathBuf, StageError> {
        let profiles: ProfileSet = self.read_input(key, &key.unit, StageKind::BuildProfiles)?;

        let params = FeatureParams::from(&self.config.features);
        let features: Vec<PhaseFeatures> = profiles
            .profiles
            .par_iter()
            .map(|p| extract_features(p, &params))
            .collect();

        self.write_output(
            key,
            &FeatureSet {
                unit: key.unit.clone(),
                features,
            },
        )
    }

    fn run_classify(&self, key: &StageKey) -> Result<PathBuf, StageError> {
        let set: FeatureSet = self.read_input(key, &key.unit, StageKind::ExtractFeatures)?;

        let params = self.classifier_params(&set.features);
        let calls: Vec<_> = set
            .features
            .par_iter()
            .map(|f| classify(f, &params))
            .collect();
        self.metrics.add_orfs_classified(calls.len() as u64);

        self.write_output(
            key,
            &CallSet {
                unit: key.unit.clone(),
                calls,
            },
        )
    }

    fn run_merge_group(&self, key: &StageKey) -> Result<PathBuf, StageError> {
        let groups = self.config.groups();
        let members = groups
            .get(&key.unit)
            .ok_or_else(|| Self::compute_err(key, format!("unknown group '{}'", key.unit)))?;

        let mut sets = Vec::with_capacity(members.len());
        for member in members {
            let set: FeatureSet = self.read_input(key, member, StageKind::ExtractFeatures)?;
            sets.push(set);
        }

        // Deterministic ORF order regardless of member ordering.
        let mut by_orf: BTreeMap<&str, Vec<&PhaseFeatures>> = BTreeMap::new();
        for set in &sets {
            for f in &set.features {
                by_orf.entry(f.orf_id.as_str()).or_default().push(f);
            }
        }

        let min_reads = self.config.features.min_reads;
        let merged: Vec<PhaseFeatures> = by_orf
            .iter()
            .map(|(orf_id, parts)| merge_features(orf_id, parts, min_reads))
            .collect();

        let params = self.classifier_params(&merged);
        let calls: Vec<_> = merged.par_iter().map(|f| classify(f, &params)).collect();
        self.metrics.add_orfs_classified(calls.len() as u64);
        tracing::debug!(group = %key.unit, members = members.len(), orfs = calls.len(), "merged replicates");

        self.write_output(
            key,
            &CallSet {
                unit: key.unit.clone(),
                calls,
            },
        )
    }

    fn run_rank_calls(&self, key: &StageKey) -> Result<PathBuf, StageError> {
        let mut flat: Vec<(String, crate::model::TranslationCall)> = Vec::new();
        for group in self.config.groups().keys() {
            let set: CallSet = self.read_input(key, group, StageKind::MergeGroup)?;
            for call in set.calls {
                flat.push((group.clone(), call));
            }
        }

        // Order by translated posterior mass, then orf id for stable ties.
        flat.sort_by(|a, b| {
            b.1.translated_mass()
                .total_cmp(&a.1.translated_mass())
                .then_with(|| a.1.orf_id.cmp(&b.1.orf_id))
                .then_with(|| a.0.cmp(&b.0))
        });

        let calls = flat
            .into_iter()
            .enumerate()
            .map(|(i, (group_id, call))| RankedCall {
                rank: i as u32 + 1,
                group_id,
                call,
            })
            .collect();

        self.write_output(key, &RankedCalls { calls })
    }
}

impl StageExecutor for StageRunner {
    fn execute(&self, key: &StageKey, attempt: u32) -> Result<PathBuf, StageError> {
        tracing::info!(stage = %key, attempt, "stage started");
        let started = Instant::now();

        let result = match key.stage {
            StageKind::FilterReads => self.run_filter_reads(key),
            StageKind::BuildProfiles => self.run_build_profiles(key),
            StageKind::ExtractFeatures => self.run_extract_features(key),
            StageKind::Classify => self.run_classify(key),
            StageKind::MergeGroup => self.run_merge_group(key),
            StageKind::RankCalls => self.run_rank_calls(key),
        };

        self.metrics.add_stage_time(key.stage, started.elapsed());
        result
    }
}

/// Build the read-density profile of one ORF: counts per nucleotide over
/// the ORF span plus flanking context, from strand-matched P-site
/// positions.
fn build_profile(
    orf: &OrfRecord,
    by_transcript: &HashMap<&str, Vec<&AlignedRead>>,
    flank: u64,
) -> ReadDensityProfile {
    let span_start = orf.start.saturating_sub(flank);
    let span_end = orf.end + flank;
    let mut counts = vec![0u32; (span_end - span_start) as usize];

    if let Some(reads) = by_transcript.get(orf.transcript_id.as_str()) {
        for read in reads {
            if read.strand != orf.strand {
                continue;
            }
            if read.position >= span_start && read.position < span_end {
                counts[(read.position - span_start) as usize] += 1;
            }
        }
    }

    // Phase of index 0 relative to the ORF reading frame.
    let frame_offset = ((orf.start + orf.frame as u64 - span_start) % 3) as u8;

    ReadDensityProfile {
        orf_id: orf.id.clone(),
        start: span_start,
        frame_offset,
        counts,
    }
}
