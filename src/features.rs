//! Periodicity feature extraction.
//!
//! Converts a per-position read-count profile into phase-bucket summaries
//! that expose the 3-nucleotide periodicity of active translation. A
//! fixed-width moving average is applied before phase assignment to damp
//! single-position noise; raw counts are bucketed alongside so the
//! classifier sees untouched multinomial evidence.

use crate::config::FeatureConfig;
use crate::model::{PhaseFeatures, ReadDensityProfile};

/// Parameters of the feature extractor.
#[derive(Debug, Clone, Copy)]
pub struct FeatureParams {
    /// Moving-average span in nucleotides (odd)
    pub window_size: usize,

    /// Minimum total reads for a non-degenerate vector
    pub min_reads: u64,
}

impl From<&FeatureConfig> for FeatureParams {
    fn from(config: &FeatureConfig) -> Self {
        Self {
            window_size: config.window_size,
            min_reads: config.min_reads,
        }
    }
}

/// Extract the periodicity feature vector for one profile.
///
/// Every position is assigned to exactly one of the three phase buckets via
/// `(index - frame_offset) mod 3`. Profiles with fewer than `min_reads`
/// total reads are flagged insufficient rather than rejected; the
/// classifier maps the flag to an automatic not-translated call.
pub fn extract_features(profile: &ReadDensityProfile, params: &FeatureParams) -> PhaseFeatures {
    let total_reads = profile.total_reads();
    let smoothed = moving_average(&profile.counts, params.window_size);

    let mut phase_counts = [0u64; 3];
    let mut smoothed_phase_density = [0f64; 3];
    let offset = profile.frame_offset as i64;

    for (i, (&raw, &smooth)) in profile.counts.iter().zip(smoothed.iter()).enumerate() {
        let phase = (i as i64 - offset).rem_euclid(3) as usize;
        phase_counts[phase] += raw as u64;
        smoothed_phase_density[phase] += smooth;
    }

    PhaseFeatures {
        orf_id: profile.orf_id.clone(),
        phase_counts,
        smoothed_phase_density,
        profile_len: profile.counts.len(),
        total_reads,
        insufficient: total_reads < params.min_reads,
    }
}

/// Centered moving average with the window truncated at profile edges.
fn moving_average(counts: &[u32], window_size: usize) -> Vec<f64> {
    if window_size <= 1 || counts.is_empty() {
        return counts.iter().map(|&c| c as f64).collect();
    }

    let half = window_size / 2;
    let n = counts.len();
    let mut out = Vec::with_capacity(n);

    for i in 0..n {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(n);
        let sum: u64 = counts[lo..hi].iter().map(|&c| c as u64).sum();
        out.push(sum as f64 / (hi - lo) as f64);
    }

    out
}
