//! Bayesian model comparison for translation calls.
//!
//! Four competing generative models explain the observed phase counts of an
//! ORF: M0 draws counts from a uniform multinomial (no periodicity), and
//! M1..M3 from a multinomial peaked at phase k with mass `rho`. Posteriors
//! are obtained by combining multinomial log-likelihoods with log-priors
//! and normalizing through log-sum-exp. The multinomial coefficient is
//! identical across models for fixed counts and cancels in normalization,
//! so it is omitted.
//!
//! The procedure is deterministic and side-effect free; no state is carried
//! across calls.

use std::collections::HashSet;
use std::path::Path;

use crate::config::ClassifierConfig;
use crate::model::{CallLabel, PhaseFeatures, TranslationCall};

/// Documented default peak mass for the periodic models.
pub const DEFAULT_RHO: f64 = 0.7;

/// Documented default confidence threshold.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Bounds applied to the empirically fitted peak mass.
const RHO_FIT_MIN: f64 = 0.4;
const RHO_FIT_MAX: f64 = 0.95;

/// Resolved classifier parameters.
#[derive(Debug, Clone)]
pub struct ClassifierParams {
    /// Peak phase mass of M1..M3
    pub rho: f64,

    /// Log-priors over [M0, M1, M2, M3]
    pub log_priors: [f64; 4],

    /// Minimum posterior for a confident call
    pub confidence_threshold: f64,
}

impl ClassifierParams {
    /// Build parameters from an explicit prior vector. Priors are
    /// normalized defensively before taking logs.
    pub fn new(rho: f64, priors: [f64; 4], confidence_threshold: f64) -> Self {
        let sum: f64 = priors.iter().sum();
        let log_priors = [
            (priors[0] / sum).ln(),
            (priors[1] / sum).ln(),
            (priors[2] / sum).ln(),
            (priors[3] / sum).ln(),
        ];
        Self {
            rho,
            log_priors,
            confidence_threshold,
        }
    }

    /// Fixed default parameters: uniform priors, `DEFAULT_RHO`.
    pub fn defaults(confidence_threshold: f64) -> Self {
        Self::new(DEFAULT_RHO, [0.25; 4], confidence_threshold)
    }

    /// Resolve parameters from configuration, without empirical fitting.
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let priors = config.priors.unwrap_or([0.25; 4]);
        Self::new(config.rho, priors, config.confidence_threshold)
    }

    /// Log phase probabilities under each model.
    fn model_log_probs(&self) -> [[f64; 3]; 4] {
        let uniform = (1.0f64 / 3.0).ln();
        let peak = self.rho.ln();
        let off = ((1.0 - self.rho) / 2.0).ln();
        [
            [uniform, uniform, uniform],
            [peak, off, off],
            [off, peak, off],
            [off, off, peak],
        ]
    }
}

/// Numerically stable log(sum(exp(x))): the maximum is subtracted before
/// exponentiation so extreme log-likelihoods cannot overflow or underflow.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Classify one feature vector into a Translation Call.
pub fn classify(features: &PhaseFeatures, params: &ClassifierParams) -> TranslationCall {
    if features.insufficient {
        // Automatic not-translated with maximal uncertainty; never a
        // numeric error.
        return TranslationCall {
            orf_id: features.orf_id.clone(),
            posteriors: [0.25; 4],
            label: CallLabel::NotTranslated,
            confidence: 0.25,
            total_reads: features.total_reads,
            insufficient_evidence: true,
        };
    }

    let counts = features.phase_counts;
    let model_log_probs = params.model_log_probs();

    let mut log_post = [0f64; 4];
    for (m, probs) in model_log_probs.iter().enumerate() {
        let log_lik: f64 = counts
            .iter()
            .zip(probs.iter())
            .map(|(&c, &lp)| c as f64 * lp)
            .sum();
        log_post[m] = params.log_priors[m] + log_lik;
    }

    let norm = log_sum_exp(&log_post);
    let mut posteriors = [0f64; 4];
    for m in 0..4 {
        posteriors[m] = (log_post[m] - norm).exp();
    }

    let (best, &best_post) = posteriors
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .unwrap_or((0, &posteriors[0]));

    let label = if best == 0 {
        CallLabel::NotTranslated
    } else if best_post >= params.confidence_threshold {
        match best {
            1 => CallLabel::Phase0,
            2 => CallLabel::Phase1,
            _ => CallLabel::Phase2,
        }
    } else {
        CallLabel::Ambiguous
    };

    TranslationCall {
        orf_id: features.orf_id.clone(),
        posteriors,
        label,
        confidence: best_post,
        total_reads: features.total_reads,
        insufficient_evidence: false,
    }
}

/// Merge replicate feature vectors for one ORF by summing phase counts.
///
/// This is the caller-selected replicate-merge mode: merging happens before
/// classification, and the insufficiency flag is re-evaluated against the
/// combined total.
pub fn merge_features(orf_id: &str, parts: &[&PhaseFeatures], min_reads: u64) -> PhaseFeatures {
    let mut phase_counts = [0u64; 3];
    let mut smoothed = [0f64; 3];
    let mut total_reads = 0u64;
    let mut profile_len = 0usize;

    for part in parts {
        for p in 0..3 {
            phase_counts[p] += part.phase_counts[p];
            smoothed[p] += part.smoothed_phase_density[p];
        }
        total_reads += part.total_reads;
        profile_len = profile_len.max(part.profile_len);
    }

    PhaseFeatures {
        orf_id: orf_id.to_string(),
        phase_counts,
        smoothed_phase_density: smoothed,
        profile_len,
        total_reads,
        insufficient: total_reads < min_reads,
    }
}

/// External reference sets of ORF ids with known translation status.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSets {
    pub translated: HashSet<String>,
    pub untranslated: HashSet<String>,
}

impl ReferenceSets {
    /// Load reference sets from plain-text id lists (one id per line,
    /// `#` comments and blank lines ignored). Either path may be absent.
    pub fn load(
        translated: Option<&Path>,
        untranslated: Option<&Path>,
    ) -> anyhow::Result<Option<Self>> {
        if translated.is_none() && untranslated.is_none() {
            return Ok(None);
        }

        let read_ids = |path: &Path| -> anyhow::Result<HashSet<String>> {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("cannot read reference set {}: {}", path.display(), e))?;
            Ok(contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect())
        };

        Ok(Some(Self {
            translated: translated.map(read_ids).transpose()?.unwrap_or_default(),
            untranslated: untranslated.map(read_ids).transpose()?.unwrap_or_default(),
        }))
    }
}

/// Empirical-Bayes parameter estimation over reference ORFs.
///
/// `rho` is fitted as the mean dominant-phase fraction among
/// known-translated ORFs with adequate evidence, clamped to
/// [`RHO_FIT_MIN`, `RHO_FIT_MAX`]; priors are the class frequencies of the
/// matched reference ORFs with the translated mass split evenly over the
/// three phase models. Falls back to `base` when the reference sets do not
/// intersect the observed features.
pub fn fit_params(
    features: &[PhaseFeatures],
    refs: &ReferenceSets,
    base: &ClassifierParams,
) -> ClassifierParams {
    let mut rho_sum = 0.0;
    let mut translated_n = 0usize;
    let mut untranslated_n = 0usize;

    for f in features {
        if f.insufficient {
            continue;
        }
        if refs.translated.contains(&f.orf_id) {
            let dominant = *f.phase_counts.iter().max().unwrap_or(&0);
            if f.total_reads > 0 {
                rho_sum += dominant as f64 / f.total_reads as f64;
                translated_n += 1;
            }
        } else if refs.untranslated.contains(&f.orf_id) {
            untranslated_n += 1;
        }
    }

    if translated_n == 0 && untranslated_n == 0 {
        return base.clone();
    }

    let rho = if translated_n > 0 {
        (rho_sum / translated_n as f64).clamp(RHO_FIT_MIN, RHO_FIT_MAX)
    } else {
        base.rho
    };

    let priors = if translated_n > 0 && untranslated_n > 0 {
        let total = (translated_n + untranslated_n) as f64;
        let p_translated = translated_n as f64 / total;
        [
            untranslated_n as f64 / total,
            p_translated / 3.0,
            p_translated / 3.0,
            p_translated / 3.0,
        ]
    } else {
        [
            base.log_priors[0].exp(),
            base.log_priors[1].exp(),
            base.log_priors[2].exp(),
            base.log_priors[3].exp(),
        ]
    };

    ClassifierParams::new(rho, priors, base.confidence_threshold)
}
