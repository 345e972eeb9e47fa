//! Domain types shared across the pipeline.
//!
//! Coordinates are transcript-relative: the external read mapper aligns
//! ribosome footprints to transcripts, and the annotation provider reports
//! ORF start/end within the same transcript. `start` is inclusive, `end`
//! exclusive. The strand field carries the originating genomic strand; a
//! read only contributes to an ORF profile when the strands match.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Genomic strand of a read or ORF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strand {
    #[serde(rename = "+")]
    Forward,
    #[serde(rename = "-")]
    Reverse,
}

impl std::str::FromStr for Strand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" => Ok(Strand::Forward),
            "-" => Ok(Strand::Reverse),
            other => Err(format!("invalid strand '{}', expected '+' or '-'", other)),
        }
    }
}

impl std::fmt::Display for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Strand::Forward => "+",
            Strand::Reverse => "-",
        })
    }
}

/// A registered biological sample. Immutable after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Unique sample identifier
    pub id: String,

    /// Path to the aligned-read TSV produced by the external read mapper
    pub reads_path: PathBuf,

    /// Replicate-group identifier (samples sharing a group are merged)
    pub group: String,
}

/// A candidate open reading frame from the annotation provider. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrfRecord {
    /// Unique ORF identifier
    pub id: String,

    /// Transcript the ORF lies on
    pub transcript_id: String,

    /// Inclusive start position on the transcript
    pub start: u64,

    /// Exclusive end position on the transcript
    pub end: u64,

    /// Originating genomic strand
    pub strand: Strand,

    /// Reading frame offset relative to `start` (0, 1, or 2)
    pub frame: u8,
}

/// One aligned ribosome footprint from the external read mapper.
///
/// `position` is the inferred P-site position after offset correction
/// (raw 5' position for unfiltered input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignedRead {
    pub transcript_id: String,
    pub position: u64,
    pub strand: Strand,
    pub length: u32,
}

/// Per-nucleotide read counts spanning one ORF plus flanking context,
/// for one (sample, ORF) pair. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadDensityProfile {
    pub orf_id: String,

    /// Transcript position of the first profile entry
    pub start: u64,

    /// Phase of position index 0: a profile index i is in-frame when
    /// (i - frame_offset) mod 3 == 0
    pub frame_offset: u8,

    /// Read count per nucleotide position
    pub counts: Vec<u32>,
}

impl ReadDensityProfile {
    /// Total reads in the profile.
    pub fn total_reads(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }
}

/// Periodicity summary derived from one Read-Density Profile.
///
/// The three phase buckets partition all profile positions; the vector is a
/// pure function of the profile and the extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseFeatures {
    pub orf_id: String,

    /// Raw read counts per phase bucket
    pub phase_counts: [u64; 3],

    /// Moving-average-smoothed density mass per phase bucket
    pub smoothed_phase_density: [f64; 3],

    /// Number of positions in the source profile
    pub profile_len: usize,

    /// Total reads in the source profile
    pub total_reads: u64,

    /// True when total_reads fell below the configured minimum; the
    /// classifier maps this to an automatic not-translated call.
    pub insufficient: bool,
}

/// Classification outcome label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallLabel {
    NotTranslated,
    Phase0,
    Phase1,
    Phase2,
    Ambiguous,
}

impl CallLabel {
    /// The translated phase, if this label names one.
    pub fn phase(&self) -> Option<u8> {
        match self {
            CallLabel::Phase0 => Some(0),
            CallLabel::Phase1 => Some(1),
            CallLabel::Phase2 => Some(2),
            _ => None,
        }
    }
}

/// Final classification for one (unit, ORF) pair.
///
/// `posteriors` holds [not-translated, phase-0, phase-1, phase-2] and sums
/// to 1 within numerical tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationCall {
    pub orf_id: String,
    pub posteriors: [f64; 4],
    pub label: CallLabel,

    /// Posterior mass of the selected model
    pub confidence: f64,

    pub total_reads: u64,
    pub insufficient_evidence: bool,
}

impl TranslationCall {
    /// Total posterior mass assigned to the three translated models.
    pub fn translated_mass(&self) -> f64 {
        1.0 - self.posteriors[0]
    }
}

// --- Stage artifact documents -------------------------------------------

/// Artifact of the filter-reads stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredReads {
    pub sample_id: String,
    pub reads: Vec<AlignedRead>,
}

/// Artifact of the build-profiles stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSet {
    pub sample_id: String,
    pub profiles: Vec<ReadDensityProfile>,
}

/// Artifact of the extract-features stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSet {
    pub unit: String,
    pub features: Vec<PhaseFeatures>,
}

/// Artifact of the classify and merge-group stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSet {
    pub unit: String,
    pub calls: Vec<TranslationCall>,
}

/// One entry of the final ranking artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedCall {
    pub rank: u32,
    pub group_id: String,
    pub call: TranslationCall,
}

/// Artifact of the rank-calls stage: all group-level calls ordered by
/// translated posterior mass, descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedCalls {
    pub calls: Vec<RankedCall>,
}
