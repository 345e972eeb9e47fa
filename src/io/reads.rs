//! Read-mapper interface: aligned ribosome footprints per sample.
//!
//! The external read mapper produces a position-sorted TSV with one
//! footprint per line:
//!
//! ```text
//! transcript_id<TAB>position<TAB>strand<TAB>read_length
//! ```
//!
//! This module consumes only that tuple; mapping internals stay outside
//! the pipeline.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::config::FeatureConfig;
use crate::model::{AlignedRead, Strand};

/// Footprint-length window and P-site offset applied during filtering.
#[derive(Debug, Clone, Copy)]
pub struct ReadFilter {
    pub min_len: u32,
    pub max_len: u32,

    /// Shift from the 5' end to the inferred ribosomal P-site
    pub psite_offset: u64,
}

impl From<&FeatureConfig> for ReadFilter {
    fn from(config: &FeatureConfig) -> Self {
        Self {
            min_len: config.min_read_len,
            max_len: config.max_read_len,
            psite_offset: config.psite_offset,
        }
    }
}

/// Load all aligned reads for one sample.
pub fn load_aligned_reads(path: &Path) -> Result<Vec<AlignedRead>> {
    let file = File::open(path)
        .with_context(|| format!("cannot open aligned reads at {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut reads = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read error at {}:{}", path.display(), lineno + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        reads.push(
            parse_read_line(trimmed)
                .with_context(|| format!("malformed read at {}:{}", path.display(), lineno + 1))?,
        );
    }
    Ok(reads)
}

fn parse_read_line(line: &str) -> Result<AlignedRead> {
    let mut fields = line.split('\t');
    let transcript_id = fields
        .next()
        .filter(|s| !s.is_empty())
        .context("missing transcript id")?;
    let position: u64 = fields
        .next()
        .context("missing position")?
        .parse()
        .context("invalid position")?;
    let strand: Strand = fields
        .next()
        .context("missing strand")?
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let length: u32 = fields
        .next()
        .context("missing read length")?
        .parse()
        .context("invalid read length")?;

    Ok(AlignedRead {
        transcript_id: transcript_id.to_string(),
        position,
        strand,
        length,
    })
}

/// Apply the footprint-length window and shift kept reads to their P-site
/// position. Reverse-strand footprints shift toward lower coordinates.
pub fn filter_reads(reads: Vec<AlignedRead>, filter: &ReadFilter) -> Vec<AlignedRead> {
    reads
        .into_iter()
        .filter(|r| r.length >= filter.min_len && r.length <= filter.max_len)
        .map(|mut r| {
            r.position = match r.strand {
                Strand::Forward => r.position + filter.psite_offset,
                Strand::Reverse => r.position.saturating_sub(filter.psite_offset),
            };
            r
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tsv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_aligned_reads() {
        let file = write_tsv("# comment\ntx1\t100\t+\t30\ntx1\t103\t-\t28\n\ntx2\t5\t+\t35\n");
        let reads = load_aligned_reads(file.path()).unwrap();
        assert_eq!(reads.len(), 3);
        assert_eq!(reads[0].transcript_id, "tx1");
        assert_eq!(reads[0].position, 100);
        assert_eq!(reads[1].strand, Strand::Reverse);
        assert_eq!(reads[2].length, 35);
    }

    #[test]
    fn test_load_rejects_malformed_lines() {
        let file = write_tsv("tx1\tnot_a_number\t+\t30\n");
        assert!(load_aligned_reads(file.path()).is_err());

        let file = write_tsv("tx1\t100\t*\t30\n");
        assert!(load_aligned_reads(file.path()).is_err());

        let file = write_tsv("tx1\t100\n");
        assert!(load_aligned_reads(file.path()).is_err());
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(load_aligned_reads(Path::new("/nonexistent/reads.tsv")).is_err());
    }

    fn read(position: u64, strand: Strand, length: u32) -> AlignedRead {
        AlignedRead {
            transcript_id: "tx1".into(),
            position,
            strand,
            length,
        }
    }

    #[test]
    fn test_filter_length_window() {
        let filter = ReadFilter {
            min_len: 26,
            max_len: 35,
            psite_offset: 0,
        };
        let reads = vec![
            read(0, Strand::Forward, 25),
            read(0, Strand::Forward, 26),
            read(0, Strand::Forward, 35),
            read(0, Strand::Forward, 36),
        ];
        let kept = filter_reads(reads, &filter);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_psite_offset_shifts_by_strand() {
        let filter = ReadFilter {
            min_len: 20,
            max_len: 40,
            psite_offset: 12,
        };
        let kept = filter_reads(
            vec![read(100, Strand::Forward, 30), read(100, Strand::Reverse, 30)],
            &filter,
        );
        assert_eq!(kept[0].position, 112);
        assert_eq!(kept[1].position, 88);
    }

    #[test]
    fn test_reverse_shift_saturates_at_zero() {
        let filter = ReadFilter {
            min_len: 20,
            max_len: 40,
            psite_offset: 12,
        };
        let kept = filter_reads(vec![read(5, Strand::Reverse, 30)], &filter);
        assert_eq!(kept[0].position, 0);
    }
}
