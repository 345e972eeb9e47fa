//! Annotation-provider interface: candidate ORF records.
//!
//! The annotation provider exports one ORF per line, transcript-relative
//! half-open coordinates:
//!
//! ```text
//! orf_id<TAB>transcript_id<TAB>start<TAB>end<TAB>strand<TAB>frame
//! ```
//!
//! Records are loaded once per pipeline run and treated as immutable.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::model::{OrfRecord, Strand};

/// Load the full ORF set for a run.
pub fn load_orfs(path: &Path) -> Result<Vec<OrfRecord>> {
    let file = File::open(path)
        .with_context(|| format!("cannot open annotation at {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut orfs = Vec::new();
    let mut seen = HashSet::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line =
            line.with_context(|| format!("read error at {}:{}", path.display(), lineno + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let orf = parse_orf_line(trimmed)
            .with_context(|| format!("malformed ORF at {}:{}", path.display(), lineno + 1))?;
        if !seen.insert(orf.id.clone()) {
            anyhow::bail!("duplicate ORF id '{}' at {}:{}", orf.id, path.display(), lineno + 1);
        }
        orfs.push(orf);
    }
    Ok(orfs)
}

fn parse_orf_line(line: &str) -> Result<OrfRecord> {
    let mut fields = line.split('\t');
    let id = fields
        .next()
        .filter(|s| !s.is_empty())
        .context("missing ORF id")?;
    let transcript_id = fields
        .next()
        .filter(|s| !s.is_empty())
        .context("missing transcript id")?;
    let start: u64 = fields
        .next()
        .context("missing start")?
        .parse()
        .context("invalid start")?;
    let end: u64 = fields
        .next()
        .context("missing end")?
        .parse()
        .context("invalid end")?;
    let strand: Strand = fields
        .next()
        .context("missing strand")?
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let frame: u8 = fields
        .next()
        .context("missing frame")?
        .parse()
        .context("invalid frame")?;

    if start >= end {
        anyhow::bail!("ORF '{}' has start {} >= end {}", id, start, end);
    }
    if frame > 2 {
        anyhow::bail!("ORF '{}' has frame {} (must be 0, 1, or 2)", id, frame);
    }

    Ok(OrfRecord {
        id: id.to_string(),
        transcript_id: transcript_id.to_string(),
        start,
        end,
        strand,
        frame,
    })
}
