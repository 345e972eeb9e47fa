//! End-to-end pipeline tests over temporary workspaces: real reads and
//! annotation files in, ranked calls and checkpoint state out.

use std::fs;
use std::path::Path;

use crate::config::{
    ClassifierConfig, Config, FeatureConfig, ProcessingConfig, RetryConfig, SampleConfig, RUN_UNIT,
};
use crate::io::artifacts::{read_json, ArtifactLayout};
use crate::model::{CallLabel, CallSet, RankedCalls};
use crate::pipeline::graph::StageKind;
use crate::{pipeline_status, reset_checkpoints, run_pipeline};

/// Reads with a clean period-3 signature in frame 0: two footprints at
/// every third position of the ORF.
fn periodic_reads(transcript: &str, orf_len: u64) -> String {
    let mut out = String::new();
    for pos in (0..orf_len).step_by(3) {
        for _ in 0..2 {
            out.push_str(&format!("{}\t{}\t+\t30\n", transcript, pos));
        }
    }
    out
}

/// One footprint at every position: no periodicity at all.
fn uniform_reads(transcript: &str, orf_len: u64) -> String {
    let mut out = String::new();
    for pos in 0..orf_len {
        out.push_str(&format!("{}\t{}\t+\t30\n", transcript, pos));
    }
    out
}

/// Two ORFs: one with periodic coverage, one with flat coverage.
fn write_annotation(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("orfs.tsv");
    fs::write(
        &path,
        "orf_per\ttx1\t0\t30\t+\t0\n\
         orf_uni\ttx2\t0\t30\t+\t0\n",
    )
    .unwrap();
    path
}

fn write_reads(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(format!("{}.reads.tsv", name));
    let mut contents = periodic_reads("tx1", 30);
    contents.push_str(&uniform_reads("tx2", 30));
    fs::write(&path, contents).unwrap();
    path
}

/// Exact-position test configuration: no P-site shift, no flank, no
/// smoothing, so phase counts match the synthetic read layout.
fn test_config(dir: &Path, samples: Vec<SampleConfig>, max_attempts: u32) -> Config {
    Config {
        workdir: dir.join("work"),
        annotation_path: write_annotation(dir),
        samples,
        features: FeatureConfig {
            window_size: 1,
            min_reads: 5,
            flank: 0,
            min_read_len: 26,
            max_read_len: 35,
            psite_offset: 0,
        },
        classifier: ClassifierConfig::default(),
        processing: ProcessingConfig {
            concurrency: 4,
            worker_threads: None,
            rayon_threads: None,
            retry: RetryConfig { max_attempts },
            stage_timeout_secs: 30,
            enable_metrics: false,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        },
    }
}

fn two_replicate_config(dir: &Path) -> Config {
    let samples = vec![
        SampleConfig {
            id: "rep1".into(),
            reads_path: write_reads(dir, "rep1"),
            group: Some("wt".into()),
        },
        SampleConfig {
            id: "rep2".into(),
            reads_path: write_reads(dir, "rep2"),
            group: Some("wt".into()),
        },
    ];
    test_config(dir, samples, 3)
}

#[tokio::test]
async fn test_end_to_end_ranked_calls() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_replicate_config(dir.path());

    let summary = run_pipeline(config.clone()).await.unwrap();
    assert!(summary.all_complete());
    // 4 per-sample stages x 2 samples + 1 merge + 1 rank
    assert_eq!(summary.total, 10);
    assert_eq!(summary.exit_code(), 0);

    let layout = ArtifactLayout::new(&config.workdir);

    // Per-sample calls exist for both replicates.
    let rep1: CallSet = read_json(&layout.stage_path("rep1", StageKind::Classify)).unwrap();
    assert_eq!(rep1.calls.len(), 2);

    // Group-level calls: periodic ORF confidently translated in frame 0,
    // flat ORF not translated.
    let merged: CallSet = read_json(&layout.stage_path("wt", StageKind::MergeGroup)).unwrap();
    let per = merged.calls.iter().find(|c| c.orf_id == "orf_per").unwrap();
    assert_eq!(per.label, CallLabel::Phase0);
    assert!(per.translated_mass() > 0.9);
    assert_eq!(per.total_reads, 40);

    let uni = merged.calls.iter().find(|c| c.orf_id == "orf_uni").unwrap();
    assert_eq!(uni.label, CallLabel::NotTranslated);
    assert!(uni.posteriors[0] > 0.9);

    // Final ranking: the periodic ORF outranks the flat one.
    let ranked: RankedCalls =
        read_json(&layout.stage_path(RUN_UNIT, StageKind::RankCalls)).unwrap();
    assert_eq!(ranked.calls.len(), 2);
    assert_eq!(ranked.calls[0].rank, 1);
    assert_eq!(ranked.calls[0].call.orf_id, "orf_per");
    assert_eq!(ranked.calls[0].group_id, "wt");
    assert_eq!(ranked.calls[1].call.orf_id, "orf_uni");
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_replicate_config(dir.path());

    let first = run_pipeline(config.clone()).await.unwrap();
    assert!(first.all_complete());
    let log_path = config.workdir.join("checkpoint.log");
    let log_len = fs::metadata(&log_path).unwrap().len();

    // Everything is checkpointed complete: nothing dispatched, nothing
    // appended to the log.
    let second = run_pipeline(config.clone()).await.unwrap();
    assert!(second.all_complete());
    assert_eq!(second.dispatched, 0);
    assert_eq!(fs::metadata(&log_path).unwrap().len(), log_len);

    let report = pipeline_status(&config).unwrap();
    assert_eq!(report.complete, report.total);
    // Every stage kind fully complete in the breakdown.
    assert_eq!(report.per_stage.len(), StageKind::ALL.len());
    for (_, complete, total) in &report.per_stage {
        assert_eq!(complete, total);
    }
}

#[tokio::test]
async fn test_missing_reads_then_reset_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let missing_path = dir.path().join("late.reads.tsv");
    let samples = vec![
        SampleConfig {
            id: "good".into(),
            reads_path: write_reads(dir.path(), "good"),
            group: None,
        },
        SampleConfig {
            id: "late".into(),
            reads_path: missing_path.clone(),
            group: None,
        },
    ];
    let config = test_config(dir.path(), samples, 1);

    let summary = run_pipeline(config.clone()).await.unwrap();
    assert!(!summary.all_complete());
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.terminal_failed.len(), 1);
    assert_eq!(summary.terminal_failed[0].0.unit, "late");
    assert_eq!(
        summary.terminal_failed[0].1,
        Some(crate::error::StageErrorKind::InputMissing)
    );

    // The healthy sample chain and its group still completed; the run-level
    // ranking is blocked behind the failed sample's merge.
    let report = pipeline_status(&config).unwrap();
    assert_eq!(report.complete, 5);
    assert_eq!(report.terminal_failed.len(), 1);

    // Per-stage breakdown: only the healthy sample's chain completed, and
    // the run-level ranking is still outstanding.
    let by_kind = |kind: StageKind| {
        report
            .per_stage
            .iter()
            .find(|e| e.0 == kind)
            .map(|e| (e.1, e.2))
            .unwrap()
    };
    assert_eq!(by_kind(StageKind::FilterReads), (1, 2));
    assert_eq!(by_kind(StageKind::Classify), (1, 2));
    assert_eq!(by_kind(StageKind::MergeGroup), (1, 2));
    assert_eq!(by_kind(StageKind::RankCalls), (0, 1));

    // Deliver the reads, clear the failed unit, and resume.
    let mut contents = periodic_reads("tx1", 30);
    contents.push_str(&uniform_reads("tx2", 30));
    fs::write(&missing_path, contents).unwrap();
    let removed = reset_checkpoints(&config, Some("late")).unwrap();
    assert_eq!(removed, 1);

    let summary = run_pipeline(config).await.unwrap();
    assert!(summary.all_complete());
    // The late sample chain, its merge, and the ranking stage.
    assert_eq!(summary.dispatched, 6);
}

#[tokio::test]
async fn test_group_merge_outweighs_single_sample() {
    // A replicate pair where each sample alone is below min_reads for the
    // periodic ORF, but the merged counts clear it.
    let dir = tempfile::tempdir().unwrap();

    let sparse = |name: &str| {
        let path = dir.path().join(format!("{}.reads.tsv", name));
        // Three in-frame reads: under the min_reads of 5.
        fs::write(&path, "tx1\t0\t+\t30\ntx1\t3\t+\t30\ntx1\t6\t+\t30\n").unwrap();
        path
    };

    let samples = vec![
        SampleConfig {
            id: "a".into(),
            reads_path: sparse("a"),
            group: Some("wt".into()),
        },
        SampleConfig {
            id: "b".into(),
            reads_path: sparse("b"),
            group: Some("wt".into()),
        },
    ];
    let config = test_config(dir.path(), samples, 3);

    let summary = run_pipeline(config.clone()).await.unwrap();
    assert!(summary.all_complete());

    let layout = ArtifactLayout::new(&config.workdir);

    // Individually insufficient.
    let single: CallSet = read_json(&layout.stage_path("a", StageKind::Classify)).unwrap();
    let call = single.calls.iter().find(|c| c.orf_id == "orf_per").unwrap();
    assert!(call.insufficient_evidence);
    assert_eq!(call.label, CallLabel::NotTranslated);

    // Merged: 6 in-frame reads clear min_reads and call phase 0.
    let merged: CallSet = read_json(&layout.stage_path("wt", StageKind::MergeGroup)).unwrap();
    let call = merged.calls.iter().find(|c| c.orf_id == "orf_per").unwrap();
    assert!(!call.insufficient_evidence);
    assert_eq!(call.label, CallLabel::Phase0);
}
