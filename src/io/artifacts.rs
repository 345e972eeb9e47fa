//! Stage artifact persistence.
//!
//! Artifacts are serde-JSON documents addressed by a deterministic path
//! function of (unit, stage). Writes go to a uniquely named temporary
//! sibling and are renamed into place after fsync, so a partially written
//! artifact is never observed at the final path and writers racing on the
//! same artifact (a retry overlapping an abandoned timed-out attempt) can
//! only publish a complete document, never truncate each other's temp
//! file. Storage is partitioned per unit, so concurrent stages never
//! contend on the same file.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pipeline::graph::StageKind;

/// Per-process sequence making every temp-file name unique.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Deterministic artifact path layout rooted under the workdir.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(workdir: &Path) -> Self {
        Self {
            root: workdir.join("artifacts"),
        }
    }

    /// Path of the artifact for one (unit, stage) pair.
    pub fn stage_path(&self, unit: &str, stage: StageKind) -> PathBuf {
        self.root.join(unit).join(format!("{}.json", stage.name()))
    }
}

/// Atomically persist a JSON artifact: write to a uniquely named temporary
/// sibling, fsync, then rename over the final path. The pid + sequence
/// suffix keeps overlapping writers to the same path on disjoint temp
/// files.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create artifact dir {}", parent.display()))?;
    }

    let bytes = serde_json::to_vec(value).context("artifact serialization failed")?;
    let tmp = path.with_extension(format!(
        "json.tmp.{}.{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let mut file =
        File::create(&tmp).with_context(|| format!("cannot create {}", tmp.display()))?;
    file.write_all(&bytes)
        .with_context(|| format!("cannot write {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("cannot sync {}", tmp.display()))?;
    drop(file);

    fs::rename(&tmp, path).with_context(|| {
        format!("cannot rename {} to {}", tmp.display(), path.display())
    })?;

    Ok(bytes.len() as u64)
}

/// Read a JSON artifact.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("cannot read artifact {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("corrupt artifact {}", path.display()))
}
