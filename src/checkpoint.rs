//! Durable checkpoint store.
//!
//! An append-only JSON-lines log keyed by (unit, stage), fronted by an
//! in-memory index of the latest record per key. `record` is durable on
//! return: the line is written and fsynced before the call completes, so a
//! crash never loses a completion record. The full transition history is
//! retained in the log; only an explicit reset rewrites it.
//!
//! Writer discipline: concurrent writers for different keys are safe (the
//! log file itself is serialized behind a mutex); writers for the same key
//! must hold the key's claim, handed out to at most one holder at a time.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CheckpointError, StageErrorKind};
use crate::pipeline::graph::{StageKey, StageKind};

/// Lifecycle state of one (unit, stage) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageState {
    Pending,
    Running,
    Complete,
    Failed,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Complete => "complete",
            StageState::Failed => "failed",
        })
    }
}

/// One state-transition record in the checkpoint log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub unit: String,
    pub stage: StageKind,
    pub state: StageState,
    pub artifact: Option<PathBuf>,
    pub attempt: u32,
    pub error_kind: Option<StageErrorKind>,

    /// Unix timestamp (seconds) of the transition
    pub timestamp: u64,
}

impl StageRecord {
    pub fn key(&self) -> StageKey {
        StageKey::new(self.unit.clone(), self.stage)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Exclusive write claim on one (unit, stage) key. Released on drop.
pub struct WriterClaim {
    store: Arc<CheckpointStore>,
    key: StageKey,
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        self.store.writers.remove(&self.key);
    }
}

/// Durable append-only key-value log of stage records.
pub struct CheckpointStore {
    path: PathBuf,
    log: Mutex<File>,
    current: DashMap<StageKey, StageRecord>,
    writers: DashMap<StageKey, ()>,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint log and replay it into the
    /// in-memory index.
    pub fn open(path: &Path) -> Result<Arc<Self>, CheckpointError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let current = DashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: StageRecord =
                    serde_json::from_str(&line).map_err(|e| CheckpointError::Corrupt {
                        line: lineno + 1,
                        message: e.to_string(),
                    })?;
                current.insert(record.key(), record);
            }
        }

        let log = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            log: Mutex::new(log),
            current,
            writers: DashMap::new(),
        }))
    }

    /// Claim exclusive write access for one key. Fails if another claim is
    /// outstanding — this is the at-most-one-writer guarantee.
    pub fn claim_writer(self: &Arc<Self>, key: &StageKey) -> Result<WriterClaim, CheckpointError> {
        use dashmap::mapref::entry::Entry;
        match self.writers.entry(key.clone()) {
            Entry::Occupied(_) => Err(CheckpointError::WriterConflict {
                unit: key.unit.clone(),
                stage: key.stage.name().to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(WriterClaim {
                    store: Arc::clone(self),
                    key: key.clone(),
                })
            }
        }
    }

    /// Append one record. Durable on return.
    pub fn record(
        &self,
        key: &StageKey,
        state: StageState,
        artifact: Option<PathBuf>,
        attempt: u32,
        error_kind: Option<StageErrorKind>,
    ) -> Result<StageRecord, CheckpointError> {
        let record = StageRecord {
            unit: key.unit.clone(),
            stage: key.stage,
            state,
            artifact,
            attempt,
            error_kind,
            timestamp: now_secs(),
        };

        let line = serde_json::to_string(&record).map_err(|e| CheckpointError::Corrupt {
            line: 0,
            message: e.to_string(),
        })?;

        {
            let mut log = match self.log.lock() {
                Ok(guard) => guard,
                // A poisoned lock only means another writer panicked after
                // its own complete line; the file is still append-safe.
                Err(poisoned) => poisoned.into_inner(),
            };
            log.write_all(line.as_bytes())?;
            log.write_all(b"\n")?;
            log.sync_data()?;
        }

        self.current.insert(key.clone(), record.clone());
        Ok(record)
    }

    /// Latest record for one key.
    pub fn query(&self, key: &StageKey) -> Option<StageRecord> {
        self.current.get(key).map(|r| r.clone())
    }

    /// Snapshot of the latest record per key, deterministically ordered.
    pub fn query_all(&self) -> Vec<StageRecord> {
        let mut records: Vec<StageRecord> =
            self.current.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        records
    }

    /// Explicit pipeline reset: drop all records for one unit, or for all
    /// units. The log is rewritten atomically and the index rebuilt.
    /// Returns the number of keys removed.
    pub fn reset(&self, unit: Option<&str>) -> Result<usize, CheckpointError> {
        let mut log = match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let keep: Vec<StageRecord> = match unit {
            Some(unit) => self
                .query_all_unlocked()
                .into_iter()
                .filter(|r| r.unit != unit)
                .collect(),
            None => Vec::new(),
        };

        let tmp = self.path.with_extension("log.tmp");
        {
            let mut file = File::create(&tmp)?;
            for record in &keep {
                let line = serde_json::to_string(record).map_err(|e| CheckpointError::Corrupt {
                    line: 0,
                    message: e.to_string(),
                })?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        let before = self.current.len();
        self.current.clear();
        for record in keep {
            self.current.insert(record.key(), record);
        }
        let removed = before - self.current.len();

        *log = OpenOptions::new().append(true).open(&self.path)?;
        Ok(removed)
    }

    fn query_all_unlocked(&self) -> Vec<StageRecord> {
        self.current.iter().map(|r| r.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> Arc<CheckpointStore> {
        CheckpointStore::open(&dir.path().join("checkpoint.log")).unwrap()
    }

    fn key(unit: &str, stage: StageKind) -> StageKey {
        StageKey::new(unit, stage)
    }

    #[test]
    fn test_record_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let k = key("s1", StageKind::FilterReads);

        store
            .record(&k, StageState::Running, None, 1, None)
            .unwrap();
        store
            .record(
                &k,
                StageState::Complete,
                Some("/tmp/a.json".into()),
                1,
                None,
            )
            .unwrap();

        let latest = store.query(&k).unwrap();
        assert_eq!(latest.state, StageState::Complete);
        assert_eq!(latest.artifact, Some(PathBuf::from("/tmp/a.json")));
    }

    #[test]
    fn test_full_history_is_retained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        let store = CheckpointStore::open(&path).unwrap();
        let k = key("s1", StageKind::Classify);

        store
            .record(&k, StageState::Running, None, 1, None)
            .unwrap();
        store
            .record(
                &k,
                StageState::Failed,
                None,
                1,
                Some(StageErrorKind::Compute),
            )
            .unwrap();
        store
            .record(&k, StageState::Running, None, 2, None)
            .unwrap();
        store
            .record(&k, StageState::Complete, None, 2, None)
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 4);
    }

    #[test]
    fn test_reopen_replays_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        let k = key("s1", StageKind::BuildProfiles);

        {
            let store = CheckpointStore::open(&path).unwrap();
            store
                .record(&k, StageState::Running, None, 1, None)
                .unwrap();
            store
                .record(&k, StageState::Complete, Some("/a".into()), 1, None)
                .unwrap();
        }

        let store = CheckpointStore::open(&path).unwrap();
        let latest = store.query(&k).unwrap();
        assert_eq!(latest.state, StageState::Complete);
        assert_eq!(store.query_all().len(), 1);
    }

    #[test]
    fn test_corrupt_log_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        std::fs::write(&path, "{ garbage\n").unwrap();
        match CheckpointStore::open(&path) {
            Err(CheckpointError::Corrupt { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected corrupt error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_writer_claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let k = key("s1", StageKind::FilterReads);

        let claim = store.claim_writer(&k).unwrap();
        assert!(matches!(
            store.claim_writer(&k),
            Err(CheckpointError::WriterConflict { .. })
        ));

        // Different key is unaffected.
        let other = key("s2", StageKind::FilterReads);
        let _other_claim = store.claim_writer(&other).unwrap();

        drop(claim);
        assert!(store.claim_writer(&k).is_ok());
    }

    #[test]
    fn test_concurrent_claims_one_winner() {
        // Simulated race: many threads contend for the same key; exactly
        // one claim succeeds while it is held.
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let k = key("s1", StageKind::Classify);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let k = k.clone();
            handles.push(std::thread::spawn(move || {
                match store.claim_writer(&k) {
                    Ok(claim) => {
                        // Hold the claim long enough for the others to try.
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        drop(claim);
                        1u32
                    }
                    Err(_) => 0u32,
                }
            }));
        }

        let winners: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_reset_single_unit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for unit in ["s1", "s2"] {
            let k = key(unit, StageKind::FilterReads);
            store
                .record(&k, StageState::Complete, None, 1, None)
                .unwrap();
        }

        let removed = store.reset(Some("s1")).unwrap();
        assert_eq!(removed, 1);
        assert!(store.query(&key("s1", StageKind::FilterReads)).is_none());
        assert!(store.query(&key("s2", StageKind::FilterReads)).is_some());

        // The store stays usable after a reset.
        store
            .record(
                &key("s1", StageKind::FilterReads),
                StageState::Running,
                None,
                1,
                None,
            )
            .unwrap();
    }

    #[test]
    fn test_reset_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        let store = CheckpointStore::open(&path).unwrap();

        for unit in ["s1", "s2", "g1"] {
            store
                .record(
                    &key(unit, StageKind::Classify),
                    StageState::Complete,
                    None,
                    1,
                    None,
                )
                .unwrap();
        }

        let removed = store.reset(None).unwrap();
        assert_eq!(removed, 3);
        assert!(store.query_all().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
