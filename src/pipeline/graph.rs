//! Explicit stage dependency graph.
//!
//! The pipeline topology is fixed: a per-sample chain (filter-reads →
//! build-profiles → extract-features → classify), one merge-group node per
//! replicate group depending on its members' classification stages, and a single
//! run-level rank-calls node depending on every merge. The graph carries
//! declared edges so the orchestrator computes runnable sets generically
//! instead of hard-coding the sequencing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::checkpoint::{StageRecord, StageState};
use crate::config::RUN_UNIT;

/// The closed set of stage kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    FilterReads,
    BuildProfiles,
    ExtractFeatures,
    Classify,
    MergeGroup,
    RankCalls,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        StageKind::FilterReads,
        StageKind::BuildProfiles,
        StageKind::ExtractFeatures,
        StageKind::Classify,
        StageKind::MergeGroup,
        StageKind::RankCalls,
    ];

    /// Stable name used in checkpoint records and artifact paths.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::FilterReads => "filter-reads",
            StageKind::BuildProfiles => "build-profiles",
            StageKind::ExtractFeatures => "extract-features",
            StageKind::Classify => "classify",
            StageKind::MergeGroup => "merge-group",
            StageKind::RankCalls => "rank-calls",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key of one schedulable unit of work: a (unit, stage) pair. The unit is
/// a sample id, a replicate-group id, or the run-level unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageKey {
    pub unit: String,
    pub stage: StageKind,
}

impl StageKey {
    pub fn new(unit: impl Into<String>, stage: StageKind) -> Self {
        Self {
            unit: unit.into(),
            stage,
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.unit, self.stage)
    }
}

/// The dependency DAG over (unit, stage) nodes for one configured run.
#[derive(Debug, Clone)]
pub struct StageGraph {
    nodes: Vec<StageKey>,
    deps: HashMap<StageKey, Vec<StageKey>>,
}

impl StageGraph {
    /// Build the graph for a set of samples and their replicate groups.
    pub fn build(sample_ids: &[String], groups: &BTreeMap<String, Vec<String>>) -> Self {
        let mut nodes = Vec::new();
        let mut deps: HashMap<StageKey, Vec<StageKey>> = HashMap::new();

        let per_sample_chain = [
            StageKind::FilterReads,
            StageKind::BuildProfiles,
            StageKind::ExtractFeatures,
            StageKind::Classify,
        ];

        for sample in sample_ids {
            let mut prev: Option<StageKey> = None;
            for stage in per_sample_chain {
                let key = StageKey::new(sample.clone(), stage);
                nodes.push(key.clone());
                let upstream = prev.iter().cloned().collect();
                deps.insert(key.clone(), upstream);
                prev = Some(key);
            }
        }

        let mut merge_keys = Vec::new();
        for (group, members) in groups {
            let key = StageKey::new(group.clone(), StageKind::MergeGroup);
            let upstream = members
                .iter()
                .map(|s| StageKey::new(s.clone(), StageKind::Classify))
                .collect();
            nodes.push(key.clone());
            deps.insert(key.clone(), upstream);
            merge_keys.push(key);
        }

        let rank = StageKey::new(RUN_UNIT, StageKind::RankCalls);
        nodes.push(rank.clone());
        deps.insert(rank, merge_keys);

        Self { nodes, deps }
    }

    /// All nodes, in deterministic construction order.
    pub fn nodes(&self) -> &[StageKey] {
        &self.nodes
    }

    /// Declared upstream dependencies of a node.
    pub fn dependencies(&self, key: &StageKey) -> &[StageKey] {
        self.deps.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether a node's latest record makes it terminally failed under the
    /// given attempt limit.
    pub fn is_terminal_failed(
        &self,
        states: &HashMap<StageKey, StageRecord>,
        key: &StageKey,
        max_attempts: u32,
    ) -> bool {
        matches!(
            states.get(key),
            Some(record)
                if record.state == StageState::Failed && record.attempt >= max_attempts
        )
    }

    /// Compute the set of nodes that may be dispatched right now: all
    /// declared dependencies complete, not already running or complete, and
    /// not out of attempts.
    pub fn runnable(
        &self,
        states: &HashMap<StageKey, StageRecord>,
        running: &HashSet<StageKey>,
        max_attempts: u32,
    ) -> Vec<StageKey> {
        self.nodes
            .iter()
            .filter(|key| {
                if running.contains(*key) {
                    return false;
                }
                match states.get(*key) {
                    Some(record) => match record.state {
                        StageState::Complete => return false,
                        StageState::Failed if record.attempt >= max_attempts => return false,
                        // A stale running record (crash) is reconciled to
                        // failed before scheduling; anything still marked
                        // running here is genuinely in flight.
                        StageState::Running => return false,
                        _ => {}
                    },
                    None => {}
                }
                self.dependencies(key).iter().all(|dep| {
                    matches!(
                        states.get(dep),
                        Some(record) if record.state == StageState::Complete
                    )
                })
            })
            .cloned()
            .collect()
    }

    /// Nodes that can never run because some transitive dependency is
    /// terminally failed.
    pub fn blocked(
        &self,
        states: &HashMap<StageKey, StageRecord>,
        max_attempts: u32,
    ) -> Vec<StageKey> {
        let terminal: HashSet<&StageKey> = self
            .nodes
            .iter()
            .filter(|k| self.is_terminal_failed(states, k, max_attempts))
            .collect();

        self.nodes
            .iter()
            .filter(|key| {
                if terminal.contains(*key) {
                    return false;
                }
                if matches!(
                    states.get(*key),
                    Some(record) if record.state == StageState::Complete
                ) {
                    return false;
                }
                self.has_terminal_ancestor(key, &terminal)
            })
            .cloned()
            .collect()
    }

    fn has_terminal_ancestor(&self, key: &StageKey, terminal: &HashSet<&StageKey>) -> bool {
        let mut stack: Vec<&StageKey> = self.dependencies(key).iter().collect();
        let mut seen = HashSet::new();
        while let Some(dep) = stack.pop() {
            if !seen.insert(dep) {
                continue;
            }
            if terminal.contains(dep) {
                return true;
            }
            stack.extend(self.dependencies(dep).iter());
        }
        false
    }
}
