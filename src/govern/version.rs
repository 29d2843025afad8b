//! # Stage: Versioned Configuration Store
//!
//! ## Responsibility
//! The live, shared configuration of the downstream pipeline: one
//! [`TargetEntry`] per tunable plus a store-wide monotonic generation.
//! Readers take committed copy-on-read snapshots; writes go through
//! governance only.
//!
//! ## Guarantees
//! - Single-writer: only the governance engine mutates entries
//! - Monotonic: the store-wide generation and every per-target generation
//!   strictly increase on each successful write (rollbacks included)
//! - Snapshot isolation: a reader never observes a partially-applied patch
//!
//! ## NOT Responsible For
//! - Deciding whether a write is allowed (policy + engine)
//! - Pushing values into the live pipeline (config sink)

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::TuneError;
use crate::patch::PatchOp;

// ---------------------------------------------------------------------------
// TargetValue — scalar or set-membership payload
// ---------------------------------------------------------------------------

/// The current value of one tunable: a continuous scalar (sampling ratio,
/// cardinality limit) or a membership set (attribute allow/deny list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetValue {
    Scalar(f64),
    Set(BTreeSet<String>),
}

impl TargetValue {
    /// The magnitude governance bounds-checks: the scalar itself, or the
    /// set's cardinality.
    pub fn magnitude(&self) -> f64 {
        match self {
            TargetValue::Scalar(v) => *v,
            TargetValue::Set(s) => s.len() as f64,
        }
    }

    /// Produce the value this op would yield, without mutating `self`.
    ///
    /// An op that does not match the value's schema (e.g. [`PatchOp::Add`]
    /// on a scalar) is a validation error, reported as a reason string for
    /// the engine to wrap into a policy rejection.
    pub fn with_op(&self, op: &PatchOp) -> Result<TargetValue, String> {
        match (self, op) {
            (TargetValue::Scalar(_), PatchOp::Set(v)) => Ok(TargetValue::Scalar(*v)),
            (TargetValue::Scalar(cur), PatchOp::Adjust(d)) => Ok(TargetValue::Scalar(cur + d)),
            (TargetValue::Set(cur), PatchOp::Add(m)) => {
                let mut next = cur.clone();
                next.insert(m.clone());
                Ok(TargetValue::Set(next))
            }
            (TargetValue::Set(cur), PatchOp::Remove(m)) => {
                let mut next = cur.clone();
                next.remove(m);
                Ok(TargetValue::Set(next))
            }
            (value, op) => Err(format!(
                "operation '{}' does not match schema of current value {value:?}",
                op.name()
            )),
        }
    }
}

impl std::fmt::Display for TargetValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetValue::Scalar(v) => write!(f, "{v}"),
            TargetValue::Set(s) => write!(f, "{{{}}}", s.iter().cloned().collect::<Vec<_>>().join(",")),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetEntry / PipelineConfigVersion
// ---------------------------------------------------------------------------

/// One tunable's committed value and its generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub value: TargetValue,
    /// Incremented on every successful apply to this target.
    pub generation: u64,
}

/// A committed snapshot of the full pipeline configuration.
///
/// `generation` is store-wide and increases on every apply to any target;
/// consumers use it to detect that anything changed. Per-target staleness
/// checks use [`TargetEntry::generation`] so unrelated targets do not
/// invalidate each other's optimistic view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfigVersion {
    pub generation: u64,
    pub entries: HashMap<String, TargetEntry>,
}

impl PipelineConfigVersion {
    pub fn get(&self, target: &str) -> Option<&TargetEntry> {
        self.entries.get(target)
    }
}

// ---------------------------------------------------------------------------
// VersionStore
// ---------------------------------------------------------------------------

/// Shared handle to the live configuration.
///
/// Reads clone committed state ([`VersionStore::snapshot`]); the only write
/// path is [`VersionStore::write`], called exclusively by the governance
/// engine's per-target workers.
#[derive(Debug)]
pub struct VersionStore {
    inner: RwLock<PipelineConfigVersion>,
}

impl VersionStore {
    /// Seed the store with each target's initial value at generation 0.
    pub fn new(initial: impl IntoIterator<Item = (String, TargetValue)>) -> Self {
        let entries = initial
            .into_iter()
            .map(|(name, value)| (name, TargetEntry { value, generation: 0 }))
            .collect();
        Self {
            inner: RwLock::new(PipelineConfigVersion { generation: 0, entries }),
        }
    }

    /// Copy-on-read snapshot of the committed configuration.
    pub fn snapshot(&self) -> PipelineConfigVersion {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The committed entry for one target.
    pub fn get(&self, target: &str) -> Option<TargetEntry> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .get(target)
            .cloned()
    }

    /// The per-target generation, if the target exists.
    pub fn target_generation(&self, target: &str) -> Option<u64> {
        self.get(target).map(|e| e.generation)
    }

    /// Commit a new value for `target`, bumping both the per-target and the
    /// store-wide generation. Returns `(prior entry, new generation)`.
    ///
    /// Single-writer discipline: only governance calls this, one worker per
    /// target, so per-target writes are strictly serialized.
    pub fn write(&self, target: &str, value: TargetValue) -> Result<(TargetEntry, u64), TuneError> {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.generation += 1;
        let entry = guard
            .entries
            .get_mut(target)
            .ok_or_else(|| TuneError::UnknownTarget { target: target.into() })?;
        let prior = entry.clone();
        entry.value = value;
        entry.generation += 1;
        let new_generation = entry.generation;
        Ok((prior, new_generation))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
