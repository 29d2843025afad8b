//! # Stage: Audit Sink
//!
//! ## Responsibility
//! One record per terminal governance transition — committed, rolled back,
//! or rejected — with the generation, operation, and the rationale snapshot
//! that justified the proposal. Records flow to a pluggable [`AuditSink`];
//! the engine additionally keeps a bounded in-memory history for queries.
//!
//! ## Guarantees
//! - Complete: every terminal transition produces exactly one record;
//!   silent failure is disallowed
//! - Bounded: the in-memory history evicts oldest records at capacity
//!
//! ## NOT Responsible For
//! - Deciding outcomes (engine)
//! - Long-term persistence (external sink implementations)

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::patch::{Outcome, PatchOp, Rationale};

/// Default capacity of the engine's in-memory audit history.
pub const AUDIT_HISTORY_CAP: usize = 1_000;

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

/// The audit trail entry for one handled patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub patch_id: Uuid,
    pub target: String,
    /// The per-target generation the patch proposed against.
    pub generation: u64,
    pub op: PatchOp,
    pub outcome: Outcome,
    /// The evidence the decider attached to the proposal.
    pub rationale: Rationale,
    /// The post-apply measurement, when the patch reached the settle window.
    pub post_measurement: Option<f64>,
    /// Human-readable cause for rejections and rollbacks.
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// AuditSink trait + implementations
// ---------------------------------------------------------------------------

/// Destination for terminal-transition records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Emits each record as a structured `tracing` event. Commits log at INFO,
/// rollbacks and rejections at WARN.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        match record.outcome {
            Outcome::Committed => info!(
                target: "pipetune::govern",
                patch = %record.patch_id,
                tunable = %record.target,
                generation = record.generation,
                op = %record.op,
                "patch committed"
            ),
            Outcome::RolledBack => warn!(
                target: "pipetune::govern",
                patch = %record.patch_id,
                tunable = %record.target,
                generation = record.generation,
                op = %record.op,
                detail = record.detail.as_deref().unwrap_or(""),
                "patch rolled back"
            ),
            Outcome::Rejected => warn!(
                target: "pipetune::govern",
                patch = %record.patch_id,
                tunable = %record.target,
                generation = record.generation,
                op = %record.op,
                detail = record.detail.as_deref().unwrap_or(""),
                "patch rejected"
            ),
        }
    }
}

/// Collects records in memory, oldest evicted first. Used by tests and by
/// the engine's built-in history.
#[derive(Debug)]
pub struct MemoryAuditSink {
    cap: usize,
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            records: Mutex::new(Vec::new()),
        }
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Records for one target, oldest first.
    pub fn records_for(&self, target: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.target == target)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(AUDIT_HISTORY_CAP)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        let mut guard = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.len() >= self.cap {
            guard.remove(0);
        }
        guard.push(record.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
