//! # Stage: Patch Types and Channel
//!
//! ## Responsibility
//! The immutable [`ConfigPatch`] proposal, its tagged [`PatchOp`] payload,
//! the [`Rationale`] snapshot carried for audit and rollback comparison, and
//! the bounded ordered channel that moves proposals from the decider to
//! governance.
//!
//! ## Guarantees
//! - Patches are read-only after construction; terminal outcomes are
//!   reported back, never written into the patch
//! - The channel preserves per-sender emission order and never drops a
//!   queued proposal (delivery is at-least-once; governance deduplicates by
//!   `(target, generation)`)
//!
//! ## NOT Responsible For
//! - Validating or applying patches (governance engine)
//! - Deciding when to emit a patch (decider)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Capacity of the decider → governance proposal channel.
///
/// Deciders hold at most one in-flight proposal per target, so the queue
/// depth is bounded by the number of targets; 64 leaves generous headroom.
pub const PATCH_CHANNEL_CAP: usize = 64;

// ---------------------------------------------------------------------------
// PatchOp — tagged operation payload
// ---------------------------------------------------------------------------

/// The operation a patch performs on its target, dispatched by the target's
/// schema: continuous tunables take [`PatchOp::Set`] / [`PatchOp::Adjust`],
/// set-membership tunables take [`PatchOp::Add`] / [`PatchOp::Remove`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatchOp {
    /// Replace the target's scalar value.
    Set(f64),
    /// Shift the target's scalar value by a signed delta.
    Adjust(f64),
    /// Insert a member into the target's set.
    Add(String),
    /// Remove a member from the target's set.
    Remove(String),
}

impl PatchOp {
    /// Short operation name for logs and audit records.
    pub fn name(&self) -> &'static str {
        match self {
            PatchOp::Set(_) => "set",
            PatchOp::Adjust(_) => "adjust",
            PatchOp::Add(_) => "add",
            PatchOp::Remove(_) => "remove",
        }
    }
}

impl std::fmt::Display for PatchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchOp::Set(v) => write!(f, "set({v})"),
            PatchOp::Adjust(d) => write!(f, "adjust({d:+})"),
            PatchOp::Add(m) => write!(f, "add({m})"),
            PatchOp::Remove(m) => write!(f, "remove({m})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Rationale — the evidence behind a proposal
// ---------------------------------------------------------------------------

/// Snapshot of the measurement and control signal that produced a patch.
///
/// Governance compares the post-apply measurement against
/// [`Rationale::measurement`] to decide commit vs rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rationale {
    /// The measured value that drove this proposal.
    pub measurement: f64,
    /// The raw controller output after saturation.
    pub control_signal: f64,
    /// Monotonic offset (since loop start) at which the sample was taken.
    pub sampled_at: Duration,
}

// ---------------------------------------------------------------------------
// ConfigPatch
// ---------------------------------------------------------------------------

/// An immutable configuration change proposal.
///
/// Created by the decider, consumed exactly once by governance. The
/// `generation` is the per-target configuration version this patch intends
/// to apply against; a mismatch at validation time rejects the patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    /// Unique proposal id, carried through audit records.
    pub id: Uuid,
    /// The tunable this patch addresses, e.g. `"sampler.ratio"`.
    pub target: String,
    /// What to do to the target's value.
    pub op: PatchOp,
    /// The per-target generation the decider believes is current.
    pub generation: u64,
    /// Evidence snapshot for audit and rollback comparison.
    pub rationale: Rationale,
}

impl ConfigPatch {
    pub fn new(target: impl Into<String>, op: PatchOp, generation: u64, rationale: Rationale) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            op,
            generation,
            rationale,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome — terminal state of a handled patch
// ---------------------------------------------------------------------------

/// The terminal state a patch reaches inside governance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Applied and survived the settle window.
    Committed,
    /// Applied, regressed past the threshold, and reverted.
    RolledBack,
    /// Refused at validation time (stale generation or policy violation).
    Rejected,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Committed => "committed",
            Outcome::RolledBack => "rolled_back",
            Outcome::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// PatchAck — governance → decider notification
// ---------------------------------------------------------------------------

/// Sent back to the proposing decider when its patch reaches a terminal
/// state. Carries the target's now-current generation so the decider can
/// resynchronize its optimistic view before proposing again.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchAck {
    pub patch_id: Uuid,
    pub target: String,
    pub outcome: Outcome,
    /// The target's generation after this patch was handled.
    pub current_generation: u64,
}

// ---------------------------------------------------------------------------
// PatchEnvelope + channel
// ---------------------------------------------------------------------------

/// A proposal in flight: the patch plus the reply channel governance uses
/// to deliver the terminal [`PatchAck`].
#[derive(Debug)]
pub struct PatchEnvelope {
    pub patch: ConfigPatch,
    pub ack_tx: mpsc::Sender<PatchAck>,
}

/// Build the decider → governance conduit.
///
/// A bounded `mpsc` keeps emission order per sender and applies natural
/// backpressure if governance falls behind.
pub fn patch_channel() -> (mpsc::Sender<PatchEnvelope>, mpsc::Receiver<PatchEnvelope>) {
    mpsc::channel(PATCH_CHANNEL_CAP)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
