//! # Stage: Decider
//!
//! ## Responsibility
//! Translates a continuous control output into discrete patch proposals
//! shaped by the target's schema: continuous tunables get scaled `Adjust`
//! operations, set-membership tunables get thresholded `Add`/`Remove` over
//! an ordered candidate list. Tracks the optimistic generation from
//! governance acknowledgements.
//!
//! ## Guarantees
//! - Dead-band: `|signal| <= dead_band` emits nothing, suppressing chatter
//! - At most one outstanding proposal per target: new proposals are
//!   withheld until the prior one reaches a terminal state
//! - Resynchronizing: every acknowledgement updates the generation used for
//!   the next proposal, so a stale rejection self-heals on the next tick
//!
//! ## NOT Responsible For
//! - Computing the control signal (PID controller)
//! - Validating or applying patches (governance)

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::config::TargetKind;
use crate::govern::version::{TargetValue, VersionStore};
use crate::patch::{ConfigPatch, Outcome, PatchAck, PatchOp, Rationale};

/// Per-target proposal policy and optimistic-concurrency state.
pub struct Decider {
    target: String,
    kind: TargetKind,
    dead_band: f64,
    store: Arc<VersionStore>,
    /// The per-target generation from the last acknowledged outcome.
    generation: u64,
    /// The id of the proposal currently awaiting a terminal state, if any.
    in_flight: Option<Uuid>,
}

impl Decider {
    pub fn new(
        target: impl Into<String>,
        kind: TargetKind,
        dead_band: f64,
        store: Arc<VersionStore>,
    ) -> Self {
        let target = target.into();
        let generation = store.target_generation(&target).unwrap_or(0);
        Self {
            target,
            kind,
            dead_band,
            store,
            generation,
            in_flight: None,
        }
    }

    /// Whether a proposal is currently awaiting its terminal state.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The generation the next proposal will carry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Map a control signal to a patch proposal, or `None` when the signal
    /// sits inside the dead-band, a proposal is already outstanding, or the
    /// target's set has no applicable member to add or remove.
    pub fn decide(
        &mut self,
        signal: f64,
        measurement: f64,
        sampled_at: std::time::Duration,
    ) -> Option<ConfigPatch> {
        if self.in_flight.is_some() {
            debug!(
                target: "pipetune::decider",
                tunable = %self.target,
                "proposal outstanding, withholding"
            );
            return None;
        }
        if signal.abs() <= self.dead_band {
            return None;
        }

        let op = match &self.kind {
            TargetKind::Continuous { scale } => PatchOp::Adjust(signal * scale),
            TargetKind::SetMembership { candidates } => {
                let current = match self.store.get(&self.target)?.value {
                    TargetValue::Set(s) => s,
                    TargetValue::Scalar(_) => return None, // schema drift, governance will reject
                };
                if signal > 0.0 {
                    // Grow membership: first candidate not yet present.
                    let member = candidates.iter().find(|c| !current.contains(*c))?;
                    PatchOp::Add(member.clone())
                } else {
                    // Shrink membership: last present candidate, unwinding
                    // additions in reverse order.
                    let member = candidates.iter().rev().find(|c| current.contains(*c))?;
                    PatchOp::Remove(member.clone())
                }
            }
        };

        let patch = ConfigPatch::new(
            self.target.clone(),
            op,
            self.generation,
            Rationale {
                measurement,
                control_signal: signal,
                sampled_at,
            },
        );
        self.in_flight = Some(patch.id);
        Some(patch)
    }

    /// Consume a governance acknowledgement. Returns the outcome when the
    /// ack resolves this decider's outstanding proposal; acks for other
    /// proposals only refresh the generation.
    pub fn on_ack(&mut self, ack: &PatchAck) -> Option<Outcome> {
        if ack.target != self.target {
            return None;
        }
        self.generation = ack.current_generation;
        if self.in_flight == Some(ack.patch_id) {
            self.in_flight = None;
            Some(ack.outcome)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scalar_store() -> Arc<VersionStore> {
        Arc::new(VersionStore::new([(
            "sampler.ratio".to_string(),
            TargetValue::Scalar(1.0),
        )]))
    }

    fn set_store(members: &[&str]) -> Arc<VersionStore> {
        Arc::new(VersionStore::new([(
            "filter.deny".to_string(),
            TargetValue::Set(members.iter().map(|s| s.to_string()).collect()),
        )]))
    }

    fn continuous() -> Decider {
        Decider::new(
            "sampler.ratio",
            TargetKind::Continuous { scale: 0.1 },
            0.05,
            scalar_store(),
        )
    }

    fn membership(members: &[&str]) -> Decider {
        Decider::new(
            "filter.deny",
            TargetKind::SetMembership {
                candidates: vec!["a".into(), "b".into(), "c".into()],
            },
            0.05,
            set_store(members),
        )
    }

    fn at(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn ack(patch: &ConfigPatch, outcome: Outcome, new_gen: u64) -> PatchAck {
        PatchAck {
            patch_id: patch.id,
            target: patch.target.clone(),
            outcome,
            current_generation: new_gen,
        }
    }

    // ===== Dead-band =====

    #[test]
    fn test_signal_inside_dead_band_emits_nothing() {
        let mut d = continuous();
        assert!(d.decide(0.04, 100.0, at(1)).is_none());
        assert!(d.decide(-0.05, 100.0, at(2)).is_none());
        assert!(d.decide(0.0, 100.0, at(3)).is_none());
    }

    #[test]
    fn test_signal_outside_dead_band_emits_patch() {
        let mut d = continuous();
        let patch = d.decide(0.5, 100.0, at(1)).unwrap();
        assert_eq!(patch.target, "sampler.ratio");
        assert_eq!(patch.op, PatchOp::Adjust(0.5 * 0.1));
    }

    // ===== Continuous scaling =====

    #[test]
    fn test_adjust_scales_and_keeps_sign() {
        let mut d = continuous();
        let patch = d.decide(-0.8, 100.0, at(1)).unwrap();
        match patch.op {
            PatchOp::Adjust(delta) => assert!((delta - (-0.08)).abs() < 1e-12),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn test_rationale_carries_signal_and_measurement() {
        let mut d = continuous();
        let patch = d.decide(0.5, 123.0, at(7)).unwrap();
        assert_eq!(patch.rationale.measurement, 123.0);
        assert_eq!(patch.rationale.control_signal, 0.5);
        assert_eq!(patch.rationale.sampled_at, at(7));
    }

    // ===== In-flight gating =====

    #[test]
    fn test_second_proposal_withheld_until_ack() {
        let mut d = continuous();
        let first = d.decide(0.5, 100.0, at(1)).unwrap();
        assert!(d.has_in_flight());
        assert!(d.decide(0.9, 100.0, at(2)).is_none());

        d.on_ack(&ack(&first, Outcome::Committed, 1));
        assert!(!d.has_in_flight());
        assert!(d.decide(0.9, 100.0, at(3)).is_some());
    }

    #[test]
    fn test_ack_resyncs_generation() {
        let mut d = continuous();
        let first = d.decide(0.5, 100.0, at(1)).unwrap();
        assert_eq!(first.generation, 0);

        d.on_ack(&ack(&first, Outcome::Committed, 1));
        let second = d.decide(0.5, 100.0, at(2)).unwrap();
        assert_eq!(second.generation, 1);
    }

    #[test]
    fn test_rejected_ack_releases_and_resyncs() {
        let mut d = continuous();
        let first = d.decide(0.5, 100.0, at(1)).unwrap();
        // Governance saw generation 4; decider was stale.
        let outcome = d.on_ack(&ack(&first, Outcome::Rejected, 4));
        assert_eq!(outcome, Some(Outcome::Rejected));
        let retry = d.decide(0.5, 100.0, at(2)).unwrap();
        assert_eq!(retry.generation, 4);
    }

    #[test]
    fn test_ack_for_other_target_ignored() {
        let mut d = continuous();
        let patch = d.decide(0.5, 100.0, at(1)).unwrap();
        let foreign = PatchAck {
            patch_id: patch.id,
            target: "other".into(),
            outcome: Outcome::Committed,
            current_generation: 9,
        };
        assert_eq!(d.on_ack(&foreign), None);
        assert!(d.has_in_flight());
        assert_eq!(d.generation(), 0);
    }

    #[test]
    fn test_ack_for_unknown_patch_refreshes_generation_only() {
        let mut d = continuous();
        let patch = d.decide(0.5, 100.0, at(1)).unwrap();
        let stray = PatchAck {
            patch_id: Uuid::new_v4(),
            target: patch.target.clone(),
            outcome: Outcome::Committed,
            current_generation: 2,
        };
        assert_eq!(d.on_ack(&stray), None);
        assert!(d.has_in_flight(), "stray ack must not release the slot");
        assert_eq!(d.generation(), 2);
    }

    // ===== Set membership =====

    #[test]
    fn test_positive_signal_adds_first_absent_candidate() {
        let mut d = membership(&["a"]);
        let patch = d.decide(0.5, 100.0, at(1)).unwrap();
        assert_eq!(patch.op, PatchOp::Add("b".into()));
    }

    #[test]
    fn test_negative_signal_removes_last_present_candidate() {
        let mut d = membership(&["a", "b"]);
        let patch = d.decide(-0.5, 100.0, at(1)).unwrap();
        assert_eq!(patch.op, PatchOp::Remove("b".into()));
    }

    #[test]
    fn test_all_candidates_present_add_is_noop() {
        let mut d = membership(&["a", "b", "c"]);
        assert!(d.decide(0.5, 100.0, at(1)).is_none());
        assert!(!d.has_in_flight());
    }

    #[test]
    fn test_empty_set_remove_is_noop() {
        let mut d = membership(&[]);
        assert!(d.decide(-0.5, 100.0, at(1)).is_none());
        assert!(!d.has_in_flight());
    }

    #[test]
    fn test_initial_generation_read_from_store() {
        let store = scalar_store();
        store.write("sampler.ratio", TargetValue::Scalar(0.5)).unwrap();
        store.write("sampler.ratio", TargetValue::Scalar(0.25)).unwrap();
        let d = Decider::new(
            "sampler.ratio",
            TargetKind::Continuous { scale: 0.1 },
            0.05,
            store,
        );
        assert_eq!(d.generation(), 2);
    }
}
