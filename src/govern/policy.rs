//! # Stage: Governance Policy
//!
//! ## Responsibility
//! The externally-configured safety envelope for patch application: minimum
//! interval between applied patches, hard per-target bounds independent of
//! the controller's own saturation, the rollback regression threshold, the
//! settle window, and the post-rollback cooldown. Pure checks — no clock
//! and no store access.
//!
//! ## Guarantees
//! - Deterministic: every check is a pure function of its arguments
//! - Conservative: a near-zero baseline disables the regression comparison
//!   instead of dividing by it
//!
//! ## NOT Responsible For
//! - Tracking when a target was last patched (engine worker state)
//! - Applying or reverting values (engine)

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TuneError;
use crate::govern::version::TargetValue;

/// Baselines closer to zero than this are treated as "no baseline" for the
/// relative regression comparison.
const BASELINE_FLOOR: f64 = 1e-9;

// ---------------------------------------------------------------------------
// MetricDirection
// ---------------------------------------------------------------------------

/// Which way "worse" points for a target's observed metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricDirection {
    /// Latency, cost, error rate: an increase is a regression.
    LowerIsBetter,
    /// Throughput, hit rate: a decrease is a regression.
    HigherIsBetter,
}

/// Relative regression of `after` versus `before`, in the target's
/// direction. Positive means worse; `0.20` is a 20% degradation.
///
/// Returns `0.0` when `before` is too close to zero to normalize against.
pub fn regression_fraction(before: f64, after: f64, direction: MetricDirection) -> f64 {
    if before.abs() < BASELINE_FLOOR {
        return 0.0;
    }
    match direction {
        MetricDirection::LowerIsBetter => (after - before) / before.abs(),
        MetricDirection::HigherIsBetter => (before - after) / before.abs(),
    }
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

/// Hard clamp for one target: scalar range, or set-cardinality range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn contains(&self, magnitude: f64) -> bool {
        magnitude >= self.min && magnitude <= self.max
    }
}

// ---------------------------------------------------------------------------
// PolicySet
// ---------------------------------------------------------------------------

/// Governance policy, fixed at construction time.
#[derive(Debug, Clone)]
pub struct PolicySet {
    /// Minimum interval between applied patches per target.
    pub max_patch_rate: Duration,
    /// Hard safety clamp per target, independent of controller saturation.
    pub bounds: HashMap<String, Bounds>,
    /// Maximum tolerated post-apply regression before automatic rollback.
    pub rollback_threshold: f64,
    /// Observation delay after an apply, before judging its effect.
    pub settle_window: Duration,
    /// Proposal suppression window for a target after a rollback.
    pub rollback_cooldown: Duration,
}

impl PolicySet {
    /// Check a candidate value against the target's hard bounds.
    pub fn check_bounds(&self, target: &str, candidate: &TargetValue) -> Result<(), TuneError> {
        let bounds = self
            .bounds
            .get(target)
            .ok_or_else(|| TuneError::UnknownTarget { target: target.into() })?;
        let magnitude = candidate.magnitude();
        if bounds.contains(magnitude) {
            Ok(())
        } else {
            Err(TuneError::PolicyViolation {
                target: target.into(),
                reason: format!(
                    "candidate {candidate} outside hard bounds [{}, {}]",
                    bounds.min, bounds.max
                ),
            })
        }
    }

    /// Whether `after` regressed past the rollback threshold relative to
    /// `before`, in the target's metric direction.
    pub fn is_regression(&self, before: f64, after: f64, direction: MetricDirection) -> bool {
        regression_fraction(before, after, direction) > self.rollback_threshold
    }

    /// Construction-time invariants.
    pub fn validate(&self) -> Result<(), TuneError> {
        let bad = |detail: &str| TuneError::Config { detail: detail.into() };
        if self.rollback_threshold <= 0.0 || !self.rollback_threshold.is_finite() {
            return Err(bad("rollback_threshold must be > 0 and finite"));
        }
        if self.settle_window.is_zero() {
            return Err(bad("settle_window must be non-zero"));
        }
        if self.max_patch_rate.is_zero() {
            return Err(bad("max_patch_rate must be non-zero"));
        }
        for (target, b) in &self.bounds {
            if !(b.min.is_finite() && b.max.is_finite()) || b.min >= b.max {
                return Err(TuneError::Config {
                    detail: format!("bounds for '{target}' must satisfy min < max"),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
