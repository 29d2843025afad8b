//! # Stage: Static Configuration
//!
//! ## Responsibility
//! TOML-loadable construction-time configuration: the controlled targets
//! (schema, direction, bounds, PID gains, dead-band), the governance
//! policy, and the loop cadence. Validated once at load; the running
//! controller is never reconfigured.
//!
//! ## Guarantees
//! - Fail-fast: an invalid file is rejected before any task is spawned
//! - Complete: every duration and threshold has a documented default
//!
//! ## NOT Responsible For
//! - Watching files for changes (the controller's own tuning is static by
//!   design)

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::pid::PidConfig;
use crate::error::TuneError;
use crate::govern::policy::{Bounds, MetricDirection, PolicySet};
use crate::govern::version::TargetValue;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_sample_interval_ms() -> u64 {
    5_000
}

fn default_fetch_timeout_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// TargetKind — tunable schema
// ---------------------------------------------------------------------------

/// How a target's value is shaped, and therefore which patch operations the
/// decider may emit for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetKind {
    /// A scalar tunable (sampling ratio, cardinality limit). The decider
    /// emits `Adjust(signal * scale)`.
    Continuous { scale: f64 },
    /// A membership tunable (attribute allow/deny list). The decider emits
    /// thresholded `Add`/`Remove` over the candidate list, in order.
    SetMembership { candidates: Vec<String> },
}

// ---------------------------------------------------------------------------
// InitialValue
// ---------------------------------------------------------------------------

/// The target's seed value: a scalar for continuous targets, a member list
/// for set-membership targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialValue {
    Scalar(f64),
    Members(Vec<String>),
}

impl InitialValue {
    pub fn to_value(&self) -> TargetValue {
        match self {
            InitialValue::Scalar(v) => TargetValue::Scalar(*v),
            InitialValue::Members(m) => TargetValue::Set(m.iter().cloned().collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetConfig
// ---------------------------------------------------------------------------

/// One controlled tunable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Identifier of the tunable, e.g. `"sampler.ratio"` or
    /// `"filter.deny_list"`.
    pub name: String,
    #[serde(flatten)]
    pub kind: TargetKind,
    /// Which way "worse" points for this target's observed metric.
    pub direction: MetricDirection,
    /// Hard lower bound (scalar value, or set cardinality).
    pub min: f64,
    /// Hard upper bound (scalar value, or set cardinality).
    pub max: f64,
    /// Control outputs with `|signal| <= dead_band` emit no patch.
    pub dead_band: f64,
    pub initial: InitialValue,
    pub pid: PidConfig,
}

impl TargetConfig {
    fn validate(&self) -> Result<(), TuneError> {
        let bad = |detail: String| TuneError::Config {
            detail: format!("target '{}': {detail}", self.name),
        };
        if self.name.trim().is_empty() {
            return Err(TuneError::Config {
                detail: "target name must be non-empty".into(),
            });
        }
        if !(self.min.is_finite() && self.max.is_finite()) || self.min >= self.max {
            return Err(bad(format!(
                "bounds must satisfy min < max, got [{}, {}]",
                self.min, self.max
            )));
        }
        if !self.dead_band.is_finite() || self.dead_band < 0.0 {
            return Err(bad(format!("dead_band must be >= 0, got {}", self.dead_band)));
        }
        self.pid.validate(&self.name)?;

        match (&self.kind, &self.initial) {
            (TargetKind::Continuous { scale }, InitialValue::Scalar(v)) => {
                if !scale.is_finite() || *scale == 0.0 {
                    return Err(bad(format!("scale must be finite and non-zero, got {scale}")));
                }
                if *v < self.min || *v > self.max {
                    return Err(bad(format!(
                        "initial value {v} outside bounds [{}, {}]",
                        self.min, self.max
                    )));
                }
            }
            (TargetKind::SetMembership { candidates }, InitialValue::Members(members)) => {
                if candidates.is_empty() {
                    return Err(bad("candidate list must be non-empty".into()));
                }
                let unique: std::collections::HashSet<&String> = candidates.iter().collect();
                if unique.len() != candidates.len() {
                    return Err(bad("candidate list contains duplicates".into()));
                }
                for m in members {
                    if !candidates.contains(m) {
                        return Err(bad(format!("initial member '{m}' is not a candidate")));
                    }
                }
                let len = members.len() as f64;
                if len < self.min || len > self.max {
                    return Err(bad(format!(
                        "initial cardinality {len} outside bounds [{}, {}]",
                        self.min, self.max
                    )));
                }
            }
            (TargetKind::Continuous { .. }, InitialValue::Members(_)) => {
                return Err(bad("continuous target requires a scalar initial value".into()));
            }
            (TargetKind::SetMembership { .. }, InitialValue::Scalar(_)) => {
                return Err(bad("set-membership target requires a member list initial value".into()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PolicyConfig
// ---------------------------------------------------------------------------

/// Governance policy knobs, all durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub max_patch_rate_ms: u64,
    pub settle_window_ms: u64,
    pub rollback_cooldown_ms: u64,
    pub rollback_threshold: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_patch_rate_ms: 10_000,
            settle_window_ms: 15_000,
            rollback_cooldown_ms: 60_000,
            rollback_threshold: 0.10,
        }
    }
}

// ---------------------------------------------------------------------------
// TuneConfig
// ---------------------------------------------------------------------------

/// Root configuration for one controller instance.
///
/// # Example
/// ```toml
/// sample_interval_ms = 5000
/// fetch_timeout_ms = 2000
///
/// [policy]
/// max_patch_rate_ms = 10000
/// settle_window_ms = 15000
/// rollback_cooldown_ms = 60000
/// rollback_threshold = 0.10
///
/// [[target]]
/// name = "sampler.ratio"
/// kind = "continuous"
/// scale = 0.05
/// direction = "lower_is_better"
/// min = 0.01
/// max = 1.0
/// dead_band = 0.05
/// initial = 1.0
///
/// [target.pid]
/// setpoint = 5000.0
/// kp = 0.001
/// ki = 0.0001
/// kd = 0.0005
/// output_min = -1.0
/// output_max = 1.0
/// integral_limit = 100.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(rename = "target", default)]
    pub targets: Vec<TargetConfig>,
}

impl TuneConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, TuneError> {
        let cfg: TuneConfig = toml::from_str(s).map_err(|e| TuneError::Config {
            detail: format!("TOML parse error: {e}"),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TuneError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| TuneError::Config {
            detail: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    /// Construction-time invariants across the whole document.
    pub fn validate(&self) -> Result<(), TuneError> {
        if self.sample_interval_ms == 0 {
            return Err(TuneError::Config {
                detail: "sample_interval_ms must be non-zero".into(),
            });
        }
        if self.fetch_timeout_ms == 0 {
            return Err(TuneError::Config {
                detail: "fetch_timeout_ms must be non-zero".into(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for t in &self.targets {
            t.validate()?;
            if !seen.insert(t.name.clone()) {
                return Err(TuneError::Config {
                    detail: format!("duplicate target name '{}'", t.name),
                });
            }
        }
        self.policy_set().validate()
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Assemble the governance policy, with per-target bounds taken from
    /// each target's hard limits.
    pub fn policy_set(&self) -> PolicySet {
        PolicySet {
            max_patch_rate: Duration::from_millis(self.policy.max_patch_rate_ms),
            bounds: self
                .targets
                .iter()
                .map(|t| (t.name.clone(), Bounds { min: t.min, max: t.max }))
                .collect(),
            rollback_threshold: self.policy.rollback_threshold,
            settle_window: Duration::from_millis(self.policy.settle_window_ms),
            rollback_cooldown: Duration::from_millis(self.policy.rollback_cooldown_ms),
        }
    }

    /// Seed values for the version store.
    pub fn initial_values(&self) -> Vec<(String, TargetValue)> {
        self.targets
            .iter()
            .map(|t| (t.name.clone(), t.initial.to_value()))
            .collect()
    }

    /// Per-target metric directions for the governance regression check.
    pub fn directions(&self) -> HashMap<String, MetricDirection> {
        self.targets
            .iter()
            .map(|t| (t.name.clone(), t.direction))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
