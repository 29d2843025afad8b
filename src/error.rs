//! Crate-level error taxonomy.
//!
//! Every failure in the control loop resolves to one of these variants and
//! then to a terminal per-target outcome; none of them abort the process.
//! Rejections and rollbacks are additionally reported through the audit sink
//! so no failure is silent.

use thiserror::Error;

/// Errors produced by the controller, decider, and governance layers.
///
/// Each variant carries enough context to diagnose the failure without
/// needing to inspect the originating error directly.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TuneError {
    /// The sampling clock did not advance: `now <= last_sample_time`.
    /// The compute call is rejected and controller state is left untouched.
    #[error("non-advancing timestep for '{target}': dt = {dt_secs}s")]
    InvalidTimestep { target: String, dt_secs: f64 },

    /// The measurement source failed or timed out for this tick.
    /// The tick is skipped; no state is mutated.
    #[error("measurement unavailable for '{target}': {detail}")]
    MeasurementUnavailable { target: String, detail: String },

    /// A patch carried a generation that no longer matches the live
    /// configuration. The proposer must resynchronize before retrying.
    #[error("stale generation for '{target}': proposed {proposed}, current {current}")]
    StaleGeneration {
        target: String,
        proposed: u64,
        current: u64,
    },

    /// A patch violated governance policy (rate limit, hard bounds, or
    /// rollback cooldown). Rejected, logged, never fatal.
    #[error("policy violation for '{target}': {reason}")]
    PolicyViolation { target: String, reason: String },

    /// The post-apply metric regressed beyond the rollback threshold.
    #[error("regression on '{target}': {before} -> {after} exceeds threshold")]
    RegressionDetected {
        target: String,
        before: f64,
        after: f64,
    },

    /// The downstream configuration sink rejected the write. Treated as a
    /// rejection; no partial state is committed.
    #[error("apply failed for '{target}': {detail}")]
    ApplyFailure { target: String, detail: String },

    /// A patch or measurement referenced a target the store does not know.
    #[error("unknown target '{target}'")]
    UnknownTarget { target: String },

    /// The remote collaborator replied with a non-2xx HTTP status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// A TCP-level connection to a collaborator could not be established.
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },

    /// A collaborator response body could not be parsed as expected JSON.
    #[error("JSON parse error: {detail}")]
    Json { detail: String },

    /// Static configuration failed to load or validate at construction.
    #[error("invalid configuration: {detail}")]
    Config { detail: String },
}

impl TuneError {
    /// `true` for variants that terminate a single patch or tick but leave
    /// the loop running. Every variant in this crate qualifies; the method
    /// exists so call sites state the invariant explicitly.
    pub fn is_recoverable(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_timestep() {
        let e = TuneError::InvalidTimestep {
            target: "sampler.ratio".into(),
            dt_secs: -0.5,
        };
        let s = e.to_string();
        assert!(s.contains("sampler.ratio"));
        assert!(s.contains("-0.5"));
    }

    #[test]
    fn test_display_stale_generation_mentions_both_generations() {
        let e = TuneError::StaleGeneration {
            target: "filter.allow".into(),
            proposed: 3,
            current: 7,
        };
        let s = e.to_string();
        assert!(s.contains('3'));
        assert!(s.contains('7'));
    }

    #[test]
    fn test_display_policy_violation_carries_reason() {
        let e = TuneError::PolicyViolation {
            target: "t".into(),
            reason: "rate limit".into(),
        };
        assert!(e.to_string().contains("rate limit"));
    }

    #[test]
    fn test_all_variants_are_recoverable() {
        let errors = [
            TuneError::InvalidTimestep { target: "a".into(), dt_secs: 0.0 },
            TuneError::MeasurementUnavailable { target: "a".into(), detail: "x".into() },
            TuneError::StaleGeneration { target: "a".into(), proposed: 1, current: 2 },
            TuneError::PolicyViolation { target: "a".into(), reason: "x".into() },
            TuneError::RegressionDetected { target: "a".into(), before: 1.0, after: 2.0 },
            TuneError::ApplyFailure { target: "a".into(), detail: "x".into() },
            TuneError::UnknownTarget { target: "a".into() },
            TuneError::Http { status: 500, url: "http://x".into() },
            TuneError::Connect { url: "http://x".into(), detail: "refused".into() },
            TuneError::Json { detail: "eof".into() },
            TuneError::Config { detail: "bad".into() },
        ];
        for e in errors {
            assert!(e.is_recoverable());
        }
    }

    #[test]
    fn test_errors_compare_equal_by_content() {
        let a = TuneError::UnknownTarget { target: "x".into() };
        let b = TuneError::UnknownTarget { target: "x".into() };
        assert_eq!(a, b);
    }
}
