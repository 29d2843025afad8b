//! # Stage: PID Controller
//!
//! ## Responsibility
//! Pure control-law arithmetic: converts `(setpoint, measurement, now)` into
//! a bounded control output. Holds the integral accumulator, the previous
//! error for derivative estimation, and the previous sample time for
//! variable time-step correction. No I/O.
//!
//! ## Guarantees
//! - Bounded: output is clamped to `[output_min, output_max]` on every call
//! - Anti-windup: the integral accumulator never leaves
//!   `[-integral_limit, integral_limit]`
//! - Deterministic: `compute` is a pure function of (state, measurement,
//!   now); identical call sequences produce identical outputs
//! - Rejecting: a non-advancing clock yields `InvalidTimestep` and leaves
//!   state untouched
//!
//! ## NOT Responsible For
//! - Sampling cadence or measurement retrieval (loop driver)
//! - Turning the signal into patches (decider)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TuneError;

// ---------------------------------------------------------------------------
// PidConfig — gains and limits, immutable after construction
// ---------------------------------------------------------------------------

/// Tuning constants and limits for one controller instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    /// Target value for the measured quantity.
    pub setpoint: f64,
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Derivative gain.
    pub kd: f64,
    /// Saturation floor for the emitted control signal.
    pub output_min: f64,
    /// Saturation ceiling for the emitted control signal.
    pub output_max: f64,
    /// Anti-windup clamp on the integral accumulator.
    pub integral_limit: f64,
    /// Low-pass EMA coefficient on the derivative term, in `(0, 1]`.
    /// `None` leaves the derivative unfiltered.
    #[serde(default)]
    pub derivative_filter: Option<f64>,
}

impl PidConfig {
    /// Check construction-time invariants.
    ///
    /// Gains must be finite, `output_min < output_max`, `integral_limit`
    /// must be positive and finite, and a filter coefficient (if present)
    /// must lie in `(0, 1]`.
    pub fn validate(&self, target: &str) -> Result<(), TuneError> {
        let bad = |detail: String| TuneError::Config {
            detail: format!("target '{target}': {detail}"),
        };
        for (name, v) in [
            ("setpoint", self.setpoint),
            ("kp", self.kp),
            ("ki", self.ki),
            ("kd", self.kd),
        ] {
            if !v.is_finite() {
                return Err(bad(format!("{name} must be finite, got {v}")));
            }
        }
        if !(self.output_min.is_finite() && self.output_max.is_finite())
            || self.output_min >= self.output_max
        {
            return Err(bad(format!(
                "output limits must satisfy min < max, got [{}, {}]",
                self.output_min, self.output_max
            )));
        }
        if !self.integral_limit.is_finite() || self.integral_limit <= 0.0 {
            return Err(bad(format!(
                "integral_limit must be > 0, got {}",
                self.integral_limit
            )));
        }
        if let Some(alpha) = self.derivative_filter {
            if !alpha.is_finite() || alpha <= 0.0 || alpha > 1.0 {
                return Err(bad(format!(
                    "derivative_filter must be in (0, 1], got {alpha}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            setpoint: 0.0,
            kp: 0.5,
            ki: 0.05,
            kd: 0.1,
            output_min: -1.0,
            output_max: 1.0,
            integral_limit: 10.0,
            derivative_filter: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PidController
// ---------------------------------------------------------------------------

/// One controller instance per controlled target.
///
/// `now` is a monotonic offset from an arbitrary epoch (the loop's start),
/// supplied by the caller on every [`compute`](PidController::compute).
/// Keeping the clock external keeps the controller reproducible.
#[derive(Debug, Clone)]
pub struct PidController {
    target: String,
    cfg: PidConfig,
    integral: f64,
    last_error: f64,
    last_sample_time: Option<Duration>,
    /// Previous (possibly filtered) derivative, the EMA memory.
    last_derivative: f64,
}

impl PidController {
    pub fn new(target: impl Into<String>, cfg: PidConfig) -> Self {
        Self {
            target: target.into(),
            cfg,
            integral: 0.0,
            last_error: 0.0,
            last_sample_time: None,
            last_derivative: 0.0,
        }
    }

    /// The tunable this controller drives.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current integral accumulator (for diagnostics and tests).
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Run one control step.
    ///
    /// The first call (no prior sample) accumulates no integral and uses a
    /// zero derivative, so the output is the clamped proportional term. On
    /// later calls `dt = now - last_sample_time` must be strictly positive;
    /// otherwise the call is rejected with [`TuneError::InvalidTimestep`]
    /// and no state changes.
    pub fn compute(&mut self, measurement: f64, now: Duration) -> Result<f64, TuneError> {
        let error = self.cfg.setpoint - measurement;

        let (integral, derivative) = match self.last_sample_time {
            None => (self.integral, 0.0),
            Some(last) => {
                let dt = now.as_secs_f64() - last.as_secs_f64();
                if dt <= 0.0 {
                    return Err(TuneError::InvalidTimestep {
                        target: self.target.clone(),
                        dt_secs: dt,
                    });
                }
                let integral = (self.integral + error * dt)
                    .clamp(-self.cfg.integral_limit, self.cfg.integral_limit);
                let raw = (error - self.last_error) / dt;
                let derivative = match self.cfg.derivative_filter {
                    Some(alpha) => alpha * raw + (1.0 - alpha) * self.last_derivative,
                    None => raw,
                };
                (integral, derivative)
            }
        };

        let raw_output =
            self.cfg.kp * error + self.cfg.ki * integral + self.cfg.kd * derivative;
        let output = raw_output.clamp(self.cfg.output_min, self.cfg.output_max);

        // State advances only on a successful compute.
        self.integral = integral;
        self.last_error = error;
        self.last_derivative = derivative;
        self.last_sample_time = Some(now);

        Ok(output)
    }

    /// Drop accumulated state, keeping the configuration.
    ///
    /// Called after a rollback so stale integral does not immediately push
    /// the value back toward the reverted configuration.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_derivative = 0.0;
        self.last_sample_time = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn cfg() -> PidConfig {
        PidConfig {
            setpoint: 100.0,
            kp: 0.1,
            ki: 0.01,
            kd: 0.05,
            output_min: -10.0,
            output_max: 10.0,
            integral_limit: 50.0,
            derivative_filter: None,
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    // ===== First-call convention =====

    #[test]
    fn test_first_call_is_pure_proportional() {
        // setpoint=100, measurement=90 at t=0: e=10, integral=0, derivative=0
        // by convention, so output = kp*10 = 1.0.
        let mut pid = PidController::new("t", cfg());
        let out = pid.compute(90.0, secs(0)).unwrap();
        assert!((out - 1.0).abs() < 1e-12, "got {out}");
    }

    #[test]
    fn test_first_call_does_not_accumulate_integral() {
        let mut pid = PidController::new("t", cfg());
        pid.compute(90.0, secs(0)).unwrap();
        assert_eq!(pid.integral(), 0.0);
    }

    // ===== Timestep handling =====

    #[test]
    fn test_zero_dt_rejected() {
        let mut pid = PidController::new("t", cfg());
        pid.compute(90.0, secs(5)).unwrap();
        let err = pid.compute(91.0, secs(5)).unwrap_err();
        assert!(matches!(err, TuneError::InvalidTimestep { .. }));
    }

    #[test]
    fn test_backwards_dt_rejected() {
        let mut pid = PidController::new("t", cfg());
        pid.compute(90.0, secs(5)).unwrap();
        let err = pid.compute(91.0, secs(3)).unwrap_err();
        match err {
            TuneError::InvalidTimestep { dt_secs, .. } => assert!(dt_secs < 0.0),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejected_call_leaves_state_untouched() {
        let mut pid = PidController::new("t", cfg());
        pid.compute(90.0, secs(1)).unwrap();
        pid.compute(95.0, secs(2)).unwrap();
        let snapshot = pid.clone();

        let _ = pid.compute(80.0, secs(2)).unwrap_err();

        assert_eq!(pid.integral, snapshot.integral);
        assert_eq!(pid.last_error, snapshot.last_error);
        assert_eq!(pid.last_sample_time, snapshot.last_sample_time);
        assert_eq!(pid.last_derivative, snapshot.last_derivative);

        // The next valid call behaves as if the rejected one never happened.
        let mut reference = snapshot;
        let a = pid.compute(85.0, secs(3)).unwrap();
        let b = reference.compute(85.0, secs(3)).unwrap();
        assert_eq!(a, b);
    }

    // ===== Integral / derivative terms =====

    #[test]
    fn test_integral_accumulates_error_times_dt() {
        let mut pid = PidController::new(
            "t",
            PidConfig { kp: 0.0, kd: 0.0, ki: 1.0, ..cfg() },
        );
        pid.compute(90.0, secs(0)).unwrap(); // first call: no accumulation
        pid.compute(90.0, secs(2)).unwrap(); // e=10, dt=2 -> integral = 20
        assert!((pid.integral() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_derivative_responds_to_error_change() {
        let mut pid = PidController::new(
            "t",
            PidConfig { kp: 0.0, ki: 0.0, kd: 1.0, ..cfg() },
        );
        pid.compute(90.0, secs(0)).unwrap(); // e = 10
        // e drops to 5 over 1s: derivative = -5, output = kd * -5.
        let out = pid.compute(95.0, secs(1)).unwrap();
        assert!((out - (-5.0)).abs() < 1e-9, "got {out}");
    }

    #[test]
    fn test_derivative_filter_damps_step() {
        let unfiltered = {
            let mut pid = PidController::new(
                "t",
                PidConfig { kp: 0.0, ki: 0.0, kd: 1.0, ..cfg() },
            );
            pid.compute(90.0, secs(0)).unwrap();
            pid.compute(95.0, secs(1)).unwrap()
        };
        let filtered = {
            let mut pid = PidController::new(
                "t",
                PidConfig {
                    kp: 0.0,
                    ki: 0.0,
                    kd: 1.0,
                    derivative_filter: Some(0.2),
                    ..cfg()
                },
            );
            pid.compute(90.0, secs(0)).unwrap();
            pid.compute(95.0, secs(1)).unwrap()
        };
        assert!(filtered.abs() < unfiltered.abs(), "{filtered} vs {unfiltered}");
    }

    #[test]
    fn test_filter_alpha_one_equals_unfiltered() {
        let mut a = PidController::new("t", PidConfig { derivative_filter: Some(1.0), ..cfg() });
        let mut b = PidController::new("t", cfg());
        for (m, t) in [(90.0, 0), (93.0, 1), (97.0, 2), (101.0, 3)] {
            let x = a.compute(m, secs(t)).unwrap();
            let y = b.compute(m, secs(t)).unwrap();
            assert_eq!(x, y);
        }
    }

    // ===== Reset =====

    #[test]
    fn test_reset_clears_accumulated_state() {
        let mut pid = PidController::new("t", cfg());
        pid.compute(50.0, secs(0)).unwrap();
        pid.compute(50.0, secs(1)).unwrap();
        assert!(pid.integral() != 0.0);
        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.last_sample_time, None);
        // After reset the next call follows the first-call convention again.
        let out = pid.compute(90.0, secs(2)).unwrap();
        assert!((out - 1.0).abs() < 1e-12);
    }

    // ===== Config validation =====

    #[rstest]
    #[case(PidConfig { kp: f64::NAN, ..cfg() })]
    #[case(PidConfig { ki: f64::INFINITY, ..cfg() })]
    #[case(PidConfig { output_min: 5.0, output_max: 5.0, ..cfg() })]
    #[case(PidConfig { output_min: 2.0, output_max: -2.0, ..cfg() })]
    #[case(PidConfig { integral_limit: 0.0, ..cfg() })]
    #[case(PidConfig { integral_limit: -4.0, ..cfg() })]
    #[case(PidConfig { derivative_filter: Some(0.0), ..cfg() })]
    #[case(PidConfig { derivative_filter: Some(1.5), ..cfg() })]
    fn test_validate_rejects_bad_config(#[case] bad: PidConfig) {
        assert!(bad.validate("t").is_err());
    }

    #[test]
    fn test_validate_accepts_default() {
        assert!(PidConfig::default().validate("t").is_ok());
    }

    // ===== Properties =====

    proptest! {
        #[test]
        fn prop_output_always_saturated(
            measurements in proptest::collection::vec(-1e6f64..1e6, 1..50),
        ) {
            let mut pid = PidController::new("t", cfg());
            for (i, m) in measurements.iter().enumerate() {
                let out = pid.compute(*m, Duration::from_millis(100 * (i as u64 + 1))).unwrap();
                prop_assert!(out >= pid.cfg.output_min && out <= pid.cfg.output_max);
            }
        }

        #[test]
        fn prop_integral_never_exceeds_limit(
            offset in 1e3f64..1e6,
            ticks in 1usize..200,
        ) {
            // Sustained error far from the setpoint must not wind up the
            // integral past the clamp.
            let mut pid = PidController::new("t", cfg());
            for i in 0..ticks {
                let _ = pid.compute(100.0 + offset, Duration::from_secs(i as u64 + 1)).unwrap();
                prop_assert!(pid.integral().abs() <= pid.cfg.integral_limit + 1e-9);
            }
        }

        #[test]
        fn prop_identical_sequences_are_bit_identical(
            inputs in proptest::collection::vec((-1e4f64..1e4, 1u64..1000), 1..30),
        ) {
            let mut a = PidController::new("t", cfg());
            let mut b = PidController::new("t", cfg());
            let mut t = Duration::ZERO;
            for (m, step_ms) in inputs {
                t += Duration::from_millis(step_ms);
                let x = a.compute(m, t).unwrap();
                let y = b.compute(m, t).unwrap();
                prop_assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }
}
