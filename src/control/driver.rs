//! # Stage: Control Loop Driver
//!
//! ## Responsibility
//! Owns one target's sampling cadence. Each tick: fetch the measurement
//! (time-bounded), run the PID controller, hand the signal to the decider,
//! and forward any resulting proposal into the patch channel. Drains
//! governance acknowledgements between ticks.
//!
//! ## Guarantees
//! - No backlog: missed ticks are skipped, the loop always samples "now"
//! - Missing sample, not zero error: a failed or timed-out fetch skips the
//!   tick and leaves controller state untouched
//! - Non-blocking cadence: a stalled measurement source costs at most
//!   `fetch_timeout` per tick, never an unbounded wait
//!
//! ## NOT Responsible For
//! - Control-law arithmetic (PID controller)
//! - Proposal policy (decider) or application (governance)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::control::decider::Decider;
use crate::control::pid::PidController;
use crate::measure::MeasurementSource;
use crate::patch::{Outcome, PatchAck, PatchEnvelope};

/// Capacity of the per-target acknowledgement channel. One proposal is in
/// flight at a time, so a small buffer absorbs any burst.
const ACK_CHANNEL_CAP: usize = 8;

// ---------------------------------------------------------------------------
// DriverStatus
// ---------------------------------------------------------------------------

/// Counters describing one driver's activity, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStatus {
    /// Ticks where a measurement was obtained and the controller ran.
    pub sampled_ticks: u64,
    /// Ticks skipped because the measurement was unavailable or late.
    pub skipped_ticks: u64,
    /// Proposals handed to the patch channel.
    pub patches_proposed: u64,
    /// Rollback acknowledgements observed (each resets the controller).
    pub rollbacks_seen: u64,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// The periodic sampling task for one controlled target.
pub struct Driver {
    target: String,
    pid: PidController,
    decider: Decider,
    source: Arc<dyn MeasurementSource>,
    patch_tx: mpsc::Sender<PatchEnvelope>,
    ack_tx: mpsc::Sender<PatchAck>,
    ack_rx: mpsc::Receiver<PatchAck>,
    sample_interval: Duration,
    fetch_timeout: Duration,
    /// Epoch for the monotonic offsets handed to the controller.
    epoch: Instant,
    status: DriverStatus,
}

impl Driver {
    pub fn new(
        target: impl Into<String>,
        pid: PidController,
        decider: Decider,
        source: Arc<dyn MeasurementSource>,
        patch_tx: mpsc::Sender<PatchEnvelope>,
        sample_interval: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAP);
        Self {
            target: target.into(),
            pid,
            decider,
            source,
            patch_tx,
            ack_tx,
            ack_rx,
            sample_interval,
            fetch_timeout,
            epoch: Instant::now(),
            status: DriverStatus::default(),
        }
    }

    pub fn status(&self) -> DriverStatus {
        self.status
    }

    /// Run until `shutdown` flips to `true`. Ticks are independent: a slow
    /// tick delays nothing, missed ticks are dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender stops the loop like an explicit signal.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(target: "pipetune::driver", tunable = %self.target, "shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
            }
        }
    }

    /// One full sampling cycle. Public so tests can drive the loop
    /// synchronously without spawning tasks.
    pub async fn tick_once(&mut self) {
        self.drain_acks();

        let sample = match timeout(self.fetch_timeout, self.source.sample(&self.target)).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                self.status.skipped_ticks += 1;
                warn!(
                    target: "pipetune::driver",
                    tunable = %self.target,
                    error = %e,
                    "measurement unavailable, skipping tick"
                );
                return;
            }
            Err(_) => {
                self.status.skipped_ticks += 1;
                warn!(
                    target: "pipetune::driver",
                    tunable = %self.target,
                    timeout_ms = self.fetch_timeout.as_millis() as u64,
                    "measurement fetch timed out, skipping tick"
                );
                return;
            }
        };

        let now = self.epoch.elapsed();
        let signal = match self.pid.compute(sample.value, now) {
            Ok(signal) => signal,
            Err(e) => {
                self.status.skipped_ticks += 1;
                warn!(
                    target: "pipetune::driver",
                    tunable = %self.target,
                    error = %e,
                    "controller rejected sample, skipping tick"
                );
                return;
            }
        };
        self.status.sampled_ticks += 1;

        let Some(patch) = self.decider.decide(signal, sample.value, now) else {
            return;
        };

        let envelope = PatchEnvelope {
            patch,
            ack_tx: self.ack_tx.clone(),
        };
        match self.patch_tx.send(envelope).await {
            Ok(()) => self.status.patches_proposed += 1,
            Err(_) => {
                warn!(
                    target: "pipetune::driver",
                    tunable = %self.target,
                    "patch channel closed, proposal dropped"
                );
            }
        }
    }

    fn drain_acks(&mut self) {
        while let Ok(ack) = self.ack_rx.try_recv() {
            if let Some(outcome) = self.decider.on_ack(&ack) {
                debug!(
                    target: "pipetune::driver",
                    tunable = %self.target,
                    outcome = %outcome,
                    generation = ack.current_generation,
                    "proposal resolved"
                );
                if outcome == Outcome::RolledBack {
                    // Stale integral would immediately push the value back
                    // toward the reverted configuration.
                    self.pid.reset();
                    self.status.rollbacks_seen += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetKind;
    use crate::control::pid::PidConfig;
    use crate::govern::version::{TargetValue, VersionStore};
    use crate::measure::StaticSource;
    use crate::patch::{patch_channel, PatchAck};

    fn pid() -> PidController {
        PidController::new(
            "sampler.ratio",
            PidConfig {
                setpoint: 100.0,
                kp: 0.1,
                ki: 0.0,
                kd: 0.0,
                output_min: -10.0,
                output_max: 10.0,
                integral_limit: 10.0,
                derivative_filter: None,
            },
        )
    }

    fn harness(
        source: Arc<StaticSource>,
    ) -> (Driver, mpsc::Receiver<PatchEnvelope>, Arc<VersionStore>) {
        let store = Arc::new(VersionStore::new([(
            "sampler.ratio".to_string(),
            TargetValue::Scalar(1.0),
        )]));
        let decider = Decider::new(
            "sampler.ratio",
            TargetKind::Continuous { scale: 0.1 },
            0.01,
            Arc::clone(&store),
        );
        let (patch_tx, patch_rx) = patch_channel();
        let driver = Driver::new(
            "sampler.ratio",
            pid(),
            decider,
            source,
            patch_tx,
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        (driver, patch_rx, store)
    }

    #[tokio::test]
    async fn test_tick_proposes_patch_when_error_present() {
        let source = Arc::new(StaticSource::new());
        source.set("sampler.ratio", 50.0); // far below setpoint 100
        let (mut driver, mut patch_rx, _store) = harness(source);

        driver.tick_once().await;

        let env = patch_rx.try_recv().expect("expected a proposal");
        assert_eq!(env.patch.target, "sampler.ratio");
        assert_eq!(driver.status().patches_proposed, 1);
        assert_eq!(driver.status().sampled_ticks, 1);
    }

    #[tokio::test]
    async fn test_unavailable_measurement_skips_tick() {
        let source = Arc::new(StaticSource::new()); // nothing set
        let (mut driver, mut patch_rx, _store) = harness(source);

        driver.tick_once().await;

        assert!(patch_rx.try_recv().is_err());
        assert_eq!(driver.status().skipped_ticks, 1);
        assert_eq!(driver.status().sampled_ticks, 0);
        // Controller state untouched: the next good sample behaves as a
        // first call.
        assert_eq!(driver.pid.integral(), 0.0);
    }

    #[tokio::test]
    async fn test_on_target_measurement_emits_nothing() {
        let source = Arc::new(StaticSource::new());
        source.set("sampler.ratio", 100.0); // exactly on setpoint
        let (mut driver, mut patch_rx, _store) = harness(source);

        driver.tick_once().await;

        assert!(patch_rx.try_recv().is_err());
        assert_eq!(driver.status().sampled_ticks, 1);
        assert_eq!(driver.status().patches_proposed, 0);
    }

    #[tokio::test]
    async fn test_second_proposal_withheld_while_first_unacked() {
        let source = Arc::new(StaticSource::new());
        source.set("sampler.ratio", 50.0);
        let (mut driver, mut patch_rx, _store) = harness(source);

        driver.tick_once().await;
        driver.tick_once().await;

        assert!(patch_rx.try_recv().is_ok());
        assert!(patch_rx.try_recv().is_err(), "second tick must withhold");
        assert_eq!(driver.status().patches_proposed, 1);
    }

    #[tokio::test]
    async fn test_ack_releases_next_proposal() {
        let source = Arc::new(StaticSource::new());
        source.set("sampler.ratio", 50.0);
        let (mut driver, mut patch_rx, _store) = harness(source);

        driver.tick_once().await;
        let env = patch_rx.try_recv().unwrap();
        env.ack_tx
            .send(PatchAck {
                patch_id: env.patch.id,
                target: env.patch.target.clone(),
                outcome: Outcome::Committed,
                current_generation: 1,
            })
            .await
            .unwrap();

        driver.tick_once().await;
        let second = patch_rx.try_recv().expect("ack should release the slot");
        assert_eq!(second.patch.generation, 1);
        assert_eq!(driver.status().patches_proposed, 2);
    }

    #[tokio::test]
    async fn test_rollback_ack_resets_controller() {
        let source = Arc::new(StaticSource::new());
        source.set("sampler.ratio", 50.0);
        let (mut driver, mut patch_rx, _store) = harness(source);

        // Accumulate integral over a few ticks (first proposal stays
        // in flight, but the controller keeps integrating).
        driver.tick_once().await;
        driver.tick_once().await;
        driver.tick_once().await;
        assert!(driver.pid.integral() != 0.0);

        let env = patch_rx.try_recv().unwrap();
        env.ack_tx
            .send(PatchAck {
                patch_id: env.patch.id,
                target: env.patch.target.clone(),
                outcome: Outcome::RolledBack,
                current_generation: 2,
            })
            .await
            .unwrap();

        driver.tick_once().await;
        assert_eq!(driver.status().rollbacks_seen, 1);
        // Reset ran before this tick's compute, which then followed the
        // first-call convention and accumulated nothing.
        assert_eq!(driver.pid.integral(), 0.0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let source = Arc::new(StaticSource::new());
        source.set("sampler.ratio", 100.0);
        let (driver, _patch_rx, _store) = harness(source);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(driver.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("driver should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_patch_channel_does_not_panic() {
        let source = Arc::new(StaticSource::new());
        source.set("sampler.ratio", 50.0);
        let (mut driver, patch_rx, _store) = harness(source);
        drop(patch_rx);

        driver.tick_once().await; // must log and continue, not panic
        assert_eq!(driver.status().patches_proposed, 0);
    }
}
