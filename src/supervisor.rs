//! # Stage: Supervisor
//!
//! ## Responsibility
//! Construction and lifecycle of the whole loop: builds the version store
//! and governance engine from a validated [`TuneConfig`], spawns one driver
//! task per controlled target, and tears everything down in order —
//! drivers first, then governance, draining in-flight transitions to a
//! terminal state before releasing controller state.
//!
//! ## Guarantees
//! - One controller instance per target; nothing is shared between targets
//!   except the version store and the patch channel
//! - Decommissioning a target waits for its in-flight governance work to
//!   reach a terminal state
//!
//! ## NOT Responsible For
//! - Anything inside a tick (driver) or a patch (engine)

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::TuneConfig;
use crate::control::decider::Decider;
use crate::control::driver::Driver;
use crate::control::pid::PidController;
use crate::error::TuneError;
use crate::govern::audit::{AuditRecord, AuditSink};
use crate::govern::engine::{GovernanceEngine, Phase};
use crate::govern::version::{PipelineConfigVersion, VersionStore};
use crate::measure::MeasurementSource;
use crate::patch::{patch_channel, PatchEnvelope};
use crate::sink::ConfigSink;

struct DriverHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Owns every task of one running controller instance.
pub struct Supervisor {
    store: Arc<VersionStore>,
    engine: GovernanceEngine,
    engine_handle: Option<JoinHandle<()>>,
    drivers: HashMap<String, DriverHandle>,
    /// The supervisor's own sender keeps the patch channel open until
    /// shutdown; dropping it (and every driver's clone) lets governance
    /// drain and stop.
    patch_tx: Option<mpsc::Sender<PatchEnvelope>>,
}

impl Supervisor {
    /// Validate the configuration, seed the store, and spawn governance
    /// plus one sampling task per target.
    pub fn start(
        config: &TuneConfig,
        source: Arc<dyn MeasurementSource>,
        sink: Arc<dyn ConfigSink>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, TuneError> {
        config.validate()?;

        let store = Arc::new(VersionStore::new(config.initial_values()));
        let engine = GovernanceEngine::new(
            Arc::clone(&store),
            config.policy_set(),
            config.directions(),
            Arc::clone(&source),
            sink,
            audit,
            config.fetch_timeout(),
        );
        let (patch_tx, patch_rx) = patch_channel();
        let engine_handle = engine.spawn(patch_rx);

        let mut drivers = HashMap::new();
        for target in &config.targets {
            let pid = PidController::new(target.name.clone(), target.pid.clone());
            let decider = Decider::new(
                target.name.clone(),
                target.kind.clone(),
                target.dead_band,
                Arc::clone(&store),
            );
            let driver = Driver::new(
                target.name.clone(),
                pid,
                decider,
                Arc::clone(&source),
                patch_tx.clone(),
                config.sample_interval(),
                config.fetch_timeout(),
            );
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let join = tokio::spawn(driver.run(shutdown_rx));
            drivers.insert(target.name.clone(), DriverHandle { shutdown_tx, join });
        }

        info!(
            target: "pipetune::supervisor",
            targets = drivers.len(),
            "control loop started"
        );
        Ok(Self {
            store,
            engine,
            engine_handle: Some(engine_handle),
            drivers,
            patch_tx: Some(patch_tx),
        })
    }

    /// Names of the currently controlled targets.
    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Committed copy-on-read snapshot of the live configuration.
    pub fn snapshot(&self) -> PipelineConfigVersion {
        self.store.snapshot()
    }

    /// The governance phase for one target.
    pub fn phase(&self, target: &str) -> Phase {
        self.engine.phase(target)
    }

    /// All terminal-transition audit records, oldest first.
    pub fn audit_history(&self) -> Vec<AuditRecord> {
        self.engine.history()
    }

    /// Terminal-transition audit records for one target.
    pub fn audit_history_for(&self, target: &str) -> Vec<AuditRecord> {
        self.engine.history_for(target)
    }

    /// Stop one target's sampling loop and wait for its in-flight
    /// governance work to reach a terminal state. The target's committed
    /// value stays live in the configuration.
    pub async fn decommission(&mut self, target: &str) -> Result<(), TuneError> {
        let handle = self
            .drivers
            .remove(target)
            .ok_or_else(|| TuneError::UnknownTarget { target: target.into() })?;
        let _ = handle.shutdown_tx.send(true);
        if let Err(e) = handle.join.await {
            error!(
                target: "pipetune::supervisor",
                tunable = %target,
                error = %e,
                "driver task failed"
            );
        }
        self.engine.quiesce(target).await;
        info!(target: "pipetune::supervisor", tunable = %target, "target decommissioned");
        Ok(())
    }

    /// Stop everything: drivers first, then governance, which drains every
    /// in-flight transition to a terminal state before the call returns.
    pub async fn shutdown(mut self) {
        for (target, handle) in self.drivers.drain() {
            let _ = handle.shutdown_tx.send(true);
            if let Err(e) = handle.join.await {
                error!(
                    target: "pipetune::supervisor",
                    tunable = %target,
                    error = %e,
                    "driver task failed"
                );
            }
        }
        // Last sender drops here; governance drains and stops.
        self.patch_tx.take();
        if let Some(engine_handle) = self.engine_handle.take() {
            if let Err(e) = engine_handle.await {
                error!(
                    target: "pipetune::supervisor",
                    error = %e,
                    "governance task failed during drain"
                );
            }
        }
        info!(target: "pipetune::supervisor", "control loop stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TuneConfig;
    use crate::govern::audit::MemoryAuditSink;
    use crate::measure::StaticSource;
    use crate::sink::MemorySink;

    const CONFIG: &str = r#"
sample_interval_ms = 20
fetch_timeout_ms = 100

[policy]
max_patch_rate_ms = 40
settle_window_ms = 20
rollback_cooldown_ms = 200
rollback_threshold = 0.10

[[target]]
name = "sampler.ratio"
kind = "continuous"
scale = 0.1
direction = "lower_is_better"
min = 0.01
max = 2.0
dead_band = 0.01
initial = 1.0

[target.pid]
setpoint = 100.0
kp = 0.05
ki = 0.0
kd = 0.0
output_min = -1.0
output_max = 1.0
integral_limit = 10.0
"#;

    fn start(source: Arc<StaticSource>) -> Supervisor {
        let config = TuneConfig::from_toml_str(CONFIG).unwrap();
        Supervisor::start(
            &config,
            source,
            Arc::new(MemorySink::new()),
            Arc::new(MemoryAuditSink::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_lists_targets() {
        let source = Arc::new(StaticSource::new());
        let sup = start(Arc::clone(&source));
        assert_eq!(sup.targets(), vec!["sampler.ratio".to_string()]);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = TuneConfig::from_toml_str(CONFIG).unwrap();
        config.sample_interval_ms = 0;
        let res = Supervisor::start(
            &config,
            Arc::new(StaticSource::new()),
            Arc::new(MemorySink::new()),
            Arc::new(MemoryAuditSink::default()),
        );
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_reflects_initial_values() {
        let source = Arc::new(StaticSource::new());
        let sup = start(Arc::clone(&source));
        let snap = sup.snapshot();
        assert_eq!(snap.generation, 0);
        assert!(snap.get("sampler.ratio").is_some());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_decommission_unknown_target_errors() {
        let source = Arc::new(StaticSource::new());
        let mut sup = start(Arc::clone(&source));
        assert!(sup.decommission("ghost").await.is_err());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_decommission_removes_target() {
        let source = Arc::new(StaticSource::new());
        let mut sup = start(Arc::clone(&source));
        sup.decommission("sampler.ratio").await.unwrap();
        assert!(sup.targets().is_empty());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completes_with_idle_loop() {
        let source = Arc::new(StaticSource::new());
        let sup = start(Arc::clone(&source));
        tokio::time::timeout(std::time::Duration::from_secs(2), sup.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
