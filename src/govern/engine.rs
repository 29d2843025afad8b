//! # Stage: Governance Engine
//!
//! ## Responsibility
//! The central authority over live configuration. Consumes patch proposals
//! from the channel, and per target runs the state machine
//! `Idle → Validating → Applying → Observing → {Committed | RolledBack |
//! Rejected}`: validates generation and policy, writes through the config
//! sink and then the version store, waits out the settle window, compares
//! the post-apply measurement against the proposal's rationale, and commits
//! or rolls back. Every terminal transition produces an audit record and an
//! acknowledgement to the proposer.
//!
//! ## Guarantees
//! - Per-target serialization: one worker task per target, proposals
//!   handled strictly in emission order; different targets proceed
//!   independently
//! - Single-writer: only these workers mutate the version store
//! - At most one patch per target in a non-terminal state at any instant
//! - Idempotent consumption: a redelivered proposal (same id and
//!   generation) is dropped, never applied twice
//! - Drain on shutdown: closing the patch channel lets every in-flight
//!   transition reach a terminal state before the engine task finishes
//!
//! ## NOT Responsible For
//! - Producing proposals (decider) or the sampling cadence (driver)
//! - The pipeline's interpretation of applied values (config sink)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TuneError;
use crate::govern::audit::{AuditRecord, AuditSink, MemoryAuditSink};
use crate::govern::policy::{MetricDirection, PolicySet};
use crate::govern::version::{TargetEntry, TargetValue, VersionStore};
use crate::measure::MeasurementSource;
use crate::patch::{ConfigPatch, Outcome, PatchAck, PatchEnvelope};
use crate::sink::ConfigSink;

/// Queue depth of each per-target worker. Deciders hold one proposal in
/// flight, so anything beyond a couple of redeliveries is headroom.
const WORKER_QUEUE_CAP: usize = 16;

/// Poll interval for [`GovernanceEngine::quiesce`].
const QUIESCE_POLL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Phase — the non-terminal states of the per-target machine
// ---------------------------------------------------------------------------

/// Where a target's governance machine currently stands. Terminal states
/// are reported via [`Outcome`]; between patches the machine rests in
/// `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    Applying,
    Observing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Validating => "validating",
            Phase::Applying => "applying",
            Phase::Observing => "observing",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// GovernanceEngine
// ---------------------------------------------------------------------------

struct EngineInner {
    store: Arc<VersionStore>,
    policy: PolicySet,
    directions: HashMap<String, MetricDirection>,
    source: Arc<dyn MeasurementSource>,
    sink: Arc<dyn ConfigSink>,
    audit: Arc<dyn AuditSink>,
    /// Built-in bounded history, queryable regardless of the external sink.
    history: MemoryAuditSink,
    /// Bound on the post-apply measurement fetch.
    fetch_timeout: Duration,
    phases: Mutex<HashMap<String, Phase>>,
}

impl EngineInner {
    fn set_phase(&self, target: &str, phase: Phase) {
        self.phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target.to_string(), phase);
    }

    fn phase(&self, target: &str) -> Phase {
        self.phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(target)
            .copied()
            .unwrap_or(Phase::Idle)
    }
}

/// Cloneable handle to the governance layer. Spawn the consumer loop with
/// [`GovernanceEngine::spawn`]; the returned task finishes once the patch
/// channel closes and every worker has drained.
#[derive(Clone)]
pub struct GovernanceEngine {
    inner: Arc<EngineInner>,
}

impl GovernanceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<VersionStore>,
        policy: PolicySet,
        directions: HashMap<String, MetricDirection>,
        source: Arc<dyn MeasurementSource>,
        sink: Arc<dyn ConfigSink>,
        audit: Arc<dyn AuditSink>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                policy,
                directions,
                source,
                sink,
                audit,
                history: MemoryAuditSink::default(),
                fetch_timeout,
                phases: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Spawn the dispatcher. Routes each envelope to its target's worker,
    /// creating workers lazily; when `rx` closes, worker queues are closed
    /// and the dispatcher awaits each one, draining in-flight transitions
    /// to a terminal state.
    pub fn spawn(&self, rx: mpsc::Receiver<PatchEnvelope>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(dispatch(inner, rx))
    }

    /// The current non-terminal phase for a target (`Idle` when nothing is
    /// in flight).
    pub fn phase(&self, target: &str) -> Phase {
        self.inner.phase(target)
    }

    /// Wait until the target's machine is idle — used when decommissioning
    /// a single target so in-flight transitions finish first. Bounded in
    /// practice by the settle window plus the measurement fetch bound.
    pub async fn quiesce(&self, target: &str) {
        while self.inner.phase(target) != Phase::Idle {
            sleep(QUIESCE_POLL).await;
        }
    }

    /// All terminal-transition records, oldest first.
    pub fn history(&self) -> Vec<AuditRecord> {
        self.inner.history.records()
    }

    /// Terminal-transition records for one target, oldest first.
    pub fn history_for(&self, target: &str) -> Vec<AuditRecord> {
        self.inner.history.records_for(target)
    }
}

async fn dispatch(inner: Arc<EngineInner>, mut rx: mpsc::Receiver<PatchEnvelope>) {
    let mut workers: HashMap<String, (mpsc::Sender<PatchEnvelope>, JoinHandle<()>)> =
        HashMap::new();

    while let Some(envelope) = rx.recv().await {
        let target = envelope.patch.target.clone();
        let (tx, _) = workers.entry(target.clone()).or_insert_with(|| {
            let (tx, worker_rx) = mpsc::channel(WORKER_QUEUE_CAP);
            let worker = TargetWorker::new(target.clone(), Arc::clone(&inner));
            (tx, tokio::spawn(worker.run(worker_rx)))
        });
        if tx.send(envelope).await.is_err() {
            warn!(
                target: "pipetune::govern",
                tunable = %target,
                "worker queue closed, proposal dropped"
            );
        }
    }

    // Patch channel closed: drain every worker to a terminal state.
    for (target, (tx, handle)) in workers {
        drop(tx);
        if let Err(e) = handle.await {
            error!(
                target: "pipetune::govern",
                tunable = %target,
                error = %e,
                "worker task failed during drain"
            );
        }
    }
    debug!(target: "pipetune::govern", "governance drained and stopped");
}

// ---------------------------------------------------------------------------
// TargetWorker — serialized per-target machine
// ---------------------------------------------------------------------------

struct TargetWorker {
    target: String,
    inner: Arc<EngineInner>,
    /// When this target's last patch was applied, for the rate limit.
    last_applied_at: Option<Instant>,
    /// Proposal suppression until this instant after a rollback.
    cooldown_until: Option<Instant>,
    /// `(id, generation)` of the last applied patch, for redelivery dedup.
    last_applied: Option<(Uuid, u64)>,
}

impl TargetWorker {
    fn new(target: String, inner: Arc<EngineInner>) -> Self {
        Self {
            target,
            inner,
            last_applied_at: None,
            cooldown_until: None,
            last_applied: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PatchEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            self.handle(envelope).await;
        }
        self.inner.set_phase(&self.target, Phase::Idle);
    }

    async fn handle(&mut self, envelope: PatchEnvelope) {
        let PatchEnvelope { patch, ack_tx } = envelope;

        // At-least-once delivery: an exact redelivery of an already-applied
        // proposal is consumed idempotently.
        if self.last_applied == Some((patch.id, patch.generation)) {
            debug!(
                target: "pipetune::govern",
                tunable = %self.target,
                patch = %patch.id,
                "duplicate delivery ignored"
            );
            return;
        }

        self.inner.set_phase(&self.target, Phase::Validating);
        let (prior, candidate) = match self.validate(&patch) {
            Ok(ok) => ok,
            Err(e) => {
                self.finish(&patch, Outcome::Rejected, None, Some(e.to_string()), ack_tx)
                    .await;
                return;
            }
        };

        self.inner.set_phase(&self.target, Phase::Applying);
        if let Err(e) = self.inner.sink.apply(&patch.target, &candidate).await {
            // Downstream refused the write: nothing was committed.
            self.finish(&patch, Outcome::Rejected, None, Some(e.to_string()), ack_tx)
                .await;
            return;
        }
        let new_generation = match self.inner.store.write(&patch.target, candidate.clone()) {
            Ok((_, generation)) => generation,
            Err(e) => {
                error!(
                    target: "pipetune::govern",
                    tunable = %self.target,
                    error = %e,
                    "store write failed after sink accepted"
                );
                self.finish(&patch, Outcome::Rejected, None, Some(e.to_string()), ack_tx)
                    .await;
                return;
            }
        };
        self.last_applied_at = Some(Instant::now());
        self.last_applied = Some((patch.id, patch.generation));
        info!(
            target: "pipetune::govern",
            tunable = %self.target,
            op = %patch.op,
            generation = new_generation,
            "patch applied, observing"
        );

        self.inner.set_phase(&self.target, Phase::Observing);
        sleep(self.inner.policy.settle_window).await;
        let (outcome, post, detail) = self.judge(&patch, &prior).await;
        self.finish(&patch, outcome, post, detail, ack_tx).await;
    }

    /// `Validating`: generation, rate limit, cooldown, schema, bounds.
    fn validate(&self, patch: &ConfigPatch) -> Result<(TargetEntry, TargetValue), TuneError> {
        let entry = self
            .inner
            .store
            .get(&patch.target)
            .ok_or_else(|| TuneError::UnknownTarget {
                target: patch.target.clone(),
            })?;

        if patch.generation != entry.generation {
            return Err(TuneError::StaleGeneration {
                target: patch.target.clone(),
                proposed: patch.generation,
                current: entry.generation,
            });
        }

        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                return Err(TuneError::PolicyViolation {
                    target: patch.target.clone(),
                    reason: "target in post-rollback cooldown".into(),
                });
            }
        }

        if let Some(last) = self.last_applied_at {
            let elapsed = last.elapsed();
            if elapsed < self.inner.policy.max_patch_rate {
                return Err(TuneError::PolicyViolation {
                    target: patch.target.clone(),
                    reason: format!(
                        "patch rate limit: {}ms since last apply, minimum is {}ms",
                        elapsed.as_millis(),
                        self.inner.policy.max_patch_rate.as_millis()
                    ),
                });
            }
        }

        let candidate = entry
            .value
            .with_op(&patch.op)
            .map_err(|reason| TuneError::PolicyViolation {
                target: patch.target.clone(),
                reason,
            })?;
        self.inner.policy.check_bounds(&patch.target, &candidate)?;

        Ok((entry, candidate))
    }

    /// `Observing` verdict: compare the post-apply measurement against the
    /// rationale snapshot, in the target's metric direction.
    async fn judge(
        &mut self,
        patch: &ConfigPatch,
        prior: &TargetEntry,
    ) -> (Outcome, Option<f64>, Option<String>) {
        let fetched = timeout(
            self.inner.fetch_timeout,
            self.inner.source.sample(&patch.target),
        )
        .await;

        let sample = match fetched {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                // The change cannot be judged; keep it, like an expired
                // observation window, and say so in the record.
                warn!(
                    target: "pipetune::govern",
                    tunable = %self.target,
                    error = %e,
                    "post-apply measurement unavailable, committing unjudged"
                );
                return (
                    Outcome::Committed,
                    None,
                    Some("post-apply measurement unavailable".into()),
                );
            }
            Err(_) => {
                warn!(
                    target: "pipetune::govern",
                    tunable = %self.target,
                    "post-apply measurement timed out, committing unjudged"
                );
                return (
                    Outcome::Committed,
                    None,
                    Some("post-apply measurement timed out".into()),
                );
            }
        };

        let direction = self
            .inner
            .directions
            .get(&patch.target)
            .copied()
            .unwrap_or(MetricDirection::LowerIsBetter);
        let before = patch.rationale.measurement;

        if !self.inner.policy.is_regression(before, sample.value, direction) {
            return (Outcome::Committed, Some(sample.value), None);
        }

        // Regression past the threshold: revert to the prior value through
        // the same write path, then suppress this target for the cooldown.
        let regression = TuneError::RegressionDetected {
            target: patch.target.clone(),
            before,
            after: sample.value,
        };
        warn!(
            target: "pipetune::govern",
            tunable = %self.target,
            before,
            after = sample.value,
            "rolling back"
        );
        if let Err(e) = self.inner.sink.apply(&patch.target, &prior.value).await {
            // The store reverts regardless: snapshots stay truthful and the
            // next cycle re-drives the sink toward them.
            error!(
                target: "pipetune::govern",
                tunable = %self.target,
                error = %e,
                "sink rejected revert write"
            );
        }
        if let Err(e) = self.inner.store.write(&patch.target, prior.value.clone()) {
            error!(
                target: "pipetune::govern",
                tunable = %self.target,
                error = %e,
                "store revert failed"
            );
        }
        self.cooldown_until = Some(Instant::now() + self.inner.policy.rollback_cooldown);

        (
            Outcome::RolledBack,
            Some(sample.value),
            Some(regression.to_string()),
        )
    }

    /// Terminal bookkeeping: audit record, history, acknowledgement.
    async fn finish(
        &mut self,
        patch: &ConfigPatch,
        outcome: Outcome,
        post_measurement: Option<f64>,
        detail: Option<String>,
        ack_tx: mpsc::Sender<PatchAck>,
    ) {
        let record = AuditRecord {
            patch_id: patch.id,
            target: patch.target.clone(),
            generation: patch.generation,
            op: patch.op.clone(),
            outcome,
            rationale: patch.rationale.clone(),
            post_measurement,
            detail,
        };
        self.inner.history.record(&record);
        self.inner.audit.record(&record);

        let current_generation = self
            .inner
            .store
            .target_generation(&patch.target)
            .unwrap_or(patch.generation);
        let ack = PatchAck {
            patch_id: patch.id,
            target: patch.target.clone(),
            outcome,
            current_generation,
        };
        if ack_tx.send(ack).await.is_err() {
            // Proposer decommissioned mid-flight; the audit trail already
            // has the terminal record.
            debug!(
                target: "pipetune::govern",
                tunable = %self.target,
                "proposer gone, ack dropped"
            );
        }

        // Idle only after the record and ack are visible, so quiesce()
        // never returns ahead of the audit trail.
        self.inner.set_phase(&self.target, Phase::Idle);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
