//! Closed-loop adaptive tuning for telemetry pipelines.
//!
//! A running pipeline exposes measurements (cost, cardinality, error rate)
//! and tunables (sampling ratio, attribute lists, limits). This crate
//! closes the loop between them:
//!
//! ```text
//! measurement ──► Driver ──► PidController ──► signal ──► Decider
//!      ▲                                                     │
//!      │                                              ConfigPatch
//!      │                                                     ▼
//! live pipeline ◄── ConfigSink ◄── GovernanceEngine ◄── patch channel
//! ```
//!
//! Each tick the [`control::driver::Driver`] samples its target, runs the
//! [`control::pid::PidController`], and lets the
//! [`control::decider::Decider`] turn the signal into a discrete proposal.
//! The [`govern::engine::GovernanceEngine`] validates the proposal against
//! policy, applies it, watches the metric through a settle window, and
//! commits or rolls back — every terminal transition audited.
//!
//! [`Supervisor`] wires it all up from a [`TuneConfig`]:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pipetune::{Supervisor, TuneConfig};
//! use pipetune::govern::audit::TracingAuditSink;
//! use pipetune::measure::{HttpMeasurementSource, HttpSourceConfig};
//! use pipetune::sink::{HttpConfigSink, HttpSinkConfig};
//!
//! let config = TuneConfig::load("pipetune.toml")?;
//! let source = Arc::new(HttpMeasurementSource::new(
//!     HttpSourceConfig::new("http://127.0.0.1:4317"))?);
//! let sink = Arc::new(HttpConfigSink::new(
//!     HttpSinkConfig::new("http://127.0.0.1:4317"))?);
//! let supervisor = Supervisor::start(&config, source, sink,
//!     Arc::new(TracingAuditSink))?;
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod govern;
pub mod measure;
pub mod patch;
pub mod sink;
pub mod supervisor;

pub use config::{TargetConfig, TargetKind, TuneConfig};
pub use error::TuneError;
pub use govern::version::{PipelineConfigVersion, TargetValue};
pub use patch::{ConfigPatch, Outcome, PatchOp};
pub use supervisor::Supervisor;

/// Install a `tracing` subscriber reading `RUST_LOG`, for binaries and
/// examples embedding the loop. Safe to call once per process.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
