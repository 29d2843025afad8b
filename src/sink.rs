//! Configuration sink contract and implementations: the outbound
//! collaborator that pushes a committed value into the live pipeline.
//! Governance writes here before touching the version store, so a refused
//! write commits nothing.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::error::TuneError;
use crate::govern::version::TargetValue;

// ---------------------------------------------------------------------------
// ConfigSink trait
// ---------------------------------------------------------------------------

/// Consumes committed configuration values for the live pipeline.
pub trait ConfigSink: Send + Sync {
    fn apply<'a>(
        &'a self,
        target: &'a str,
        value: &'a TargetValue,
    ) -> BoxFuture<'a, Result<(), TuneError>>;
}

// ---------------------------------------------------------------------------
// HttpConfigSink
// ---------------------------------------------------------------------------

/// Configuration for the HTTP config sink.
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Base URL of the pipeline's config API.
    pub base_url: String,
    /// TCP connection timeout.
    pub connect_timeout: Duration,
    /// Per-request read timeout.
    pub request_timeout: Duration,
}

impl HttpSinkConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Pushes `POST {base_url}/api/config` with the target and its new value.
/// A non-2xx response or transport failure maps to [`TuneError::ApplyFailure`].
pub struct HttpConfigSink {
    config: HttpSinkConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ConfigWrite<'a> {
    target: &'a str,
    value: &'a TargetValue,
}

impl HttpConfigSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self, TuneError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TuneError::Config {
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    async fn push(&self, target: &str, value: &TargetValue) -> Result<(), TuneError> {
        let url = format!("{}/api/config", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&ConfigWrite { target, value })
            .send()
            .await
            .map_err(|e| TuneError::ApplyFailure {
                target: target.to_string(),
                detail: format!("connection to {url} failed: {e}"),
            })?;

        if !resp.status().is_success() {
            return Err(TuneError::ApplyFailure {
                target: target.to_string(),
                detail: format!("HTTP {} from {url}", resp.status().as_u16()),
            });
        }

        Ok(())
    }
}

impl ConfigSink for HttpConfigSink {
    fn apply<'a>(
        &'a self,
        target: &'a str,
        value: &'a TargetValue,
    ) -> BoxFuture<'a, Result<(), TuneError>> {
        Box::pin(self.push(target, value))
    }
}

// ---------------------------------------------------------------------------
// MemorySink — recording fake
// ---------------------------------------------------------------------------

/// Records every apply in order; individual targets can be made to fail.
#[derive(Debug, Default)]
pub struct MemorySink {
    applied: Mutex<Vec<(String, TargetValue)>>,
    failing: Mutex<HashSet<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent applies for `target` fail with `ApplyFailure`.
    pub fn fail_target(&self, target: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target.into());
    }

    /// Stop failing applies for `target`.
    pub fn heal_target(&self, target: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(target);
    }

    /// Every `(target, value)` write in application order.
    pub fn applied(&self) -> Vec<(String, TargetValue)> {
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The most recent value written for `target`.
    pub fn current(&self, target: &str) -> Option<TargetValue> {
        self.applied()
            .into_iter()
            .rev()
            .find(|(t, _)| t == target)
            .map(|(_, v)| v)
    }
}

impl ConfigSink for MemorySink {
    fn apply<'a>(
        &'a self,
        target: &'a str,
        value: &'a TargetValue,
    ) -> BoxFuture<'a, Result<(), TuneError>> {
        Box::pin(async move {
            let failing = self
                .failing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(target);
            if failing {
                return Err(TuneError::ApplyFailure {
                    target: target.to_string(),
                    detail: "sink configured to fail".into(),
                });
            }
            self.applied
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((target.to_string(), value.clone()));
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
