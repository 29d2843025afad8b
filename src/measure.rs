//! Measurement source contract and implementations: the inbound
//! collaborator that reports the current value of a target's metric.
//! Callers bound every fetch with a timeout; a stalled source costs one
//! tick, never the cadence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::TuneError;

// ---------------------------------------------------------------------------
// Sample
// ---------------------------------------------------------------------------

/// One measurement: the target it belongs to, the observed value, and the
/// collaborator's wall-clock timestamp in unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub target: String,
    pub value: f64,
    pub observed_at_ms: u64,
}

// ---------------------------------------------------------------------------
// MeasurementSource trait
// ---------------------------------------------------------------------------

/// Supplies the current measurement for a target.
///
/// Implementations may block on the network; callers wrap every call in a
/// bounded wait.
pub trait MeasurementSource: Send + Sync {
    fn sample<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Sample, TuneError>>;
}

// ---------------------------------------------------------------------------
// HttpMeasurementSource
// ---------------------------------------------------------------------------

/// Configuration for the HTTP measurement source.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Base URL of the stats API (e.g. `http://127.0.0.1:4317`).
    pub base_url: String,
    /// TCP connection timeout.
    pub connect_timeout: Duration,
    /// Per-request read timeout.
    pub request_timeout: Duration,
}

impl HttpSourceConfig {
    /// Create a config with sensible defaults.
    ///
    /// - connect_timeout: 3 s
    /// - request_timeout: 10 s
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Polls `GET {base_url}/api/metrics/{target}` for the current sample.
///
/// Accepts both the direct [`Sample`] shape and a `{ "sample": Sample }`
/// wrapper so the source is forward-compatible with envelope changes on the
/// collaborator side.
pub struct HttpMeasurementSource {
    config: HttpSourceConfig,
    client: reqwest::Client,
}

impl HttpMeasurementSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, TuneError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TuneError::Config {
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    async fn fetch(&self, target: &str) -> Result<Sample, TuneError> {
        let url = format!("{}/api/metrics/{}", self.config.base_url, target);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TuneError::Connect {
                url: url.clone(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(TuneError::Http {
                status: resp.status().as_u16(),
                url,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| TuneError::Json {
            detail: e.to_string(),
        })?;

        // Try the direct shape first.
        if let Ok(sample) = serde_json::from_slice::<Sample>(&bytes) {
            return Ok(sample);
        }

        // Fall back to a wrapped shape: { "sample": { ... } }.
        #[derive(Deserialize)]
        struct Wrapped {
            sample: Sample,
        }

        serde_json::from_slice::<Wrapped>(&bytes)
            .map(|w| w.sample)
            .map_err(|e| TuneError::Json {
                detail: e.to_string(),
            })
    }
}

impl MeasurementSource for HttpMeasurementSource {
    fn sample<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Sample, TuneError>> {
        Box::pin(self.fetch(target))
    }
}

// ---------------------------------------------------------------------------
// StaticSource — settable fake
// ---------------------------------------------------------------------------

/// In-memory source returning whatever value was last `set` per target.
/// Targets without a value report `MeasurementUnavailable`.
#[derive(Debug, Default)]
pub struct StaticSource {
    values: Mutex<HashMap<String, f64>>,
    clock_ms: AtomicU64,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, target: impl Into<String>, value: f64) {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target.into(), value);
    }

    /// Make subsequent samples for `target` fail.
    pub fn unset(&self, target: &str) {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(target);
    }
}

impl MeasurementSource for StaticSource {
    fn sample<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Sample, TuneError>> {
        Box::pin(async move {
            let value = self
                .values
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(target)
                .copied();
            match value {
                Some(value) => Ok(Sample {
                    target: target.to_string(),
                    value,
                    observed_at_ms: self.clock_ms.fetch_add(1, Ordering::Relaxed),
                }),
                None => Err(TuneError::MeasurementUnavailable {
                    target: target.to_string(),
                    detail: "no value configured".into(),
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedSource — deterministic sequence fake
// ---------------------------------------------------------------------------

/// In-memory source that replays a scripted sequence of values per target,
/// then keeps repeating the final value. Lets tests stage "measurement
/// before the patch" and "measurement after the settle window" without
/// racing the clock.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, Vec<f64>>>,
    clock_ms: AtomicU64,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the sequence of values `target` will report, in order.
    pub fn script(&self, target: impl Into<String>, values: impl Into<Vec<f64>>) {
        let mut values = values.into();
        values.reverse(); // pop() consumes from the front of the script
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target.into(), values);
    }
}

impl MeasurementSource for ScriptedSource {
    fn sample<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Sample, TuneError>> {
        Box::pin(async move {
            let mut guard = self
                .scripts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let script = guard
                .get_mut(target)
                .ok_or_else(|| TuneError::MeasurementUnavailable {
                    target: target.to_string(),
                    detail: "no script configured".into(),
                })?;
            let value = if script.len() > 1 {
                script.pop().unwrap_or_default()
            } else {
                *script.last().ok_or_else(|| TuneError::MeasurementUnavailable {
                    target: target.to_string(),
                    detail: "script exhausted".into(),
                })?
            };
            Ok(Sample {
                target: target.to_string(),
                value,
                observed_at_ms: self.clock_ms.fetch_add(1, Ordering::Relaxed),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_returns_set_value() {
        let src = StaticSource::new();
        src.set("t", 42.0);
        let s = src.sample("t").await.unwrap();
        assert_eq!(s.value, 42.0);
        assert_eq!(s.target, "t");
    }

    #[tokio::test]
    async fn test_static_source_unknown_target_unavailable() {
        let src = StaticSource::new();
        let err = src.sample("t").await.unwrap_err();
        assert!(matches!(err, TuneError::MeasurementUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_static_source_unset_makes_target_unavailable() {
        let src = StaticSource::new();
        src.set("t", 1.0);
        src.unset("t");
        assert!(src.sample("t").await.is_err());
    }

    #[tokio::test]
    async fn test_static_source_set_overwrites() {
        let src = StaticSource::new();
        src.set("t", 1.0);
        src.set("t", 2.0);
        assert_eq!(src.sample("t").await.unwrap().value, 2.0);
    }

    #[tokio::test]
    async fn test_static_source_timestamps_advance() {
        let src = StaticSource::new();
        src.set("t", 1.0);
        let a = src.sample("t").await.unwrap();
        let b = src.sample("t").await.unwrap();
        assert!(b.observed_at_ms > a.observed_at_ms);
    }

    #[tokio::test]
    async fn test_scripted_source_replays_then_repeats_last() {
        let src = ScriptedSource::new();
        src.script("t", vec![10.0, 20.0, 30.0]);
        assert_eq!(src.sample("t").await.unwrap().value, 10.0);
        assert_eq!(src.sample("t").await.unwrap().value, 20.0);
        assert_eq!(src.sample("t").await.unwrap().value, 30.0);
        // Final value repeats indefinitely.
        assert_eq!(src.sample("t").await.unwrap().value, 30.0);
        assert_eq!(src.sample("t").await.unwrap().value, 30.0);
    }

    #[tokio::test]
    async fn test_scripted_source_unscripted_target_unavailable() {
        let src = ScriptedSource::new();
        assert!(src.sample("t").await.is_err());
    }

    #[test]
    fn test_sample_serde_direct_shape() {
        let json = r#"{"target":"sampler.ratio","value":0.5,"observed_at_ms":1700000000000}"#;
        let s: Sample = serde_json::from_str(json).unwrap();
        assert_eq!(s.value, 0.5);
    }

    #[test]
    fn test_http_source_config_defaults() {
        let cfg = HttpSourceConfig::new("http://localhost:9000");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_http_source_builds() {
        let src = HttpMeasurementSource::new(HttpSourceConfig::new("http://localhost:9000"));
        assert!(src.is_ok());
    }
}
