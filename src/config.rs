//! Configuration module for netmon.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Any invalid value is fatal at startup.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Longest accepted duration option: 100 years.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3600;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid metric rules: {0}")]
    Rules(String),
}

/// Direction in which a metric value becomes unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    /// Values above the threshold are bad (latency, loss).
    Above,
    /// Values below the threshold are bad (presence, throughput).
    Below,
}

/// Threshold rule used to classify samples of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub metric: String,
    pub comparison: Comparison,
    pub fail: f64,
    #[serde(default)]
    pub warn: Option<f64>,
}

/// Rules used when `NETMON_METRIC_RULES` is not set.
pub fn default_metric_rules() -> Vec<MetricRule> {
    vec![
        MetricRule {
            metric: "latency_ms".to_string(),
            comparison: Comparison::Above,
            fail: 1000.0,
            warn: Some(250.0),
        },
        MetricRule {
            metric: "packet_loss".to_string(),
            comparison: Comparison::Above,
            fail: 50.0,
            warn: Some(5.0),
        },
        MetricRule {
            metric: "up".to_string(),
            comparison: Comparison::Below,
            fail: 0.5,
            warn: None,
        },
    ]
}

/// Tunables for the aggregation engine and its background tasks.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rolling window time horizon in seconds (default: 300)
    pub window_horizon_secs: u64,
    /// Maximum entries per rolling window (default: 512)
    pub window_max_samples: usize,
    /// Consecutive failures before a target goes DOWN (default: 3)
    pub failure_threshold: u32,
    /// Consecutive successes before a target comes back UP (default: 2)
    pub success_threshold: u32,
    /// Health alternations within the flap window that mark a target FLAPPING (default: 4)
    pub flap_rate: u32,
    /// Flap detection window in seconds (default: 60)
    pub flap_window_secs: u64,
    /// Quiet period before a flapping target settles again, in seconds (default: 120)
    pub flap_cooldown_secs: u64,
    /// Silence after which a target is marked UNKNOWN, in seconds (default: 300)
    pub silence_timeout_secs: u64,
    /// Maximum queued samples before backpressure (default: 10000)
    pub queue_capacity: usize,
    /// Worker tasks draining the queue (default: 4)
    pub workers: usize,
    /// Snapshot publish interval in seconds (default: 10)
    pub snapshot_interval_secs: u64,
    /// Silence/horizon sweep interval in seconds (default: 5)
    pub sweep_interval_secs: u64,
    /// Pending durable writes kept while storage is unavailable (default: 10000)
    pub persist_buffer_capacity: usize,
    /// Flush passes a single write is retried before it is dropped (default: 5)
    pub persist_max_retries: u32,
    /// Persistence flush interval in seconds (default: 2)
    pub persist_flush_secs: u64,
    /// How long snapshot history is kept in the durable store, in seconds (default: 7 days)
    pub snapshot_retention_secs: u64,
    /// Transitions kept in memory for queries (default: 10000)
    pub transition_history: usize,
    /// Silence after which a network raises NETWORK_DOWN, in seconds (default: 300)
    pub alerting_delay_secs: u64,
    /// Alerts kept in memory for queries (default: 1000)
    pub alert_history: usize,
    pub metric_rules: Vec<MetricRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_horizon_secs: 300,
            window_max_samples: 512,
            failure_threshold: 3,
            success_threshold: 2,
            flap_rate: 4,
            flap_window_secs: 60,
            flap_cooldown_secs: 120,
            silence_timeout_secs: 300,
            queue_capacity: 10_000,
            workers: 4,
            snapshot_interval_secs: 10,
            sweep_interval_secs: 5,
            persist_buffer_capacity: 10_000,
            persist_max_retries: 5,
            persist_flush_secs: 2,
            snapshot_retention_secs: 604_800,
            transition_history: 10_000,
            alerting_delay_secs: 300,
            alert_history: 1_000,
            metric_rules: default_metric_rules(),
        }
    }
}

impl EngineConfig {
    pub fn window_horizon(&self) -> ChronoDuration {
        bounded_secs(self.window_horizon_secs)
    }

    pub fn flap_window(&self) -> ChronoDuration {
        bounded_secs(self.flap_window_secs)
    }

    pub fn flap_cooldown(&self) -> ChronoDuration {
        bounded_secs(self.flap_cooldown_secs)
    }

    pub fn silence_timeout(&self) -> ChronoDuration {
        bounded_secs(self.silence_timeout_secs)
    }

    pub fn snapshot_retention(&self) -> ChronoDuration {
        bounded_secs(self.snapshot_retention_secs)
    }

    pub fn alerting_delay(&self) -> ChronoDuration {
        bounded_secs(self.alerting_delay_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn persist_flush_interval(&self) -> Duration {
        Duration::from_secs(self.persist_flush_secs)
    }

    /// Check that every option is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        duration("NETMON_WINDOW_HORIZON_SECS", self.window_horizon_secs)?;
        positive("NETMON_WINDOW_MAX_SAMPLES", self.window_max_samples as u64)?;
        positive("NETMON_FAILURE_THRESHOLD", self.failure_threshold as u64)?;
        positive("NETMON_SUCCESS_THRESHOLD", self.success_threshold as u64)?;
        duration("NETMON_FLAP_WINDOW_SECS", self.flap_window_secs)?;
        duration("NETMON_FLAP_COOLDOWN_SECS", self.flap_cooldown_secs)?;
        duration("NETMON_SILENCE_TIMEOUT_SECS", self.silence_timeout_secs)?;
        positive("NETMON_QUEUE_CAPACITY", self.queue_capacity as u64)?;
        positive("NETMON_WORKERS", self.workers as u64)?;
        duration("NETMON_SNAPSHOT_INTERVAL_SECS", self.snapshot_interval_secs)?;
        duration("NETMON_SWEEP_INTERVAL_SECS", self.sweep_interval_secs)?;
        positive("NETMON_PERSIST_BUFFER", self.persist_buffer_capacity as u64)?;
        positive("NETMON_PERSIST_MAX_RETRIES", self.persist_max_retries as u64)?;
        duration("NETMON_PERSIST_FLUSH_SECS", self.persist_flush_secs)?;
        duration("NETMON_SNAPSHOT_RETENTION_SECS", self.snapshot_retention_secs)?;
        positive("NETMON_TRANSITION_HISTORY", self.transition_history as u64)?;
        duration("NETMON_ALERTING_DELAY_SECS", self.alerting_delay_secs)?;
        positive("NETMON_ALERT_HISTORY", self.alert_history as u64)?;

        if self.flap_rate < 2 {
            return Err(ConfigError::Invalid {
                key: "NETMON_FLAP_RATE",
                value: self.flap_rate.to_string(),
                reason: "must be at least 2".to_string(),
            });
        }

        validate_metric_rules(&self.metric_rules)
    }
}

fn positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Convert a duration option, clamped to [`MAX_DURATION_SECS`].
fn bounded_secs(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// A duration option: positive and at most [`MAX_DURATION_SECS`].
fn duration(key: &'static str, secs: u64) -> Result<(), ConfigError> {
    positive(key, secs)?;
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
            reason: format!("must be at most {} seconds", MAX_DURATION_SECS),
        });
    }
    Ok(())
}

/// Validate metric rules: unique names, finite thresholds, warn on the healthy side of fail.
pub fn validate_metric_rules(rules: &[MetricRule]) -> Result<(), ConfigError> {
    if rules.is_empty() {
        return Err(ConfigError::Rules("at least one metric rule is required".to_string()));
    }

    let mut seen = HashSet::new();
    for rule in rules {
        if rule.metric.trim().is_empty() {
            return Err(ConfigError::Rules("metric name cannot be empty".to_string()));
        }
        if !seen.insert(rule.metric.as_str()) {
            return Err(ConfigError::Rules(format!("duplicate rule for metric {}", rule.metric)));
        }
        if !rule.fail.is_finite() {
            return Err(ConfigError::Rules(format!("fail threshold of {} is not finite", rule.metric)));
        }
        if let Some(warn) = rule.warn {
            let healthy_side = match rule.comparison {
                Comparison::Above => warn < rule.fail,
                Comparison::Below => warn > rule.fail,
            };
            if !warn.is_finite() || !healthy_side {
                return Err(ConfigError::Rules(format!(
                    "warn threshold {} of {} must be on the healthy side of fail threshold {}",
                    warn, rule.metric, rule.fail
                )));
            }
        }
    }

    Ok(())
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "netmon.db")
    pub db_path: String,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "netmon.db".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every `NETMON_*` variable is optional; see [`EngineConfig`] for defaults.
    /// `NETMON_METRIC_RULES` takes a JSON array such as
    /// `[{"metric":"latency_ms","comparison":"above","fail":800,"warn":200}]`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn load_from<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("NETMON_DB_PATH") {
            cfg.db_path = db_path;
        }

        let e = &mut cfg.engine;
        parse_var(&lookup, "NETMON_WINDOW_HORIZON_SECS", &mut e.window_horizon_secs)?;
        parse_var(&lookup, "NETMON_WINDOW_MAX_SAMPLES", &mut e.window_max_samples)?;
        parse_var(&lookup, "NETMON_FAILURE_THRESHOLD", &mut e.failure_threshold)?;
        parse_var(&lookup, "NETMON_SUCCESS_THRESHOLD", &mut e.success_threshold)?;
        parse_var(&lookup, "NETMON_FLAP_RATE", &mut e.flap_rate)?;
        parse_var(&lookup, "NETMON_FLAP_WINDOW_SECS", &mut e.flap_window_secs)?;
        parse_var(&lookup, "NETMON_FLAP_COOLDOWN_SECS", &mut e.flap_cooldown_secs)?;
        parse_var(&lookup, "NETMON_SILENCE_TIMEOUT_SECS", &mut e.silence_timeout_secs)?;
        parse_var(&lookup, "NETMON_QUEUE_CAPACITY", &mut e.queue_capacity)?;
        parse_var(&lookup, "NETMON_WORKERS", &mut e.workers)?;
        parse_var(&lookup, "NETMON_SNAPSHOT_INTERVAL_SECS", &mut e.snapshot_interval_secs)?;
        parse_var(&lookup, "NETMON_SWEEP_INTERVAL_SECS", &mut e.sweep_interval_secs)?;
        parse_var(&lookup, "NETMON_PERSIST_BUFFER", &mut e.persist_buffer_capacity)?;
        parse_var(&lookup, "NETMON_PERSIST_MAX_RETRIES", &mut e.persist_max_retries)?;
        parse_var(&lookup, "NETMON_PERSIST_FLUSH_SECS", &mut e.persist_flush_secs)?;
        parse_var(&lookup, "NETMON_SNAPSHOT_RETENTION_SECS", &mut e.snapshot_retention_secs)?;
        parse_var(&lookup, "NETMON_TRANSITION_HISTORY", &mut e.transition_history)?;
        parse_var(&lookup, "NETMON_ALERTING_DELAY_SECS", &mut e.alerting_delay_secs)?;
        parse_var(&lookup, "NETMON_ALERT_HISTORY", &mut e.alert_history)?;

        if let Some(rules) = lookup("NETMON_METRIC_RULES") {
            e.metric_rules = serde_json::from_str(&rules)
                .map_err(|err| ConfigError::Rules(format!("NETMON_METRIC_RULES: {}", err)))?;
        }

        cfg.engine.validate()?;
        Ok(cfg)
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}
