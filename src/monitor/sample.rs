//! Monitoring samples.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::MonitorError;

/// One observed metric value of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub target_id: String,
    pub metric_name: String,
    pub value: f64,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(
        target_id: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            metric_name: metric_name.into(),
            value,
            observed_at,
        }
    }

    /// Reject samples that can never be aggregated.
    ///
    /// Unknown metrics are caught later by the classifier, which owns the rules.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if !is_valid_target_id(&self.target_id) {
            return Err(MonitorError::MalformedSample(format!(
                "invalid target id {:?}",
                self.target_id
            )));
        }
        if !self.value.is_finite() {
            return Err(MonitorError::MalformedSample(format!(
                "non-finite value {} for {}/{}",
                self.value, self.target_id, self.metric_name
            )));
        }
        Ok(())
    }
}

/// Target ids: 1-128 characters of `[A-Za-z0-9_.:/@-]`.
pub fn is_valid_target_id(id: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:/@-]{1,128}$").unwrap());
    re.is_match(id)
}
