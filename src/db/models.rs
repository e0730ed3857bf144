//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key prefix of persisted transition log entries.
pub const TRANSITION_PREFIX: &str = "transition/";

/// Key prefix of persisted snapshot history.
pub const SNAPSHOT_PREFIX: &str = "snapshot/";

/// Key of the most recently persisted snapshot.
pub const LATEST_SNAPSHOT_KEY: &str = "snapshot/latest";

/// Key prefix of persisted alerts.
pub const ALERT_PREFIX: &str = "alert/";

/// A stored key/value record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    /// JSON document
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Format a timestamp for use inside a record key.
///
/// Fixed width and UTC, so keys of one prefix sort chronologically.
pub fn key_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Key for a snapshot captured at `time`.
pub fn snapshot_key(time: DateTime<Utc>) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, key_time(time))
}

/// Key for a transition log entry.
pub fn transition_key(time: DateTime<Utc>, target_id: &str, seq: u64) -> String {
    format!("{}{}/{}/{:012}", TRANSITION_PREFIX, key_time(time), target_id, seq)
}

/// Key for an alert. Opening and closing an alert write the same key.
pub fn alert_key(opened_at: DateTime<Utc>, target_id: &str, seq: u64) -> String {
    format!("{}{}/{}/{:012}", ALERT_PREFIX, key_time(opened_at), target_id, seq)
}
