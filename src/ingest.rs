//! Collector line protocol.
//!
//! Producers write one JSON object per line. A line is either a raw sample
//!
//! ```json
//! {"target_id":"gw","metric_name":"latency_ms","value":12.5,"observed_at":"2025-12-03T10:18:56Z"}
//! ```
//!
//! or a network status report as published by a network agent
//!
//! ```json
//! {"topic":"network/home/status","report":{"hostname":"pi","timestamp":"2025-12-03 10:18:56",
//!  "devices":[{"ip":"192.168.1.10","mac":"AA:BB:CC:DD:EE:FF"}]}}
//! ```
//!
//! Reports are turned into `up` samples for the network and for each device,
//! and every reported device is recorded as a sighting. A third kind of line
//! sets a device's operation mode:
//!
//! ```json
//! {"target_id":"home/aa:bb:cc:dd:ee:ff","mode":"ALWAYS_ON"}
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::monitor::{network_target, DeviceMode, DeviceSighting, Monitor, MonitorError, Sample};

/// One line of collector input.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IngestLine {
    Report { topic: String, report: NetworkReport },
    Mode { target_id: String, mode: DeviceMode },
    Sample(Sample),
}

/// Devices currently seen on one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkReport {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(deserialize_with = "deserialize_report_time")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
fn deserialize_report_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(t) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
        .map(|t| t.and_utc())
        .map_err(serde::de::Error::custom)
}

/// Network name from a topic such as `network/home/status`.
///
/// The name sits between the last two slashes; topics without two slashes
/// are used whole.
pub fn network_name(topic: &str) -> &str {
    if let Some(right) = topic.rfind('/').filter(|&i| i > 0) {
        if let Some(left) = topic[..right].rfind('/') {
            return &topic[left + 1..right];
        }
    }
    tracing::warn!(
        "Ingest: Topic {:?} does not follow network/<name>/<operation>, using it whole",
        topic
    );
    topic
}

/// What one network report turns into.
#[derive(Debug, Clone, Default)]
pub struct Translation {
    pub samples: Vec<Sample>,
    pub sightings: Vec<DeviceSighting>,
}

/// Turns network reports into presence samples, remembering which devices
/// each network has reported so departures produce `up = 0`.
#[derive(Debug, Default)]
pub struct ReportTranslator {
    known: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl ReportTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&self, topic: &str, report: &NetworkReport) -> Translation {
        let network = network_name(topic);
        let at = report.timestamp;
        let device_id = |mac: &str| format!("{}/{}", network, mac);
        let mut samples = vec![Sample::new(network_target(network), "up", 1.0, at)];

        let mut present = BTreeSet::new();
        let mut sightings = Vec::new();
        for device in &report.devices {
            match device.mac.as_deref().map(str::trim) {
                Some(mac) if !mac.is_empty() => {
                    let mac = mac.to_lowercase();
                    sightings.push(DeviceSighting {
                        target_id: device_id(mac.as_str()),
                        network: network.to_string(),
                        ip: device
                            .ip
                            .as_deref()
                            .map(str::trim)
                            .filter(|ip| !ip.is_empty())
                            .map(str::to_string),
                        seen_at: at,
                    });
                    present.insert(mac);
                }
                _ => tracing::warn!(
                    "Ingest: Device {} on network {} has no MAC address, skipped",
                    device.ip.as_deref().unwrap_or("?"),
                    network
                ),
            }
        }

        let mut known = self.known.lock();
        let seen = known.entry(network.to_string()).or_default();
        for mac in seen.difference(&present) {
            samples.push(Sample::new(device_id(mac.as_str()), "up", 0.0, at));
        }
        for mac in &present {
            samples.push(Sample::new(device_id(mac.as_str()), "up", 1.0, at));
        }
        seen.extend(present);

        Translation { samples, sightings }
    }
}

/// Counts of what happened to the lines read from a collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub lines: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub invalid: u64,
    /// Mode changes applied
    pub modes: u64,
}

/// Feeds collector lines into a [`Monitor`].
pub struct LineIngestor {
    monitor: Arc<Monitor>,
    translator: ReportTranslator,
}

impl LineIngestor {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self {
            monitor,
            translator: ReportTranslator::new(),
        }
    }

    /// Parse one line and offer the resulting samples to the monitor.
    pub fn handle_line(&self, line: &str, summary: &mut IngestSummary) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        summary.lines += 1;

        let samples = match serde_json::from_str::<IngestLine>(line) {
            Ok(IngestLine::Sample(sample)) => vec![sample],
            Ok(IngestLine::Report { topic, report }) => {
                let translation = self.translator.translate(&topic, &report);
                for sighting in &translation.sightings {
                    if let Err(e) = self.monitor.device_seen(sighting) {
                        tracing::debug!("Ingest: Sighting of {} ignored: {}", sighting.target_id, e);
                    }
                }
                translation.samples
            }
            Ok(IngestLine::Mode { target_id, mode }) => {
                match self.monitor.set_device_mode(&target_id, mode) {
                    Ok(_) => summary.modes += 1,
                    Err(e) => {
                        summary.invalid += 1;
                        tracing::warn!("Ingest: Cannot set mode of {}: {}", target_id, e);
                    }
                }
                return;
            }
            Err(e) => {
                summary.invalid += 1;
                tracing::debug!("Ingest: Ignoring invalid line: {}", e);
                return;
            }
        };

        for sample in samples {
            match self.monitor.ingest(sample) {
                Ok(()) => summary.accepted += 1,
                Err(MonitorError::Backpressure { capacity }) => {
                    summary.rejected += 1;
                    tracing::warn!("Ingest: Queue full ({}), sample dropped", capacity);
                }
                Err(e) => {
                    summary.rejected += 1;
                    tracing::debug!("Ingest: Sample rejected: {}", e);
                }
            }
        }
    }

    /// Read lines until end of input.
    pub async fn ingest_lines<R>(&self, reader: R) -> std::io::Result<IngestSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut summary = IngestSummary::default();
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            self.handle_line(&line, &mut summary);
        }
        Ok(summary)
    }
}
