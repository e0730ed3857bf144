//! Device operation modes and alerts.
//!
//! Alerts are opened from device sightings, status transitions and network
//! silence, and closed once the condition clears. A target has at most one
//! open alert of each kind. Opening and closing both upsert the alert's
//! durable record under `alert/`.
//!
//! Every entry point is called with the target's lock held.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::counters::EngineCounters;
use super::detector::Transition;
use super::state::{TargetState, TargetStatus};
use crate::db::alert_key;
use crate::scheduler::PersistBuffer;

/// Target id prefix of whole-network presence targets.
pub const NETWORK_TARGET_PREFIX: &str = "network:";

pub fn network_target(network: &str) -> String {
    format!("{}{}", NETWORK_TARGET_PREFIX, network)
}

/// How a device is expected to behave on its network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceMode {
    /// Not allowed on the network. New devices start here.
    #[default]
    Unauthorized,
    /// Allowed; its presence is not alerted on.
    Authorized,
    /// Expected to stay online.
    AlwaysOn,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceMode::Unauthorized => "UNAUTHORIZED",
            DeviceMode::Authorized => "AUTHORIZED",
            DeviceMode::AlwaysOn => "ALWAYS_ON",
        };
        f.write_str(s)
    }
}

/// Device metadata carried on a target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub mode: DeviceMode,
    pub network: Option<String>,
    /// Last reported address
    pub ip: Option<String>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// A device present in a network report.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSighting {
    pub target_id: String,
    pub network: String,
    pub ip: Option<String>,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// A network has not reported within the alerting delay.
    NetworkDown,
    /// An ALWAYS_ON target went DOWN.
    DeviceDown,
    /// An UNAUTHORIZED device was seen on its network.
    DeviceUnauthorized,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::NetworkDown => "NETWORK_DOWN",
            AlertKind::DeviceDown => "DEVICE_DOWN",
            AlertKind::DeviceUnauthorized => "DEVICE_UNAUTHORIZED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub seq: u64,
    pub kind: AlertKind,
    pub target_id: String,
    pub network: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub message: String,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// Open alerts plus a bounded history of recent ones.
pub struct Alerter {
    open: Mutex<HashMap<(AlertKind, String), Alert>>,
    history: RwLock<VecDeque<Alert>>,
    next_seq: AtomicU64,
    capacity: usize,
    alerting_delay: ChronoDuration,
    persist: Arc<PersistBuffer>,
    counters: Arc<EngineCounters>,
}

impl Alerter {
    pub fn new(
        capacity: usize,
        alerting_delay: ChronoDuration,
        persist: Arc<PersistBuffer>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
            capacity: capacity.max(1),
            alerting_delay,
            persist,
            counters,
        }
    }

    /// Update a target's device record from a sighting.
    ///
    /// Raises DEVICE_UNAUTHORIZED when the device is UNAUTHORIZED and has no
    /// open alert, whether it is new or was seen before.
    pub fn on_sighting(&self, state: &mut TargetState, sighting: &DeviceSighting) -> Option<Alert> {
        let device = state.device.get_or_insert_with(DeviceRecord::default);
        let first = device.first_seen.is_none();
        device.network = Some(sighting.network.clone());
        if sighting.ip.is_some() {
            device.ip = sighting.ip.clone();
        }
        device.first_seen.get_or_insert(sighting.seen_at);
        if device.last_seen.map_or(true, |t| sighting.seen_at > t) {
            device.last_seen = Some(sighting.seen_at);
        }

        if first {
            tracing::info!(
                "Alerter: New device {} ({}) on {}",
                state.target_id,
                device.ip.as_deref().unwrap_or("no address"),
                sighting.network
            );
        }
        if device.mode != DeviceMode::Unauthorized {
            return None;
        }

        let message = if first {
            "device detected for the first time"
        } else {
            "device was seen before"
        };
        let network = device.network.clone();
        self.open(
            AlertKind::DeviceUnauthorized,
            &state.target_id,
            network,
            sighting.seen_at,
            message.to_string(),
        )
    }

    /// Open DEVICE_DOWN when an ALWAYS_ON target goes DOWN, close it when it is UP again.
    pub fn on_transition(&self, state: &TargetState, t: &Transition) -> Option<Alert> {
        let device = state
            .device
            .as_ref()
            .filter(|d| d.mode == DeviceMode::AlwaysOn)?;
        match t.to {
            TargetStatus::Down => self.open(
                AlertKind::DeviceDown,
                &t.target_id,
                device.network.clone(),
                t.occurred_at,
                format!("went down: {}", t.reason),
            ),
            TargetStatus::Up => self.close(AlertKind::DeviceDown, &t.target_id, t.occurred_at),
            _ => None,
        }
    }

    /// Change a target's mode. Returns the alerts opened or closed by the change.
    pub fn set_mode(&self, state: &mut TargetState, mode: DeviceMode, at: DateTime<Utc>) -> Vec<Alert> {
        let device = state.device.get_or_insert_with(DeviceRecord::default);
        let previous = std::mem::replace(&mut device.mode, mode);
        let network = device.network.clone();
        if previous != mode {
            tracing::info!("Alerter: {} mode {} -> {}", state.target_id, previous, mode);
        }

        let mut changed = Vec::new();
        if mode != DeviceMode::Unauthorized {
            changed.extend(self.close(AlertKind::DeviceUnauthorized, &state.target_id, at));
        }
        if mode != DeviceMode::AlwaysOn {
            changed.extend(self.close(AlertKind::DeviceDown, &state.target_id, at));
        } else if state.status() == TargetStatus::Down {
            changed.extend(self.open(
                AlertKind::DeviceDown,
                &state.target_id,
                network,
                at,
                "down when set ALWAYS_ON".to_string(),
            ));
        }
        changed
    }

    /// Open NETWORK_DOWN for a network silent longer than the alerting delay
    /// and close it once the network reports again. Other targets are ignored.
    pub fn check_network(&self, state: &TargetState, now: DateTime<Utc>) -> Option<Alert> {
        let network = state.target_id.strip_prefix(NETWORK_TARGET_PREFIX)?;
        let last = state.last_sample_at?;
        let silent = now - last;
        if silent > self.alerting_delay {
            self.open(
                AlertKind::NetworkDown,
                &state.target_id,
                Some(network.to_string()),
                now,
                format!("no report for {}s", silent.num_seconds()),
            )
        } else {
            self.close(AlertKind::NetworkDown, &state.target_id, now)
        }
    }

    fn open(
        &self,
        kind: AlertKind,
        target_id: &str,
        network: Option<String>,
        at: DateTime<Utc>,
        message: String,
    ) -> Option<Alert> {
        let mut open = self.open.lock();
        let key = (kind, target_id.to_string());
        if open.contains_key(&key) {
            return None;
        }

        let alert = Alert {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            kind,
            target_id: target_id.to_string(),
            network,
            opened_at: at,
            closed_at: None,
            message,
        };
        open.insert(key, alert.clone());
        self.push_history(alert.clone());

        EngineCounters::incr(&self.counters.alerts);
        tracing::warn!("Alerter: {} opened for {} ({})", kind, target_id, alert.message);
        self.persist
            .enqueue_json(alert_key(alert.opened_at, target_id, alert.seq), &alert);
        Some(alert)
    }

    fn close(&self, kind: AlertKind, target_id: &str, at: DateTime<Utc>) -> Option<Alert> {
        let mut alert = self.open.lock().remove(&(kind, target_id.to_string()))?;
        alert.closed_at = Some(at);
        if let Some(entry) = self
            .history
            .write()
            .iter_mut()
            .rev()
            .find(|a| a.seq == alert.seq)
        {
            *entry = alert.clone();
        }

        tracing::info!("Alerter: {} closed for {}", kind, target_id);
        self.persist
            .enqueue_json(alert_key(alert.opened_at, target_id, alert.seq), &alert);
        Some(alert)
    }

    fn push_history(&self, alert: Alert) {
        let mut history = self.history.write();
        history.push_back(alert);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    /// Alerts newest first. With `open_only`, only alerts that are still open.
    pub fn recent(&self, open_only: bool, limit: usize) -> Vec<Alert> {
        if open_only {
            let mut alerts: Vec<Alert> = self.open.lock().values().cloned().collect();
            alerts.sort_by(|a, b| b.seq.cmp(&a.seq));
            alerts.truncate(limit);
            return alerts;
        }
        self.history
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    /// Take over alerts persisted by a previous run. Returns how many are open.
    pub fn restore(&self, alerts: impl IntoIterator<Item = Alert>) -> usize {
        let mut open = self.open.lock();
        let mut restored = 0;
        for alert in alerts {
            self.next_seq.fetch_max(alert.seq + 1, Ordering::SeqCst);
            if !alert.is_open() {
                continue;
            }
            let key = (alert.kind, alert.target_id.clone());
            if open.contains_key(&key) {
                continue;
            }
            self.push_history(alert.clone());
            open.insert(key, alert);
            restored += 1;
        }
        restored
    }
}
