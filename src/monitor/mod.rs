//! Monitoring engine: ingest queue, target state, aggregation, transitions
//! and snapshots.
//!
//! [`Monitor`] ties the parts together and is the only type callers need.
//! Workers that drain the queue live in [`crate::scheduler`].

mod aggregator;
mod alerts;
mod counters;
mod detector;
mod queue;
mod sample;
mod snapshot;
mod state;
mod window;

pub use aggregator::*;
pub use alerts::*;
pub use counters::*;
pub use detector::*;
pub use queue::*;
pub use sample::*;
pub use snapshot::*;
pub use state::*;
pub use window::*;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::db::{DbError, Repository, ALERT_PREFIX, LATEST_SNAPSHOT_KEY};
use crate::scheduler::{PersistBuffer, StorageMode};

/// Engine error types.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("ingest queue full (capacity {capacity})")]
    Backpressure { capacity: usize },
    #[error("malformed sample: {0}")]
    MalformedSample(String),
    #[error("target not found: {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl From<DbError> for MonitorError {
    fn from(e: DbError) -> Self {
        MonitorError::StorageUnavailable(e.to_string())
    }
}

/// Operational state of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub counters: CounterSnapshot,
    pub storage: StorageMode,
    pub pending_writes: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub targets: usize,
    pub statuses: BTreeMap<TargetStatus, usize>,
    pub transitions_total: u64,
    pub open_alerts: usize,
}

/// The monitoring engine.
pub struct Monitor {
    config: EngineConfig,
    store: Arc<TargetStore>,
    queue: IngestQueue,
    receivers: Mutex<Option<Vec<ShardReceiver>>>,
    aggregator: Aggregator,
    publisher: SnapshotPublisher,
    persist: Arc<PersistBuffer>,
    counters: Arc<EngineCounters>,
}

impl Monitor {
    pub fn new(config: EngineConfig) -> Self {
        let counters = Arc::new(EngineCounters::default());
        let store = Arc::new(TargetStore::new(
            config.window_max_samples,
            config.window_horizon(),
        ));
        let persist = Arc::new(PersistBuffer::new(
            config.persist_buffer_capacity,
            config.persist_max_retries,
            counters.clone(),
        ));
        let (queue, receivers) = IngestQueue::new(config.queue_capacity, config.workers);

        let alerts = Arc::new(Alerter::new(
            config.alert_history,
            config.alerting_delay(),
            persist.clone(),
            counters.clone(),
        ));
        let aggregator = Aggregator::new(
            store.clone(),
            Classifier::new(&config.metric_rules),
            TransitionDetector::new(DetectorConfig::from(&config)),
            Arc::new(TransitionLog::new(config.transition_history)),
            alerts,
            persist.clone(),
            counters.clone(),
        );
        let publisher = SnapshotPublisher::new(store.clone(), persist.clone(), counters.clone());

        Self {
            config,
            store,
            queue,
            receivers: Mutex::new(Some(receivers)),
            aggregator,
            publisher,
            persist,
            counters,
        }
    }

    /// Offer a sample to the ingest queue.
    pub fn ingest(&self, sample: Sample) -> Result<(), MonitorError> {
        match self.queue.push(sample) {
            Ok(()) => {
                EngineCounters::incr(&self.counters.accepted);
                Ok(())
            }
            Err(e) => {
                EngineCounters::incr(&self.counters.rejected);
                Err(e)
            }
        }
    }

    /// Apply a sample directly, bypassing the queue.
    pub fn process(&self, sample: Sample) -> Result<Option<Transition>, MonitorError> {
        self.aggregator.process(sample)
    }

    pub fn target(&self, target_id: &str) -> Result<TargetState, MonitorError> {
        self.store.get(target_id)
    }

    /// A freshly captured snapshot. Not published.
    pub fn snapshot(&self) -> Snapshot {
        self.publisher.capture()
    }

    pub fn latest_snapshot(&self) -> Arc<Snapshot> {
        self.publisher.latest()
    }

    pub fn publish_snapshot(&self) -> Arc<Snapshot> {
        self.publisher.publish()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.publisher.subscribe()
    }

    /// Recent transitions, newest first.
    pub fn transitions(&self, target_id: Option<&str>, limit: usize) -> Vec<Transition> {
        self.aggregator.log().recent(target_id, limit)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            counters: self.counters.snapshot(),
            storage: self.persist.mode(),
            pending_writes: self.persist.pending(),
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            targets: self.store.len(),
            statuses: self.snapshot().status_counts(),
            transitions_total: self.aggregator.log().total(),
            open_alerts: self.aggregator.alerts().open_count(),
        }
    }

    /// Alerts newest first; with `open_only`, just the ones still open.
    pub fn alerts(&self, open_only: bool, limit: usize) -> Vec<Alert> {
        self.aggregator.alerts().recent(open_only, limit)
    }

    /// Record a device seen in a network report, creating its target if needed.
    pub fn device_seen(&self, sighting: &DeviceSighting) -> Result<Option<Alert>, MonitorError> {
        check_target_id(&sighting.target_id)?;
        let alerts = self.aggregator.alerts();
        Ok(self
            .store
            .upsert(&sighting.target_id, |state| alerts.on_sighting(state, sighting)))
    }

    /// Set a target's device mode. Returns the alerts the change opened or closed.
    pub fn set_device_mode(&self, target_id: &str, mode: DeviceMode) -> Result<Vec<Alert>, MonitorError> {
        check_target_id(target_id)?;
        let alerts = self.aggregator.alerts();
        Ok(self
            .store
            .upsert(target_id, |state| alerts.set_mode(state, mode, Utc::now())))
    }

    /// Start tracking a target before its first sample.
    pub fn register(&self, target_id: &str) -> Result<bool, MonitorError> {
        check_target_id(target_id)?;
        Ok(self.store.register(target_id))
    }

    pub fn deregister(&self, target_id: &str) -> Result<TargetState, MonitorError> {
        self.store.deregister(target_id)
    }

    /// Reload target statuses from the last persisted snapshot and reopen
    /// alerts that were still open.
    ///
    /// Returns the number of targets restored. Windows start empty.
    pub fn restore_from(&self, repo: &dyn Repository) -> Result<usize, MonitorError> {
        let mut alerts = Vec::new();
        for record in repo.list(ALERT_PREFIX)? {
            match serde_json::from_str::<Alert>(&record.value) {
                Ok(alert) => alerts.push(alert),
                Err(e) => tracing::warn!("Monitor: Skipping unreadable alert {}: {}", record.key, e),
            }
        }
        let reopened = self.aggregator.alerts().restore(alerts);
        if reopened > 0 {
            tracing::info!("Monitor: {} alerts still open from the previous run", reopened);
        }

        let record = match repo.get(LATEST_SNAPSHOT_KEY)? {
            Some(r) => r,
            None => return Ok(0),
        };
        let snapshot: Snapshot = serde_json::from_str(&record.value).map_err(DbError::from)?;

        let restored = snapshot
            .targets
            .values()
            .filter(|view| self.store.restore(view))
            .count();
        tracing::info!(
            "Monitor: Restored {} targets from snapshot captured at {}",
            restored,
            snapshot.captured_at
        );
        Ok(restored)
    }

    /// Expire window entries and detect silent targets as of `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Transition> {
        self.aggregator.sweep(now)
    }

    /// Hand the shard receivers to the worker pool. Only the first call gets them.
    pub fn take_receivers(&self) -> Option<Vec<ShardReceiver>> {
        self.receivers.lock().take()
    }

    pub fn queue(&self) -> &IngestQueue {
        &self.queue
    }

    pub fn persist(&self) -> &Arc<PersistBuffer> {
        &self.persist
    }

    pub fn counters(&self) -> &Arc<EngineCounters> {
        &self.counters
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn check_target_id(target_id: &str) -> Result<(), MonitorError> {
    if is_valid_target_id(target_id) {
        Ok(())
    } else {
        Err(MonitorError::MalformedSample(format!(
            "invalid target id {:?}",
            target_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;
    use chrono::Duration as ChronoDuration;

    fn sample(target: &str, metric: &str, value: f64, at: DateTime<Utc>) -> Sample {
        Sample::new(target, metric, value, at)
    }

    #[test]
    fn test_three_failures_then_down() {
        let monitor = Monitor::new(EngineConfig::default());
        let t0 = Utc::now();
        for i in 0..3 {
            monitor
                .process(sample("gw", "up", 0.0, t0 + ChronoDuration::seconds(i)))
                .unwrap();
        }

        assert_eq!(monitor.target("gw").unwrap().status(), TargetStatus::Down);
        let log = monitor.transitions(Some("gw"), 10);
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].from, log[0].to), (TargetStatus::Unknown, TargetStatus::Down));
    }

    #[test]
    fn test_unbounded_durations_do_not_panic() {
        // bypasses validation; the conversions clamp what they are given
        let cfg = EngineConfig {
            window_horizon_secs: 10_000_000_000_000,
            flap_window_secs: u64::MAX,
            silence_timeout_secs: u64::MAX,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let monitor = Monitor::new(cfg);
        let t0 = Utc::now();
        for i in 0..3 {
            monitor
                .process(sample("gw", "up", 1.0, t0 + ChronoDuration::seconds(i)))
                .unwrap();
        }
        assert!(monitor.sweep(t0 + ChronoDuration::hours(1)).is_empty());
        let gw = monitor.target("gw").unwrap();
        assert_eq!(gw.status(), TargetStatus::Up);
        assert_eq!(gw.rolling_window.len(), 3);
    }

    #[test]
    fn test_ingest_counts_rejections() {
        let cfg = EngineConfig {
            queue_capacity: 1,
            workers: 1,
            ..EngineConfig::default()
        };
        let monitor = Monitor::new(cfg);
        monitor.ingest(sample("a", "up", 1.0, Utc::now())).unwrap();
        assert!(matches!(
            monitor.ingest(sample("a", "up", 1.0, Utc::now())),
            Err(MonitorError::Backpressure { capacity: 1 })
        ));

        let health = monitor.health();
        assert_eq!(health.counters.accepted, 1);
        assert_eq!(health.counters.rejected, 1);
        assert_eq!(health.queue_depth, 1);
        assert_eq!(health.storage, StorageMode::Available);
        assert!(health.statuses.is_empty());

        monitor.process(sample("b", "up", 0.0, Utc::now())).unwrap();
        monitor.process(sample("c", "up", 1.0, Utc::now())).unwrap();
        let statuses = monitor.health().statuses;
        assert_eq!(statuses[&TargetStatus::Unknown], 1);
        assert_eq!(statuses[&TargetStatus::Up], 1);
    }

    #[test]
    fn test_register_validates_id() {
        let monitor = Monitor::new(EngineConfig::default());
        assert!(monitor.register("core-sw").unwrap());
        assert!(monitor.register("bad id").is_err());
        assert_eq!(monitor.snapshot().targets.len(), 1);
        assert!(monitor.deregister("core-sw").is_ok());
        assert!(matches!(monitor.target("core-sw"), Err(MonitorError::NotFound(_))));
    }

    #[test]
    fn test_restore_from_persisted_snapshot() {
        let repo = MemoryRepository::new();
        let first = Monitor::new(EngineConfig::default());
        first.process(sample("gw", "up", 1.0, Utc::now())).unwrap();
        first.publish_snapshot();
        first.persist().flush(&repo);

        let second = Monitor::new(EngineConfig::default());
        assert_eq!(second.restore_from(&repo).unwrap(), 1);
        let gw = second.target("gw").unwrap();
        assert_eq!(gw.status(), TargetStatus::Up);
        assert_eq!(gw.samples_seen, 1);
        assert!(second.transitions(None, 10).is_empty());

        // nothing persisted yet
        assert_eq!(
            Monitor::new(EngineConfig::default())
                .restore_from(&MemoryRepository::new())
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_restore_reports_storage_errors() {
        let repo = MemoryRepository::new();
        repo.set_available(false);
        let monitor = Monitor::new(EngineConfig::default());
        assert!(matches!(
            monitor.restore_from(&repo),
            Err(MonitorError::StorageUnavailable(_))
        ));
    }

    fn sighting(target_id: &str, ip: &str, at: DateTime<Utc>) -> DeviceSighting {
        DeviceSighting {
            target_id: target_id.to_string(),
            network: "home".to_string(),
            ip: Some(ip.to_string()),
            seen_at: at,
        }
    }

    #[test]
    fn test_always_on_device_goes_down() {
        let monitor = Monitor::new(EngineConfig::default());
        let t0 = Utc::now();
        let nas = "home/aa:bb:cc:00:00:01";

        let alert = monitor.device_seen(&sighting(nas, "10.0.0.9", t0)).unwrap().unwrap();
        assert_eq!(alert.kind, AlertKind::DeviceUnauthorized);
        let changed = monitor.set_device_mode(nas, DeviceMode::AlwaysOn).unwrap();
        assert_eq!(changed.len(), 1);
        assert!(!changed[0].is_open());

        monitor.process(sample(nas, "up", 1.0, t0)).unwrap();
        for i in 1..=3 {
            monitor
                .process(sample(nas, "up", 0.0, t0 + ChronoDuration::seconds(i)))
                .unwrap();
        }

        let open = monitor.alerts(true, 10);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, AlertKind::DeviceDown);
        assert_eq!(open[0].network.as_deref(), Some("home"));
        assert_eq!(monitor.health().open_alerts, 1);
        assert_eq!(monitor.alerts(false, 10).len(), 2);

        // offline history keeps the last known address
        let down = &monitor.transitions(Some(nas), 1)[0];
        assert_eq!(down.to, TargetStatus::Down);
        assert_eq!(down.address.as_deref(), Some("10.0.0.9"));

        let device = monitor.target(nas).unwrap().device.unwrap();
        assert_eq!(device.mode, DeviceMode::AlwaysOn);
        assert_eq!(device.first_seen, Some(t0));
        assert!(monitor.set_device_mode("bad id", DeviceMode::Authorized).is_err());
    }

    #[test]
    fn test_restore_reopens_alerts_and_modes() {
        let repo = MemoryRepository::new();
        let t0 = Utc::now();
        let first = Monitor::new(EngineConfig::default());
        first.device_seen(&sighting("home/aa:01", "10.0.0.5", t0)).unwrap();
        first.device_seen(&sighting("home/aa:02", "10.0.0.6", t0)).unwrap();
        first.set_device_mode("home/aa:02", DeviceMode::Authorized).unwrap();
        first.publish_snapshot();
        first.persist().flush(&repo);
        assert_eq!(repo.list(ALERT_PREFIX).unwrap().len(), 2);

        let second = Monitor::new(EngineConfig::default());
        assert_eq!(second.restore_from(&repo).unwrap(), 2);
        assert_eq!(second.health().open_alerts, 1);
        let restored = second.target("home/aa:02").unwrap().device.unwrap();
        assert_eq!(restored.mode, DeviceMode::Authorized);
        assert_eq!(restored.ip.as_deref(), Some("10.0.0.6"));

        // neither device alerts again: one is authorized, the other already has an open alert
        let later = t0 + ChronoDuration::seconds(60);
        assert!(second.device_seen(&sighting("home/aa:01", "10.0.0.5", later)).unwrap().is_none());
        assert!(second.device_seen(&sighting("home/aa:02", "10.0.0.6", later)).unwrap().is_none());
    }

    #[test]
    fn test_take_receivers_once() {
        let monitor = Monitor::new(EngineConfig::default());
        assert_eq!(monitor.take_receivers().map(|r| r.len()), Some(4));
        assert!(monitor.take_receivers().is_none());
    }
}
