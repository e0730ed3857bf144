//! Read-only snapshots of all targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::alerts::DeviceRecord;
use super::counters::EngineCounters;
use super::state::{TargetState, TargetStatus, TargetStore};
use super::window::WindowStats;
use crate::db::{snapshot_key, LATEST_SNAPSHOT_KEY};
use crate::scheduler::PersistBuffer;

/// Plain copy of one target's state, detached from the live store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetView {
    pub target_id: String,
    pub status: TargetStatus,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_warnings: u32,
    pub samples_seen: u64,
    pub window_len: usize,
    pub stats: BTreeMap<String, WindowStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceRecord>,
}

impl From<&TargetState> for TargetView {
    fn from(state: &TargetState) -> Self {
        Self {
            target_id: state.target_id.clone(),
            status: state.status(),
            last_sample_at: state.last_sample_at,
            last_transition_at: state.last_transition_at,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            consecutive_warnings: state.consecutive_warnings,
            samples_seen: state.samples_seen,
            window_len: state.rolling_window.len(),
            stats: state.stats.clone(),
            device: state.device.clone(),
        }
    }
}

/// Point-in-time view of every target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    pub targets: BTreeMap<String, TargetView>,
}

impl Snapshot {
    pub fn get(&self, target_id: &str) -> Option<&TargetView> {
        self.targets.get(target_id)
    }

    /// Number of targets per status.
    pub fn status_counts(&self) -> BTreeMap<TargetStatus, usize> {
        let mut counts = BTreeMap::new();
        for view in self.targets.values() {
            *counts.entry(view.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Captures snapshots and hands them to subscribers and the durable store.
pub struct SnapshotPublisher {
    store: Arc<TargetStore>,
    tx: watch::Sender<Arc<Snapshot>>,
    persist: Arc<PersistBuffer>,
    counters: Arc<EngineCounters>,
}

impl SnapshotPublisher {
    pub fn new(
        store: Arc<TargetStore>,
        persist: Arc<PersistBuffer>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        let (tx, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            store,
            tx,
            persist,
            counters,
        }
    }

    /// Build a snapshot from the live store.
    ///
    /// Each target is copied under its own lock, so every view is internally
    /// consistent; views of different targets may be from slightly different
    /// moments.
    pub fn capture(&self) -> Snapshot {
        let targets = self
            .store
            .map_all(|state| TargetView::from(state))
            .into_iter()
            .map(|view| (view.target_id.clone(), view))
            .collect();

        Snapshot {
            captured_at: Utc::now(),
            targets,
        }
    }

    /// Capture, persist and broadcast a new snapshot.
    pub fn publish(&self) -> Arc<Snapshot> {
        let snapshot = Arc::new(self.capture());

        self.persist
            .enqueue_json(snapshot_key(snapshot.captured_at), snapshot.as_ref());
        self.persist
            .enqueue_json(LATEST_SNAPSHOT_KEY.to_string(), snapshot.as_ref());

        self.tx.send_replace(snapshot.clone());
        EngineCounters::incr(&self.counters.snapshots);
        tracing::debug!(
            "SnapshotPublisher: Published snapshot of {} targets",
            snapshot.targets.len()
        );
        snapshot
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::thread;

    fn publisher() -> (SnapshotPublisher, Arc<TargetStore>, Arc<PersistBuffer>) {
        let store = Arc::new(TargetStore::new(16, ChronoDuration::seconds(300)));
        let counters = Arc::new(EngineCounters::default());
        let persist = Arc::new(PersistBuffer::new(100, 3, counters.clone()));
        let publisher = SnapshotPublisher::new(store.clone(), persist.clone(), counters);
        (publisher, store, persist)
    }

    #[test]
    fn test_snapshot_does_not_alias_live_state() {
        let (publisher, store, _) = publisher();
        store.upsert("a", |s| s.samples_seen = 1);

        let snapshot = publisher.capture();
        store.upsert("a", |s| s.samples_seen = 2);

        assert_eq!(snapshot.get("a").unwrap().samples_seen, 1);
        assert_eq!(snapshot.status_counts()[&TargetStatus::Unknown], 1);
    }

    #[test]
    fn test_publish_notifies_and_persists() {
        let (publisher, store, persist) = publisher();
        let mut rx = publisher.subscribe();
        store.register("a");

        publisher.publish();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().targets.len(), 1);
        assert_eq!(publisher.latest().targets.len(), 1);
        assert_eq!(persist.pending(), 2);
    }

    #[test]
    fn test_capture_never_torn() {
        let (publisher, store, _) = publisher();
        let publisher = Arc::new(publisher);
        for id in ["a", "b", "c"] {
            store.register(id);
        }

        let writers: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        store.upsert(id, |s| {
                            s.consecutive_failures += 1;
                            thread::yield_now();
                            s.consecutive_successes += 1;
                        });
                    }
                })
            })
            .collect();

        for _ in 0..500 {
            for view in publisher.capture().targets.values() {
                assert_eq!(view.consecutive_failures, view.consecutive_successes);
            }
        }
        for w in writers {
            w.join().unwrap();
        }
    }
}
