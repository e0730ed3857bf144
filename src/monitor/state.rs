//! Target state store.
//!
//! One [`TargetState`] per target id, each behind its own mutex so writers
//! for the same target are serialized while different targets proceed in
//! parallel. The outer map lock is only held to find or create an entry,
//! never while a target is locked.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::alerts::DeviceRecord;
use super::detector::{FlapTracker, Outcome};
use super::snapshot::TargetView;
use super::window::{RollingWindow, WindowStats};
use super::MonitorError;

/// Health status of a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetStatus {
    #[default]
    Unknown,
    Up,
    Down,
    Degraded,
    Flapping,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetStatus::Unknown => "UNKNOWN",
            TargetStatus::Up => "UP",
            TargetStatus::Down => "DOWN",
            TargetStatus::Degraded => "DEGRADED",
            TargetStatus::Flapping => "FLAPPING",
        };
        f.write_str(s)
    }
}

/// Live state of one monitored target.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub target_id: String,
    pub(crate) current_status: TargetStatus,
    pub created_at: DateTime<Utc>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_warnings: u32,
    pub last_outcome: Option<Outcome>,
    pub samples_seen: u64,
    pub rolling_window: RollingWindow,
    pub stats: BTreeMap<String, WindowStats>,
    /// Mode and sighting details, for targets that are network devices
    pub device: Option<DeviceRecord>,
    pub(crate) flap: FlapTracker,
    retired: bool,
}

impl TargetState {
    pub fn new(target_id: &str, window_max_samples: usize, horizon: ChronoDuration) -> Self {
        Self {
            target_id: target_id.to_string(),
            current_status: TargetStatus::Unknown,
            created_at: Utc::now(),
            last_sample_at: None,
            last_transition_at: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            consecutive_warnings: 0,
            last_outcome: None,
            samples_seen: 0,
            rolling_window: RollingWindow::new(window_max_samples, horizon),
            stats: BTreeMap::new(),
            device: None,
            flap: FlapTracker::default(),
            retired: false,
        }
    }

    /// Current health status. Only the transition detector changes it.
    pub fn status(&self) -> TargetStatus {
        self.current_status
    }

    /// Forget outcome history, used when a target goes silent.
    pub(crate) fn reset_history(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.consecutive_warnings = 0;
        self.last_outcome = None;
        self.flap = FlapTracker::default();
    }
}

/// Keyed store of target states with explicit lifecycle.
pub struct TargetStore {
    targets: RwLock<HashMap<String, Arc<Mutex<TargetState>>>>,
    window_max_samples: usize,
    horizon: ChronoDuration,
}

impl TargetStore {
    pub fn new(window_max_samples: usize, horizon: ChronoDuration) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            window_max_samples,
            horizon,
        }
    }

    /// Get or create the entry for a target.
    fn entry(&self, target_id: &str) -> Arc<Mutex<TargetState>> {
        // Fast path: check if it exists
        {
            let targets = self.targets.read();
            if let Some(state) = targets.get(target_id) {
                return state.clone();
            }
        }

        // Slow path: create it
        let mut targets = self.targets.write();
        targets
            .entry(target_id.to_string())
            .or_insert_with(|| {
                tracing::info!("TargetStore: Registered target {}", target_id);
                Arc::new(Mutex::new(TargetState::new(
                    target_id,
                    self.window_max_samples,
                    self.horizon,
                )))
            })
            .clone()
    }

    /// Snapshot of the current entries, taken without holding any target lock.
    fn entries(&self) -> Vec<Arc<Mutex<TargetState>>> {
        self.targets.read().values().cloned().collect()
    }

    /// Get a copy of a target's state.
    pub fn get(&self, target_id: &str) -> Result<TargetState, MonitorError> {
        let entry = self
            .targets
            .read()
            .get(target_id)
            .cloned()
            .ok_or_else(|| MonitorError::NotFound(target_id.to_string()))?;
        let state = entry.lock().clone();
        Ok(state)
    }

    /// Apply a mutation to a target, creating it on first use.
    ///
    /// Mutations of the same target never overlap; readers observe the state
    /// either before or after `mutate` runs.
    pub fn upsert<R>(&self, target_id: &str, mutate: impl FnOnce(&mut TargetState) -> R) -> R {
        loop {
            let entry = self.entry(target_id);
            let mut state = entry.lock();
            if state.retired {
                // deregistered while we waited; the next lookup creates a fresh entry
                continue;
            }
            return mutate(&mut state);
        }
    }

    /// Visit every target, locking one at a time.
    pub fn for_each_mut(&self, mut visit: impl FnMut(&mut TargetState)) {
        for entry in self.entries() {
            let mut state = entry.lock();
            if !state.retired {
                visit(&mut state);
            }
        }
    }

    /// Map every target through `f`, locking one at a time.
    pub fn map_all<T>(&self, f: impl Fn(&TargetState) -> T) -> Vec<T> {
        self.entries()
            .into_iter()
            .filter_map(|entry| {
                let state = entry.lock();
                (!state.retired).then(|| f(&state))
            })
            .collect()
    }

    /// Create a target ahead of its first sample. Returns false if it already existed.
    pub fn register(&self, target_id: &str) -> bool {
        let existed = self.targets.read().contains_key(target_id);
        if !existed {
            self.entry(target_id);
        }
        !existed
    }

    /// Remove a target. Returns its final state.
    pub fn deregister(&self, target_id: &str) -> Result<TargetState, MonitorError> {
        let mut targets = self.targets.write();
        let entry = targets
            .remove(target_id)
            .ok_or_else(|| MonitorError::NotFound(target_id.to_string()))?;
        let mut state = entry.lock();
        state.retired = true;
        tracing::info!("TargetStore: Deregistered target {}", target_id);
        Ok(state.clone())
    }

    /// Recreate a target from a persisted view. Existing targets are left alone.
    pub fn restore(&self, view: &TargetView) -> bool {
        let mut targets = self.targets.write();
        if targets.contains_key(&view.target_id) {
            return false;
        }

        let mut state = TargetState::new(&view.target_id, self.window_max_samples, self.horizon);
        state.current_status = view.status;
        state.last_sample_at = view.last_sample_at;
        state.last_transition_at = view.last_transition_at;
        state.consecutive_failures = view.consecutive_failures;
        state.consecutive_successes = view.consecutive_successes;
        state.consecutive_warnings = view.consecutive_warnings;
        state.samples_seen = view.samples_seen;
        state.device = view.device.clone();

        targets.insert(view.target_id.clone(), Arc::new(Mutex::new(state)));
        true
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn store() -> TargetStore {
        TargetStore::new(16, ChronoDuration::seconds(300))
    }

    #[test]
    fn test_get_missing_target() {
        let store = store();
        assert!(matches!(store.get("nope"), Err(MonitorError::NotFound(_))));
    }

    #[test]
    fn test_upsert_creates_once() {
        let store = store();
        store.upsert("a", |s| s.samples_seen += 1);
        store.upsert("a", |s| s.samples_seen += 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().samples_seen, 2);
        assert_eq!(store.get("a").unwrap().status(), TargetStatus::Unknown);
    }

    #[test]
    fn test_register_and_deregister() {
        let store = store();
        assert!(store.register("a"));
        assert!(!store.register("a"));

        let last = store.deregister("a").unwrap();
        assert_eq!(last.target_id, "a");
        assert!(store.is_empty());
        assert!(store.deregister("a").is_err());

        // a later sample brings it back fresh
        store.upsert("a", |s| s.samples_seen += 1);
        assert_eq!(store.get("a").unwrap().samples_seen, 1);
    }

    #[test]
    fn test_concurrent_upserts_are_serialized() {
        let store = Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store.upsert("shared", |s| s.samples_seen += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("shared").unwrap().samples_seen, 8000);
    }

    #[test]
    fn test_readers_never_see_partial_mutation() {
        let store = Arc::new(store());
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..5000 {
                    store.upsert("t", |s| {
                        // keep the two counters equal after every mutation
                        s.consecutive_failures += 1;
                        thread::yield_now();
                        s.consecutive_successes += 1;
                    });
                }
            })
        };

        for _ in 0..5000 {
            for state in store.map_all(TargetState::clone) {
                assert_eq!(state.consecutive_failures, state.consecutive_successes);
            }
        }
        writer.join().unwrap();
    }
}
