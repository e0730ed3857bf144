use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters, updated lock-free from every task.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub malformed: AtomicU64,
    pub processed: AtomicU64,
    pub discarded: AtomicU64,
    pub transitions: AtomicU64,
    pub persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub persist_dropped: AtomicU64,
    pub snapshots: AtomicU64,
    pub alerts: AtomicU64,
}

/// Point-in-time copy of [`EngineCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub processed: u64,
    pub discarded: u64,
    pub transitions: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub persist_dropped: u64,
    pub snapshots: u64,
    pub alerts: u64,
}

impl EngineCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            malformed: load(&self.malformed),
            processed: load(&self.processed),
            discarded: load(&self.discarded),
            transitions: load(&self.transitions),
            persisted: load(&self.persisted),
            persist_failures: load(&self.persist_failures),
            persist_dropped: load(&self.persist_dropped),
            snapshots: load(&self.snapshots),
            alerts: load(&self.alerts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let counters = EngineCounters::default();
        EngineCounters::incr(&counters.accepted);
        EngineCounters::incr(&counters.accepted);
        EngineCounters::add(&counters.discarded, 5);

        let snap = counters.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.discarded, 5);
        assert_eq!(snap.rejected, 0);
    }
}
