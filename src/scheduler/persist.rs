//! Write buffer in front of the durable store.
//!
//! Transitions and snapshots are queued here and written by a background
//! task. When the store is unreachable the writes stay queued (bounded, oldest
//! dropped first), each write is retried a limited number of times with
//! jittered backoff, and the buffer reports a degraded storage mode until a
//! write succeeds again.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::{snapshot_key, DbError, Repository, SNAPSHOT_PREFIX};
use crate::monitor::EngineCounters;

const MAX_BACKOFF_SECS: u64 = 60;

/// Whether the durable store is currently accepting writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StorageMode {
    Available,
    Degraded {
        since: DateTime<Utc>,
        last_error: String,
    },
}

impl StorageMode {
    pub fn is_degraded(&self) -> bool {
        matches!(self, StorageMode::Degraded { .. })
    }
}

#[derive(Debug, Clone)]
struct PendingWrite {
    key: String,
    value: String,
    attempts: u32,
}

struct Inner {
    pending: VecDeque<PendingWrite>,
    mode: StorageMode,
    failed_passes: u32,
    retry_at: Option<Instant>,
}

pub struct PersistBuffer {
    inner: Mutex<Inner>,
    flush_lock: Mutex<()>,
    capacity: usize,
    max_retries: u32,
    counters: Arc<EngineCounters>,
}

impl PersistBuffer {
    pub fn new(capacity: usize, max_retries: u32, counters: Arc<EngineCounters>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                mode: StorageMode::Available,
                failed_passes: 0,
                retry_at: None,
            }),
            flush_lock: Mutex::new(()),
            capacity: capacity.max(1),
            max_retries: max_retries.max(1),
            counters,
        }
    }

    /// Queue a write. Drops the oldest pending write when full.
    pub fn enqueue(&self, key: String, value: String) {
        let mut inner = self.inner.lock();
        inner.pending.push_back(PendingWrite {
            key,
            value,
            attempts: 0,
        });
        self.enforce_capacity(&mut inner);
    }

    /// Serialize `value` as JSON and queue it.
    pub fn enqueue_json<T: Serialize>(&self, key: String, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => self.enqueue(key, json),
            Err(e) => {
                EngineCounters::incr(&self.counters.persist_dropped);
                tracing::error!("PersistBuffer: Failed to serialize {}: {}", key, e);
            }
        }
    }

    fn enforce_capacity(&self, inner: &mut Inner) {
        while inner.pending.len() > self.capacity {
            if let Some(dropped) = inner.pending.pop_front() {
                EngineCounters::incr(&self.counters.persist_dropped);
                tracing::warn!("PersistBuffer: Buffer full, dropped write {}", dropped.key);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn mode(&self) -> StorageMode {
        self.inner.lock().mode.clone()
    }

    /// True unless a failed flush scheduled a backoff that has not elapsed.
    pub fn retry_due(&self, now: Instant) -> bool {
        self.inner.lock().retry_at.map_or(true, |at| now >= at)
    }

    /// Write everything pending, in order. Returns the number of writes stored.
    ///
    /// Stops at the first failure: the failed write and everything behind it
    /// stay queued ahead of writes enqueued meanwhile.
    pub fn flush(&self, repo: &dyn Repository) -> usize {
        let _flushing = self.flush_lock.lock();
        let mut batch: VecDeque<PendingWrite> = std::mem::take(&mut self.inner.lock().pending);
        if batch.is_empty() {
            return 0;
        }

        let mut written = 0;
        let mut failure: Option<DbError> = None;
        while let Some(mut write) = batch.pop_front() {
            match repo.put(&write.key, &write.value) {
                Ok(()) => written += 1,
                Err(e) => {
                    write.attempts += 1;
                    EngineCounters::incr(&self.counters.persist_failures);
                    if write.attempts >= self.max_retries {
                        EngineCounters::incr(&self.counters.persist_dropped);
                        tracing::error!(
                            "PersistBuffer: Giving up on {} after {} attempts: {}",
                            write.key,
                            write.attempts,
                            e
                        );
                    } else {
                        batch.push_front(write);
                    }
                    failure = Some(e);
                    break;
                }
            }
        }
        EngineCounters::add(&self.counters.persisted, written as u64);

        let mut inner = self.inner.lock();
        while let Some(write) = batch.pop_back() {
            inner.pending.push_front(write);
        }
        self.enforce_capacity(&mut inner);

        match failure {
            Some(e) => {
                inner.failed_passes += 1;
                inner.retry_at = Some(Instant::now() + backoff(inner.failed_passes));
                match &mut inner.mode {
                    StorageMode::Degraded { last_error, .. } => *last_error = e.to_string(),
                    mode => {
                        tracing::error!("PersistBuffer: Storage unavailable, entering degraded mode: {}", e);
                        *mode = StorageMode::Degraded {
                            since: Utc::now(),
                            last_error: e.to_string(),
                        };
                    }
                }
            }
            None => {
                inner.failed_passes = 0;
                inner.retry_at = None;
                if let StorageMode::Degraded { since, .. } = &inner.mode {
                    tracing::info!(
                        "PersistBuffer: Storage available again after {}s degraded",
                        (Utc::now() - *since).num_seconds()
                    );
                    inner.mode = StorageMode::Available;
                }
            }
        }

        written
    }
}

/// Exponential backoff with up to 500ms of jitter.
fn backoff(failed_passes: u32) -> Duration {
    let base = 1u64
        .checked_shl(failed_passes.saturating_sub(1))
        .unwrap_or(MAX_BACKOFF_SECS)
        .min(MAX_BACKOFF_SECS);
    let jitter = rand::thread_rng().gen_range(0..500);
    Duration::from_secs(base) + Duration::from_millis(jitter)
}

/// Remove persisted snapshots older than the retention period.
pub fn prune_snapshots(repo: &dyn Repository, now: DateTime<Utc>, retention: ChronoDuration) {
    let Some(cutoff) = now.checked_sub_signed(retention) else {
        return;
    };
    let upper = snapshot_key(cutoff);
    match repo.remove_before(SNAPSHOT_PREFIX, &upper) {
        Ok(0) => {}
        Ok(n) => tracing::info!("PersistBuffer: Pruned {} snapshots older than {}", n, upper),
        Err(e) => tracing::warn!("PersistBuffer: Failed to prune snapshots: {}", e),
    }
}

/// Flush the buffer on an interval until stopped.
pub async fn run_writer(
    buffer: Arc<PersistBuffer>,
    repo: Arc<dyn Repository>,
    flush_every: Duration,
    retention: ChronoDuration,
    mut stop_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut flush = tokio::time::interval(flush_every);
    let mut prune = tokio::time::interval(Duration::from_secs(60));
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = flush.tick() => {
                if buffer.retry_due(Instant::now()) {
                    buffer.flush(repo.as_ref());
                }
            }
            _ = prune.tick() => {
                if !buffer.mode().is_degraded() {
                    prune_snapshots(repo.as_ref(), Utc::now(), retention);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;

    fn buffer(capacity: usize, max_retries: u32) -> (PersistBuffer, Arc<EngineCounters>) {
        let counters = Arc::new(EngineCounters::default());
        (PersistBuffer::new(capacity, max_retries, counters.clone()), counters)
    }

    #[test]
    fn test_flush_writes_in_order() {
        let (buf, counters) = buffer(10, 3);
        let repo = MemoryRepository::new();
        buf.enqueue("k/1".into(), "1".into());
        buf.enqueue("k/2".into(), "2".into());

        assert_eq!(buf.flush(&repo), 2);
        assert_eq!(buf.pending(), 0);
        assert_eq!(repo.get("k/2").unwrap().unwrap().value, "2");
        assert_eq!(counters.snapshot().persisted, 2);
    }

    #[test]
    fn test_outage_then_recovery_loses_nothing() {
        let (buf, counters) = buffer(10, 5);
        let repo = MemoryRepository::new();
        repo.set_available(false);

        for i in 0..3 {
            buf.enqueue(format!("k/{}", i), i.to_string());
        }
        assert_eq!(buf.flush(&repo), 0);
        assert!(buf.mode().is_degraded());
        assert_eq!(buf.pending(), 3);
        assert!(!buf.retry_due(Instant::now()));

        // writes arriving during the outage queue behind the retried ones
        buf.enqueue("k/3".into(), "3".into());

        repo.set_available(true);
        assert_eq!(buf.flush(&repo), 4);
        assert_eq!(buf.mode(), StorageMode::Available);
        assert!(buf.retry_due(Instant::now()));

        let keys: Vec<String> = repo.list("k/").unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["k/0", "k/1", "k/2", "k/3"]);
        assert_eq!(counters.snapshot().persist_dropped, 0);
        assert_eq!(counters.snapshot().persist_failures, 1);
    }

    #[test]
    fn test_retry_bound_drops_write() {
        let (buf, counters) = buffer(10, 2);
        let repo = MemoryRepository::new();
        repo.set_available(false);
        buf.enqueue("a".into(), "1".into());
        buf.enqueue("b".into(), "2".into());

        buf.flush(&repo);
        assert_eq!(buf.pending(), 2);
        buf.flush(&repo);
        assert_eq!(buf.pending(), 1);
        assert_eq!(counters.snapshot().persist_dropped, 1);

        repo.set_available(true);
        buf.flush(&repo);
        assert!(repo.get("a").unwrap().is_none());
        assert!(repo.get("b").unwrap().is_some());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let (buf, counters) = buffer(2, 3);
        buf.enqueue("a".into(), "1".into());
        buf.enqueue("b".into(), "2".into());
        buf.enqueue("c".into(), "3".into());

        let repo = MemoryRepository::new();
        buf.flush(&repo);
        assert!(repo.get("a").unwrap().is_none());
        assert_eq!(repo.len(), 2);
        assert_eq!(counters.snapshot().persist_dropped, 1);
    }

    #[test]
    fn test_prune_snapshots_keeps_recent() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        repo.put(&snapshot_key(now - ChronoDuration::hours(2)), "{}").unwrap();
        repo.put(&snapshot_key(now), "{}").unwrap();
        repo.put(crate::db::LATEST_SNAPSHOT_KEY, "{}").unwrap();

        prune_snapshots(&repo, now, ChronoDuration::hours(1));
        assert_eq!(repo.len(), 2);
        assert!(repo.get(crate::db::LATEST_SNAPSHOT_KEY).unwrap().is_some());

        prune_snapshots(&repo, now, ChronoDuration::weeks(52_000_000));
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert!(backoff(1) < Duration::from_secs(2));
        assert!(backoff(3) >= Duration::from_secs(4));
        assert!(backoff(40) <= Duration::from_secs(MAX_BACKOFF_SECS + 1));
    }
}
