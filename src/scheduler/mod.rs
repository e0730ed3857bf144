//! Scheduler module for draining the ingest queue and running background tasks.

mod persist;
mod publisher;
mod sweep;

pub use persist::*;
pub use publisher::*;
pub use sweep::*;

use crate::db::Repository;
use crate::monitor::{drain_shard, EngineCounters, Monitor, MonitorError, ShardReceiver};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("workers already started for this monitor")]
    AlreadyStarted,
}

/// Summary of what happened during shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Samples still queued when the workers stopped
    pub discarded: usize,
    /// Durable writes stored by the final flush
    pub flushed: usize,
    /// Durable writes still pending after the final flush
    pub pending_writes: usize,
    pub storage: StorageMode,
}

/// Owns the worker pool and the background tasks of a running [`Monitor`].
pub struct Scheduler {
    monitor: Arc<Monitor>,
    repo: Arc<dyn Repository>,
    stop_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<usize>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn one worker per queue shard plus the sweeper, snapshot publisher
    /// and persistence writer.
    pub fn start(monitor: Arc<Monitor>, repo: Arc<dyn Repository>) -> Result<Self, SchedulerError> {
        let receivers = monitor.take_receivers().ok_or(SchedulerError::AlreadyStarted)?;
        let (stop_tx, _) = broadcast::channel(1);
        let cfg = monitor.config().clone();

        tracing::info!("Starting scheduler with {} workers", receivers.len());

        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(id, rx)| {
                tokio::spawn(run_worker(id, monitor.clone(), rx, stop_tx.subscribe()))
            })
            .collect();

        let sweeper = Sweeper::new(monitor.clone(), cfg.sweep_interval());
        let publisher = SnapshotTask::new(monitor.clone(), cfg.snapshot_interval());
        let tasks = vec![
            sweeper.start(stop_tx.subscribe()),
            publisher.start(stop_tx.subscribe()),
            tokio::spawn(run_writer(
                monitor.persist().clone(),
                repo.clone(),
                cfg.persist_flush_interval(),
                cfg.snapshot_retention(),
                stop_tx.subscribe(),
            )),
        ];

        Ok(Self {
            monitor,
            repo,
            stop_tx,
            workers,
            tasks,
        })
    }

    /// Stop accepting samples, stop all tasks and flush what is left.
    ///
    /// Each worker finishes the sample it is processing; samples still queued
    /// are discarded and counted.
    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!("Scheduler: Shutting down");
        self.monitor.queue().close();
        let _ = self.stop_tx.send(());

        let mut discarded = 0;
        for worker in self.workers {
            match worker.await {
                Ok(n) => discarded += n,
                Err(e) => tracing::error!("Scheduler: Worker task failed: {}", e),
            }
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Scheduler: Background task failed: {}", e);
            }
        }

        self.monitor.publish_snapshot();
        let flushed = self.monitor.persist().flush(self.repo.as_ref());

        let report = ShutdownReport {
            discarded,
            flushed,
            pending_writes: self.monitor.persist().pending(),
            storage: self.monitor.persist().mode(),
        };
        tracing::info!(
            "Scheduler: Stopped ({} samples discarded, {} writes flushed, {} pending)",
            report.discarded,
            report.flushed,
            report.pending_writes
        );
        report
    }
}

/// Drain one queue shard until stopped. Returns the number of discarded samples.
async fn run_worker(
    id: usize,
    monitor: Arc<Monitor>,
    mut rx: ShardReceiver,
    mut stop_rx: broadcast::Receiver<()>,
) -> usize {
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            queued = rx.recv() => {
                let Some(queued) = queued else { break };
                match monitor.process(queued.into_sample()) {
                    Ok(_) => {}
                    Err(MonitorError::MalformedSample(_)) => {}
                    Err(e) => tracing::error!("Worker {}: Failed to process sample: {}", id, e),
                }
            }
        }
    }

    let discarded = drain_shard(&mut rx);
    if discarded > 0 {
        EngineCounters::add(&monitor.counters().discarded, discarded as u64);
        tracing::warn!("Worker {}: Discarded {} queued samples", id, discarded);
    }
    discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::{MemoryRepository, TRANSITION_PREFIX};
    use crate::monitor::{Sample, TargetStatus};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_workers_process_queued_samples() {
        let monitor = Arc::new(Monitor::new(EngineConfig::default()));
        let repo = Arc::new(MemoryRepository::new());
        let scheduler = Scheduler::start(monitor.clone(), repo.clone()).unwrap();

        let t0 = Utc::now();
        for i in 0..3 {
            monitor
                .ingest(Sample::new("gw", "up", 0.0, t0 + ChronoDuration::seconds(i)))
                .unwrap();
        }
        wait_for(|| monitor.counters().snapshot().processed == 3).await;
        assert_eq!(monitor.target("gw").unwrap().status(), TargetStatus::Down);

        let report = scheduler.shutdown().await;
        assert_eq!(report.discarded, 0);
        assert_eq!(report.pending_writes, 0);
        assert_eq!(repo.list(TRANSITION_PREFIX).unwrap().len(), 1);
        assert!(repo.get(crate::db::LATEST_SNAPSHOT_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let monitor = Arc::new(Monitor::new(EngineConfig::default()));
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let scheduler = Scheduler::start(monitor.clone(), repo.clone()).unwrap();
        assert!(matches!(
            Scheduler::start(monitor, repo),
            Err(SchedulerError::AlreadyStarted)
        ));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_samples() {
        let monitor = Arc::new(Monitor::new(EngineConfig::default()));
        let scheduler = Scheduler::start(monitor.clone(), Arc::new(MemoryRepository::new())).unwrap();
        scheduler.shutdown().await;

        let result = monitor.ingest(Sample::new("gw", "up", 1.0, Utc::now()));
        assert!(matches!(result, Err(MonitorError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_stopped_worker_counts_discarded() {
        let monitor = Arc::new(Monitor::new(EngineConfig {
            workers: 1,
            ..EngineConfig::default()
        }));
        let mut receivers = monitor.take_receivers().unwrap();
        let rx = receivers.remove(0);

        for i in 0..5 {
            monitor
                .ingest(Sample::new(format!("t{}", i), "up", 1.0, Utc::now()))
                .unwrap();
        }
        let (stop_tx, stop_rx) = broadcast::channel(1);
        stop_tx.send(()).unwrap();

        // stop is checked before the shard, so nothing gets processed
        let discarded = run_worker(0, monitor.clone(), rx, stop_rx).await;
        assert_eq!(discarded, 5);
        assert_eq!(monitor.counters().snapshot().discarded, 5);
        assert_eq!(monitor.counters().snapshot().processed, 0);
    }
}
