//! Periodic snapshot publishing.

use crate::monitor::Monitor;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Publishes a snapshot of all targets on a fixed interval.
pub struct SnapshotTask {
    monitor: Arc<Monitor>,
    interval: Duration,
}

impl SnapshotTask {
    pub fn new(monitor: Arc<Monitor>, interval: Duration) -> Self {
        Self { monitor, interval }
    }

    /// Start the snapshot background task.
    pub fn start(&self, mut stop_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        monitor.publish_snapshot();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn test_subscribers_receive_snapshots() {
        let monitor = Arc::new(Monitor::new(EngineConfig::default()));
        monitor.register("core-sw").unwrap();
        let mut rx = monitor.subscribe();

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = SnapshotTask::new(monitor.clone(), Duration::from_millis(10)).start(stop_rx);

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(rx.borrow().get("core-sw").is_some());

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(monitor.counters().snapshot().snapshots >= 1);
    }
}
