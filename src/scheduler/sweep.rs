//! Sweeper for silent targets and expired window entries.

use crate::monitor::Monitor;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Periodically marks silent targets UNKNOWN and trims rolling windows.
pub struct Sweeper {
    monitor: Arc<Monitor>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(monitor: Arc<Monitor>, interval: Duration) -> Self {
        Self { monitor, interval }
    }

    /// Start the sweeper background task.
    pub fn start(&self, mut stop_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        let silenced = monitor.sweep(Utc::now());
                        if !silenced.is_empty() {
                            tracing::info!("Sweeper: {} targets went silent", silenced.len());
                        }
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
    use crate::monitor::{Sample, TargetStatus};
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_sweeper_marks_silent_target() {
        let monitor = Arc::new(Monitor::new(EngineConfig {
            silence_timeout_secs: 60,
            ..EngineConfig::default()
        }));
        // last heard from ten minutes ago
        let then = Utc::now() - ChronoDuration::seconds(600);
        monitor.process(Sample::new("ap-1", "up", 1.0, then)).unwrap();
        assert_eq!(monitor.target("ap-1").unwrap().status(), TargetStatus::Up);

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = Sweeper::new(monitor.clone(), Duration::from_millis(10)).start(stop_rx);

        for _ in 0..100 {
            if monitor.target("ap-1").unwrap().status() == TargetStatus::Unknown {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(monitor.target("ap-1").unwrap().status(), TargetStatus::Unknown);
        let last = &monitor.transitions(Some("ap-1"), 1)[0];
        assert_eq!((last.from, last.to), (TargetStatus::Up, TargetStatus::Unknown));
    }
}
