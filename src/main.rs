//! netmon binary.
//!
//! Reads samples, network reports and device modes from stdin, one JSON
//! object per line, and keeps per-target health state, transitions, alerts
//! and snapshots.

use netmon::config::ServerConfig;
use netmon::db::{Repository, Store, TRANSITION_PREFIX};
use netmon::ingest::LineIngestor;
use netmon::monitor::Monitor;
use netmon::scheduler::Scheduler;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netmon=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!(
        "Database initialized ({} bytes, {} transitions, {} snapshots)",
        store.get_db_size_bytes()?,
        store.count(TRANSITION_PREFIX)?,
        store.snapshot_history_count()?
    );

    let monitor = Arc::new(Monitor::new(cfg.engine));
    if let Err(e) = monitor.restore_from(store.as_ref()) {
        tracing::warn!("Could not restore previous state: {}", e);
    }

    let repo: Arc<dyn Repository> = store;
    let scheduler = Scheduler::start(monitor.clone(), repo)?;

    let ingestor = LineIngestor::new(monitor.clone());
    let stdin = BufReader::new(tokio::io::stdin());

    let run = async {
        match ingestor.ingest_lines(stdin).await {
            Ok(summary) => tracing::info!(
                "Input closed after {} lines ({} accepted, {} rejected, {} invalid)",
                summary.lines,
                summary.accepted,
                summary.rejected,
                summary.invalid
            ),
            Err(e) => tracing::error!("Failed to read input: {}", e),
        }
        wait_for_drain(&monitor).await;
    };

    tokio::select! {
        _ = run => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt");
        }
    }

    let report = scheduler.shutdown().await;
    let health = monitor.health();
    tracing::info!(
        "Final state: {} targets, {} samples processed, {} malformed, {} transitions, storage {:?}",
        health.targets,
        health.counters.processed,
        health.counters.malformed,
        health.transitions_total,
        report.storage
    );
    for (status, count) in &health.statuses {
        tracing::info!("Final state: {} {}", count, status);
    }
    for alert in monitor.alerts(true, health.open_alerts) {
        tracing::warn!(
            "Open alert: {} for {} since {} ({})",
            alert.kind,
            alert.target_id,
            alert.opened_at,
            alert.message
        );
    }

    Ok(())
}

/// Wait until the workers have taken every queued sample.
async fn wait_for_drain(monitor: &Monitor) {
    while monitor.queue().depth() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
