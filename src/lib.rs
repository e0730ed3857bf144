//! netmon - network monitoring ingestion and state-aggregation engine.
//!
//! - **[`monitor`]**: the [`monitor::Monitor`] facade over the ingest queue,
//!   target state, transition detection, alerts and snapshots
//! - **[`scheduler`]**: worker pool, background tasks and durable writes
//! - **[`db`]**: the [`db::Repository`] trait and its SQLite store
//! - **[`ingest`]**: the collector line protocol
//! - **[`config`]**: environment configuration

pub mod config;
pub mod db;
pub mod ingest;
pub mod monitor;
pub mod scheduler;
