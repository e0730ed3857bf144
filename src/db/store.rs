//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::Repository;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.lock()?;
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        for migration in report.applied_migrations() {
            tracing::info!("Applied migration {}", migration);
        }

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Get database size in bytes.
    pub fn get_db_size_bytes(&self) -> Result<i64, DbError> {
        let conn = self.lock()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }

    /// Count records under a key prefix.
    pub fn count(&self, prefix: &str) -> Result<i64, DbError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM records WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
            |r| r.get(0),
        )?)
    }

    /// Count persisted snapshot history, not counting the latest-snapshot record.
    pub fn snapshot_history_count(&self) -> Result<i64, DbError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM records WHERE substr(key, 1, length(?1)) = ?1 AND key != ?2",
            params![SNAPSHOT_PREFIX, LATEST_SNAPSHOT_KEY],
            |r| r.get(0),
        )?)
    }
}

impl Repository for Store {
    fn put(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO records (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
            params![key, value, format_db_time(Utc::now())],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Record>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value, updated_at FROM records WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], row_to_record)?;
        let record = rows.next().transpose()?;
        Ok(record)
    }

    fn list(&self, prefix: &str) -> Result<Vec<Record>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, value, updated_at FROM records
             WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
        )?;

        let records = stmt
            .query_map(params![prefix], row_to_record)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    fn remove_before(&self, prefix: &str, upper: &str) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM records WHERE substr(key, 1, length(?1)) = ?1 AND key < ?2",
            params![prefix, upper],
        )?;
        Ok(removed)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> SqlResult<Record> {
    let time_str: String = row.get(2)?;
    Ok(Record {
        key: row.get(0)?,
        value: row.get(1)?,
        updated_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
    })
}

fn format_db_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = ["%Y-%m-%d %H:%M:%S%.9f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
