//! Database module for netmon.
//!
//! The engine only sees the [`Repository`] trait: keyed JSON records with
//! prefix listing. SQLite backs it in production, an in-memory map in tests.

#[cfg(test)]
mod memory;
mod models;
mod store;

#[cfg(test)]
pub use memory::*;
pub use models::*;
pub use store::*;

/// Durable key/value storage the engine writes transitions and snapshots to.
pub trait Repository: Send + Sync {
    /// Insert or replace the record stored under `key`.
    fn put(&self, key: &str, value: &str) -> Result<(), DbError>;

    /// Fetch a record by key.
    fn get(&self, key: &str) -> Result<Option<Record>, DbError>;

    /// List records whose key starts with `prefix`, in key order.
    fn list(&self, prefix: &str) -> Result<Vec<Record>, DbError>;

    /// Remove records under `prefix` whose key sorts before `upper`.
    fn remove_before(&self, prefix: &str, upper: &str) -> Result<usize, DbError>;
}
