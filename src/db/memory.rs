//! In-memory repository.
//!
//! Test double for the SQLite store. It can be switched offline to exercise
//! the engine's degraded storage mode.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::models::Record;
use super::{DbError, Repository};

/// Repository backed by a sorted map.
#[derive(Debug)]
pub struct MemoryRepository {
    records: Mutex<BTreeMap<String, Record>>,
    available: AtomicBool,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the storage backend going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    fn check(&self) -> Result<(), DbError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::Unavailable("memory repository offline".to_string()))
        }
    }
}

impl Repository for MemoryRepository {
    fn put(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.check()?;
        self.records.lock().insert(
            key.to_string(),
            Record {
                key: key.to_string(),
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Record>, DbError> {
        self.check()?;
        Ok(self.records.lock().get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<Record>, DbError> {
        self.check()?;
        let records = self.records.lock();
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn remove_before(&self, prefix: &str, upper: &str) -> Result<usize, DbError> {
        self.check()?;
        if upper <= prefix {
            return Ok(0);
        }
        let mut records = self.records.lock();
        let doomed: Vec<String> = records
            .range(prefix.to_string()..upper.to_string())
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            records.remove(key);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_listing() {
        let repo = MemoryRepository::new();
        repo.put("snapshot/a", "1").unwrap();
        repo.put("snapshot/b", "2").unwrap();
        repo.put("transition/a", "3").unwrap();

        let keys: Vec<String> = repo.list("snapshot/").unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["snapshot/a", "snapshot/b"]);
        assert_eq!(repo.remove_before("snapshot/", "snapshot/b").unwrap(), 1);
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn test_offline_rejects_everything() {
        let repo = MemoryRepository::new();
        repo.set_available(false);
        assert!(matches!(repo.put("k", "v"), Err(DbError::Unavailable(_))));
        assert!(repo.get("k").is_err());

        repo.set_available(true);
        repo.put("k", "v").unwrap();
        assert_eq!(repo.len(), 1);
    }
}
