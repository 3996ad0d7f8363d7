// src/lease/memory.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use super::{LeaseManager, LeaseRecord};
use crate::errors::Result;

/// In-process lease table.
///
/// Clones share the same table, so several managers (or several simulated
/// dispatcher "processes") can contend on one instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseManager {
    leases: Arc<Mutex<HashMap<String, LeaseRecord>>>,
}

impl MemoryLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the lease on `key` was taken `age` ago.
    ///
    /// Used to simulate holders that crashed without releasing.
    pub fn backdate(&self, key: &str, age: Duration) {
        let mut leases = self.table();
        if let Some(record) = leases.get_mut(key) {
            let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());
            record.acquired_at -= age;
            if let Some(renewed) = record.renewed_at.as_mut() {
                *renewed -= age;
            }
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, LeaseRecord>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LeaseManager for MemoryLeaseManager {
    fn try_acquire(&self, key: &str, holder: &str) -> Result<bool> {
        let mut leases = self.table();
        if leases.contains_key(key) {
            return Ok(false);
        }
        leases.insert(key.to_string(), LeaseRecord::new(key, holder));
        Ok(true)
    }

    fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut leases = self.table();
        match leases.get(key) {
            Some(record) if record.holder == holder => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn renew(&self, key: &str, holder: &str) -> Result<bool> {
        match self.table().get_mut(key) {
            Some(record) if record.holder == holder => {
                record.renewed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn holder_of(&self, key: &str) -> Result<Option<LeaseRecord>> {
        Ok(self.table().get(key).cloned())
    }

    fn force_reclaim(&self, key: &str) -> Result<Option<LeaseRecord>> {
        Ok(self.table().remove(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<LeaseRecord>> {
        let mut records: Vec<LeaseRecord> = self
            .table()
            .values()
            .filter(|record| record.key.starts_with(prefix))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}
