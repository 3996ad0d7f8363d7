// src/slots/model.rs

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::CorruptionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Available,
    Allocated,
    /// Pre- or post-use cleanup in progress.
    Cleaning,
    /// Failed integrity or cleanup; excluded until repaired.
    Error,
}

/// A reusable working directory.
///
/// The state field is this process's view. The slot lease is what actually
/// decides ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: String,
    pub pool: String,
    pub path: PathBuf,
    pub state: SlotState,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub allocation_count: u64,
    pub last_allocated_at: Option<DateTime<Utc>>,
    pub last_released_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Slot {
    pub fn new(id: String, pool: &str, path: PathBuf) -> Self {
        Self {
            id,
            pool: pool.to_string(),
            path,
            state: SlotState::Available,
            branch: None,
            commit: None,
            allocation_count: 0,
            last_allocated_at: None,
            last_released_at: None,
            error: None,
        }
    }
}

/// A group of slots backed by one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSpec {
    pub name: String,
    /// Clone source used when re-provisioning a corrupted slot.
    pub repository: Option<String>,
    /// What cleanup resets each slot to (e.g. `origin/main`).
    pub reference: String,
    pub slots: Vec<PathBuf>,
    pub on_corruption: CorruptionPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub pool: String,
    pub available: usize,
    pub allocated: usize,
    pub cleaning: usize,
    pub error: usize,
}

impl PoolSummary {
    pub fn total(&self) -> usize {
        self.available + self.allocated + self.cleaning + self.error
    }
}

/// A slot was taken out of service. The dispatcher turns these into
/// `SlotQuarantined` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotNotice {
    pub slot_id: String,
    pub pool: String,
    pub reason: String,
}
