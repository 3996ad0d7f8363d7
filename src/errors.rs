// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::registry::TaskState;

#[derive(Error, Debug)]
pub enum SlotdagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed task or dependency definitions, rejected at ingest.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task set not found: {0}")]
    TaskSetNotFound(String),

    #[error("Task not found: {set}/{task}")]
    TaskNotFound { set: String, task: String },

    #[error("Illegal transition for task {task}: {from:?} -> {to:?} ({reason})")]
    Transition {
        task: String,
        from: TaskState,
        to: TaskState,
        reason: String,
    },

    /// Version mismatch on write. The caller must re-read and reapply intent.
    #[error("Concurrency conflict on {set}/{task}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        set: String,
        task: String,
        expected: u64,
        actual: u64,
    },

    #[error("Timed out acquiring lock '{0}'")]
    LockTimeout(String),

    #[error("No slot available in pool '{0}'")]
    NoSlotAvailable(String),

    #[error("Slot {slot} failed integrity check: {reason}")]
    SlotCorruption { slot: String, reason: String },

    #[error("Slot {0} is busy")]
    SlotBusy(String),

    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Dependency cycle among blocked tasks in '{set}': {cycle}")]
    DeadlockDetected { set: String, cycle: String },

    #[error("Runner {runner} for task {task} missed its heartbeat for {elapsed_ms} ms")]
    RunnerTimeout {
        runner: String,
        task: String,
        elapsed_ms: i64,
    },

    #[error("Task {task} exhausted its retry budget after {retries} retries")]
    RetryExhausted { task: String, retries: u32 },

    #[error("Runner launch failed: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SlotdagError {
    /// Infrastructure errors that are worth retrying locally a bounded number
    /// of times. Everything else needs an external correction.
    pub fn is_transient(&self) -> bool {
        matches!(self, SlotdagError::LockTimeout(_) | SlotdagError::IoError(_))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SlotdagError>;
