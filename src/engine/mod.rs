// src/engine/mod.rs

//! Dispatcher: the polling scheduler that moves tasks from the registry into
//! slots and runners.
//!
//! This module ties together:
//! - the ready queue and scheduling policies ([`queue`])
//! - pool routing and admission control ([`routing`])
//! - the pure per-tick planner ([`core`])
//! - the async shell that applies plans and reacts to runner signals
//!   ([`runtime`])

use chrono::{DateTime, Utc};

use crate::registry::TaskId;

/// Identifier handed out by a launcher for one runner instance.
pub type RunnerId = String;

/// Fully qualified task reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub set: String,
    pub id: TaskId,
}

impl TaskKey {
    pub fn new(set: &str, id: &str) -> Self {
        Self {
            set: set.to_string(),
            id: id.to_string(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.set, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Running,
    Completed,
    Failed,
}

/// A launched runner the dispatcher is monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerHandle {
    pub id: RunnerId,
    pub key: TaskKey,
    /// Agent pool that admitted the runner.
    pub pool: String,
    pub slot_id: String,
    pub state: RunnerState,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Answer to a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerStatus {
    Running,
    Completed,
    Failed(String),
}

/// Signals flowing into the dispatcher from launchers and the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// The runner is alive.
    Heartbeat { runner_id: RunnerId },
    /// The runner finished its task successfully.
    RunnerCompleted { runner_id: RunnerId },
    /// The runner finished unsuccessfully.
    RunnerFailed { runner_id: RunnerId, reason: String },
    /// Stop taking new work and drain (e.g. Ctrl-C).
    ShutdownRequested,
}

/// Options for the dispatcher loop itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Exit once nothing is queued, running or waiting out a backoff
    /// (used for `--once`).
    pub exit_when_idle: bool,
    /// Plan and log assignments without allocating or launching anything.
    pub dry_run: bool,
}

/// Branch name recorded for a task's assignment.
pub fn branch_name(key: &TaskKey) -> String {
    format!("slotdag/{}/{}", key.set, key.id)
}

pub mod core;
pub mod queue;
pub mod routing;
pub mod runtime;

pub use core::{Action, DispatchCore, TickPlan};
pub use queue::{FairShareWindow, QueuedTask, ReadyQueue};
pub use routing::{PoolLoads, Router};
pub use runtime::{Dispatcher, ShutdownReport, TickReport};
