// src/registry/events.rs

//! Append-only audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::model::{Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskSetCreated,
    StateChanged,
    DependenciesChanged,
    ArtifactAdded,
    TaskAssigned,
    /// A failed attempt was counted and the task was requeued with backoff.
    TaskRetry,
    /// Terminal failure; retries are exhausted.
    TaskFailed,
    RunnerTimeout,
    DeadlockDetected,
    RoutingBlocked,
    SlotQuarantined,
    TaskSetArchived,
    /// Free-form kind recorded by external reporters.
    Custom(String),
}

impl EventKind {
    /// Standing warnings an operator is expected to act on.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EventKind::DeadlockDetected | EventKind::RoutingBlocked | EventKind::SlotQuarantined
        )
    }
}

/// Immutable event record.
///
/// Events produced by registry mutations carry the task snapshot after the
/// change (`detail.task`) and the resulting set version
/// (`detail.set_version`), which is what makes replay possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub task_set: String,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl TaskEvent {
    pub fn new(kind: EventKind, task_set: &str, task_id: &str, detail: serde_json::Value) -> Self {
        Self {
            kind,
            task_set: task_set.to_string(),
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            detail,
        }
    }

    /// Event describing a task write, carrying the post-write snapshot.
    pub(crate) fn snapshot(
        kind: EventKind,
        task_set: &str,
        task: &Task,
        set_version: u64,
        mut extra: serde_json::Map<String, serde_json::Value>,
    ) -> crate::errors::Result<Self> {
        extra.insert("task".to_string(), serde_json::to_value(task)?);
        extra.insert("set_version".to_string(), serde_json::Value::from(set_version));
        Ok(Self::new(
            kind,
            task_set,
            &task.id,
            serde_json::Value::Object(extra),
        ))
    }

    /// Task snapshot embedded in this event, if any.
    pub fn task_snapshot(&self) -> Option<Task> {
        self.detail
            .get("task")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set_version(&self) -> Option<u64> {
        self.detail.get("set_version").and_then(|v| v.as_u64())
    }
}
