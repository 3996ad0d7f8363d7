// src/registry/model.rs

//! Durable task and task-set records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task identifier, unique within its task set (e.g. `"1.2"`).
pub type TaskId = String;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on at least one dependency that is not `Done`.
    Blocked,
    /// All dependencies are `Done`; eligible for dispatch once `ready_at`
    /// has passed.
    Ready,
    /// Assigned to a slot and a runner.
    Running,
    Done,
    /// Terminal failure after the retry budget was exhausted.
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

/// Reference to something a task produced. The registry never dereferences it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: String,
    pub uri: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub added_at: DateTime<Utc>,
}

/// One task as declared in a task-set definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Capability tag used for pool routing.
    #[serde(default)]
    pub capability: Option<String>,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: i64,
    /// Bookkeeping only; optional tasks are scheduled like any other.
    #[serde(default)]
    pub optional: bool,
}

/// Side information accompanying a state transition.
///
/// `Ready -> Running` requires `slot_id`, `branch` and `runner_id` together.
/// `Running -> Failed` may carry an `error` description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionMetadata {
    pub slot_id: Option<String>,
    pub branch: Option<String>,
    pub runner_id: Option<String>,
    pub error: Option<String>,
}

impl TransitionMetadata {
    pub fn assignment(slot_id: &str, branch: &str, runner_id: &str) -> Self {
        Self {
            slot_id: Some(slot_id.to_string()),
            branch: Some(branch.to_string()),
            runner_id: Some(runner_id.to_string()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// A task as stored by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub state: TaskState,
    pub depends_on: Vec<TaskId>,
    pub capability: Option<String>,
    pub priority: i64,
    pub optional: bool,
    pub slot_id: Option<String>,
    pub branch: Option<String>,
    pub runner_id: Option<String>,
    pub retry_count: u32,
    /// Bumped by exactly one on every successful write to this task.
    pub version: u64,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Position in the original definition; breaks creation-time ties.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Not-before instant for dispatch; set by retry backoff.
    pub ready_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Task {
    pub fn from_definition(def: &TaskDefinition, seq: u64, now: DateTime<Utc>) -> Self {
        let state = if def.depends_on.is_empty() {
            TaskState::Ready
        } else {
            TaskState::Blocked
        };

        Self {
            id: def.id.clone(),
            title: if def.title.is_empty() {
                def.id.clone()
            } else {
                def.title.clone()
            },
            description: def.description.clone(),
            state,
            depends_on: def.depends_on.clone(),
            capability: def.capability.clone(),
            priority: def.priority,
            optional: def.optional,
            slot_id: None,
            branch: None,
            runner_id: None,
            retry_count: 0,
            version: 1,
            artifacts: Vec::new(),
            seq,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            ready_at: None,
            last_error: None,
        }
    }

    /// Whether the backoff window (if any) has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.ready_at.is_none_or(|at| at <= now)
    }

    pub(crate) fn clear_assignment(&mut self) {
        self.slot_id = None;
        self.branch = None;
        self.runner_id = None;
    }
}

/// Named, versioned collection of tasks sharing one dependency namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSet {
    pub name: String,
    /// Incremented on every successful mutation of the set.
    pub version: u64,
    pub tasks: BTreeMap<TaskId, Task>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskSet {
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks in creation order.
    pub fn tasks_in_order(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        tasks
    }

    /// Whether every dependency of `task` is `Done`.
    ///
    /// A dependency id that is missing from the set counts as unsatisfied.
    pub fn deps_done(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.state == TaskState::Done)
        })
    }

    /// Number of tasks in each state, for status output.
    pub fn state_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(format!("{:?}", task.state)).or_insert(0) += 1;
        }
        counts
    }
}
