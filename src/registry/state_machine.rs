// src/registry/state_machine.rs

//! Pure task state transitions.
//!
//! Nothing in here touches storage or leases. The registry loads a set,
//! calls [`apply_transition`] on it and persists the result.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::{Result, SlotdagError};
use crate::registry::graph::DependencyGraph;
use crate::registry::model::{TaskId, TaskSet, TaskState, TransitionMetadata};

/// Retry budget and backoff applied on `Running -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `retry_count` may be dispatched.
    pub fn backoff(&self, retry_count: u32) -> chrono::Duration {
        let secs = self.backoff_base.powi(retry_count as i32);
        if !secs.is_finite() || secs <= 0.0 {
            return chrono::Duration::zero();
        }
        let millis = (secs * 1000.0).min(i64::MAX as f64) as i64;
        chrono::Duration::try_milliseconds(millis).unwrap_or(chrono::Duration::MAX)
    }
}

/// What a transition ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionEffect {
    /// The requested state was applied as asked.
    Applied,
    /// A failure was absorbed by the retry budget; the task is `Ready` again.
    Retried {
        retry_count: u32,
        ready_at: DateTime<Utc>,
    },
    /// A failure with no budget left; the task is terminally `Failed`.
    Exhausted { retries: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub effect: TransitionEffect,
    /// Blocked dependents that became `Ready` in the same write.
    pub promoted: Vec<TaskId>,
}

fn reject(task: &str, from: TaskState, to: TaskState, reason: &str) -> SlotdagError {
    SlotdagError::Transition {
        task: task.to_string(),
        from,
        to,
        reason: reason.to_string(),
    }
}

/// Check and apply one transition to `set` in place.
///
/// Task versions are bumped here (the target and every promoted
/// dependent); the set version is left to the caller.
pub fn apply_transition(
    set: &mut TaskSet,
    id: &str,
    to: TaskState,
    metadata: Option<&TransitionMetadata>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let task = set.tasks.get(id).ok_or_else(|| SlotdagError::TaskNotFound {
        set: set.name.clone(),
        task: id.to_string(),
    })?;
    let from = task.state;
    let deps_done = set.deps_done(task);

    let effect = match (from, to) {
        (TaskState::Blocked, TaskState::Ready) => {
            if !deps_done {
                return Err(reject(id, from, to, "dependencies are not all done"));
            }
            TransitionEffect::Applied
        }
        (TaskState::Ready, TaskState::Running) => {
            if !deps_done {
                return Err(reject(id, from, to, "dependencies are not all done"));
            }
            let complete = metadata.is_some_and(|m| {
                m.slot_id.is_some() && m.branch.is_some() && m.runner_id.is_some()
            });
            if !complete {
                return Err(reject(
                    id,
                    from,
                    to,
                    "slot, branch and runner must be supplied together",
                ));
            }
            TransitionEffect::Applied
        }
        (TaskState::Running, TaskState::Done) => TransitionEffect::Applied,
        (TaskState::Running, TaskState::Failed) => {
            if task.retry_count < policy.max_retries {
                let retry_count = task.retry_count + 1;
                TransitionEffect::Retried {
                    retry_count,
                    ready_at: now + policy.backoff(retry_count),
                }
            } else {
                TransitionEffect::Exhausted {
                    retries: task.retry_count,
                }
            }
        }
        _ => return Err(reject(id, from, to, "transition not allowed")),
    };

    {
        let Some(task) = set.tasks.get_mut(id) else {
            return Err(SlotdagError::TaskNotFound {
                set: set.name.clone(),
                task: id.to_string(),
            });
        };
        task.version += 1;
        task.updated_at = now;

        match &effect {
            TransitionEffect::Applied => {
                task.state = to;
                match to {
                    TaskState::Running => {
                        if let Some(meta) = metadata {
                            task.slot_id = meta.slot_id.clone();
                            task.branch = meta.branch.clone();
                            task.runner_id = meta.runner_id.clone();
                        }
                        task.started_at = Some(now);
                        task.ready_at = None;
                    }
                    TaskState::Done => {
                        task.finished_at = Some(now);
                        task.last_error = None;
                    }
                    _ => {}
                }
            }
            TransitionEffect::Retried {
                retry_count,
                ready_at,
            } => {
                task.state = TaskState::Ready;
                task.retry_count = *retry_count;
                task.ready_at = Some(*ready_at);
                task.last_error = metadata.and_then(|m| m.error.clone());
                task.clear_assignment();
            }
            TransitionEffect::Exhausted { .. } => {
                task.state = TaskState::Failed;
                task.finished_at = Some(now);
                task.last_error = metadata.and_then(|m| m.error.clone());
            }
        }
    }

    let promoted = if to == TaskState::Done {
        promote_dependents(set, id, now)
    } else {
        Vec::new()
    };

    debug!(
        task_set = %set.name,
        task = %id,
        ?from,
        ?to,
        ?effect,
        promoted = promoted.len(),
        "transition applied"
    );

    Ok(TransitionOutcome { effect, promoted })
}

/// Move `Blocked` dependents of `done` whose dependencies are now all
/// `Done` to `Ready`.
fn promote_dependents(set: &mut TaskSet, done: &str, now: DateTime<Utc>) -> Vec<TaskId> {
    let graph = DependencyGraph::from_set(set);
    let mut candidates: Vec<TaskId> = graph
        .dependents_of(done)
        .iter()
        .filter(|dep| {
            set.get(dep)
                .is_some_and(|t| t.state == TaskState::Blocked && set.deps_done(t))
        })
        .cloned()
        .collect();
    candidates.sort();

    for dep in &candidates {
        if let Some(task) = set.tasks.get_mut(dep) {
            task.state = TaskState::Ready;
            task.version += 1;
            task.updated_at = now;
        }
    }
    candidates
}

/// State a task should take after its dependency list changed.
///
/// Only `Blocked` and `Ready` tasks may have their dependencies edited.
pub fn state_after_dependency_edit(set: &TaskSet, id: &str) -> Result<TaskState> {
    let task = set.get(id).ok_or_else(|| SlotdagError::TaskNotFound {
        set: set.name.clone(),
        task: id.to_string(),
    })?;
    Ok(if set.deps_done(task) {
        TaskState::Ready
    } else {
        TaskState::Blocked
    })
}
