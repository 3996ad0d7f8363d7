// src/registry/mod.rs

//! Durable task sets: state machine, dependency resolution, versioned
//! persistence and the append-only event log.
//!
//! Every write follows the same shape:
//!
//! 1. take the `set-<name>` lease (bounded wait, bounded retries),
//! 2. load the freshest record from the store,
//! 3. check the caller's expected version and the requested transition,
//! 4. mutate, bump task and set versions,
//! 5. save the record, then append the events describing the write,
//! 6. release the lease.
//!
//! Reads go straight to the store; saves are atomic so a reader always sees
//! a complete record.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{Result, SlotdagError};
use crate::lease::{FileLeaseManager, LeaseManager, MemoryLeaseManager, set_key};

pub mod events;
pub mod graph;
pub mod ingest;
pub mod model;
pub mod state_machine;
pub mod store;

pub use events::{EventKind, TaskEvent};
pub use graph::{DependencyGraph, find_blocked_cycles, validate_definitions};
pub use ingest::{TaskSetDefinition, load_task_set_definition};
pub use model::{Artifact, Task, TaskDefinition, TaskId, TaskSet, TaskState, TransitionMetadata};
pub use state_machine::{RetryPolicy, TransitionEffect, TransitionOutcome};
pub use store::{FileTaskStore, MemoryTaskStore, TaskStore};

/// Tunables for registry writes.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryOptions {
    pub retry: RetryPolicy,
    /// Longest single wait for a set lease.
    pub lock_timeout: Duration,
    /// Extra acquisition attempts after the first one timed out.
    pub lock_retries: u32,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lock_timeout: Duration::from_secs(2),
            lock_retries: 3,
        }
    }
}

#[derive(Debug)]
pub struct TaskRegistry {
    store: Arc<dyn TaskStore>,
    leases: Arc<dyn LeaseManager>,
    holder: String,
    options: RegistryOptions,
}

impl TaskRegistry {
    pub fn new(
        store: Arc<dyn TaskStore>,
        leases: Arc<dyn LeaseManager>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            store,
            leases,
            holder: format!("registry-{}", Uuid::new_v4()),
            options,
        }
    }

    /// File-backed registry rooted at `state_dir`, with leases under
    /// `state_dir/locks`.
    pub fn open(state_dir: &Path, options: RegistryOptions) -> Self {
        Self::new(
            Arc::new(FileTaskStore::new(state_dir)),
            Arc::new(FileLeaseManager::new(state_dir.join("locks"))),
            options,
        )
    }

    pub fn in_memory(options: RegistryOptions) -> Self {
        Self::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemoryLeaseManager::new()),
            options,
        )
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Lease holder id used by this registry instance.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Ingest a new task set.
    pub fn create_task_set(&self, name: &str, defs: &[TaskDefinition]) -> Result<TaskSet> {
        validate_set_name(name)?;
        validate_definitions(defs)?;

        self.with_set_lock(name, || {
            if self.store.load(name)?.is_some() {
                return Err(SlotdagError::Validation(format!(
                    "task set '{name}' already exists"
                )));
            }

            let now = Utc::now();
            let tasks = defs
                .iter()
                .enumerate()
                .map(|(seq, def)| (def.id.clone(), Task::from_definition(def, seq as u64, now)))
                .collect();
            let set = TaskSet {
                name: name.to_string(),
                version: 1,
                tasks,
                created_at: now,
                updated_at: now,
            };

            let event = TaskEvent::new(
                EventKind::TaskSetCreated,
                name,
                "",
                json!({ "set": set, "set_version": set.version }),
            );
            self.store.save(&set)?;
            self.store.append_events(name, &[event])?;

            info!(
                task_set = %name,
                tasks = set.tasks.len(),
                ready = set.tasks.values().filter(|t| t.state == TaskState::Ready).count(),
                "task set created"
            );
            Ok(set)
        })
    }

    /// Apply a state transition under optimistic concurrency.
    ///
    /// Returns the task's new version.
    pub fn update_task_state(
        &self,
        name: &str,
        id: &str,
        new_state: TaskState,
        expected_version: u64,
        metadata: Option<TransitionMetadata>,
    ) -> Result<u64> {
        self.update_task_state_at(name, id, new_state, expected_version, metadata, Utc::now())
    }

    /// [`update_task_state`](Self::update_task_state) with an explicit clock.
    pub fn update_task_state_at(
        &self,
        name: &str,
        id: &str,
        new_state: TaskState,
        expected_version: u64,
        metadata: Option<TransitionMetadata>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.with_set_lock(name, || {
            let mut set = self.load_required(name)?;
            let task = require_task(&set, id)?;
            check_version(name, id, expected_version, task.version)?;
            let from = task.state;

            let outcome = state_machine::apply_transition(
                &mut set,
                id,
                new_state,
                metadata.as_ref(),
                &self.options.retry,
                now,
            )?;
            bump_set(&mut set, now);

            let error_text = metadata.as_ref().and_then(|m| m.error.clone());
            let mut events = Vec::with_capacity(1 + outcome.promoted.len());
            let task = require_task(&set, id)?;

            match &outcome.effect {
                TransitionEffect::Applied => {
                    events.push(TaskEvent::snapshot(
                        EventKind::StateChanged,
                        name,
                        task,
                        set.version,
                        extra(json!({ "from": from, "to": task.state })),
                    )?);
                    info!(task_set = %name, task = %id, ?from, to = ?task.state, "task state changed");
                }
                TransitionEffect::Retried {
                    retry_count,
                    ready_at,
                } => {
                    events.push(TaskEvent::snapshot(
                        EventKind::TaskRetry,
                        name,
                        task,
                        set.version,
                        extra(json!({
                            "from": from,
                            "to": task.state,
                            "retry_count": retry_count,
                            "ready_at": ready_at,
                            "error": error_text,
                        })),
                    )?);
                    warn!(
                        task_set = %name,
                        task = %id,
                        retry_count,
                        max_retries = self.options.retry.max_retries,
                        %ready_at,
                        error = ?error_text,
                        "task failed; requeued with backoff"
                    );
                }
                TransitionEffect::Exhausted { retries } => {
                    let reason = SlotdagError::RetryExhausted {
                        task: id.to_string(),
                        retries: *retries,
                    }
                    .to_string();
                    events.push(TaskEvent::snapshot(
                        EventKind::TaskFailed,
                        name,
                        task,
                        set.version,
                        extra(json!({
                            "from": from,
                            "to": task.state,
                            "retries": retries,
                            "reason": reason,
                            "error": error_text,
                        })),
                    )?);
                    error!(task_set = %name, task = %id, retries, error = ?error_text, "{reason}");
                }
            }

            for promoted in &outcome.promoted {
                let dependent = require_task(&set, promoted)?;
                events.push(TaskEvent::snapshot(
                    EventKind::StateChanged,
                    name,
                    dependent,
                    set.version,
                    extra(json!({
                        "from": TaskState::Blocked,
                        "to": TaskState::Ready,
                        "cause": id,
                    })),
                )?);
                debug!(task_set = %name, task = %promoted, cause = %id, "dependent promoted to ready");
            }

            let version = task.version;
            self.commit(&set, &events)?;
            Ok(version)
        })
    }

    /// Attach an artifact reference to a task. The reference is recorded
    /// as given; nothing is fetched.
    pub fn add_artifact(
        &self,
        name: &str,
        id: &str,
        kind: &str,
        uri: &str,
        metadata: Option<Value>,
    ) -> Result<u64> {
        self.with_set_lock(name, || {
            let mut set = self.load_required(name)?;
            let now = Utc::now();
            let artifact = Artifact {
                kind: kind.to_string(),
                uri: uri.to_string(),
                metadata: metadata.clone().unwrap_or(Value::Null),
                added_at: now,
            };

            let task = require_task_mut(&mut set, id)?;
            task.artifacts.push(artifact.clone());
            task.version += 1;
            task.updated_at = now;
            bump_set(&mut set, now);

            let task = require_task(&set, id)?;
            let event = TaskEvent::snapshot(
                EventKind::ArtifactAdded,
                name,
                task,
                set.version,
                extra(json!({ "artifact": artifact })),
            )?;
            let version = task.version;
            self.commit(&set, &[event])?;

            debug!(task_set = %name, task = %id, kind, uri, "artifact added");
            Ok(version)
        })
    }

    /// Append a free-form event. The task set must exist; the task id is
    /// not checked so that set-wide events can use an empty id.
    pub fn record_event(&self, name: &str, id: &str, kind: EventKind, detail: Value) -> Result<()> {
        self.with_set_lock(name, || {
            self.load_required(name)?;
            let event = TaskEvent::new(kind, name, id, detail);
            if event.kind.is_warning() {
                warn!(task_set = %name, task = %id, kind = ?event.kind, detail = %event.detail, "warning recorded");
            } else {
                debug!(task_set = %name, task = %id, kind = ?event.kind, "event recorded");
            }
            self.store.append_events(name, &[event])
        })
    }

    /// Replace a task's dependency list.
    ///
    /// Only `Blocked` and `Ready` tasks can be edited. The task ends up
    /// `Ready` iff every new dependency is `Done`. Cycles are accepted here
    /// and surface later through [`find_blocked_cycles`](Self::find_blocked_cycles).
    pub fn set_dependencies(
        &self,
        name: &str,
        id: &str,
        depends_on: Vec<TaskId>,
        expected_version: u64,
    ) -> Result<u64> {
        self.with_set_lock(name, || {
            let mut set = self.load_required(name)?;
            let task = require_task(&set, id)?;
            check_version(name, id, expected_version, task.version)?;

            let from = task.state;
            if !matches!(from, TaskState::Blocked | TaskState::Ready) {
                return Err(SlotdagError::Transition {
                    task: id.to_string(),
                    from,
                    to: from,
                    reason: "dependencies can only be edited on blocked or ready tasks".to_string(),
                });
            }
            graph::validate_dependency_list(id, &depends_on, |dep| set.tasks.contains_key(dep))?;

            let now = Utc::now();
            require_task_mut(&mut set, id)?.depends_on = depends_on.clone();
            let to = state_machine::state_after_dependency_edit(&set, id)?;

            let task = require_task_mut(&mut set, id)?;
            task.state = to;
            task.version += 1;
            task.updated_at = now;
            bump_set(&mut set, now);

            let task = require_task(&set, id)?;
            let event = TaskEvent::snapshot(
                EventKind::DependenciesChanged,
                name,
                task,
                set.version,
                extra(json!({ "depends_on": depends_on, "from": from, "to": to })),
            )?;
            let version = task.version;
            self.commit(&set, &[event])?;

            info!(task_set = %name, task = %id, ?from, ?to, deps = ?depends_on, "dependencies changed");
            Ok(version)
        })
    }

    /// Move a task set out of the active namespace. Its event log stays.
    pub fn archive_task_set(&self, name: &str) -> Result<()> {
        self.with_set_lock(name, || {
            let set = self.load_required(name)?;
            let event = TaskEvent::new(
                EventKind::TaskSetArchived,
                name,
                "",
                json!({ "set_version": set.version, "counts": set.state_counts() }),
            );
            self.store.append_events(name, &[event])?;
            self.store.archive(name)?;
            info!(task_set = %name, "task set archived");
            Ok(())
        })
    }

    /// Rebuild the set from the log and overwrite the stored record.
    pub fn restore_from_events(&self, name: &str) -> Result<TaskSet> {
        self.with_set_lock(name, || {
            let set = self.rebuild_from_events(name)?;
            self.store.save(&set)?;
            warn!(task_set = %name, version = set.version, "task set restored from event log");
            Ok(set)
        })
    }

    /// Force-reclaim set leases older than `max_age`. Returns the keys.
    pub fn sweep_stale_locks(&self, max_age: Duration) -> Result<Vec<String>> {
        let mut reclaimed = Vec::new();
        for record in self.leases.stale("set-", max_age)? {
            if self.leases.force_reclaim(&record.key)?.is_some() {
                warn!(
                    lease = %record.key,
                    holder = %record.holder,
                    acquired_at = %record.acquired_at,
                    "reclaimed stale task-set lease"
                );
                reclaimed.push(record.key);
            }
        }
        Ok(reclaimed)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Dispatchable tasks: `Ready`, dependencies `Done`, backoff elapsed,
    /// optionally restricted to one capability. Creation order.
    pub fn get_ready_tasks(&self, name: &str, capability: Option<&str>) -> Result<Vec<Task>> {
        self.get_ready_tasks_at(name, capability, Utc::now())
    }

    pub fn get_ready_tasks_at(
        &self,
        name: &str,
        capability: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let set = self.load_required(name)?;
        Ok(set
            .tasks_in_order()
            .into_iter()
            .filter(|t| t.state == TaskState::Ready)
            .filter(|t| set.deps_done(t))
            .filter(|t| t.is_due(now))
            .filter(|t| capability.is_none_or(|cap| t.capability.as_deref() == Some(cap)))
            .cloned()
            .collect())
    }

    pub fn get_task(&self, name: &str, id: &str) -> Result<Task> {
        let set = self.load_required(name)?;
        require_task(&set, id).cloned()
    }

    pub fn get_task_set(&self, name: &str) -> Result<TaskSet> {
        self.load_required(name)
    }

    pub fn list_task_sets(&self) -> Result<Vec<String>> {
        self.store.list()
    }

    pub fn events(&self, name: &str) -> Result<Vec<TaskEvent>> {
        self.store.read_events(name)
    }

    pub fn find_blocked_cycles(&self, name: &str) -> Result<Vec<Vec<TaskId>>> {
        Ok(find_blocked_cycles(&self.load_required(name)?))
    }

    /// Error with `DeadlockDetected` if any Blocked tasks form a cycle.
    pub fn assert_no_deadlock(&self, name: &str) -> Result<()> {
        match self.find_blocked_cycles(name)?.into_iter().next() {
            None => Ok(()),
            Some(cycle) => Err(SlotdagError::DeadlockDetected {
                set: name.to_string(),
                cycle: cycle.join(", "),
            }),
        }
    }

    /// Reconstruct a set from its event log alone.
    ///
    /// Starts from the `TaskSetCreated` snapshot and replays every later
    /// task snapshot in order. The result is not persisted.
    pub fn rebuild_from_events(&self, name: &str) -> Result<TaskSet> {
        let events = self.store.read_events(name)?;
        let mut iter = events.iter();

        let mut set: TaskSet = loop {
            let Some(event) = iter.next() else {
                return Err(SlotdagError::TaskSetNotFound(name.to_string()));
            };
            if event.kind == EventKind::TaskSetCreated {
                let snapshot = event.detail.get("set").cloned().ok_or_else(|| {
                    SlotdagError::Validation(format!(
                        "creation event for '{name}' carries no snapshot"
                    ))
                })?;
                break serde_json::from_value(snapshot)?;
            }
        };

        let mut replayed = 0usize;
        for event in iter {
            if let Some(version) = event.set_version() {
                set.version = set.version.max(version);
            }
            if let Some(task) = event.task_snapshot() {
                set.tasks.insert(task.id.clone(), task);
                set.updated_at = event.timestamp;
                replayed += 1;
            }
        }

        debug!(task_set = %name, replayed, version = set.version, "task set rebuilt from events");
        Ok(set)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn load_required(&self, name: &str) -> Result<TaskSet> {
        self.store
            .load(name)?
            .ok_or_else(|| SlotdagError::TaskSetNotFound(name.to_string()))
    }

    fn commit(&self, set: &TaskSet, events: &[TaskEvent]) -> Result<()> {
        self.store.save(set)?;
        self.store.append_events(&set.name, events)
    }

    /// Run `f` while holding the set lease.
    fn with_set_lock<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let key = set_key(name);
        let mut attempt = 0;
        loop {
            match self
                .leases
                .acquire(&key, &self.holder, self.options.lock_timeout)
            {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < self.options.lock_retries => {
                    attempt += 1;
                    debug!(lease = %key, attempt, error = %e, "retrying set lease");
                }
                Err(e) => {
                    warn!(lease = %key, attempts = attempt + 1, error = %e, "giving up on set lease");
                    return Err(e);
                }
            }
        }

        let result = f();

        match self.leases.release(&key, &self.holder) {
            Ok(true) => {}
            Ok(false) => warn!(lease = %key, "set lease was reclaimed while held"),
            Err(e) => warn!(lease = %key, error = %e, "failed to release set lease"),
        }
        result
    }
}

/// Task-set names become file names, so they are restricted to
/// `[A-Za-z0-9._-]`.
pub fn validate_set_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SlotdagError::Validation(format!(
            "invalid task set name '{name}' (allowed: A-Z a-z 0-9 . _ -)"
        )))
    }
}

fn require_task<'a>(set: &'a TaskSet, id: &str) -> Result<&'a Task> {
    set.get(id).ok_or_else(|| SlotdagError::TaskNotFound {
        set: set.name.clone(),
        task: id.to_string(),
    })
}

fn require_task_mut<'a>(set: &'a mut TaskSet, id: &str) -> Result<&'a mut Task> {
    let name = set.name.clone();
    set.tasks.get_mut(id).ok_or_else(|| SlotdagError::TaskNotFound {
        set: name,
        task: id.to_string(),
    })
}

fn check_version(set: &str, id: &str, expected: u64, actual: u64) -> Result<()> {
    if expected != actual {
        return Err(SlotdagError::ConcurrencyConflict {
            set: set.to_string(),
            task: id.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn bump_set(set: &mut TaskSet, now: DateTime<Utc>) {
    set.version += 1;
    set.updated_at = now;
}

fn extra(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
