// src/engine/runtime.rs

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::config::{AgentPoolConfig, ConfigFile};
use crate::errors::{Result, SlotdagError};
use crate::exec::{LaunchRequest, RunnerLauncher};
use crate::registry::{EventKind, TaskId, TaskRegistry, TaskState, TransitionMetadata};
use crate::slots::SlotPoolManager;

use super::core::{Action, DispatchCore};
use super::{
    DispatchEvent, RunOptions, RunnerHandle, RunnerId, RunnerState, RunnerStatus, TaskKey,
    branch_name,
};

/// Conflicting writes are re-read and re-applied this many times.
const FINISH_ATTEMPTS: usize = 3;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub assigned: Vec<TaskKey>,
    /// Assignments that would have been made in dry-run mode.
    pub planned: Vec<TaskKey>,
    pub completed: Vec<TaskKey>,
    pub failed: Vec<TaskKey>,
    pub expired: Vec<TaskKey>,
    pub routing_blocked: Vec<TaskKey>,
    pub deadlocks: Vec<(String, Vec<TaskId>)>,
    pub quarantined: Vec<String>,
    pub reclaimed_leases: Vec<String>,
    pub errors: Vec<String>,
}

/// What happened to the runners still alive when shutdown began.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    pub finished_in_grace: Vec<TaskKey>,
    pub aborted: Vec<TaskKey>,
}

/// Async shell around [`DispatchCore`].
///
/// Each tick drains runner signals, polls the registry, asks the core for a
/// plan and applies it against the registry, the slot pools and the
/// launcher. A failure while applying one action is logged and recorded in
/// the report; it never aborts the tick.
pub struct Dispatcher<L: RunnerLauncher> {
    core: DispatchCore,
    registry: Arc<TaskRegistry>,
    slots: Arc<SlotPoolManager>,
    launcher: L,
    agent_pools: BTreeMap<String, AgentPoolConfig>,
    event_rx: mpsc::Receiver<DispatchEvent>,
    options: RunOptions,
    stale_lock_age: Duration,
    /// Sets whose existing deadlock events have been loaded into the core.
    cycles_seeded: HashSet<String>,
    /// Ready tasks still waiting out a retry backoff, as of the last poll.
    backing_off: usize,
    shutdown_requested: bool,
}

impl<L: RunnerLauncher> fmt::Debug for Dispatcher<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("core", &self.core)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<L: RunnerLauncher> Dispatcher<L> {
    pub fn new(
        config: &ConfigFile,
        registry: Arc<TaskRegistry>,
        slots: Arc<SlotPoolManager>,
        launcher: L,
        event_rx: mpsc::Receiver<DispatchEvent>,
        options: RunOptions,
    ) -> Self {
        Self {
            core: DispatchCore::new(
                config.dispatcher.clone(),
                config.agent_pools.clone(),
                &config.routing,
            ),
            registry,
            slots,
            launcher,
            agent_pools: config.agent_pools.clone(),
            event_rx,
            options,
            stale_lock_age: config.slots.stale_lock_age,
            cycles_seeded: HashSet::new(),
            backing_off: 0,
            shutdown_requested: false,
        }
    }

    pub fn core(&self) -> &DispatchCore {
        &self.core
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Nothing queued, running or backing off.
    pub fn is_idle(&self) -> bool {
        self.core.is_idle() && self.backing_off == 0
    }

    /// Main loop: tick on `poll_interval`, react to signals as they arrive,
    /// drain on shutdown.
    pub async fn run(mut self) -> Result<ShutdownReport> {
        info!(
            policy = ?self.core.config().policy,
            poll_interval = ?self.core.config().poll_interval,
            dry_run = self.options.dry_run,
            "dispatcher started"
        );

        let mut interval = tokio::time::interval(self.core.config().poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.errors.is_empty() {
                        debug!(errors = report.errors.len(), "tick finished with errors");
                    }
                    if self.options.exit_when_idle
                        && (self.is_idle() || self.options.dry_run)
                    {
                        info!("nothing left to dispatch; exiting (--once)");
                        break;
                    }
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => {
                            let mut report = TickReport::default();
                            self.handle_event(event, Utc::now(), &mut report);
                        }
                        None => {
                            info!("dispatch event channel closed; stopping");
                            self.shutdown_requested = true;
                        }
                    }
                }
            }

            if self.shutdown_requested {
                break;
            }
        }

        let report = self.shutdown().await;
        info!(
            finished = report.finished_in_grace.len(),
            aborted = report.aborted.len(),
            "dispatcher exiting"
        );
        Ok(report)
    }

    /// One tick at the current time.
    pub async fn tick(&mut self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One tick at `now`.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        self.drain_signals(now, &mut report);
        self.poll_statuses(now, &mut report).await;
        if self.core.is_accepting() {
            self.poll_registry(now, &mut report);
        }

        let plan = self.core.plan_tick(now);
        report.tick = plan.tick;

        for action in plan.actions {
            self.apply(action, now, &mut report).await;
        }

        debug!(
            tick = report.tick,
            assigned = report.assigned.len(),
            completed = report.completed.len(),
            failed = report.failed.len(),
            expired = report.expired.len(),
            queued = self.core.queue().len(),
            running = self.core.runners().count(),
            "tick applied"
        );
        report
    }

    /// Stop new assignments, give running runners `grace_period` to finish,
    /// then abort the rest. Every slot held by this dispatcher is released.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        self.core.stop_accepting();
        let mut shutdown = ShutdownReport::default();
        let before: BTreeMap<RunnerId, TaskKey> = self
            .core
            .runners()
            .map(|r| (r.id.clone(), r.key.clone()))
            .collect();

        if !before.is_empty() {
            info!(
                running = before.len(),
                grace = ?self.core.config().grace_period,
                "shutdown: waiting for running runners"
            );
        }

        let deadline = tokio::time::Instant::now() + self.core.config().grace_period;
        let mut scratch = TickReport::default();
        while self.core.runners().next().is_some() {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, self.event_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event, Utc::now(), &mut scratch),
                Ok(None) | Err(_) => break,
            }
            self.poll_statuses(Utc::now(), &mut scratch).await;
        }

        for runner_id in self.core.runner_ids() {
            if let Some(handle) = self.core.runner_finished(&runner_id) {
                if let Err(e) = self.launcher.abort(runner_id.clone()).await {
                    warn!(runner = %runner_id, error = %e, "abort at shutdown failed");
                }
                warn!(runner = %runner_id, task = %handle.key, "runner aborted at shutdown");
                self.settle(
                    &handle,
                    Err("aborted at dispatcher shutdown".to_string()),
                    Utc::now(),
                    &mut scratch,
                );
                shutdown.aborted.push(handle.key);
            }
        }

        shutdown.finished_in_grace = before
            .into_values()
            .filter(|key| !shutdown.aborted.contains(key))
            .collect();
        shutdown
    }

    // ---------------------------------------------------------------------
    // Signals
    // ---------------------------------------------------------------------

    fn drain_signals(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        loop {
            match self.event_rx.try_recv() {
                Ok(event) => self.handle_event(event, now, report),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("dispatch event channel disconnected");
                    break;
                }
            }
        }
    }

    fn handle_event(&mut self, event: DispatchEvent, now: DateTime<Utc>, report: &mut TickReport) {
        match event {
            DispatchEvent::Heartbeat { runner_id } => {
                if !self.core.heartbeat(&runner_id, now) {
                    debug!(runner = %runner_id, "heartbeat from unknown runner");
                    return;
                }
                let Some(slot_id) = self.core.runner(&runner_id).map(|r| r.slot_id.clone()) else {
                    return;
                };
                if let Err(e) = self.slots.renew(&slot_id) {
                    report.errors.push(format!("renewing slot {slot_id}: {e}"));
                }
            }
            DispatchEvent::RunnerCompleted { runner_id } => {
                self.finish_runner(&runner_id, Ok(()), now, report);
            }
            DispatchEvent::RunnerFailed { runner_id, reason } => {
                self.finish_runner(&runner_id, Err(reason), now, report);
            }
            DispatchEvent::ShutdownRequested => {
                info!("shutdown requested; no new assignments");
                self.core.stop_accepting();
                self.shutdown_requested = true;
            }
        }
    }

    async fn poll_statuses(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        for runner_id in self.core.runner_ids() {
            match self.launcher.poll_status(runner_id.clone()).await {
                Some(RunnerStatus::Completed) => self.finish_runner(&runner_id, Ok(()), now, report),
                Some(RunnerStatus::Failed(reason)) => {
                    self.finish_runner(&runner_id, Err(reason), now, report)
                }
                Some(RunnerStatus::Running) | None => {}
            }
        }
    }

    fn finish_runner(
        &mut self,
        runner_id: &str,
        outcome: std::result::Result<(), String>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let Some(mut handle) = self.core.runner_finished(runner_id) else {
            debug!(runner = %runner_id, "completion from unknown runner ignored");
            return;
        };
        handle.state = if outcome.is_ok() {
            RunnerState::Completed
        } else {
            RunnerState::Failed
        };
        self.settle(&handle, outcome, now, report);
    }

    /// Record the runner's outcome on its task and give the slot back.
    fn settle(
        &mut self,
        handle: &RunnerHandle,
        outcome: std::result::Result<(), String>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let key = &handle.key;
        let (target, metadata) = match &outcome {
            Ok(()) => (TaskState::Done, None),
            Err(reason) => (TaskState::Failed, Some(TransitionMetadata::failure(reason.clone()))),
        };

        match self.write_outcome(handle, target, metadata, now) {
            Ok(true) => match target {
                TaskState::Done => {
                    info!(task = %key, runner = %handle.id, "task done");
                    report.completed.push(key.clone());
                }
                _ => report.failed.push(key.clone()),
            },
            Ok(false) => {}
            Err(e) => {
                error!(task = %key, runner = %handle.id, error = %e, "failed to record runner outcome");
                report.errors.push(format!("{key}: {e}"));
            }
        }

        self.release_slot(&handle.slot_id, key, report);
    }

    /// Returns `Ok(false)` when the task no longer belongs to this runner.
    fn write_outcome(
        &self,
        handle: &RunnerHandle,
        target: TaskState,
        metadata: Option<TransitionMetadata>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = &handle.key;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let task = self.registry.get_task(&key.set, &key.id)?;
            if task.state != TaskState::Running || task.runner_id.as_deref() != Some(handle.id.as_str()) {
                warn!(
                    task = %key,
                    runner = %handle.id,
                    state = ?task.state,
                    "task no longer owned by runner; outcome ignored"
                );
                return Ok(false);
            }

            match self.registry.update_task_state_at(
                &key.set,
                &key.id,
                target,
                task.version,
                metadata.clone(),
                now,
            ) {
                Ok(_) => return Ok(true),
                Err(SlotdagError::ConcurrencyConflict { .. }) if attempt < FINISH_ATTEMPTS => {
                    debug!(task = %key, attempt, "version moved underneath us; re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn release_slot(&self, slot_id: &str, key: &TaskKey, report: &mut TickReport) {
        if let Err(e) = self.slots.release(slot_id) {
            error!(slot = %slot_id, task = %key, error = %e, "failed to release slot");
            report.errors.push(format!("release {slot_id}: {e}"));
        }
        self.record_slot_notices(key, report);
    }

    /// Turn slot quarantine notices into events on the task's set.
    fn record_slot_notices(&self, key: &TaskKey, report: &mut TickReport) {
        for notice in self.slots.drain_notices() {
            let detail = json!({
                "slot": notice.slot_id,
                "pool": notice.pool,
                "reason": notice.reason,
            });
            if let Err(e) =
                self.registry
                    .record_event(&key.set, &key.id, EventKind::SlotQuarantined, detail)
            {
                warn!(slot = %notice.slot_id, error = %e, "failed to record quarantine event");
            }
            report.quarantined.push(notice.slot_id);
        }
    }

    // ---------------------------------------------------------------------
    // Registry polling
    // ---------------------------------------------------------------------

    fn poll_registry(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        let names = match self.registry.list_task_sets() {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "failed to list task sets");
                report.errors.push(format!("list task sets: {e}"));
                return;
            }
        };

        let mut backing_off = 0;
        for name in &names {
            match self.registry.get_ready_tasks_at(name, None, now) {
                Ok(ready) => self.core.sync_ready(name, ready),
                Err(e) => {
                    warn!(task_set = %name, error = %e, "failed to poll ready tasks");
                    report.errors.push(format!("{name}: {e}"));
                    continue;
                }
            }
            if let Ok(set) = self.registry.get_task_set(name) {
                backing_off += set
                    .tasks
                    .values()
                    .filter(|t| t.state == TaskState::Ready && !t.is_due(now))
                    .count();
            }
        }
        self.backing_off = backing_off;

        let active: BTreeSet<String> = names.into_iter().collect();
        self.core.retain_sets(&active);
    }

    // ---------------------------------------------------------------------
    // Plan application
    // ---------------------------------------------------------------------

    async fn apply(&mut self, action: Action, now: DateTime<Utc>, report: &mut TickReport) {
        match action {
            Action::Assign {
                key,
                task,
                agent_pool,
                slot_pool,
            } => {
                if self.options.dry_run {
                    info!(task = %key, agent_pool, slot_pool, "dry run: would assign");
                    self.core.cancel_assignment(&key);
                    report.planned.push(key);
                    return;
                }
                match self.assign(&key, task, &agent_pool, &slot_pool, now).await {
                    Ok(true) => report.assigned.push(key.clone()),
                    Ok(false) => self.core.cancel_assignment(&key),
                    Err(e) => {
                        warn!(task = %key, agent_pool, error = %e, "assignment failed; task stays queued");
                        self.core.cancel_assignment(&key);
                        report.errors.push(format!("{key}: {e}"));
                    }
                }
                self.record_slot_notices(&key, report);
            }
            Action::RoutingBlocked { key, capability } => {
                warn!(task = %key, capability = ?capability, "no route for task; holding it back");
                let detail = json!({
                    "capability": capability,
                    "policy": format!("{:?}", self.core.config().policy),
                });
                if let Err(e) =
                    self.registry
                        .record_event(&key.set, &key.id, EventKind::RoutingBlocked, detail)
                {
                    report.errors.push(format!("{key}: {e}"));
                }
                report.routing_blocked.push(key);
            }
            Action::ExpireRunner {
                runner_id,
                elapsed_ms,
            } => self.expire(&runner_id, elapsed_ms, now, report).await,
            Action::CheckDeadlocks => self.check_deadlocks(report),
            Action::SweepStaleLeases => self.sweep_stale(report),
        }
    }

    /// Allocate, launch, mark Running, record. Returns `Ok(false)` when no
    /// slot is free.
    async fn assign(
        &mut self,
        key: &TaskKey,
        task: crate::registry::Task,
        agent_pool: &str,
        slot_pool: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let pool = self
            .agent_pools
            .get(agent_pool)
            .cloned()
            .ok_or_else(|| SlotdagError::PoolNotFound(agent_pool.to_string()))?;

        let slot = match self.slots.allocate(slot_pool) {
            Ok(slot) => slot,
            Err(SlotdagError::NoSlotAvailable(_)) => {
                debug!(task = %key, slot_pool, "no slot free; task stays queued");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let branch = branch_name(key);
        let version = task.version;
        let request = LaunchRequest {
            task_set: key.set.clone(),
            task,
            slot: slot.clone(),
            pool,
            branch: branch.clone(),
        };

        let launched = match self.launcher.launch(request).await {
            Ok(launched) => launched,
            Err(e) => {
                self.give_back_slot(&slot.id);
                return Err(e);
            }
        };
        let runner_id = launched.runner_id;

        let metadata = TransitionMetadata::assignment(&slot.id, &branch, &runner_id);
        if let Err(e) = self.registry.update_task_state_at(
            &key.set,
            &key.id,
            TaskState::Running,
            version,
            Some(metadata),
            now,
        ) {
            if let Err(abort_err) = self.launcher.abort(runner_id.clone()).await {
                warn!(runner = %runner_id, error = %abort_err, "abort after failed assignment failed");
            }
            self.give_back_slot(&slot.id);
            return Err(e);
        }

        self.core.assignment_succeeded(RunnerHandle {
            id: runner_id.clone(),
            key: key.clone(),
            pool: agent_pool.to_string(),
            slot_id: slot.id.clone(),
            state: RunnerState::Running,
            started_at: now,
            last_heartbeat: now,
        });

        let detail = json!({
            "slot": slot.id,
            "branch": branch,
            "runner": runner_id,
            "agent_pool": agent_pool,
            "slot_pool": slot_pool,
        });
        if let Err(e) = self
            .registry
            .record_event(&key.set, &key.id, EventKind::TaskAssigned, detail)
        {
            warn!(task = %key, error = %e, "failed to record assignment event");
        }

        info!(
            task = %key,
            runner = %runner_id,
            slot = %slot.id,
            agent_pool,
            "task assigned"
        );
        Ok(true)
    }

    fn give_back_slot(&self, slot_id: &str) {
        if let Err(e) = self.slots.release(slot_id) {
            error!(slot = %slot_id, error = %e, "failed to release slot after aborted assignment");
        }
    }

    async fn expire(
        &mut self,
        runner_id: &str,
        elapsed_ms: i64,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let Some(mut handle) = self.core.runner_finished(runner_id) else {
            return;
        };
        handle.state = RunnerState::Failed;

        let timeout = SlotdagError::RunnerTimeout {
            runner: runner_id.to_string(),
            task: handle.key.to_string(),
            elapsed_ms,
        };
        warn!(task = %handle.key, runner = %runner_id, elapsed_ms, "{timeout}");

        if let Err(e) = self.launcher.abort(runner_id.to_string()).await {
            warn!(runner = %runner_id, error = %e, "abort of silent runner failed");
        }

        let detail = json!({
            "runner": runner_id,
            "slot": handle.slot_id,
            "elapsed_ms": elapsed_ms,
        });
        if let Err(e) = self.registry.record_event(
            &handle.key.set,
            &handle.key.id,
            EventKind::RunnerTimeout,
            detail,
        ) {
            report.errors.push(format!("{}: {e}", handle.key));
        }

        report.expired.push(handle.key.clone());
        self.settle(&handle, Err(timeout.to_string()), now, report);
    }

    fn check_deadlocks(&mut self, report: &mut TickReport) {
        let names = match self.registry.list_task_sets() {
            Ok(names) => names,
            Err(e) => {
                report.errors.push(format!("list task sets: {e}"));
                return;
            }
        };

        for name in names {
            if self.cycles_seeded.insert(name.clone()) {
                self.seed_cycles(&name);
            }

            let cycles = match self.registry.find_blocked_cycles(&name) {
                Ok(cycles) => cycles,
                Err(e) => {
                    report.errors.push(format!("{name}: {e}"));
                    continue;
                }
            };

            for cycle in cycles {
                if !self.core.note_cycle(&name, &cycle) {
                    continue;
                }
                let deadlock = SlotdagError::DeadlockDetected {
                    set: name.clone(),
                    cycle: cycle.join(", "),
                };
                error!(task_set = %name, cycle = ?cycle, "{deadlock}");

                let first = cycle.first().cloned().unwrap_or_default();
                if let Err(e) = self.registry.record_event(
                    &name,
                    &first,
                    EventKind::DeadlockDetected,
                    json!({ "cycle": cycle }),
                ) {
                    report.errors.push(format!("{name}: {e}"));
                }
                report.deadlocks.push((name.clone(), cycle));
            }
        }
    }

    /// Load cycles already reported in the event log (by an earlier process)
    /// so they are not reported twice.
    fn seed_cycles(&mut self, name: &str) {
        let Ok(events) = self.registry.events(name) else {
            return;
        };
        for event in events {
            if event.kind != EventKind::DeadlockDetected {
                continue;
            }
            let cycle: Option<Vec<TaskId>> = event
                .detail
                .get("cycle")
                .and_then(|c| serde_json::from_value(c.clone()).ok());
            if let Some(cycle) = cycle {
                self.core.note_cycle(name, &cycle);
            }
        }
    }

    fn sweep_stale(&mut self, report: &mut TickReport) {
        match self.slots.sweep_stale(self.stale_lock_age) {
            Ok(reclaimed) => report.reclaimed_leases.extend(reclaimed),
            Err(e) => report.errors.push(format!("slot sweep: {e}")),
        }
        match self.registry.sweep_stale_locks(self.stale_lock_age) {
            Ok(reclaimed) => report.reclaimed_leases.extend(reclaimed),
            Err(e) => report.errors.push(format!("set lock sweep: {e}")),
        }
    }
}
