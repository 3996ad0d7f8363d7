// src/engine/core.rs

//! Pure dispatcher planner.
//!
//! [`DispatchCore`] owns the ready queue, pool loads, the runner table and
//! the bookkeeping for one-shot warnings. Given the current instant it
//! produces a [`TickPlan`]: the list of actions the async shell
//! (`engine::runtime::Dispatcher`) should carry out. Planned assignments
//! hold their pool load until the shell confirms or cancels them.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::config::{AgentPoolConfig, DispatcherConfig, RoutingConfig};
use crate::engine::queue::{FairShareWindow, ReadyQueue};
use crate::engine::routing::{PoolLoads, Router};
use crate::engine::{RunnerHandle, RunnerId, RunnerState, TaskKey};
use crate::registry::{Task, TaskId};
use crate::types::SchedulingPolicy;

/// One step for the shell to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Allocate a slot from `slot_pool`, launch a runner in `agent_pool`
    /// and mark the task Running. Load is already reserved.
    Assign {
        key: TaskKey,
        task: Task,
        agent_pool: String,
        slot_pool: String,
    },
    /// The task has no usable route; record a warning once.
    RoutingBlocked {
        key: TaskKey,
        capability: Option<String>,
    },
    /// The runner missed its heartbeat deadline.
    ExpireRunner { runner_id: RunnerId, elapsed_ms: i64 },
    CheckDeadlocks,
    SweepStaleLeases,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickPlan {
    pub tick: u64,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone)]
struct InFlight {
    pool: String,
    group: String,
}

#[derive(Debug)]
pub struct DispatchCore {
    config: DispatcherConfig,
    router: Router,
    loads: PoolLoads,
    queue: ReadyQueue,
    fair_share: FairShareWindow,
    runners: BTreeMap<RunnerId, RunnerHandle>,
    /// Planned assignments not yet confirmed or cancelled.
    in_flight: BTreeMap<TaskKey, InFlight>,
    routing_reported: HashSet<TaskKey>,
    reported_cycles: HashSet<(String, Vec<TaskId>)>,
    ticks: u64,
    accepting: bool,
}

impl DispatchCore {
    pub fn new(
        config: DispatcherConfig,
        agent_pools: BTreeMap<String, AgentPoolConfig>,
        routing: &RoutingConfig,
    ) -> Self {
        let strict = config.policy == SchedulingPolicy::Capability;
        Self {
            router: Router::new(routing, strict),
            loads: PoolLoads::new(agent_pools, config.max_concurrency),
            queue: ReadyQueue::new(),
            fair_share: FairShareWindow::new(config.fair_share_window),
            runners: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            routing_reported: HashSet::new(),
            reported_cycles: HashSet::new(),
            ticks: 0,
            accepting: true,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn loads(&self) -> &PoolLoads {
        &self.loads
    }

    pub fn queue(&self) -> &ReadyQueue {
        &self.queue
    }

    /// Recent confirmed assignments per capability group.
    pub fn fair_share(&self) -> &FairShareWindow {
        &self.fair_share
    }

    pub fn is_in_flight(&self, key: &TaskKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Stop planning new assignments. Monitoring continues.
    pub fn stop_accepting(&mut self) {
        if self.accepting {
            debug!("dispatcher stopped accepting new assignments");
        }
        self.accepting = false;
    }

    pub fn runners(&self) -> impl Iterator<Item = &RunnerHandle> {
        self.runners.values()
    }

    pub fn runner(&self, runner_id: &str) -> Option<&RunnerHandle> {
        self.runners.get(runner_id)
    }

    pub fn runner_ids(&self) -> Vec<RunnerId> {
        self.runners.keys().cloned().collect()
    }

    /// Nothing running, nothing pending, and nothing queued that could
    /// still be routed.
    pub fn is_idle(&self) -> bool {
        self.runners.is_empty()
            && self.in_flight.is_empty()
            && self.queue.keys().all(|key| self.routing_reported.contains(key))
    }

    /// Mirror the registry's ready tasks for one set.
    pub fn sync_ready(&mut self, set: &str, ready: Vec<Task>) {
        let ready = ready
            .into_iter()
            .filter(|task| !self.in_flight.contains_key(&TaskKey::new(set, &task.id)))
            .collect();
        self.queue.sync(set, ready);
    }

    pub fn retain_sets(&mut self, active: &BTreeSet<String>) {
        self.queue.retain_sets(active);
    }

    /// Plan one tick at `now`.
    pub fn plan_tick(&mut self, now: DateTime<Utc>) -> TickPlan {
        self.ticks += 1;
        let mut actions = Vec::new();

        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or(chrono::Duration::MAX);
        for runner in self.runners.values() {
            let silent = now.signed_duration_since(runner.last_heartbeat);
            if runner.state == RunnerState::Running && silent > timeout {
                actions.push(Action::ExpireRunner {
                    runner_id: runner.id.clone(),
                    elapsed_ms: silent.num_milliseconds(),
                });
            }
        }

        if self.accepting {
            self.plan_assignments(&mut actions);
        }

        if self.ticks % self.config.deadlock_check_every.max(1) == 0 {
            actions.push(Action::CheckDeadlocks);
        }
        if self.ticks % self.config.stale_sweep_every.max(1) == 0 {
            actions.push(Action::SweepStaleLeases);
        }

        trace!(tick = self.ticks, actions = actions.len(), "tick planned");
        TickPlan {
            tick: self.ticks,
            actions,
        }
    }

    fn plan_assignments(&mut self, actions: &mut Vec<Action>) {
        let mut planned: Vec<(TaskKey, Task, String, String, String)> = Vec::new();
        let mut blocked: Vec<(TaskKey, Option<String>)> = Vec::new();
        let mut loads = self.loads.clone();

        for queued in self.queue.ordered(self.config.policy, &self.fair_share) {
            if self.in_flight.contains_key(&queued.key) {
                continue;
            }

            let capability = queued.task.capability.as_deref();
            let Some(candidates) = self.router.candidates(capability) else {
                if !self.routing_reported.contains(&queued.key) {
                    blocked.push((queued.key.clone(), queued.task.capability.clone()));
                }
                continue;
            };

            let Some(agent_pool) = loads.pick(&candidates) else {
                trace!(task = %queued.key, ?candidates, "no agent pool admits task; stays queued");
                continue;
            };
            let Some(slot_pool) = loads.pool(&agent_pool).map(|p| p.slot_pool.clone()) else {
                continue;
            };

            loads.reserve(&agent_pool);
            planned.push((
                queued.key.clone(),
                queued.task.clone(),
                agent_pool,
                slot_pool,
                queued.group().to_string(),
            ));
        }

        self.loads = loads;
        for (key, capability) in blocked {
            self.routing_reported.insert(key.clone());
            actions.push(Action::RoutingBlocked { key, capability });
        }
        for (key, task, agent_pool, slot_pool, group) in planned {
            self.in_flight.insert(
                key.clone(),
                InFlight {
                    pool: agent_pool.clone(),
                    group,
                },
            );
            actions.push(Action::Assign {
                key,
                task,
                agent_pool,
                slot_pool,
            });
        }
    }

    /// The planned assignment did not happen; give the load back. The task
    /// stays queued.
    pub fn cancel_assignment(&mut self, key: &TaskKey) {
        if let Some(flight) = self.in_flight.remove(key) {
            self.loads.release(&flight.pool);
        }
    }

    /// The planned assignment is live; start monitoring the runner.
    pub fn assignment_succeeded(&mut self, handle: RunnerHandle) {
        if let Some(flight) = self.in_flight.remove(&handle.key) {
            self.fair_share.record(&flight.group);
        }
        self.queue.remove(&handle.key);
        self.runners.insert(handle.id.clone(), handle);
    }

    /// Stop monitoring a runner and free its pool capacity.
    pub fn runner_finished(&mut self, runner_id: &str) -> Option<RunnerHandle> {
        let handle = self.runners.remove(runner_id)?;
        self.loads.release(&handle.pool);
        Some(handle)
    }

    /// Returns `false` for runners we do not know about.
    pub fn heartbeat(&mut self, runner_id: &str, now: DateTime<Utc>) -> bool {
        match self.runners.get_mut(runner_id) {
            Some(runner) => {
                if now > runner.last_heartbeat {
                    runner.last_heartbeat = now;
                }
                true
            }
            None => false,
        }
    }

    /// Remember a cycle. Returns `true` the first time it is seen.
    pub fn note_cycle(&mut self, set: &str, cycle: &[TaskId]) -> bool {
        self.reported_cycles
            .insert((set.to_string(), cycle.to_vec()))
    }
}
