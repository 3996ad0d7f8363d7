// tests/dispatch_core.rs
//
// Planner behaviour without a runtime, registry or slots.

use chrono::{DateTime, Duration, Utc};

use slotdag::engine::{Action, DispatchCore, RunnerHandle, RunnerState, TaskKey};
use slotdag::registry::{Task, TaskDefinition};
use slotdag::types::SchedulingPolicy;
use slotdag_test_utils::{AgentPoolBuilder, ConfigFileBuilder, TaskDefBuilder};

fn core(configure: impl FnOnce(ConfigFileBuilder) -> ConfigFileBuilder) -> DispatchCore {
    let builder = ConfigFileBuilder::new()
        .slot_pool("main", vec![])
        .agent_pool(AgentPoolBuilder::new("default", "main").max_concurrency(2))
        .default_pool("default");
    let cfg = configure(builder).build();
    DispatchCore::new(cfg.dispatcher, cfg.agent_pools, &cfg.routing)
}

fn tasks(defs: &[TaskDefinition], now: DateTime<Utc>) -> Vec<Task> {
    defs.iter()
        .enumerate()
        .map(|(seq, def)| Task::from_definition(def, seq as u64, now))
        .collect()
}

fn assigned(actions: &[Action]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Assign { key, .. } => Some(key.id.clone()),
            _ => None,
        })
        .collect()
}

fn handle(id: &str, task: &str, at: DateTime<Utc>) -> RunnerHandle {
    RunnerHandle {
        id: id.to_string(),
        key: TaskKey::new("s", task),
        pool: "default".to_string(),
        slot_id: "main-0".to_string(),
        state: RunnerState::Running,
        started_at: at,
        last_heartbeat: at,
    }
}

#[test]
fn planning_reserves_load_until_cancelled() {
    let now = Utc::now();
    let mut core = core(|b| b);
    let defs: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|id| TaskDefBuilder::new(id).build())
        .collect();
    core.sync_ready("s", tasks(&defs, now));

    let plan = core.plan_tick(now);
    assert_eq!(assigned(&plan.actions), vec!["a", "b"]);
    assert_eq!(core.loads().running("default"), 2);

    // In-flight tasks are not planned twice, even after a re-sync.
    core.sync_ready("s", tasks(&defs, now));
    assert!(assigned(&core.plan_tick(now).actions).is_empty());

    core.cancel_assignment(&TaskKey::new("s", "a"));
    assert!(!core.is_in_flight(&TaskKey::new("s", "a")));
    assert_eq!(core.loads().running("default"), 1);
    assert_eq!(assigned(&core.plan_tick(now).actions), vec!["a"]);
}

#[test]
fn silent_runner_is_expired_until_it_heartbeats() {
    let start = Utc::now();
    let mut core = core(|b| b.heartbeat_timeout("1s"));
    core.sync_ready("s", tasks(&[TaskDefBuilder::new("a").build()], start));
    core.plan_tick(start);
    core.assignment_succeeded(handle("r1", "a", start));

    assert!(
        !core
            .plan_tick(start + Duration::milliseconds(900))
            .actions
            .iter()
            .any(|a| matches!(a, Action::ExpireRunner { .. }))
    );

    let late = start + Duration::seconds(2);
    let plan = core.plan_tick(late);
    assert!(plan.actions.contains(&Action::ExpireRunner {
        runner_id: "r1".to_string(),
        elapsed_ms: 2000,
    }));

    assert!(core.heartbeat("r1", late));
    assert!(!core.heartbeat("ghost", late));
    let plan = core.plan_tick(late + Duration::milliseconds(500));
    assert!(
        !plan
            .actions
            .iter()
            .any(|a| matches!(a, Action::ExpireRunner { .. }))
    );
}

#[test]
fn unroutable_task_is_reported_once_and_does_not_keep_core_busy() {
    let now = Utc::now();
    let mut core = core(|b| {
        b.policy(SchedulingPolicy::Capability)
            .route("rust", &["default"])
    });
    core.sync_ready(
        "s",
        tasks(&[TaskDefBuilder::new("d").capability("docs").build()], now),
    );

    let plan = core.plan_tick(now);
    assert!(plan.actions.contains(&Action::RoutingBlocked {
        key: TaskKey::new("s", "d"),
        capability: Some("docs".to_string()),
    }));
    assert!(
        !core
            .plan_tick(now)
            .actions
            .iter()
            .any(|a| matches!(a, Action::RoutingBlocked { .. }))
    );
    assert!(core.is_idle());
}

#[test]
fn stopped_core_still_monitors_runners() {
    let start = Utc::now();
    let mut core = core(|b| b.heartbeat_timeout("1s"));
    core.sync_ready(
        "s",
        tasks(
            &[TaskDefBuilder::new("a").build(), TaskDefBuilder::new("b").build()],
            start,
        ),
    );
    core.plan_tick(start);
    core.assignment_succeeded(handle("r1", "a", start));
    core.cancel_assignment(&TaskKey::new("s", "b"));

    core.stop_accepting();
    let plan = core.plan_tick(start + Duration::seconds(5));
    assert!(assigned(&plan.actions).is_empty());
    assert!(
        plan.actions
            .iter()
            .any(|a| matches!(a, Action::ExpireRunner { .. }))
    );

    let finished = core.runner_finished("r1").unwrap();
    assert_eq!(finished.key, TaskKey::new("s", "a"));
    assert_eq!(core.loads().running("default"), 0);
}

#[test]
fn periodic_checks_follow_their_tick_intervals() {
    let now = Utc::now();
    let mut core = core(|b| b.deadlock_check_every(2).stale_sweep_every(3));

    let mut deadlock_ticks = Vec::new();
    let mut sweep_ticks = Vec::new();
    for _ in 0..6 {
        let plan = core.plan_tick(now);
        if plan.actions.contains(&Action::CheckDeadlocks) {
            deadlock_ticks.push(plan.tick);
        }
        if plan.actions.contains(&Action::SweepStaleLeases) {
            sweep_ticks.push(plan.tick);
        }
    }
    assert_eq!(deadlock_ticks, vec![2, 4, 6]);
    assert_eq!(sweep_ticks, vec![3, 6]);
}

#[test]
fn fair_share_window_moves_on_confirmation_only() {
    let now = Utc::now();
    let mut core = core(|b| b.policy(SchedulingPolicy::FairShare));
    core.sync_ready(
        "s",
        tasks(
            &[
                TaskDefBuilder::new("r").capability("rust").build(),
                TaskDefBuilder::new("d").capability("docs").build(),
            ],
            now,
        ),
    );

    let plan = core.plan_tick(now);
    assert_eq!(assigned(&plan.actions).len(), 2);
    assert_eq!(core.fair_share().share("rust"), 0);
    assert_eq!(core.fair_share().share("docs"), 0);

    core.assignment_succeeded(handle("r1", "r", now));
    core.cancel_assignment(&TaskKey::new("s", "d"));
    assert_eq!(core.fair_share().share("rust"), 1);
    assert_eq!(core.fair_share().share("docs"), 0);
}
