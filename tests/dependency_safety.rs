// tests/dependency_safety.rs

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use tokio::sync::mpsc;

use slotdag::engine::{Dispatcher, RunOptions};
use slotdag::lease::MemoryLeaseManager;
use slotdag::registry::{TaskDefinition, TaskRegistry, TaskSet, TaskState};
use slotdag::slots::SlotPoolManager;
use slotdag::types::SchedulingPolicy;
use slotdag_test_utils::{
    AgentPoolBuilder, ConfigFileBuilder, FakeLauncher, LaunchMode, ScratchWorkspace,
    TaskDefBuilder,
};

// Acyclic by construction: task i may only depend on tasks 0..i.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<TaskDefinition>> {
    (1..=max_tasks).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n),
            proptest::collection::vec(-2i64..3, n),
        )
            .prop_map(move |(raw_deps, priorities)| {
                (0..n)
                    .map(|i| {
                        let mut def = TaskDefBuilder::new(&format!("t{i}")).priority(priorities[i]);
                        let deps: HashSet<usize> = raw_deps[i]
                            .iter()
                            .filter(|_| i > 0)
                            .map(|d| d % i)
                            .collect();
                        for d in deps {
                            def = def.after(&format!("t{d}"));
                        }
                        def.build()
                    })
                    .collect()
            })
    })
}

fn policy_strategy() -> impl Strategy<Value = SchedulingPolicy> {
    prop_oneof![
        Just(SchedulingPolicy::Fifo),
        Just(SchedulingPolicy::Priority),
        Just(SchedulingPolicy::FairShare),
    ]
}

fn assert_dependencies_respected(set: &TaskSet) {
    for task in set.tasks.values() {
        if matches!(task.state, TaskState::Running | TaskState::Done) {
            for dep in &task.depends_on {
                assert_eq!(
                    set.tasks[dep].state,
                    TaskState::Done,
                    "{} is {:?} but dependency {} is {:?}",
                    task.id,
                    task.state,
                    dep,
                    set.tasks[dep].state
                );
            }
        }
    }
}

async fn drive(defs: Vec<TaskDefinition>, policy: SchedulingPolicy, outcomes: Vec<bool>, slots: usize) {
    let dir = tempfile::tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", slots);
    let cfg = ConfigFileBuilder::new()
        .policy(policy)
        .max_retries(1)
        .slot_pool("main", paths)
        .agent_pool(AgentPoolBuilder::new("default", "main").max_concurrency(slots))
        .default_pool("default")
        .build();

    let registry = Arc::new(TaskRegistry::in_memory(cfg.registry_options()));
    registry.create_task_set("p", &defs).unwrap();
    let pool = Arc::new(
        SlotPoolManager::new(
            cfg.pools.values().cloned(),
            cfg.slots.clone(),
            Arc::new(MemoryLeaseManager::new()),
            Arc::new(ScratchWorkspace::new()),
        )
        .unwrap(),
    );

    let (tx, rx) = mpsc::channel(1024);
    let launcher = FakeLauncher::new(tx, LaunchMode::Manual);
    let mut dispatcher = Dispatcher::new(
        &cfg,
        Arc::clone(&registry),
        Arc::clone(&pool),
        launcher.clone(),
        rx,
        RunOptions::default(),
    );

    let mut step = 0usize;
    for _ in 0..200 {
        dispatcher.tick().await;
        let set = registry.get_task_set("p").unwrap();
        assert_dependencies_respected(&set);

        let running = dispatcher.core().runner_ids();
        assert!(running.len() <= slots);
        if running.is_empty() && dispatcher.is_idle() {
            break;
        }
        for runner in running {
            let succeed = outcomes.get(step % outcomes.len().max(1)).copied().unwrap_or(true);
            step += 1;
            if succeed {
                launcher.complete(&runner).await;
            } else {
                launcher.fail(&runner, "scripted failure").await;
            }
        }
    }

    let set = registry.get_task_set("p").unwrap();
    assert_dependencies_respected(&set);
    for task in set.tasks.values() {
        assert_ne!(task.state, TaskState::Running, "{} still running", task.id);
        if task.state == TaskState::Ready {
            panic!("{} left ready with the dispatcher idle", task.id);
        }
    }
    assert_eq!(pool.pool_summary("main").unwrap().available, slots);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn no_task_runs_before_its_dependencies(
        defs in dag_strategy(8),
        policy in policy_strategy(),
        outcomes in proptest::collection::vec(prop::bool::weighted(0.8), 1..10),
        slots in 1usize..4,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(drive(defs, policy, outcomes, slots));
    }
}
