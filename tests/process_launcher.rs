// tests/process_launcher.rs
#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;
use tokio::sync::mpsc;

use slotdag::engine::DispatchEvent;
use slotdag::errors::SlotdagError;
use slotdag::exec::{LaunchRequest, ProcessLauncher, RunnerLauncher};
use slotdag::registry::Task;
use slotdag::slots::Slot;
use slotdag_test_utils::{AgentPoolBuilder, TaskDefBuilder, init_tracing, with_timeout};

fn request(slot_path: &Path, pool: AgentPoolBuilder) -> LaunchRequest {
    let def = TaskDefBuilder::new("t1").capability("rust").build();
    LaunchRequest {
        task_set: "auth".to_string(),
        task: Task::from_definition(&def, 0, Utc::now()),
        slot: Slot::new("main-0".to_string(), "main", slot_path.to_path_buf()),
        pool: pool.build(),
        branch: "slotdag/auth/t1".to_string(),
    }
}

/// Collect events until the runner reports an outcome.
async fn until_finished(rx: &mut mpsc::Receiver<DispatchEvent>) -> Vec<DispatchEvent> {
    with_timeout(async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(
                event,
                DispatchEvent::RunnerCompleted { .. } | DispatchEvent::RunnerFailed { .. }
            );
            events.push(event);
            if done {
                break;
            }
        }
        events
    })
    .await
}

#[tokio::test]
async fn successful_command_runs_in_slot_with_task_env() {
    init_tracing();
    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let mut launcher = ProcessLauncher::new(tx, Duration::from_secs(10));

    let pool = AgentPoolBuilder::new("default", "main").command(
        r#"test "$SLOTDAG_TASK_ID" = t1 && test "$SLOTDAG_BRANCH" = slotdag/auth/t1 && echo "$SLOTDAG_CAPABILITY" > out.txt"#,
    );
    let launched = launcher.launch(request(dir.path(), pool)).await.unwrap();
    assert!(launched.runner_id.starts_with("runner-"));

    let events = until_finished(&mut rx).await;
    assert_eq!(
        events.last(),
        Some(&DispatchEvent::RunnerCompleted {
            runner_id: launched.runner_id.clone()
        })
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
        "rust\n"
    );
}

#[tokio::test]
async fn non_zero_exit_is_reported_as_failure() {
    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let mut launcher = ProcessLauncher::new(tx, Duration::from_secs(10));

    let pool = AgentPoolBuilder::new("default", "main").command("exit 3");
    let launched = launcher.launch(request(dir.path(), pool)).await.unwrap();

    let events = until_finished(&mut rx).await;
    assert_eq!(
        events.last(),
        Some(&DispatchEvent::RunnerFailed {
            runner_id: launched.runner_id,
            reason: "exit code 3".to_string(),
        })
    );
}

#[tokio::test]
async fn live_process_sends_periodic_heartbeats() {
    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel(256);
    let mut launcher = ProcessLauncher::new(tx, Duration::from_millis(20));

    let pool = AgentPoolBuilder::new("default", "main").command("sleep 0.3");
    launcher.launch(request(dir.path(), pool)).await.unwrap();

    let events = until_finished(&mut rx).await;
    let beats = events
        .iter()
        .filter(|e| matches!(e, DispatchEvent::Heartbeat { .. }))
        .count();
    assert!(beats >= 2, "expected periodic heartbeats, got {beats}");
}

#[tokio::test]
async fn stdout_pattern_replaces_periodic_heartbeats() {
    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel(256);
    let mut launcher = ProcessLauncher::new(tx, Duration::from_millis(20));

    let pool = AgentPoolBuilder::new("default", "main")
        .command("echo 'HB step 1'; sleep 0.2; echo noise; echo 'HB step 2'; sleep 0.1")
        .heartbeat_on_stdout("^HB");
    launcher.launch(request(dir.path(), pool)).await.unwrap();

    let events = until_finished(&mut rx).await;
    let beats = events
        .iter()
        .filter(|e| matches!(e, DispatchEvent::Heartbeat { .. }))
        .count();
    assert_eq!(beats, 2);
}

#[tokio::test]
async fn aborted_runner_reports_nothing() {
    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let mut launcher = ProcessLauncher::new(tx, Duration::from_secs(10));

    let pool = AgentPoolBuilder::new("default", "main").command("sleep 30");
    let launched = launcher.launch(request(dir.path(), pool)).await.unwrap();

    launcher.abort(launched.runner_id.clone()).await.unwrap();
    // Aborting twice is harmless.
    launcher.abort(launched.runner_id).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            match rx.recv().await {
                Some(DispatchEvent::Heartbeat { .. }) => continue,
                other => return other,
            }
        }
    })
    .await;
    assert!(outcome.is_err(), "aborted runner reported {outcome:?}");
}

#[tokio::test]
async fn pool_without_command_cannot_launch() {
    let dir = tempdir().unwrap();
    let (tx, _rx) = mpsc::channel(8);
    let mut launcher = ProcessLauncher::new(tx, Duration::from_secs(10));

    let err = launcher
        .launch(request(dir.path(), AgentPoolBuilder::new("bare", "main")))
        .await
        .unwrap_err();
    match err {
        SlotdagError::Launch(msg) => assert!(msg.contains("has no command")),
        other => panic!("expected Launch error, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_utf8_output_keeps_heartbeats_flowing() {
    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel(256);
    let mut launcher = ProcessLauncher::new(tx, Duration::from_secs(10));

    let pool = AgentPoolBuilder::new("default", "main")
        .command(r"printf 'HB one\n\377\376 garbage\n'; sleep 0.1; echo 'HB two'; echo 'HB three'; sleep 0.1")
        .heartbeat_on_stdout("^HB");
    let launched = launcher.launch(request(dir.path(), pool)).await.unwrap();

    let events = until_finished(&mut rx).await;
    let beats = events
        .iter()
        .filter(|e| matches!(e, DispatchEvent::Heartbeat { .. }))
        .count();
    assert_eq!(beats, 3);
    assert_eq!(
        events.last(),
        Some(&DispatchEvent::RunnerCompleted {
            runner_id: launched.runner_id
        })
    );
}
