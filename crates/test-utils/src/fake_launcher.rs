use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use slotdag::engine::{DispatchEvent, RunnerId, RunnerStatus};
use slotdag::errors::{Result, SlotdagError};
use slotdag::exec::{LaunchFuture, LaunchRequest, LaunchedRunner, RunnerLauncher};

/// What the fake does right after a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Push `RunnerCompleted` immediately.
    AutoComplete,
    /// Push `RunnerFailed` with the given reason immediately.
    AutoFail(String),
    /// Push nothing; the test drives the runner.
    Manual,
    /// Refuse to launch.
    Refuse,
}

#[derive(Debug)]
struct State {
    mode: LaunchMode,
    next_id: u64,
    launches: Vec<(RunnerId, LaunchRequest)>,
    aborts: Vec<RunnerId>,
    statuses: HashMap<RunnerId, RunnerStatus>,
}

/// A fake launcher that:
/// - records every launch request and abort
/// - reports outcomes according to its [`LaunchMode`]
///
/// Clones share state, so a test keeps one clone for inspection while the
/// dispatcher owns the other.
#[derive(Debug, Clone)]
pub struct FakeLauncher {
    events_tx: mpsc::Sender<DispatchEvent>,
    state: Arc<Mutex<State>>,
}

impl FakeLauncher {
    pub fn new(events_tx: mpsc::Sender<DispatchEvent>, mode: LaunchMode) -> Self {
        Self {
            events_tx,
            state: Arc::new(Mutex::new(State {
                mode,
                next_id: 0,
                launches: Vec::new(),
                aborts: Vec::new(),
                statuses: HashMap::new(),
            })),
        }
    }

    pub fn set_mode(&self, mode: LaunchMode) {
        self.state.lock().unwrap().mode = mode;
    }

    /// `set/id` of every launched task, in launch order.
    pub fn launched_tasks(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .launches
            .iter()
            .map(|(_, req)| format!("{}/{}", req.task_set, req.task.id))
            .collect()
    }

    pub fn launches(&self) -> Vec<(RunnerId, LaunchRequest)> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn runner_for(&self, task_id: &str) -> Option<RunnerId> {
        self.state
            .lock()
            .unwrap()
            .launches
            .iter()
            .rev()
            .find(|(_, req)| req.task.id == task_id)
            .map(|(id, _)| id.clone())
    }

    pub fn aborts(&self) -> Vec<RunnerId> {
        self.state.lock().unwrap().aborts.clone()
    }

    /// Answer subsequent `poll_status` calls for this runner.
    pub fn set_status(&self, runner_id: &str, status: RunnerStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(runner_id.to_string(), status);
    }

    pub async fn heartbeat(&self, runner_id: &str) {
        self.send(DispatchEvent::Heartbeat {
            runner_id: runner_id.to_string(),
        })
        .await;
    }

    pub async fn complete(&self, runner_id: &str) {
        self.send(DispatchEvent::RunnerCompleted {
            runner_id: runner_id.to_string(),
        })
        .await;
    }

    pub async fn fail(&self, runner_id: &str, reason: &str) {
        self.send(DispatchEvent::RunnerFailed {
            runner_id: runner_id.to_string(),
            reason: reason.to_string(),
        })
        .await;
    }

    async fn send(&self, event: DispatchEvent) {
        self.events_tx
            .send(event)
            .await
            .expect("dispatcher event channel closed");
    }
}

impl RunnerLauncher for FakeLauncher {
    fn launch(&mut self, request: LaunchRequest) -> LaunchFuture<'_, Result<LaunchedRunner>> {
        Box::pin(async move {
            let (runner_id, mode) = {
                let mut state = self.state.lock().unwrap();
                if state.mode == LaunchMode::Refuse {
                    return Err(SlotdagError::Launch("fake launcher refused".to_string()));
                }
                state.next_id += 1;
                let runner_id = format!("fake-{}", state.next_id);
                state.launches.push((runner_id.clone(), request));
                (runner_id, state.mode.clone())
            };

            match mode {
                LaunchMode::AutoComplete => {
                    self.send(DispatchEvent::RunnerCompleted {
                        runner_id: runner_id.clone(),
                    })
                    .await
                }
                LaunchMode::AutoFail(reason) => {
                    self.send(DispatchEvent::RunnerFailed {
                        runner_id: runner_id.clone(),
                        reason,
                    })
                    .await
                }
                LaunchMode::Manual | LaunchMode::Refuse => {}
            }

            Ok(LaunchedRunner { runner_id })
        })
    }

    fn poll_status(&mut self, runner_id: RunnerId) -> LaunchFuture<'_, Option<RunnerStatus>> {
        let status = self.state.lock().unwrap().statuses.get(&runner_id).cloned();
        Box::pin(async move { status })
    }

    fn abort(&mut self, runner_id: RunnerId) -> LaunchFuture<'_, Result<()>> {
        self.state.lock().unwrap().aborts.push(runner_id);
        Box::pin(async { Ok(()) })
    }
}
