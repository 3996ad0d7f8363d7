// src/exec/process.rs

//! Runner launcher that runs the agent pool's shell command inside the slot.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::launcher::{LaunchFuture, LaunchRequest, LaunchedRunner, RunnerLauncher};
use crate::engine::{DispatchEvent, RunnerId};
use crate::errors::{Result, SlotdagError};

/// Launches `sh -c <command>` (or `cmd /C` on Windows) per runner.
///
/// The task context is exported as `SLOTDAG_*` environment variables.
/// Heartbeats are sent every `heartbeat_interval` while the process is alive,
/// unless the pool sets `heartbeat_on_stdout`, in which case only matching
/// stdout lines count.
#[derive(Debug)]
pub struct ProcessLauncher {
    events_tx: mpsc::Sender<DispatchEvent>,
    heartbeat_interval: Duration,
    cancels: HashMap<RunnerId, oneshot::Sender<()>>,
}

impl ProcessLauncher {
    pub fn new(events_tx: mpsc::Sender<DispatchEvent>, heartbeat_interval: Duration) -> Self {
        Self {
            events_tx,
            heartbeat_interval: heartbeat_interval.max(Duration::from_millis(10)),
            cancels: HashMap::new(),
        }
    }

    fn spawn_child(request: &LaunchRequest, runner_id: &str) -> anyhow::Result<Child> {
        let command = request
            .pool
            .command
            .as_deref()
            .ok_or_else(|| anyhow!("agent pool '{}' has no command", request.pool.name))?;

        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };

        cmd.current_dir(&request.slot.path)
            .env("SLOTDAG_TASK_SET", &request.task_set)
            .env("SLOTDAG_TASK_ID", &request.task.id)
            .env("SLOTDAG_TASK_TITLE", &request.task.title)
            .env("SLOTDAG_TASK_DESCRIPTION", &request.task.description)
            .env(
                "SLOTDAG_CAPABILITY",
                request.task.capability.as_deref().unwrap_or(""),
            )
            .env("SLOTDAG_RETRY_COUNT", request.task.retry_count.to_string())
            .env("SLOTDAG_BRANCH", &request.branch)
            .env("SLOTDAG_SLOT_ID", &request.slot.id)
            .env("SLOTDAG_SLOT_PATH", &request.slot.path)
            .env("SLOTDAG_RUNNER_ID", runner_id)
            .env("SLOTDAG_AGENT_POOL", &request.pool.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().with_context(|| {
            format!(
                "spawning runner for task '{}/{}' in {:?}",
                request.task_set, request.task.id, request.slot.path
            )
        })
    }
}

impl RunnerLauncher for ProcessLauncher {
    fn launch(&mut self, request: LaunchRequest) -> LaunchFuture<'_, Result<LaunchedRunner>> {
        Box::pin(async move {
            self.cancels.retain(|_, cancel| !cancel.is_closed());

            let runner_id = format!("runner-{}", Uuid::new_v4());
            let heartbeat_regex = match request.pool.heartbeat_on_stdout.as_deref() {
                Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                    SlotdagError::Launch(format!("invalid heartbeat_on_stdout regex: {e}"))
                })?),
                None => None,
            };

            let child = Self::spawn_child(&request, &runner_id)
                .map_err(|e| SlotdagError::Launch(format!("{e:#}")))?;

            info!(
                runner = %runner_id,
                task_set = %request.task_set,
                task = %request.task.id,
                slot = %request.slot.id,
                pool = %request.pool.name,
                "runner process started"
            );

            let (cancel_tx, cancel_rx) = oneshot::channel();
            self.cancels.insert(runner_id.clone(), cancel_tx);

            let monitor = RunnerMonitor {
                runner_id: runner_id.clone(),
                events_tx: self.events_tx.clone(),
                heartbeat_interval: self.heartbeat_interval,
                heartbeat_regex,
            };
            tokio::spawn(monitor.run(child, cancel_rx));

            Ok(LaunchedRunner { runner_id })
        })
    }

    fn abort(&mut self, runner_id: RunnerId) -> LaunchFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.cancels.remove(&runner_id) {
                Some(cancel) => {
                    if cancel.send(()).is_err() {
                        debug!(runner = %runner_id, "runner already finished before abort");
                    }
                }
                None => debug!(runner = %runner_id, "abort for unknown runner ignored"),
            }
            Ok(())
        })
    }
}

/// Background task watching one runner process.
struct RunnerMonitor {
    runner_id: RunnerId,
    events_tx: mpsc::Sender<DispatchEvent>,
    heartbeat_interval: Duration,
    heartbeat_regex: Option<Regex>,
}

impl RunnerMonitor {
    /// If the cancel channel fires the child is killed and **no** completion
    /// signal is sent; the dispatcher already decided the outcome.
    async fn run(self, mut child: Child, mut cancel_rx: oneshot::Receiver<()>) {
        let runner_id = self.runner_id.clone();
        let events_tx = self.events_tx.clone();

        self.watch_output(&mut child);

        let periodic = self.heartbeat_regex.is_none();
        let mut ticker = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                status_res = child.wait() => {
                    let event = match status_res {
                        Ok(status) if status.success() => {
                            info!(runner = %runner_id, "runner process exited successfully");
                            DispatchEvent::RunnerCompleted { runner_id: runner_id.clone() }
                        }
                        Ok(status) => {
                            let code = status.code().unwrap_or(-1);
                            warn!(runner = %runner_id, exit_code = code, "runner process failed");
                            DispatchEvent::RunnerFailed {
                                runner_id: runner_id.clone(),
                                reason: format!("exit code {code}"),
                            }
                        }
                        Err(e) => {
                            error!(runner = %runner_id, error = %e, "waiting for runner process failed");
                            DispatchEvent::RunnerFailed {
                                runner_id: runner_id.clone(),
                                reason: format!("wait failed: {e}"),
                            }
                        }
                    };
                    if events_tx.send(event).await.is_err() {
                        debug!(runner = %runner_id, "dispatcher gone; completion dropped");
                    }
                    break;
                }

                _ = ticker.tick(), if periodic => {
                    if events_tx
                        .send(DispatchEvent::Heartbeat { runner_id: runner_id.clone() })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }

                cancel = &mut cancel_rx => {
                    match cancel {
                        Ok(()) => {
                            info!(runner = %runner_id, "abort requested; killing runner process");
                            if let Err(e) = child.kill().await {
                                warn!(runner = %runner_id, error = %e, "failed to kill runner process");
                            }
                        }
                        Err(_) => {
                            // Launcher dropped; kill_on_drop takes care of the child.
                            debug!(runner = %runner_id, "cancel channel closed");
                        }
                    }
                    break;
                }
            }
        }
    }

    /// Drain stdout/stderr so pipes never fill, turning matching stdout
    /// lines into heartbeats when a pattern is configured.
    fn watch_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            spawn_stdout_reader(
                self.runner_id.clone(),
                stdout,
                self.heartbeat_regex.clone(),
                self.events_tx.clone(),
            );
        }

        if let Some(stderr) = child.stderr.take() {
            let runner_id = self.runner_id.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Some(line) = next_lossy_line(&mut reader, &mut buf).await {
                    debug!(runner = %runner_id, "stderr: {}", line);
                }
            });
        }
    }
}

fn spawn_stdout_reader(
    runner_id: RunnerId,
    stdout: ChildStdout,
    heartbeat_regex: Option<Regex>,
    events_tx: mpsc::Sender<DispatchEvent>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        while let Some(line) = next_lossy_line(&mut reader, &mut buf).await {
            debug!(runner = %runner_id, "stdout: {}", line);

            let Some(re) = heartbeat_regex.as_ref() else {
                continue;
            };
            if re.is_match(&line) {
                let event = DispatchEvent::Heartbeat {
                    runner_id: runner_id.clone(),
                };
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    });
}

/// Next line of child output without its terminator. Invalid UTF-8 is
/// replaced rather than ending the read, so the pipe keeps draining.
/// `None` at EOF or on a read error.
async fn next_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }
            Some(String::from_utf8_lossy(buf).into_owned())
        }
    }
}
