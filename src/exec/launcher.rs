// src/exec/launcher.rs

//! Pluggable runner launcher abstraction.
//!
//! The dispatcher talks to a `RunnerLauncher` instead of spawning anything
//! itself. Production uses [`ProcessLauncher`](super::ProcessLauncher);
//! tests provide a launcher that records requests and emits completion
//! signals directly.
//!
//! Liveness and completion flow back as `DispatchEvent`s on the channel the
//! launcher was constructed with. `poll_status` is an optional second
//! source; the heartbeat timeout is the fallback when both stay silent.

use std::future::Future;
use std::pin::Pin;

use crate::config::AgentPoolConfig;
use crate::engine::{RunnerId, RunnerStatus};
use crate::errors::Result;
use crate::registry::Task;
use crate::slots::Slot;

/// Everything a runner needs to work on one task.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub task_set: String,
    pub task: Task,
    pub slot: Slot,
    pub pool: AgentPoolConfig,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedRunner {
    pub runner_id: RunnerId,
}

pub type LaunchFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait abstracting how runners are started and stopped.
pub trait RunnerLauncher: Send {
    /// Start a runner for the request.
    fn launch(&mut self, request: LaunchRequest) -> LaunchFuture<'_, Result<LaunchedRunner>>;

    /// Ask for the runner's status. `None` means "no opinion".
    fn poll_status(&mut self, runner_id: RunnerId) -> LaunchFuture<'_, Option<RunnerStatus>> {
        let _ = runner_id;
        Box::pin(async { None })
    }

    /// Stop the runner. Aborting an unknown or finished runner is not an
    /// error.
    fn abort(&mut self, runner_id: RunnerId) -> LaunchFuture<'_, Result<()>>;
}
