// src/exec/mod.rs

//! Runner execution layer.
//!
//! - [`launcher`] provides the `RunnerLauncher` trait the dispatcher talks to.
//! - [`process`] is the production launcher: one shell process per runner,
//!   reporting heartbeats and completion as `DispatchEvent`s.

pub mod launcher;
pub mod process;

pub use launcher::{LaunchFuture, LaunchRequest, LaunchedRunner, RunnerLauncher};
pub use process::ProcessLauncher;
