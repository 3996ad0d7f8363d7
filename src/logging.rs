// src/logging.rs

//! `tracing` subscriber setup.
//!
//! The filter is taken from `--log-level` when given, otherwise from
//! `SLOTDAG_LOG`, which accepts full `EnvFilter` directives such as
//! `slotdag::engine=debug,info`. Output goes to stderr so `status` and
//! `events` can be piped.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "SLOTDAG_LOG";
const DEFAULT_DIRECTIVES: &str = "info";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let directives = filter_directives(cli_level, env.as_deref());

    let (filter, rejected) = match EnvFilter::try_new(&directives) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(DEFAULT_DIRECTIVES), Some(e)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    if let Some(e) = rejected {
        tracing::warn!(directives = %directives, error = %e, "ignoring {LOG_ENV}; using {DEFAULT_DIRECTIVES}");
    }
    Ok(())
}

/// Directive string for the subscriber: the CLI level wins, then a
/// non-blank `SLOTDAG_LOG`, then `info`.
pub fn filter_directives(cli_level: Option<LogLevel>, env: Option<&str>) -> String {
    if let Some(level) = cli_level {
        return level_directive(level).to_string();
    }
    match env.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => DEFAULT_DIRECTIVES.to_string(),
    }
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}
