// src/config/validate.rs

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::config::model::{
    AgentPoolConfig, ConfigFile, DispatcherConfig, RawConfigFile, RegistryConfig,
};
use crate::errors::{Result, SlotdagError};
use crate::slots::{PoolSpec, SlotOptions};
use crate::types::{CorruptionPolicy, parse_duration};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::SlotdagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;

        let d = &raw.dispatcher;
        let dispatcher = DispatcherConfig {
            poll_interval: duration("dispatcher.poll_interval", &d.poll_interval)?,
            policy: d.policy,
            max_concurrency: d.max_concurrency,
            heartbeat_timeout: duration("dispatcher.heartbeat_timeout", &d.heartbeat_timeout)?,
            max_retries: d.max_retries,
            backoff_base: d.backoff_base,
            grace_period: duration("dispatcher.grace_period", &d.grace_period)?,
            deadlock_check_every: d.deadlock_check_every,
            stale_sweep_every: d.stale_sweep_every,
            fair_share_window: d.fair_share_window,
        };

        let registry = RegistryConfig {
            state_dir: raw.registry.state_dir.clone(),
            lock_timeout: duration("registry.lock_timeout", &raw.registry.lock_timeout)?,
            lock_retries: raw.registry.lock_retries,
        };

        let slots = SlotOptions {
            lock_timeout: duration("slots.lock_timeout", &raw.slots.lock_timeout)?,
            stale_lock_age: duration("slots.stale_lock_age", &raw.slots.stale_lock_age)?,
            cleanup_attempts: raw.slots.cleanup_attempts,
        };

        let pools: BTreeMap<String, PoolSpec> = raw
            .pool
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    PoolSpec {
                        name: name.clone(),
                        repository: p.repository.clone(),
                        reference: p.reference.clone(),
                        slots: p.slots.clone(),
                        on_corruption: p.on_corruption,
                    },
                )
            })
            .collect();

        let agent_pools: BTreeMap<String, AgentPoolConfig> = raw
            .agent_pool
            .iter()
            .map(|(name, a)| {
                let mut agent = a.clone();
                agent.name = name.clone();
                (name.clone(), agent)
            })
            .collect();

        Ok(ConfigFile::new_unchecked(
            dispatcher,
            registry,
            slots,
            pools,
            agent_pools,
            raw.routing,
        ))
    }
}

/// Run every semantic check on a raw config.
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    validate_raw_config(cfg)
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_dispatcher(cfg)?;
    validate_durations(cfg)?;
    validate_pools(cfg)?;
    validate_agent_pools(cfg)?;
    validate_routing(cfg)?;
    Ok(())
}

fn config_error(msg: String) -> SlotdagError {
    SlotdagError::ConfigError(msg)
}

fn duration(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_error(format!("[{field}] {e}")))
}

fn validate_dispatcher(cfg: &RawConfigFile) -> Result<()> {
    let d = &cfg.dispatcher;

    if d.max_concurrency == 0 {
        return Err(config_error(
            "[dispatcher].max_concurrency must be >= 1 (got 0)".to_string(),
        ));
    }
    if !d.backoff_base.is_finite() || d.backoff_base < 0.0 {
        return Err(config_error(format!(
            "[dispatcher].backoff_base must be a finite, non-negative number (got {})",
            d.backoff_base
        )));
    }
    if d.deadlock_check_every == 0 {
        return Err(config_error(
            "[dispatcher].deadlock_check_every must be >= 1 (got 0)".to_string(),
        ));
    }
    if d.stale_sweep_every == 0 {
        return Err(config_error(
            "[dispatcher].stale_sweep_every must be >= 1 (got 0)".to_string(),
        ));
    }
    if d.fair_share_window == 0 {
        return Err(config_error(
            "[dispatcher].fair_share_window must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_durations(cfg: &RawConfigFile) -> Result<()> {
    let must_be_positive = [
        ("dispatcher.poll_interval", &cfg.dispatcher.poll_interval),
        ("dispatcher.heartbeat_timeout", &cfg.dispatcher.heartbeat_timeout),
        ("slots.stale_lock_age", &cfg.slots.stale_lock_age),
    ];
    for (field, value) in must_be_positive {
        if duration(field, value)?.is_zero() {
            return Err(config_error(format!("[{field}] must be greater than zero")));
        }
    }

    // Zero is meaningful for these: a single attempt / no grace.
    duration("dispatcher.grace_period", &cfg.dispatcher.grace_period)?;
    duration("registry.lock_timeout", &cfg.registry.lock_timeout)?;
    duration("slots.lock_timeout", &cfg.slots.lock_timeout)?;

    if cfg.slots.cleanup_attempts == 0 {
        return Err(config_error(
            "[slots].cleanup_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_pools(cfg: &RawConfigFile) -> Result<()> {
    let mut seen: HashSet<&PathBuf> = HashSet::new();
    for (name, pool) in cfg.pool.iter() {
        if pool.reference.trim().is_empty() {
            return Err(config_error(format!(
                "pool '{name}' has an empty `reference`"
            )));
        }
        if pool.on_corruption == CorruptionPolicy::Reprovision && pool.repository.is_none() {
            return Err(config_error(format!(
                "pool '{name}' uses on_corruption = \"reprovision\" but has no `repository`"
            )));
        }
        for path in pool.slots.iter() {
            if !seen.insert(path) {
                return Err(config_error(format!(
                    "slot path {path:?} in pool '{name}' is used more than once"
                )));
            }
        }
    }
    Ok(())
}

fn validate_agent_pools(cfg: &RawConfigFile) -> Result<()> {
    for (name, agent) in cfg.agent_pool.iter() {
        if !cfg.pool.contains_key(&agent.slot_pool) {
            return Err(config_error(format!(
                "agent pool '{name}' references unknown slot pool '{}'",
                agent.slot_pool
            )));
        }
        if agent.max_concurrency == 0 {
            return Err(config_error(format!(
                "agent pool '{name}': max_concurrency must be >= 1 (got 0)"
            )));
        }
        if !agent.cpu_per_runner.is_finite() || agent.cpu_per_runner < 0.0 {
            return Err(config_error(format!(
                "agent pool '{name}': cpu_per_runner must be a finite, non-negative number"
            )));
        }
        if let Some(quota) = agent.cpu_quota {
            if !quota.is_finite() || quota < agent.cpu_per_runner {
                return Err(config_error(format!(
                    "agent pool '{name}': cpu_quota ({quota}) is below cpu_per_runner ({})",
                    agent.cpu_per_runner
                )));
            }
        }
        if let Some(quota) = agent.memory_quota_mb {
            if quota < agent.memory_per_runner_mb {
                return Err(config_error(format!(
                    "agent pool '{name}': memory_quota_mb ({quota}) is below memory_per_runner_mb ({})",
                    agent.memory_per_runner_mb
                )));
            }
        }
        if let Some(pattern) = agent.heartbeat_on_stdout.as_deref() {
            Regex::new(pattern).map_err(|e| {
                config_error(format!(
                    "agent pool '{name}': invalid heartbeat_on_stdout regex: {e}"
                ))
            })?;
        }
    }
    Ok(())
}

fn validate_routing(cfg: &RawConfigFile) -> Result<()> {
    if let Some(default_pool) = cfg.routing.default_pool.as_deref() {
        if !cfg.agent_pool.contains_key(default_pool) {
            return Err(config_error(format!(
                "[routing].default_pool references unknown agent pool '{default_pool}'"
            )));
        }
    }
    for (capability, pools) in cfg.routing.capabilities.iter() {
        if pools.is_empty() {
            return Err(config_error(format!(
                "routing for capability '{capability}' lists no agent pools"
            )));
        }
        for pool in pools {
            if !cfg.agent_pool.contains_key(pool) {
                return Err(config_error(format!(
                    "routing for capability '{capability}' references unknown agent pool '{pool}'"
                )));
            }
        }
    }
    Ok(())
}
