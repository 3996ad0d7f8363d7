// src/engine/routing.rs

//! Which agent pool a task goes to, and whether that pool can take it now.

use std::collections::BTreeMap;

use crate::config::{AgentPoolConfig, RoutingConfig};

/// Maps capability tags to candidate agent pools.
#[derive(Debug, Clone)]
pub struct Router {
    routes: BTreeMap<String, Vec<String>>,
    default_pool: Option<String>,
    /// Tagged tasks without an explicit route are not sent to the default
    /// pool.
    strict: bool,
}

impl Router {
    pub fn new(routing: &RoutingConfig, strict: bool) -> Self {
        Self {
            routes: routing.capabilities.clone(),
            default_pool: routing.default_pool.clone(),
            strict,
        }
    }

    /// Candidate agent pools for a task, or `None` when the task cannot be
    /// routed at all.
    pub fn candidates(&self, capability: Option<&str>) -> Option<Vec<String>> {
        if let Some(cap) = capability {
            if let Some(pools) = self.routes.get(cap) {
                return Some(pools.clone());
            }
            if self.strict {
                return None;
            }
        }
        self.default_pool.clone().map(|pool| vec![pool])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Load {
    running: usize,
    cpu: f64,
    memory_mb: u64,
}

/// Running counts and resource use per agent pool.
///
/// Admission is checked here before any slot is requested, so a pool's
/// running count can never exceed its `max_concurrency`.
#[derive(Debug, Clone)]
pub struct PoolLoads {
    pools: BTreeMap<String, AgentPoolConfig>,
    loads: BTreeMap<String, Load>,
    global_max: usize,
}

impl PoolLoads {
    pub fn new(pools: BTreeMap<String, AgentPoolConfig>, global_max: usize) -> Self {
        Self {
            pools,
            loads: BTreeMap::new(),
            global_max,
        }
    }

    pub fn pool(&self, name: &str) -> Option<&AgentPoolConfig> {
        self.pools.get(name)
    }

    pub fn running(&self, name: &str) -> usize {
        self.loads.get(name).map(|l| l.running).unwrap_or(0)
    }

    pub fn total_running(&self) -> usize {
        self.loads.values().map(|l| l.running).sum()
    }

    /// Fraction of the pool's concurrency in use.
    pub fn ratio(&self, name: &str) -> f64 {
        match self.pools.get(name) {
            Some(pool) if pool.max_concurrency > 0 => {
                self.running(name) as f64 / pool.max_concurrency as f64
            }
            _ => f64::INFINITY,
        }
    }

    /// Whether one more runner fits in `name` right now.
    pub fn admits(&self, name: &str) -> bool {
        let Some(pool) = self.pools.get(name) else {
            return false;
        };
        if !pool.enabled || self.total_running() >= self.global_max {
            return false;
        }

        let load = self.loads.get(name).copied().unwrap_or_default();
        if load.running >= pool.max_concurrency {
            return false;
        }
        if let Some(quota) = pool.cpu_quota {
            if load.cpu + pool.cpu_per_runner > quota + f64::EPSILON {
                return false;
            }
        }
        if let Some(quota) = pool.memory_quota_mb {
            if load.memory_mb + pool.memory_per_runner_mb > quota {
                return false;
            }
        }
        true
    }

    /// Least-loaded admitting pool among `candidates`. Ties keep candidate
    /// order.
    pub fn pick(&self, candidates: &[String]) -> Option<String> {
        let mut best: Option<(&String, f64)> = None;
        for name in candidates.iter().filter(|name| self.admits(name)) {
            let ratio = self.ratio(name);
            if best.is_none_or(|(_, r)| ratio < r) {
                best = Some((name, ratio));
            }
        }
        best.map(|(name, _)| name.clone())
    }

    pub fn reserve(&mut self, name: &str) {
        let Some(pool) = self.pools.get(name) else {
            return;
        };
        let load = self.loads.entry(name.to_string()).or_default();
        load.running += 1;
        load.cpu += pool.cpu_per_runner;
        load.memory_mb += pool.memory_per_runner_mb;
    }

    pub fn release(&mut self, name: &str) {
        let Some(pool) = self.pools.get(name) else {
            return;
        };
        if let Some(load) = self.loads.get_mut(name) {
            load.running = load.running.saturating_sub(1);
            load.cpu = (load.cpu - pool.cpu_per_runner).max(0.0);
            load.memory_mb = load.memory_mb.saturating_sub(pool.memory_per_runner_mb);
        }
    }
}
