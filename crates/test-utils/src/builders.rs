#![allow(dead_code)]

use std::path::{Path, PathBuf};

use slotdag::config::{AgentPoolConfig, ConfigFile, RawConfigFile, RawPoolSection};
use slotdag::registry::TaskDefinition;
use slotdag::types::{CorruptionPolicy, SchedulingPolicy};

/// Builder for `ConfigFile` to simplify test setup.
///
/// Defaults are tuned for tests: a 10ms poll interval, no grace period,
/// no retry backoff, deadlock checks on every tick.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = RawConfigFile::default();
        config.dispatcher.poll_interval = "10ms".to_string();
        config.dispatcher.grace_period = "0ms".to_string();
        config.dispatcher.backoff_base = 0.0;
        config.dispatcher.deadlock_check_every = 1;
        config.registry.lock_timeout = "500ms".to_string();
        Self { config }
    }

    pub fn policy(mut self, policy: SchedulingPolicy) -> Self {
        self.config.dispatcher.policy = policy;
        self
    }

    pub fn poll_interval(mut self, value: &str) -> Self {
        self.config.dispatcher.poll_interval = value.to_string();
        self
    }

    pub fn heartbeat_timeout(mut self, value: &str) -> Self {
        self.config.dispatcher.heartbeat_timeout = value.to_string();
        self
    }

    pub fn grace_period(mut self, value: &str) -> Self {
        self.config.dispatcher.grace_period = value.to_string();
        self
    }

    pub fn max_concurrency(mut self, value: usize) -> Self {
        self.config.dispatcher.max_concurrency = value;
        self
    }

    pub fn max_retries(mut self, value: u32) -> Self {
        self.config.dispatcher.max_retries = value;
        self
    }

    pub fn backoff_base(mut self, value: f64) -> Self {
        self.config.dispatcher.backoff_base = value;
        self
    }

    pub fn deadlock_check_every(mut self, ticks: u64) -> Self {
        self.config.dispatcher.deadlock_check_every = ticks;
        self
    }

    pub fn stale_sweep_every(mut self, ticks: u64) -> Self {
        self.config.dispatcher.stale_sweep_every = ticks;
        self
    }

    pub fn state_dir(mut self, dir: &Path) -> Self {
        self.config.registry.state_dir = dir.to_path_buf();
        self
    }

    pub fn stale_lock_age(mut self, value: &str) -> Self {
        self.config.slots.stale_lock_age = value.to_string();
        self
    }

    /// Slot pool with one slot per path.
    pub fn slot_pool(mut self, name: &str, slots: Vec<PathBuf>) -> Self {
        self.config.pool.insert(
            name.to_string(),
            RawPoolSection {
                repository: None,
                reference: "HEAD".to_string(),
                slots,
                on_corruption: CorruptionPolicy::Quarantine,
            },
        );
        self
    }

    pub fn on_corruption(mut self, pool: &str, policy: CorruptionPolicy) -> Self {
        if let Some(section) = self.config.pool.get_mut(pool) {
            section.on_corruption = policy;
        }
        self
    }

    pub fn agent_pool(mut self, pool: AgentPoolBuilder) -> Self {
        let pool = pool.build();
        self.config.agent_pool.insert(pool.name.clone(), pool);
        self
    }

    pub fn default_pool(mut self, name: &str) -> Self {
        self.config.routing.default_pool = Some(name.to_string());
        self
    }

    pub fn route(mut self, capability: &str, pools: &[&str]) -> Self {
        self.config.routing.capabilities.insert(
            capability.to_string(),
            pools.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `AgentPoolConfig`.
pub struct AgentPoolBuilder {
    pool: AgentPoolConfig,
}

impl AgentPoolBuilder {
    pub fn new(name: &str, slot_pool: &str) -> Self {
        Self {
            pool: AgentPoolConfig::new(name, slot_pool),
        }
    }

    pub fn max_concurrency(mut self, value: usize) -> Self {
        self.pool.max_concurrency = value;
        self
    }

    pub fn cpu(mut self, quota: f64, per_runner: f64) -> Self {
        self.pool.cpu_quota = Some(quota);
        self.pool.cpu_per_runner = per_runner;
        self
    }

    pub fn memory_mb(mut self, quota: u64, per_runner: u64) -> Self {
        self.pool.memory_quota_mb = Some(quota);
        self.pool.memory_per_runner_mb = per_runner;
        self
    }

    pub fn command(mut self, cmd: &str) -> Self {
        self.pool.command = Some(cmd.to_string());
        self
    }

    pub fn heartbeat_on_stdout(mut self, pattern: &str) -> Self {
        self.pool.heartbeat_on_stdout = Some(pattern.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.pool.enabled = false;
        self
    }

    pub fn build(self) -> AgentPoolConfig {
        self.pool
    }
}

/// Builder for `TaskDefinition`.
pub struct TaskDefBuilder {
    def: TaskDefinition,
}

impl TaskDefBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            def: TaskDefinition {
                id: id.to_string(),
                title: format!("task {id}"),
                description: String::new(),
                depends_on: vec![],
                capability: None,
                priority: 0,
                optional: false,
            },
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.def.title = title.to_string();
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.def.depends_on.push(dep.to_string());
        self
    }

    pub fn capability(mut self, capability: &str) -> Self {
        self.def.capability = Some(capability.to_string());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.def.priority = priority;
        self
    }

    pub fn optional(mut self) -> Self {
        self.def.optional = true;
        self
    }

    pub fn build(self) -> TaskDefinition {
        self.def
    }
}
