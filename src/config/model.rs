// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::registry::{RegistryOptions, RetryPolicy};
use crate::slots::{PoolSpec, SlotOptions};
use crate::types::{CorruptionPolicy, SchedulingPolicy};

/// Configuration exactly as read from TOML, before validation.
///
/// ```toml
/// [dispatcher]
/// poll_interval = "2s"
/// policy = "priority"
///
/// [registry]
/// state_dir = ".slotdag"
///
/// [pool.main]
/// reference = "origin/main"
/// slots = ["/work/main-0", "/work/main-1"]
///
/// [agent_pool.default]
/// slot_pool = "main"
/// max_concurrency = 2
/// command = "./run-agent.sh"
///
/// [routing]
/// default_pool = "default"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub dispatcher: RawDispatcherSection,

    #[serde(default)]
    pub registry: RawRegistrySection,

    #[serde(default)]
    pub slots: RawSlotsSection,

    /// Slot pools from `[pool.<name>]`.
    #[serde(default)]
    pub pool: BTreeMap<String, RawPoolSection>,

    /// Execution targets from `[agent_pool.<name>]`.
    #[serde(default)]
    pub agent_pool: BTreeMap<String, AgentPoolConfig>,

    #[serde(default)]
    pub routing: RoutingConfig,
}

/// `[dispatcher]` section. Durations are strings such as `"2s"`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDispatcherSection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default)]
    pub policy: SchedulingPolicy,
    /// Cap on running runners across all agent pools.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_grace_period")]
    pub grace_period: String,
    /// Run cycle detection every N ticks.
    #[serde(default = "default_deadlock_check_every")]
    pub deadlock_check_every: u64,
    /// Sweep stale leases every N ticks.
    #[serde(default = "default_stale_sweep_every")]
    pub stale_sweep_every: u64,
    #[serde(default = "default_fair_share_window")]
    pub fair_share_window: usize,
}

fn default_poll_interval() -> String {
    "2s".to_string()
}

fn default_max_concurrency() -> usize {
    8
}

fn default_heartbeat_timeout() -> String {
    "60s".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_grace_period() -> String {
    "30s".to_string()
}

fn default_deadlock_check_every() -> u64 {
    10
}

fn default_stale_sweep_every() -> u64 {
    30
}

fn default_fair_share_window() -> usize {
    32
}

impl Default for RawDispatcherSection {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            policy: SchedulingPolicy::default(),
            max_concurrency: default_max_concurrency(),
            heartbeat_timeout: default_heartbeat_timeout(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            grace_period: default_grace_period(),
            deadlock_check_every: default_deadlock_check_every(),
            stale_sweep_every: default_stale_sweep_every(),
            fair_share_window: default_fair_share_window(),
        }
    }
}

/// `[registry]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRegistrySection {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_registry_lock_timeout")]
    pub lock_timeout: String,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".slotdag")
}

fn default_registry_lock_timeout() -> String {
    "2s".to_string()
}

fn default_lock_retries() -> u32 {
    3
}

impl Default for RawRegistrySection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lock_timeout: default_registry_lock_timeout(),
            lock_retries: default_lock_retries(),
        }
    }
}

/// `[slots]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSlotsSection {
    /// Wait per candidate slot lease. `"0ms"` means a single attempt.
    #[serde(default = "default_slot_lock_timeout")]
    pub lock_timeout: String,
    #[serde(default = "default_stale_lock_age")]
    pub stale_lock_age: String,
    #[serde(default = "default_cleanup_attempts")]
    pub cleanup_attempts: u32,
}

fn default_slot_lock_timeout() -> String {
    "0ms".to_string()
}

fn default_stale_lock_age() -> String {
    "30m".to_string()
}

fn default_cleanup_attempts() -> u32 {
    2
}

impl Default for RawSlotsSection {
    fn default() -> Self {
        Self {
            lock_timeout: default_slot_lock_timeout(),
            stale_lock_age: default_stale_lock_age(),
            cleanup_attempts: default_cleanup_attempts(),
        }
    }
}

/// `[pool.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPoolSection {
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default = "default_reference")]
    pub reference: String,
    #[serde(default)]
    pub slots: Vec<PathBuf>,
    #[serde(default)]
    pub on_corruption: CorruptionPolicy,
}

fn default_reference() -> String {
    "HEAD".to_string()
}

/// `[agent_pool.<name>]` section: one execution target.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentPoolConfig {
    /// Filled in from the table key.
    #[serde(skip)]
    pub name: String,
    #[serde(default = "default_agent_kind")]
    pub kind: String,
    /// Slot pool this agent pool draws working directories from.
    pub slot_pool: String,
    #[serde(default = "default_agent_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub cpu_quota: Option<f64>,
    #[serde(default = "default_cpu_per_runner")]
    pub cpu_per_runner: f64,
    #[serde(default)]
    pub memory_quota_mb: Option<u64>,
    #[serde(default)]
    pub memory_per_runner_mb: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Shell command the process launcher runs inside the slot.
    #[serde(default)]
    pub command: Option<String>,
    /// When set, only stdout lines matching this regex count as heartbeats.
    #[serde(default)]
    pub heartbeat_on_stdout: Option<String>,
}

fn default_agent_kind() -> String {
    "process".to_string()
}

fn default_agent_concurrency() -> usize {
    1
}

fn default_cpu_per_runner() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl AgentPoolConfig {
    pub fn new(name: &str, slot_pool: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: default_agent_kind(),
            slot_pool: slot_pool.to_string(),
            max_concurrency: default_agent_concurrency(),
            cpu_quota: None,
            cpu_per_runner: default_cpu_per_runner(),
            memory_quota_mb: None,
            memory_per_runner_mb: 0,
            enabled: default_enabled(),
            command: None,
            heartbeat_on_stdout: None,
        }
    }
}

/// `[routing]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RoutingConfig {
    /// Agent pool for tasks without a matching capability route.
    #[serde(default)]
    pub default_pool: Option<String>,
    /// Capability tag -> candidate agent pools.
    #[serde(default)]
    pub capabilities: BTreeMap<String, Vec<String>>,
}

/// Validated dispatcher settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub policy: SchedulingPolicy,
    pub max_concurrency: usize,
    pub heartbeat_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: f64,
    pub grace_period: Duration,
    pub deadlock_check_every: u64,
    pub stale_sweep_every: u64,
    pub fair_share_window: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            policy: SchedulingPolicy::default(),
            max_concurrency: default_max_concurrency(),
            heartbeat_timeout: Duration::from_secs(60),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            grace_period: Duration::from_secs(30),
            deadlock_check_every: default_deadlock_check_every(),
            stale_sweep_every: default_stale_sweep_every(),
            fair_share_window: default_fair_share_window(),
        }
    }
}

/// Validated registry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    pub state_dir: PathBuf,
    pub lock_timeout: Duration,
    pub lock_retries: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lock_timeout: Duration::from_secs(2),
            lock_retries: default_lock_retries(),
        }
    }
}

/// Validated configuration.
///
/// Only constructible through `TryFrom<RawConfigFile>` (see `validate.rs`),
/// so holding one means the cross-references have been checked.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub dispatcher: DispatcherConfig,
    pub registry: RegistryConfig,
    pub slots: SlotOptions,
    pub pools: BTreeMap<String, PoolSpec>,
    pub agent_pools: BTreeMap<String, AgentPoolConfig>,
    pub routing: RoutingConfig,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        dispatcher: DispatcherConfig,
        registry: RegistryConfig,
        slots: SlotOptions,
        pools: BTreeMap<String, PoolSpec>,
        agent_pools: BTreeMap<String, AgentPoolConfig>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            slots,
            pools,
            agent_pools,
            routing,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.dispatcher.max_retries,
            backoff_base: self.dispatcher.backoff_base,
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            retry: self.retry_policy(),
            lock_timeout: self.registry.lock_timeout,
            lock_retries: self.registry.lock_retries,
        }
    }

    /// Where leases live: `<state_dir>/locks`.
    pub fn lock_dir(&self) -> PathBuf {
        self.registry.state_dir.join("locks")
    }
}
