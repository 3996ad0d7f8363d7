// tests/config_validation.rs

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::NamedTempFile;

use slotdag::config::{ConfigFile, load_and_validate};
use slotdag::errors::SlotdagError;
use slotdag::types::{CorruptionPolicy, SchedulingPolicy};
use slotdag_test_utils::{AgentPoolBuilder, ConfigFileBuilder};

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn expect_config_error(contents: &str, needle: &str) {
    let file = write_config(contents);
    match load_and_validate(file.path()) {
        Err(SlotdagError::ConfigError(msg)) => {
            assert!(msg.contains(needle), "message {msg:?} lacks {needle:?}");
        }
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

const BASE_POOLS: &str = r#"
[pool.main]
slots = ["/work/main-0", "/work/main-1"]

[agent_pool.default]
slot_pool = "main"
"#;

#[test]
fn full_config_is_parsed() {
    let file = write_config(
        r#"
[dispatcher]
poll_interval = "500ms"
policy = "fair_share"
max_concurrency = 4
heartbeat_timeout = "2m"
max_retries = 5
backoff_base = 3.0
grace_period = "10s"
deadlock_check_every = 5
stale_sweep_every = 20
fair_share_window = 8

[registry]
state_dir = "/var/lib/slotdag"
lock_timeout = "1s"
lock_retries = 4

[slots]
lock_timeout = "100ms"
stale_lock_age = "1h"
cleanup_attempts = 3

[pool.main]
repository = "git@example.com:org/repo.git"
reference = "origin/main"
slots = ["/work/main-0", "/work/main-1"]
on_corruption = "reprovision"

[agent_pool.rust]
slot_pool = "main"
max_concurrency = 2
cpu_quota = 4.0
cpu_per_runner = 2.0
memory_quota_mb = 8192
memory_per_runner_mb = 2048
command = "./agent.sh"
heartbeat_on_stdout = "^HEARTBEAT"

[agent_pool.docs]
slot_pool = "main"
enabled = false

[routing]
default_pool = "rust"

[routing.capabilities]
rust = ["rust"]
docs = ["docs", "rust"]
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();

    let d = &cfg.dispatcher;
    assert_eq!(d.poll_interval, Duration::from_millis(500));
    assert_eq!(d.policy, SchedulingPolicy::FairShare);
    assert_eq!(d.max_concurrency, 4);
    assert_eq!(d.heartbeat_timeout, Duration::from_secs(120));
    assert_eq!(d.max_retries, 5);
    assert_eq!(d.grace_period, Duration::from_secs(10));
    assert_eq!(d.fair_share_window, 8);

    assert_eq!(cfg.registry.state_dir, PathBuf::from("/var/lib/slotdag"));
    assert_eq!(cfg.registry.lock_retries, 4);
    assert_eq!(cfg.lock_dir(), PathBuf::from("/var/lib/slotdag/locks"));
    assert_eq!(cfg.slots.stale_lock_age, Duration::from_secs(3600));
    assert_eq!(cfg.slots.cleanup_attempts, 3);

    let main = &cfg.pools["main"];
    assert_eq!(main.name, "main");
    assert_eq!(main.reference, "origin/main");
    assert_eq!(main.on_corruption, CorruptionPolicy::Reprovision);
    assert_eq!(main.slots.len(), 2);

    let rust = &cfg.agent_pools["rust"];
    assert_eq!(rust.name, "rust");
    assert_eq!(rust.cpu_quota, Some(4.0));
    assert_eq!(rust.command.as_deref(), Some("./agent.sh"));
    assert!(!cfg.agent_pools["docs"].enabled);

    assert_eq!(cfg.routing.capabilities["docs"], vec!["docs", "rust"]);

    let options = cfg.registry_options();
    assert_eq!(options.retry.max_retries, 5);
    assert_eq!(options.retry.backoff(2), chrono::Duration::seconds(9));
}

#[test]
fn empty_config_uses_defaults() {
    let file = write_config("");
    let cfg = load_and_validate(file.path()).unwrap();

    assert_eq!(cfg.dispatcher.policy, SchedulingPolicy::Priority);
    assert_eq!(cfg.dispatcher.poll_interval, Duration::from_secs(2));
    assert_eq!(cfg.dispatcher.heartbeat_timeout, Duration::from_secs(60));
    assert_eq!(cfg.dispatcher.max_retries, 3);
    assert_eq!(cfg.registry.state_dir, PathBuf::from(".slotdag"));
    assert_eq!(cfg.slots.lock_timeout, Duration::ZERO);
    assert!(cfg.pools.is_empty());
    assert!(cfg.agent_pools.is_empty());
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let file = write_config("[dispatcher\npolicy = ");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(SlotdagError::TomlError(_))
    ));
}

#[test]
fn unknown_policy_is_rejected_at_parse_time() {
    let file = write_config("[dispatcher]\npolicy = \"round_robin\"\n");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(SlotdagError::TomlError(_))
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    assert!(matches!(
        load_and_validate("/definitely/not/here/Slotdag.toml"),
        Err(SlotdagError::IoError(_))
    ));
}

#[test]
fn bad_durations_are_rejected() {
    expect_config_error(
        "[dispatcher]\npoll_interval = \"5 fortnights\"\n",
        "dispatcher.poll_interval",
    );
    expect_config_error(
        "[dispatcher]\nheartbeat_timeout = \"0s\"\n",
        "must be greater than zero",
    );
    expect_config_error("[slots]\nstale_lock_age = \"10\"\n", "missing unit");
}

#[test]
fn zero_counts_are_rejected() {
    expect_config_error("[dispatcher]\nmax_concurrency = 0\n", "max_concurrency");
    expect_config_error(
        "[dispatcher]\ndeadlock_check_every = 0\n",
        "deadlock_check_every",
    );
    expect_config_error("[slots]\ncleanup_attempts = 0\n", "cleanup_attempts");
    expect_config_error("[dispatcher]\nbackoff_base = -1.0\n", "backoff_base");
}

#[test]
fn agent_pool_must_reference_known_slot_pool() {
    expect_config_error(
        "[agent_pool.default]\nslot_pool = \"ghost\"\n",
        "unknown slot pool 'ghost'",
    );
}

#[test]
fn agent_pool_limits_are_checked() {
    expect_config_error(
        &format!("{BASE_POOLS}\n[agent_pool.tight]\nslot_pool = \"main\"\ncpu_quota = 0.5\n"),
        "cpu_quota",
    );
    expect_config_error(
        &format!(
            "{BASE_POOLS}\n[agent_pool.mem]\nslot_pool = \"main\"\nmemory_quota_mb = 100\nmemory_per_runner_mb = 200\n"
        ),
        "memory_quota_mb",
    );
    expect_config_error(
        &format!(
            "{BASE_POOLS}\n[agent_pool.noisy]\nslot_pool = \"main\"\nheartbeat_on_stdout = \"([\"\n"
        ),
        "heartbeat_on_stdout",
    );
}

#[test]
fn routing_must_reference_known_agent_pools() {
    expect_config_error(
        &format!("{BASE_POOLS}\n[routing]\ndefault_pool = \"nobody\"\n"),
        "unknown agent pool 'nobody'",
    );
    expect_config_error(
        &format!("{BASE_POOLS}\n[routing.capabilities]\nrust = [\"default\", \"gpu\"]\n"),
        "unknown agent pool 'gpu'",
    );
    expect_config_error(
        &format!("{BASE_POOLS}\n[routing.capabilities]\nrust = []\n"),
        "lists no agent pools",
    );
}

#[test]
fn slot_paths_must_be_unique_across_pools() {
    expect_config_error(
        r#"
[pool.a]
slots = ["/work/shared"]

[pool.b]
slots = ["/work/shared"]
"#,
        "used more than once",
    );
}

#[test]
fn reprovision_requires_a_repository() {
    expect_config_error(
        "[pool.main]\nslots = [\"/work/a\"]\non_corruption = \"reprovision\"\n",
        "no `repository`",
    );
}

#[test]
fn builder_output_passes_validation() {
    let raw = ConfigFileBuilder::new()
        .slot_pool("main", vec![PathBuf::from("/tmp/slot-a")])
        .agent_pool(AgentPoolBuilder::new("default", "main").max_concurrency(2))
        .default_pool("default")
        .route("rust", &["default"])
        .raw();

    let cfg = ConfigFile::try_from(raw).unwrap();
    assert_eq!(cfg.agent_pools["default"].max_concurrency, 2);
    assert_eq!(cfg.routing.default_pool.as_deref(), Some("default"));
}
