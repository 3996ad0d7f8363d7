// tests/cli_commands.rs

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use tempfile::tempdir;

use slotdag::cli::CliArgs;
use slotdag::config::load_and_validate;
use slotdag::registry::{
    EventKind, RegistryOptions, TaskRegistry, TaskState, load_task_set_definition,
};
use slotdag_test_utils::init_tracing;

fn demo(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("demos").join(path)
}

fn write_config(dir: &Path) -> PathBuf {
    let slot = dir.join("slot-0");
    fs::create_dir_all(&slot).unwrap();
    let config = dir.join("Slotdag.toml");
    fs::write(
        &config,
        format!(
            r#"
[registry]
state_dir = '{}'

[pool.main]
slots = ['{}']

[agent_pool.default]
slot_pool = "main"
command = "true"

[routing]
default_pool = "default"
"#,
            dir.join("state").display(),
            slot.display()
        ),
    )
    .unwrap();
    config
}

async fn slotdag(config: &Path, args: &[&str]) -> anyhow::Result<()> {
    let mut argv = vec!["slotdag", "--config", config.to_str().unwrap()];
    argv.extend_from_slice(args);
    slotdag::run(CliArgs::try_parse_from(argv).unwrap()).await
}

#[test]
fn demo_files_are_valid() {
    let cfg = load_and_validate(demo("Slotdag.toml")).unwrap();
    assert_eq!(cfg.pools["main"].slots.len(), 2);

    let def = load_task_set_definition(demo("tasksets/auth.toml")).unwrap();
    assert_eq!(def.name, "auth");
    assert_eq!(def.tasks.len(), 4);

    let registry = TaskRegistry::in_memory(RegistryOptions::default());
    let set = registry.create_task_set(&def.name, &def.tasks).unwrap();
    assert_eq!(set.tasks["1"].state, TaskState::Ready);
    assert_eq!(set.tasks["2"].state, TaskState::Ready);
    assert_eq!(set.tasks["3"].state, TaskState::Blocked);
}

#[test]
fn cli_parses_global_flags_after_subcommand() {
    let args = CliArgs::try_parse_from([
        "slotdag",
        "run",
        "--once",
        "--dry-run",
        "--config",
        "other.toml",
    ])
    .unwrap();
    assert_eq!(args.config, PathBuf::from("other.toml"));
    assert!(matches!(
        args.command,
        slotdag::cli::Command::Run {
            once: true,
            dry_run: true
        }
    ));

    assert!(CliArgs::try_parse_from(["slotdag", "status"]).is_err());
}

#[tokio::test]
async fn ingest_inspect_rebuild_and_archive() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let taskset = demo("tasksets/auth.toml");

    slotdag(&config, &["ingest", taskset.to_str().unwrap()])
        .await
        .unwrap();
    // Same name twice is refused.
    assert!(
        slotdag(&config, &["ingest", taskset.to_str().unwrap()])
            .await
            .is_err()
    );

    slotdag(&config, &["status", "auth"]).await.unwrap();
    slotdag(&config, &["events", "auth"]).await.unwrap();
    slotdag(&config, &["pools"]).await.unwrap();
    slotdag(&config, &["sweep"]).await.unwrap();
    slotdag(&config, &["rebuild", "auth"]).await.unwrap();
    assert!(slotdag(&config, &["status", "missing"]).await.is_err());

    // Dry run plans the two ready tasks and exits without touching them.
    slotdag(&config, &["run", "--once", "--dry-run"])
        .await
        .unwrap();

    let registry = TaskRegistry::open(&dir.path().join("state"), RegistryOptions::default());
    let set = registry.get_task_set("auth").unwrap();
    assert!(
        set.tasks
            .values()
            .all(|t| matches!(t.state, TaskState::Ready | TaskState::Blocked))
    );
    assert!(
        registry
            .events("auth")
            .unwrap()
            .iter()
            .all(|e| e.kind != EventKind::TaskAssigned)
    );

    slotdag(&config, &["archive", "auth"]).await.unwrap();
    assert!(registry.list_task_sets().unwrap().is_empty());
}

#[tokio::test]
async fn broken_config_is_reported_with_path() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("Slotdag.toml");
    fs::write(&config, "[agent_pool.default]\nslot_pool = \"nowhere\"\n").unwrap();

    let err = slotdag(&config, &["pools"]).await.unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("loading config"));
    assert!(message.contains("nowhere"));
}

#[test]
fn log_filter_prefers_cli_flag_then_env() {
    use slotdag::cli::LogLevel;
    use slotdag::logging::filter_directives;

    assert_eq!(
        filter_directives(Some(LogLevel::Debug), Some("slotdag=trace")),
        "debug"
    );
    assert_eq!(
        filter_directives(None, Some(" slotdag::engine=debug,warn ")),
        "slotdag::engine=debug,warn"
    );
    assert_eq!(filter_directives(None, Some("  ")), "info");
    assert_eq!(filter_directives(None, None), "info");
}
