// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod lease;
pub mod logging;
pub mod registry;
pub mod slots;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::{CliArgs, Command};
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::engine::{DispatchEvent, Dispatcher, RunOptions};
use crate::exec::ProcessLauncher;
use crate::lease::FileLeaseManager;
use crate::registry::{TaskRegistry, load_task_set_definition};
use crate::slots::{GitWorkspace, SlotPoolManager};

/// High-level entry point used by `main.rs`.
///
/// Loads and validates the config, opens the registry under `state_dir`,
/// then dispatches on the subcommand.
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let registry = Arc::new(TaskRegistry::open(
        &cfg.registry.state_dir,
        cfg.registry_options(),
    ));

    match args.command {
        Command::Run { once, dry_run } => {
            run_dispatcher(&cfg, registry, RunOptions {
                exit_when_idle: once,
                dry_run,
            })
            .await
        }
        Command::Ingest { file } => ingest(&registry, &file),
        Command::Status { set } => print_status(&registry, &set),
        Command::Events { set } => print_events(&registry, &set),
        Command::Pools => print_pools(&open_slots(&cfg)?),
        Command::RepairSlot { slot_id } => {
            let slot = open_slots(&cfg)?.repair_slot(&slot_id)?;
            println!("{} repaired ({:?})", slot.id, slot.state);
            Ok(())
        }
        Command::Archive { set } => {
            registry.archive_task_set(&set)?;
            println!("{set} archived");
            Ok(())
        }
        Command::Rebuild { set } => {
            let rebuilt = registry.restore_from_events(&set)?;
            println!(
                "{set} rebuilt at version {} ({} tasks)",
                rebuilt.version,
                rebuilt.tasks.len()
            );
            Ok(())
        }
        Command::Sweep => {
            let slots = open_slots(&cfg)?;
            let mut reclaimed = slots.sweep_stale(cfg.slots.stale_lock_age)?;
            reclaimed.extend(registry.sweep_stale_locks(cfg.slots.stale_lock_age)?);
            if reclaimed.is_empty() {
                println!("no stale leases");
            }
            for key in reclaimed {
                println!("reclaimed {key}");
            }
            Ok(())
        }
    }
}

fn open_slots(cfg: &ConfigFile) -> Result<SlotPoolManager> {
    let leases = Arc::new(FileLeaseManager::new(cfg.lock_dir()));
    let slots = SlotPoolManager::new(
        cfg.pools.values().cloned(),
        cfg.slots.clone(),
        leases,
        Arc::new(GitWorkspace),
    )?;
    Ok(slots)
}

async fn run_dispatcher(
    cfg: &ConfigFile,
    registry: Arc<TaskRegistry>,
    options: RunOptions,
) -> Result<()> {
    let slots = Arc::new(open_slots(cfg)?);

    let (tx, rx) = mpsc::channel::<DispatchEvent>(256);
    let launcher = ProcessLauncher::new(tx.clone(), cfg.dispatcher.heartbeat_timeout / 3);

    // Ctrl-C → graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        let _ = tx.send(DispatchEvent::ShutdownRequested).await;
    });

    for pool in slots.pool_names() {
        let summary = slots.pool_summary(&pool)?;
        info!(
            pool = %pool,
            available = summary.available,
            allocated = summary.allocated,
            error = summary.error,
            "slot pool ready"
        );
    }

    let dispatcher = Dispatcher::new(cfg, registry, slots, launcher, rx, options);
    let report = dispatcher.run().await?;
    if !report.aborted.is_empty() {
        warn!(aborted = report.aborted.len(), "runners aborted at shutdown");
    }
    Ok(())
}

fn ingest(registry: &TaskRegistry, file: &Path) -> Result<()> {
    let def = load_task_set_definition(file)?;
    let set = registry.create_task_set(&def.name, &def.tasks)?;
    let counts = set.state_counts();
    println!("{} created with {} tasks {:?}", set.name, set.tasks.len(), counts);
    Ok(())
}

fn print_status(registry: &TaskRegistry, name: &str) -> Result<()> {
    let set = registry.get_task_set(name)?;
    println!("{} (version {})", set.name, set.version);
    for task in set.tasks_in_order() {
        println!(
            "  {:<12} {:<8} p={:<3} retries={} {}",
            task.id,
            format!("{:?}", task.state),
            task.priority,
            task.retry_count,
            task.title
        );
        if !task.depends_on.is_empty() {
            println!("      after: {}", task.depends_on.join(", "));
        }
        if let Some(slot) = &task.slot_id {
            println!("      slot: {slot}");
        }
        if let Some(error) = &task.last_error {
            println!("      last error: {error}");
        }
    }
    for cycle in registry.find_blocked_cycles(name)? {
        println!("  deadlock: {}", cycle.join(" -> "));
    }
    Ok(())
}

fn print_events(registry: &TaskRegistry, name: &str) -> Result<()> {
    for event in registry.events(name)? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn print_pools(slots: &SlotPoolManager) -> Result<()> {
    for pool in slots.pool_names() {
        let summary = slots.pool_summary(&pool)?;
        println!(
            "{pool}: {} available, {} allocated, {} cleaning, {} error",
            summary.available, summary.allocated, summary.cleaning, summary.error
        );
        for slot in slots.slots(Some(&pool)) {
            println!(
                "  {:<12} {:<10} {}",
                slot.id,
                format!("{:?}", slot.state),
                slot.path.display()
            );
            if let Some(error) = &slot.error {
                println!("      error: {error}");
            }
        }
    }
    Ok(())
}
