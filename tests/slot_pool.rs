// tests/slot_pool.rs

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use slotdag::errors::SlotdagError;
use slotdag::lease::{FileLeaseManager, LeaseManager, MemoryLeaseManager, slot_key};
use slotdag::slots::{PoolSpec, SlotOptions, SlotPoolManager, SlotState};
use slotdag::types::CorruptionPolicy;
use slotdag_test_utils::{ScratchWorkspace, init_tracing};

fn spec(name: &str, slots: Vec<PathBuf>) -> PoolSpec {
    PoolSpec {
        name: name.to_string(),
        repository: None,
        reference: "HEAD".to_string(),
        slots,
        on_corruption: CorruptionPolicy::Quarantine,
    }
}

fn manager(
    pools: Vec<PoolSpec>,
    leases: Arc<dyn LeaseManager>,
    workspace: &ScratchWorkspace,
) -> SlotPoolManager {
    SlotPoolManager::new(
        pools,
        SlotOptions::default(),
        leases,
        Arc::new(workspace.clone()),
    )
    .unwrap()
}

#[test]
fn slot_ids_and_summary() {
    init_tracing();
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 3);
    let ws = ScratchWorkspace::new();
    let pool = manager(
        vec![spec("main", paths)],
        Arc::new(MemoryLeaseManager::new()),
        &ws,
    );

    let ids: Vec<_> = pool.slots(Some("main")).into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["main-0", "main-1", "main-2"]);

    let summary = pool.pool_summary("main").unwrap();
    assert_eq!(summary.available, 3);
    assert_eq!(summary.total(), 3);

    assert!(matches!(
        pool.allocate("nope"),
        Err(SlotdagError::PoolNotFound(_))
    ));
}

#[test]
fn allocation_is_exclusive_and_bounded() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 2);
    let ws = ScratchWorkspace::new();
    let pool = manager(
        vec![spec("main", paths)],
        Arc::new(MemoryLeaseManager::new()),
        &ws,
    );

    let a = pool.allocate("main").unwrap();
    let b = pool.allocate("main").unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(a.state, SlotState::Allocated);
    assert!(matches!(
        pool.allocate("main"),
        Err(SlotdagError::NoSlotAvailable(_))
    ));

    pool.release(&a.id).unwrap();
    pool.release(&b.id).unwrap();
    assert!(pool.allocate("main").is_ok());
    assert!(pool.allocate("main").is_ok());

    let summary = pool.pool_summary("main").unwrap();
    assert_eq!(summary.allocated, 2);
    assert_eq!(summary.available, 0);
}

#[test]
fn concurrent_managers_never_share_a_slot() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(&dir.path().join("slots"), "main", 3);
    let lock_dir = dir.path().join("locks");

    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let paths = paths.clone();
            let lock_dir = lock_dir.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // One manager per thread: separate "processes" sharing a lock dir.
                let ws = ScratchWorkspace::new();
                let pool = manager(
                    vec![spec("main", paths)],
                    Arc::new(FileLeaseManager::new(lock_dir)),
                    &ws,
                );
                barrier.wait();
                pool.allocate("main").map(|slot| slot.id)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let mut won: Vec<String> = results.iter().filter_map(|r| r.as_ref().ok().cloned()).collect();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(SlotdagError::NoSlotAvailable(_))))
        .count();

    won.sort();
    assert_eq!(won, vec!["main-0", "main-1", "main-2"]);
    assert_eq!(refused, contenders - 3);
}

#[test]
fn released_slot_is_reused_and_cleaned() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "solo", 1);
    let ws = ScratchWorkspace::new();
    let pool = manager(
        vec![spec("solo", paths)],
        Arc::new(MemoryLeaseManager::new()),
        &ws,
    );

    let first = pool.allocate("solo").unwrap();
    let scratch_file = first.path.join("untracked.txt");
    fs::write(&scratch_file, "left behind").unwrap();
    pool.release(&first.id).unwrap();

    let second = pool.allocate("solo").unwrap();
    assert_eq!(first.id, second.id);
    assert!(!scratch_file.exists());
    assert_eq!(second.allocation_count, 2);
    assert!(second.last_released_at.is_some());
}

#[test]
fn most_recently_released_slot_goes_first() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 3);
    let ws = ScratchWorkspace::new();
    let pool = manager(
        vec![spec("main", paths)],
        Arc::new(MemoryLeaseManager::new()),
        &ws,
    );

    let a = pool.allocate("main").unwrap();
    let b = pool.allocate("main").unwrap();
    pool.release(&a.id).unwrap();
    thread::sleep(Duration::from_millis(5));
    pool.release(&b.id).unwrap();

    assert_eq!(pool.allocate("main").unwrap().id, b.id);
    assert_eq!(pool.allocate("main").unwrap().id, a.id);
}

#[test]
fn releasing_an_idle_slot_is_rejected() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 1);
    let ws = ScratchWorkspace::new();
    let pool = manager(
        vec![spec("main", paths)],
        Arc::new(MemoryLeaseManager::new()),
        &ws,
    );

    assert!(matches!(
        pool.release("main-0"),
        Err(SlotdagError::Validation(_))
    ));
    assert!(matches!(
        pool.release("main-9"),
        Err(SlotdagError::SlotNotFound(_))
    ));
}

#[test]
fn corrupt_slot_is_quarantined_and_skipped() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 2);
    ScratchWorkspace::corrupt(&paths[0]);
    let ws = ScratchWorkspace::new();
    let pool = manager(
        vec![spec("main", paths)],
        Arc::new(MemoryLeaseManager::new()),
        &ws,
    );

    let slot = pool.allocate("main").unwrap();
    assert_eq!(slot.id, "main-1");

    let bad = pool.slot("main-0").unwrap();
    assert_eq!(bad.state, SlotState::Error);
    assert!(bad.error.unwrap().contains("integrity check failed"));

    let notices = pool.drain_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].slot_id, "main-0");
    assert!(pool.drain_notices().is_empty());

    // Error slots are never handed out.
    pool.release(&slot.id).unwrap();
    assert_eq!(pool.allocate("main").unwrap().id, "main-1");

    // Operator repair brings it back.
    ScratchWorkspace::init_slot(&pool.slot("main-0").unwrap().path);
    let repaired = pool.repair_slot("main-0").unwrap();
    assert_eq!(repaired.state, SlotState::Available);
    assert_eq!(pool.allocate("main").unwrap().id, "main-0");
}

#[test]
fn reprovision_policy_recovers_corrupt_slot() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 1);
    ScratchWorkspace::corrupt(&paths[0]);
    let ws = ScratchWorkspace::new();
    let mut pool_spec = spec("main", paths);
    pool_spec.on_corruption = CorruptionPolicy::Reprovision;
    pool_spec.repository = Some("file:///unused".to_string());
    let pool = manager(vec![pool_spec], Arc::new(MemoryLeaseManager::new()), &ws);

    let slot = pool.allocate("main").unwrap();
    assert_eq!(slot.id, "main-0");
    assert_eq!(ws.reprovision_count(), 1);
    assert!(pool.drain_notices().is_empty());
}

#[test]
fn failed_cleanup_on_release_quarantines() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 1);
    let ws = ScratchWorkspace::new();
    let leases = MemoryLeaseManager::new();
    let pool = manager(vec![spec("main", paths)], Arc::new(leases.clone()), &ws);

    let slot = pool.allocate("main").unwrap();
    ws.set_fail_cleanup(true);
    pool.release(&slot.id).unwrap();

    assert_eq!(pool.slot(&slot.id).unwrap().state, SlotState::Error);
    assert_eq!(pool.drain_notices().len(), 1);
    // The lease is released even though cleanup failed.
    assert!(!leases.is_held(&slot_key(&slot.id)).unwrap());

    ws.set_fail_cleanup(false);
    assert!(matches!(
        pool.allocate("main"),
        Err(SlotdagError::NoSlotAvailable(_))
    ));
}

#[test]
fn remove_slot_refuses_busy_slots() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 1);
    let ws = ScratchWorkspace::new();
    let pool = manager(
        vec![spec("main", paths)],
        Arc::new(MemoryLeaseManager::new()),
        &ws,
    );

    let extra = dir.path().join("extra");
    ScratchWorkspace::init_slot(&extra);
    let added = pool.add_slot("main", &extra).unwrap();
    assert_eq!(added.id, "main-1");
    assert!(matches!(
        pool.add_slot("main", &extra),
        Err(SlotdagError::Validation(_))
    ));

    let busy = pool.allocate("main").unwrap();
    assert!(matches!(
        pool.remove_slot(&busy.id),
        Err(SlotdagError::SlotBusy(_))
    ));
    assert!(matches!(
        pool.repair_slot(&busy.id),
        Err(SlotdagError::SlotBusy(_))
    ));

    let idle = if busy.id == "main-0" { "main-1" } else { "main-0" };
    let removed = pool.remove_slot(idle).unwrap();
    assert_eq!(removed.id, idle);
    assert_eq!(pool.pool_summary("main").unwrap().total(), 1);
}

#[test]
fn stale_slot_leases_are_swept() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 1);
    let leases = MemoryLeaseManager::new();

    // A previous process took the slot and crashed.
    let ws = ScratchWorkspace::new();
    let crashed = manager(vec![spec("main", paths.clone())], Arc::new(leases.clone()), &ws);
    crashed.allocate("main").unwrap();
    drop(crashed);

    let pool = manager(vec![spec("main", paths)], Arc::new(leases.clone()), &ws);
    assert_eq!(pool.slot("main-0").unwrap().state, SlotState::Allocated);
    assert!(matches!(
        pool.allocate("main"),
        Err(SlotdagError::NoSlotAvailable(_))
    ));

    assert!(pool.sweep_stale(Duration::from_secs(60)).unwrap().is_empty());
    leases.backdate(&slot_key("main-0"), Duration::from_secs(3600));
    assert_eq!(
        pool.sweep_stale(Duration::from_secs(60)).unwrap(),
        vec!["main-0"]
    );
    assert_eq!(pool.slot("main-0").unwrap().state, SlotState::Available);
    assert_eq!(pool.allocate("main").unwrap().id, "main-0");
}

#[test]
fn file_leases_renew_only_for_their_holder() {
    let dir = tempdir().unwrap();
    let leases = FileLeaseManager::new(dir.path().join("locks"));
    let key = slot_key("main-0");

    assert!(!leases.renew(&key, "a").unwrap());
    assert!(leases.try_acquire(&key, "a").unwrap());
    assert!(!leases.renew(&key, "b").unwrap());

    thread::sleep(Duration::from_millis(60));
    assert_eq!(leases.stale("slot-", Duration::from_millis(50)).unwrap().len(), 1);

    assert!(leases.renew(&key, "a").unwrap());
    let record = leases.holder_of(&key).unwrap().unwrap();
    assert_eq!(record.holder, "a");
    assert!(record.renewed_at.is_some_and(|at| at > record.acquired_at));
    assert!(leases.stale("slot-", Duration::from_millis(50)).unwrap().is_empty());
}

#[test]
fn sweep_spares_slots_this_manager_holds() {
    let dir = tempdir().unwrap();
    let paths = ScratchWorkspace::make_slots(dir.path(), "main", 1);
    let leases = MemoryLeaseManager::new();
    let ws = ScratchWorkspace::new();
    let pool = manager(vec![spec("main", paths.clone())], Arc::new(leases.clone()), &ws);

    let slot = pool.allocate("main").unwrap();
    leases.backdate(&slot_key(&slot.id), Duration::from_secs(3600));
    assert!(pool.sweep_stale(Duration::from_secs(60)).unwrap().is_empty());
    assert_eq!(pool.slot(&slot.id).unwrap().state, SlotState::Allocated);

    // Renewal makes the lease fresh for everyone else too.
    assert!(pool.renew(&slot.id).unwrap());
    let other = manager(vec![spec("main", paths)], Arc::new(leases.clone()), &ws);
    assert!(other.sweep_stale(Duration::from_secs(60)).unwrap().is_empty());

    pool.release(&slot.id).unwrap();
    assert!(!pool.renew(&slot.id).unwrap());
}
