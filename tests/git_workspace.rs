// tests/git_workspace.rs
//
// These tests shell out to `git` and are skipped when it is not installed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::{TempDir, tempdir};

use slotdag::lease::MemoryLeaseManager;
use slotdag::slots::{GitWorkspace, PoolSpec, SlotOptions, SlotPoolManager, SlotState, Workspace};
use slotdag::types::CorruptionPolicy;
use slotdag_test_utils::init_tracing;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=slotdag", "-c", "user.email=slotdag@localhost"])
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// An origin repository with one commit on `main`, plus `n` clones of it.
struct Fixture {
    dir: TempDir,
    origin: PathBuf,
    slots: Vec<PathBuf>,
}

impl Fixture {
    fn new(n: usize) -> Self {
        let dir = tempdir().unwrap();
        let origin = dir.path().join("origin");
        fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init", "-q"]);
        git(&origin, &["checkout", "-q", "-b", "main"]);
        fs::write(origin.join("README.md"), "hello\n").unwrap();
        git(&origin, &["add", "README.md"]);
        git(&origin, &["commit", "-q", "-m", "initial"]);

        let slots = (0..n)
            .map(|i| {
                let slot = dir.path().join(format!("slot-{i}"));
                git(
                    dir.path(),
                    &["clone", "-q", origin.to_str().unwrap(), slot.to_str().unwrap()],
                );
                slot
            })
            .collect();

        Self { dir, origin, slots }
    }

    fn repository(&self) -> String {
        self.origin.to_string_lossy().into_owned()
    }
}

#[test]
fn scrub_resets_tracked_and_removes_untracked_files() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    init_tracing();
    let fx = Fixture::new(1);
    let slot = &fx.slots[0];
    let ws = GitWorkspace;

    fs::write(slot.join("README.md"), "scribbled\n").unwrap();
    fs::write(slot.join("notes.txt"), "untracked\n").unwrap();
    fs::create_dir_all(slot.join("target/debug")).unwrap();

    ws.scrub(slot, "HEAD").unwrap();

    assert_eq!(fs::read_to_string(slot.join("README.md")).unwrap(), "hello\n");
    assert!(!slot.join("notes.txt").exists());
    assert!(!slot.join("target").exists());
}

#[test]
fn prepare_follows_the_remote_reference() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new(1);
    let slot = &fx.slots[0];
    let ws = GitWorkspace;

    fs::write(fx.origin.join("CHANGELOG.md"), "v2\n").unwrap();
    git(&fx.origin, &["add", "CHANGELOG.md"]);
    git(&fx.origin, &["commit", "-q", "-m", "second"]);
    let upstream = git(&fx.origin, &["rev-parse", "HEAD"]);

    ws.prepare(slot, "origin/main").unwrap();

    let (_, commit) = ws.head(slot);
    assert_eq!(commit.as_deref(), Some(upstream.as_str()));
    assert!(slot.join("CHANGELOG.md").is_file());
}

#[test]
fn verify_detects_missing_metadata() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new(1);
    let slot = &fx.slots[0];
    let ws = GitWorkspace;

    ws.verify(slot).unwrap();
    let (branch, commit) = ws.head(slot);
    assert_eq!(branch.as_deref(), Some("main"));
    assert_eq!(commit.map(|c| c.len()), Some(40));

    fs::remove_dir_all(slot.join(".git")).unwrap();
    assert!(ws.verify(slot).is_err());
    assert!(ws.verify(&fx.dir.path().join("missing")).is_err());
}

#[test]
fn reprovision_clones_a_fresh_copy() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new(1);
    let slot = &fx.slots[0];
    let ws = GitWorkspace;

    fs::remove_dir_all(slot.join(".git")).unwrap();
    fs::write(slot.join("junk"), "x").unwrap();

    ws.reprovision(slot, Some(&fx.repository()), "HEAD").unwrap();
    ws.verify(slot).unwrap();
    assert!(!slot.join("junk").exists());

    assert!(ws.reprovision(slot, None, "HEAD").is_err());
}

#[test]
fn pool_over_git_slots_quarantines_and_reprovisions() {
    if !git_available() {
        return;
    }
    init_tracing();
    let fx = Fixture::new(2);
    fs::remove_dir_all(fx.slots[0].join(".git")).unwrap();
    fs::remove_dir_all(fx.slots[1].join(".git")).unwrap();

    let pools = vec![
        PoolSpec {
            name: "strict".to_string(),
            repository: None,
            reference: "HEAD".to_string(),
            slots: vec![fx.slots[0].clone()],
            on_corruption: CorruptionPolicy::Quarantine,
        },
        PoolSpec {
            name: "healing".to_string(),
            repository: Some(fx.repository()),
            reference: "origin/main".to_string(),
            slots: vec![fx.slots[1].clone()],
            on_corruption: CorruptionPolicy::Reprovision,
        },
    ];
    let manager = SlotPoolManager::new(
        pools,
        SlotOptions::default(),
        Arc::new(MemoryLeaseManager::new()),
        Arc::new(GitWorkspace),
    )
    .unwrap();

    assert!(manager.allocate("strict").is_err());
    assert_eq!(manager.slot("strict-0").unwrap().state, SlotState::Error);

    let healed = manager.allocate("healing").unwrap();
    assert_eq!(healed.state, SlotState::Allocated);
    assert_eq!(healed.branch.as_deref(), Some("main"));
    assert!(healed.path.join("README.md").is_file());

    fs::write(healed.path.join("scratch.txt"), "tmp").unwrap();
    manager.release(&healed.id).unwrap();
    assert!(!healed.path.join("scratch.txt").exists());
    assert_eq!(manager.slot(&healed.id).unwrap().state, SlotState::Available);
}
