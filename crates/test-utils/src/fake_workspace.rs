use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Context, Result, bail};

use slotdag::slots::Workspace;

/// Marker standing in for VCS metadata.
pub const MARKER: &str = ".scratch";

/// Filesystem-only slot workspace.
///
/// A slot is healthy when it contains the [`MARKER`] file. Cleanup deletes
/// every other entry. `reprovision` recreates the directory with a fresh
/// marker.
#[derive(Debug, Clone, Default)]
pub struct ScratchWorkspace {
    fail_cleanup: Arc<AtomicBool>,
    prepares: Arc<AtomicUsize>,
    reprovisions: Arc<AtomicUsize>,
}

impl ScratchWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `count` healthy slot directories under `root`.
    pub fn make_slots(root: &Path, prefix: &str, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = root.join(format!("{prefix}-{i}"));
                Self::init_slot(&path);
                path
            })
            .collect()
    }

    pub fn init_slot(path: &Path) {
        fs::create_dir_all(path).expect("create slot dir");
        fs::write(path.join(MARKER), "v1\n").expect("write marker");
    }

    /// Break the slot's metadata so the integrity check fails.
    pub fn corrupt(path: &Path) {
        fs::remove_file(path.join(MARKER)).expect("remove marker");
    }

    /// Make every cleanup fail until switched back.
    pub fn set_fail_cleanup(&self, fail: bool) {
        self.fail_cleanup.store(fail, Ordering::SeqCst);
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn reprovision_count(&self) -> usize {
        self.reprovisions.load(Ordering::SeqCst)
    }

    fn clean(&self, path: &Path) -> Result<()> {
        if self.fail_cleanup.load(Ordering::SeqCst) {
            bail!("injected cleanup failure in {:?}", path);
        }
        if !path.is_dir() {
            bail!("slot directory {:?} does not exist", path);
        }
        for entry in fs::read_dir(path).with_context(|| format!("reading {:?}", path))? {
            let entry = entry?;
            if entry.file_name() == MARKER {
                continue;
            }
            let p = entry.path();
            if p.is_dir() {
                fs::remove_dir_all(&p)?;
            } else {
                fs::remove_file(&p)?;
            }
        }
        Ok(())
    }
}

impl Workspace for ScratchWorkspace {
    fn prepare(&self, path: &Path, _reference: &str) -> Result<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        self.clean(path)
    }

    fn scrub(&self, path: &Path, _reference: &str) -> Result<()> {
        self.clean(path)
    }

    fn verify(&self, path: &Path) -> Result<()> {
        if !path.join(MARKER).is_file() {
            bail!("missing {MARKER} in {:?}", path);
        }
        Ok(())
    }

    fn reprovision(&self, path: &Path, _repository: Option<&str>, _reference: &str) -> Result<()> {
        self.reprovisions.fetch_add(1, Ordering::SeqCst);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        fs::create_dir_all(path)?;
        fs::write(path.join(MARKER), "v1\n")?;
        Ok(())
    }

    fn head(&self, path: &Path) -> (Option<String>, Option<String>) {
        let commit = fs::read_to_string(path.join(MARKER))
            .ok()
            .map(|s| s.trim().to_string());
        (Some("scratch".to_string()), commit)
    }
}
