// src/slots/workspace.rs

//! Operations on a slot's working directory.

use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::debug;

/// What the slot pool needs from the version-control layer.
pub trait Workspace: Send + Sync + Debug {
    /// Pre-allocation cleanup: refresh remotes, drop untracked files and
    /// hard-reset to `reference`.
    fn prepare(&self, path: &Path, reference: &str) -> Result<()>;

    /// Post-use cleanup. Same as `prepare` without touching remotes.
    fn scrub(&self, path: &Path, reference: &str) -> Result<()>;

    /// Integrity check of the VCS metadata.
    fn verify(&self, path: &Path) -> Result<()>;

    /// Replace the directory with a fresh clone of `repository`.
    fn reprovision(&self, path: &Path, repository: Option<&str>, reference: &str) -> Result<()>;

    /// Current branch and commit, if they can be determined.
    fn head(&self, path: &Path) -> (Option<String>, Option<String>);
}

/// Git-backed slots.
#[derive(Debug, Clone, Default)]
pub struct GitWorkspace;

impl GitWorkspace {
    fn git(path: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(path)
            .args(args)
            .output()
            .with_context(|| format!("running git {} in {:?}", args.join(" "), path))?;

        if !output.status.success() {
            bail!(
                "git {} failed in {:?}: {}",
                args.join(" "),
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn reset_to(path: &Path, reference: &str) -> Result<()> {
        Self::git(path, &["reset", "--hard", reference])?;
        Self::git(path, &["clean", "-fdx"])?;
        Ok(())
    }
}

impl Workspace for GitWorkspace {
    fn prepare(&self, path: &Path, reference: &str) -> Result<()> {
        Self::git(path, &["fetch", "--all", "--prune"])?;
        Self::reset_to(path, reference)?;
        debug!(path = ?path, reference, "slot prepared");
        Ok(())
    }

    fn scrub(&self, path: &Path, reference: &str) -> Result<()> {
        Self::reset_to(path, reference)?;
        debug!(path = ?path, reference, "slot scrubbed");
        Ok(())
    }

    fn verify(&self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            bail!("slot directory {:?} does not exist", path);
        }
        // Without this, git would happily find an enclosing repository.
        if !path.join(".git").exists() {
            bail!("slot directory {:?} has no .git", path);
        }
        Self::git(path, &["rev-parse", "--git-dir"])?;
        Self::git(path, &["rev-parse", "--verify", "HEAD"])?;
        Ok(())
    }

    fn reprovision(&self, path: &Path, repository: Option<&str>, reference: &str) -> Result<()> {
        let Some(repository) = repository else {
            bail!("no repository configured to re-provision {:?}", path);
        };

        if path.exists() {
            fs::remove_dir_all(path).with_context(|| format!("removing {:?}", path))?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }

        let output = Command::new("git")
            .arg("clone")
            .arg(repository)
            .arg(path)
            .output()
            .with_context(|| format!("cloning {repository} into {:?}", path))?;
        if !output.status.success() {
            bail!(
                "git clone {repository} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Self::reset_to(path, reference)
    }

    fn head(&self, path: &Path) -> (Option<String>, Option<String>) {
        let branch = Self::git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).ok();
        let commit = Self::git(path, &["rev-parse", "HEAD"]).ok();
        (branch, commit)
    }
}
