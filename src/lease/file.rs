// src/lease/file.rs

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{LeaseManager, LeaseRecord};
use crate::errors::Result;

/// Lease store backed by a directory.
///
/// For a key `K` there are two files:
/// - `K.lock`: an fs2 advisory lock held only for the few microseconds it
///   takes to read-check-write the record. The OS drops it if the process
///   dies, so it can never go stale.
/// - `K.lease`: the JSON [`LeaseRecord`]. Its presence means "held". It
///   survives crashes, which is what the stale sweep is for.
#[derive(Debug, Clone)]
pub struct FileLeaseManager {
    dir: PathBuf,
}

impl FileLeaseManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn guard_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(key)))
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lease", file_stem(key)))
    }

    /// Run `f` while holding the advisory guard for `key`.
    fn with_guard<T>(&self, key: &str, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        fs::create_dir_all(&self.dir)?;

        let guard = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.guard_path(key))?;
        FileExt::lock_exclusive(&guard)?;

        let result = f(&self.record_path(key));

        if let Err(e) = FileExt::unlock(&guard) {
            debug!(key, error = %e, "failed to unlock lease guard; dropped with file");
        }
        result
    }

    fn write_record(&self, path: &Path, record: &LeaseRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl LeaseManager for FileLeaseManager {
    fn try_acquire(&self, key: &str, holder: &str) -> Result<bool> {
        self.with_guard(key, |path| {
            if let Some(existing) = read_record(path)? {
                debug!(key, holder = %existing.holder, "lease already held");
                return Ok(false);
            }
            self.write_record(path, &LeaseRecord::new(key, holder))?;
            debug!(key, holder, "lease acquired");
            Ok(true)
        })
    }

    fn release(&self, key: &str, holder: &str) -> Result<bool> {
        self.with_guard(key, |path| match read_record(path)? {
            Some(existing) if existing.holder == holder => {
                remove_if_exists(path)?;
                debug!(key, holder, "lease released");
                Ok(true)
            }
            Some(existing) => {
                warn!(
                    key,
                    holder,
                    current_holder = %existing.holder,
                    "release requested by a holder that does not own the lease"
                );
                Ok(false)
            }
            None => Ok(false),
        })
    }

    fn renew(&self, key: &str, holder: &str) -> Result<bool> {
        self.with_guard(key, |path| match read_record(path)? {
            Some(mut record) if record.holder == holder => {
                record.renewed_at = Some(Utc::now());
                self.write_record(path, &record)?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn holder_of(&self, key: &str) -> Result<Option<LeaseRecord>> {
        read_record(&self.record_path(key))
    }

    fn force_reclaim(&self, key: &str) -> Result<Option<LeaseRecord>> {
        self.with_guard(key, |path| {
            let existing = read_record(path)?;
            remove_if_exists(path)?;
            Ok(existing)
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<LeaseRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lease") {
                continue;
            }
            if let Some(record) = read_record(&path)? {
                if record.key.starts_with(prefix) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}

/// Lease keys may contain characters that are awkward in file names.
fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_record(path: &Path) -> Result<Option<LeaseRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str::<LeaseRecord>(&contents) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            // Records are written via rename, so this is outside tampering.
            warn!(path = ?path, error = %e, "unreadable lease record; treating lease as free");
            Ok(None)
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

