// src/registry/store.rs

//! Persistence for task sets and their event logs.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::errors::{Result, SlotdagError};
use crate::registry::events::TaskEvent;
use crate::registry::model::TaskSet;

/// Abstract storage for task sets.
///
/// Callers are expected to hold the set lease around any read-modify-write
/// sequence; the store itself only guarantees that a single `save` is atomic.
pub trait TaskStore: Send + Sync + Debug {
    fn load(&self, name: &str) -> Result<Option<TaskSet>>;
    fn save(&self, set: &TaskSet) -> Result<()>;
    fn append_events(&self, name: &str, events: &[TaskEvent]) -> Result<()>;
    fn read_events(&self, name: &str) -> Result<Vec<TaskEvent>>;
    /// Names of active (non-archived) task sets.
    fn list(&self) -> Result<Vec<String>>;
    /// Move the set out of the active namespace. Its event log is kept.
    fn archive(&self, name: &str) -> Result<()>;
}

/// Layout under `root`:
///
/// ```text
/// sets/<name>.json      current versioned record
/// events/<name>.jsonl   append-only event log
/// archive/<name>.json   archived records
/// ```
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    root: PathBuf,
}

impl FileTaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn set_path(&self, name: &str) -> PathBuf {
        self.root.join("sets").join(format!("{name}.json"))
    }

    fn events_path(&self, name: &str) -> PathBuf {
        self.root.join("events").join(format!("{name}.jsonl"))
    }

    fn archive_path(&self, name: &str) -> PathBuf {
        self.root.join("archive").join(format!("{name}.json"))
    }
}

impl TaskStore for FileTaskStore {
    fn load(&self, name: &str) -> Result<Option<TaskSet>> {
        let path = self.set_path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let set: TaskSet = serde_json::from_str(&contents)?;
        Ok(Some(set))
    }

    fn save(&self, set: &TaskSet) -> Result<()> {
        let path = self.set_path(&set.name);
        write_atomically(&path, &serde_json::to_vec_pretty(set)?)?;
        debug!(task_set = %set.name, version = set.version, "task set saved");
        Ok(())
    }

    fn append_events(&self, name: &str, events: &[TaskEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let path = self.events_path(name);
        ensure_parent(&path)?;

        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_events(&self, name: &str) -> Result<Vec<TaskEvent>> {
        let path = self.events_path(name);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    // A crash mid-append can leave a torn final line.
                    warn!(
                        task_set = %name,
                        line = lineno + 1,
                        error = %e,
                        "skipping unreadable event log line"
                    );
                }
            }
        }
        Ok(events)
    }

    fn list(&self) -> Result<Vec<String>> {
        let dir = self.root.join("sets");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn archive(&self, name: &str) -> Result<()> {
        let from = self.set_path(name);
        if !from.exists() {
            return Err(SlotdagError::TaskSetNotFound(name.to_string()));
        }
        let to = self.archive_path(name);
        ensure_parent(&to)?;
        fs::rename(&from, &to)?;
        info!(task_set = %name, path = ?to, "task set archived");
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write via a temp file in the same directory and rename over the target,
/// so readers never observe a half-written record.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let parent = path
        .parent()
        .ok_or_else(|| SlotdagError::Validation(format!("path has no parent: {path:?}")))?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    sets: HashMap<String, TaskSet>,
    events: HashMap<String, Vec<TaskEvent>>,
    archived: HashMap<String, TaskSet>,
}

/// Keeps everything in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the primary record while keeping the event log, as if the set
    /// file had been lost.
    pub fn forget_set(&self, name: &str) {
        self.inner().sets.remove(name);
    }

    fn inner(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TaskStore for MemoryTaskStore {
    fn load(&self, name: &str) -> Result<Option<TaskSet>> {
        Ok(self.inner().sets.get(name).cloned())
    }

    fn save(&self, set: &TaskSet) -> Result<()> {
        self.inner().sets.insert(set.name.clone(), set.clone());
        Ok(())
    }

    fn append_events(&self, name: &str, events: &[TaskEvent]) -> Result<()> {
        self.inner()
            .events
            .entry(name.to_string())
            .or_default()
            .extend(events.iter().cloned());
        Ok(())
    }

    fn read_events(&self, name: &str) -> Result<Vec<TaskEvent>> {
        Ok(self.inner().events.get(name).cloned().unwrap_or_default())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.inner().sets.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn archive(&self, name: &str) -> Result<()> {
        let mut state = self.inner();
        let set = state
            .sets
            .remove(name)
            .ok_or_else(|| SlotdagError::TaskSetNotFound(name.to_string()))?;
        state.archived.insert(name.to_string(), set);
        Ok(())
    }
}
