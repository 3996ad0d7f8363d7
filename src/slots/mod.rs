// src/slots/mod.rs

//! Exclusive allocation of reusable working directories.
//!
//! Ownership of a slot is the `slot-<id>` lease. The in-memory table kept
//! by [`SlotPoolManager`] is a reporting cache for this process; several
//! managers (possibly in several processes) can share one lease store and
//! still never hand out the same slot twice.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{Result, SlotdagError};
use crate::lease::{LeaseManager, slot_key};
use crate::types::CorruptionPolicy;

pub mod model;
pub mod workspace;

pub use model::{PoolSpec, PoolSummary, Slot, SlotNotice, SlotState};
pub use workspace::{GitWorkspace, Workspace};

#[derive(Debug, Clone, PartialEq)]
pub struct SlotOptions {
    /// How long `allocate` waits on each candidate's lease.
    pub lock_timeout: Duration,
    /// Slot leases older than this are presumed abandoned.
    pub stale_lock_age: Duration,
    /// Attempts per cleanup before the slot is marked `Error`.
    pub cleanup_attempts: u32,
}

impl Default for SlotOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::ZERO,
            stale_lock_age: Duration::from_secs(30 * 60),
            cleanup_attempts: 2,
        }
    }
}

#[derive(Debug)]
struct PoolEntry {
    spec: PoolSpec,
    next_index: usize,
}

#[derive(Debug, Default)]
struct PoolTable {
    pools: BTreeMap<String, PoolEntry>,
    slots: BTreeMap<String, Slot>,
    /// Slots whose lease this manager holds.
    owned: HashSet<String>,
    notices: Vec<SlotNotice>,
}

#[derive(Debug)]
pub struct SlotPoolManager {
    table: Mutex<PoolTable>,
    leases: Arc<dyn LeaseManager>,
    workspace: Arc<dyn Workspace>,
    holder: String,
    options: SlotOptions,
}

impl SlotPoolManager {
    pub fn new(
        pools: impl IntoIterator<Item = PoolSpec>,
        options: SlotOptions,
        leases: Arc<dyn LeaseManager>,
        workspace: Arc<dyn Workspace>,
    ) -> Result<Self> {
        let mut table = PoolTable::default();

        for spec in pools {
            let name = spec.name.clone();
            let paths = spec.slots.clone();
            table.pools.insert(
                name.clone(),
                PoolEntry {
                    spec,
                    next_index: 0,
                },
            );
            for path in paths {
                insert_slot(&mut table, &name, path)?;
            }
        }

        // Slots leased by someone else start out as Allocated in our view.
        for slot in table.slots.values_mut() {
            if leases.is_held(&slot_key(&slot.id))? {
                slot.state = SlotState::Allocated;
            }
        }

        Ok(Self {
            table: Mutex::new(table),
            leases,
            workspace,
            holder: format!("slots-{}", Uuid::new_v4()),
            options,
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn options(&self) -> &SlotOptions {
        &self.options
    }

    /// Lease, clean, verify and hand out a slot from `pool`.
    ///
    /// Candidates are tried most-recently-released first. Never waits
    /// longer than `lock_timeout` per candidate.
    pub fn allocate(&self, pool: &str) -> Result<Slot> {
        let (spec, candidates) = {
            let table = self.lock_table();
            let entry = table
                .pools
                .get(pool)
                .ok_or_else(|| SlotdagError::PoolNotFound(pool.to_string()))?;

            let mut candidates: Vec<&Slot> = table
                .slots
                .values()
                .filter(|s| s.pool == pool)
                .filter(|s| {
                    s.state == SlotState::Available
                        || (s.state == SlotState::Allocated && !table.owned.contains(&s.id))
                })
                .collect();
            // Most recently released first, never-released last, then by id.
            candidates.sort_by(|a, b| {
                b.last_released_at
                    .cmp(&a.last_released_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            let ids: Vec<(String, PathBuf)> = candidates
                .into_iter()
                .map(|s| (s.id.clone(), s.path.clone()))
                .collect();
            (entry.spec.clone(), ids)
        };

        for (slot_id, path) in candidates {
            let key = slot_key(&slot_id);
            match self
                .leases
                .acquire(&key, &self.holder, self.options.lock_timeout)
            {
                Ok(()) => {}
                Err(SlotdagError::LockTimeout(_)) => {
                    debug!(slot = %slot_id, pool, "slot leased elsewhere; trying next");
                    continue;
                }
                Err(e) => {
                    warn!(slot = %slot_id, pool, error = %e, "slot lease error; trying next");
                    continue;
                }
            }

            {
                let mut table = self.lock_table();
                let claimable = match table.slots.get_mut(&slot_id) {
                    Some(slot) if matches!(slot.state, SlotState::Available | SlotState::Allocated) => {
                        slot.state = SlotState::Cleaning;
                        true
                    }
                    _ => false,
                };
                if !claimable {
                    drop(table);
                    self.release_lease(&slot_id);
                    continue;
                }
                table.owned.insert(slot_id.clone());
            }

            match self.prepare_slot(&slot_id, &path, &spec) {
                Ok(()) => {
                    let (branch, commit) = self.workspace.head(&path);
                    let mut table = self.lock_table();
                    let Some(slot) = table.slots.get_mut(&slot_id) else {
                        drop(table);
                        self.release_lease(&slot_id);
                        continue;
                    };
                    slot.state = SlotState::Allocated;
                    slot.branch = branch;
                    slot.commit = commit;
                    slot.allocation_count += 1;
                    slot.last_allocated_at = Some(Utc::now());
                    slot.error = None;
                    let slot = slot.clone();

                    info!(
                        slot = %slot.id,
                        pool,
                        allocations = slot.allocation_count,
                        commit = ?slot.commit,
                        "slot allocated"
                    );
                    return Ok(slot);
                }
                Err(reason) => {
                    self.quarantine(&slot_id, reason);
                    self.release_lease(&slot_id);
                }
            }
        }

        debug!(pool, "no slot available");
        Err(SlotdagError::NoSlotAvailable(pool.to_string()))
    }

    /// Clean up after use and return the slot to the pool.
    ///
    /// A failed cleanup leaves the slot in `Error`; the lease is released
    /// either way.
    pub fn release(&self, slot_id: &str) -> Result<()> {
        let (path, spec) = {
            let mut table = self.lock_table();
            let slot = table
                .slots
                .get_mut(slot_id)
                .ok_or_else(|| SlotdagError::SlotNotFound(slot_id.to_string()))?;
            if slot.state != SlotState::Allocated {
                return Err(SlotdagError::Validation(format!(
                    "slot {slot_id} is not allocated (state {:?})",
                    slot.state
                )));
            }
            slot.state = SlotState::Cleaning;
            let path = slot.path.clone();
            let pool = slot.pool.clone();
            let spec = table
                .pools
                .get(&pool)
                .map(|entry| entry.spec.clone())
                .ok_or(SlotdagError::PoolNotFound(pool))?;
            (path, spec)
        };

        let scrubbed = self.with_attempts(slot_id, "post-use cleanup", || {
            self.workspace.scrub(&path, &spec.reference)
        });

        match scrubbed {
            Ok(()) => {
                let (branch, commit) = self.workspace.head(&path);
                let mut table = self.lock_table();
                if let Some(slot) = table.slots.get_mut(slot_id) {
                    slot.state = SlotState::Available;
                    slot.branch = branch;
                    slot.commit = commit;
                    slot.last_released_at = Some(Utc::now());
                }
                info!(slot = %slot_id, pool = %spec.name, "slot released");
            }
            Err(reason) => self.quarantine(slot_id, reason),
        }

        self.release_lease(slot_id);
        Ok(())
    }

    /// Add capacity to a pool. Returns the new slot.
    pub fn add_slot(&self, pool: &str, path: impl Into<PathBuf>) -> Result<Slot> {
        let mut table = self.lock_table();
        if !table.pools.contains_key(pool) {
            return Err(SlotdagError::PoolNotFound(pool.to_string()));
        }
        let slot = insert_slot(&mut table, pool, path.into())?;
        info!(slot = %slot.id, pool, path = ?slot.path, "slot added");
        Ok(slot)
    }

    /// Decommission a slot. Refused while it is in use by anyone.
    pub fn remove_slot(&self, slot_id: &str) -> Result<Slot> {
        let mut table = self.lock_table();
        let slot = table
            .slots
            .get(slot_id)
            .ok_or_else(|| SlotdagError::SlotNotFound(slot_id.to_string()))?;
        if matches!(slot.state, SlotState::Allocated | SlotState::Cleaning)
            || self.leases.is_held(&slot_key(slot_id))?
        {
            return Err(SlotdagError::SlotBusy(slot_id.to_string()));
        }

        let slot = table
            .slots
            .remove(slot_id)
            .ok_or_else(|| SlotdagError::SlotNotFound(slot_id.to_string()))?;
        if let Some(entry) = table.pools.get_mut(&slot.pool) {
            entry.spec.slots.retain(|p| p != &slot.path);
        }
        info!(slot = %slot_id, pool = %slot.pool, "slot removed");
        Ok(slot)
    }

    /// Keep the lease on an allocated slot fresh while its runner is alive.
    /// Returns `false` if this manager no longer holds the lease.
    pub fn renew(&self, slot_id: &str) -> Result<bool> {
        if !self.lock_table().owned.contains(slot_id) {
            return Ok(false);
        }
        let renewed = self.leases.renew(&slot_key(slot_id), &self.holder)?;
        if !renewed {
            warn!(slot = %slot_id, "slot lease lost while allocated");
        }
        Ok(renewed)
    }

    /// Force-reclaim slot leases not renewed within `max_age`. Returns slot
    /// ids.
    ///
    /// Slots this manager still owns are left alone; their holder is alive.
    /// Reclaimed slots go back to `Available` and the next allocation cleans
    /// whatever the crashed holder left behind.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<Vec<String>> {
        let owned = self.lock_table().owned.clone();
        let mut reclaimed = Vec::new();
        for record in self.leases.stale("slot-", max_age)? {
            let slot_id = record
                .key
                .strip_prefix("slot-")
                .unwrap_or(&record.key)
                .to_string();
            if owned.contains(&slot_id) {
                debug!(slot = %slot_id, "stale-looking lease is ours; keeping it");
                continue;
            }
            if self.leases.force_reclaim(&record.key)?.is_none() {
                continue;
            }
            warn!(
                slot = %slot_id,
                holder = %record.holder,
                last_seen = %record.last_seen(),
                "reclaimed stale slot lease"
            );

            let mut table = self.lock_table();
            table.owned.remove(&slot_id);
            if let Some(slot) = table.slots.get_mut(&slot_id) {
                if matches!(slot.state, SlotState::Allocated | SlotState::Cleaning) {
                    slot.state = SlotState::Available;
                }
            }
            reclaimed.push(slot_id);
        }
        Ok(reclaimed)
    }

    /// Operator repair of a slot in `Error`: re-provision (or clean), then
    /// verify. On success the slot is `Available` again.
    pub fn repair_slot(&self, slot_id: &str) -> Result<Slot> {
        let (path, spec) = {
            let table = self.lock_table();
            let slot = table
                .slots
                .get(slot_id)
                .ok_or_else(|| SlotdagError::SlotNotFound(slot_id.to_string()))?;
            if matches!(slot.state, SlotState::Allocated | SlotState::Cleaning) {
                return Err(SlotdagError::SlotBusy(slot_id.to_string()));
            }
            let spec = table
                .pools
                .get(&slot.pool)
                .map(|entry| entry.spec.clone())
                .ok_or_else(|| SlotdagError::PoolNotFound(slot.pool.clone()))?;
            (slot.path.clone(), spec)
        };

        let key = slot_key(slot_id);
        if self
            .leases
            .acquire(&key, &self.holder, self.options.lock_timeout)
            .is_err()
        {
            return Err(SlotdagError::SlotBusy(slot_id.to_string()));
        }

        let repaired = if spec.repository.is_some() {
            self.workspace
                .reprovision(&path, spec.repository.as_deref(), &spec.reference)
        } else {
            self.workspace.prepare(&path, &spec.reference)
        }
        .and_then(|()| self.workspace.verify(&path));

        let result = match repaired {
            Ok(()) => {
                let (branch, commit) = self.workspace.head(&path);
                let mut table = self.lock_table();
                match table.slots.get_mut(slot_id) {
                    Some(slot) => {
                        slot.state = SlotState::Available;
                        slot.error = None;
                        slot.branch = branch;
                        slot.commit = commit;
                        info!(slot = %slot_id, pool = %slot.pool, "slot repaired");
                        Ok(slot.clone())
                    }
                    None => Err(SlotdagError::SlotNotFound(slot_id.to_string())),
                }
            }
            Err(e) => {
                let reason = format!("{e:#}");
                let mut table = self.lock_table();
                if let Some(slot) = table.slots.get_mut(slot_id) {
                    slot.state = SlotState::Error;
                    slot.error = Some(reason.clone());
                }
                error!(slot = %slot_id, error = %reason, "slot repair failed");
                Err(SlotdagError::SlotCorruption {
                    slot: slot_id.to_string(),
                    reason,
                })
            }
        };

        self.release_lease(slot_id);
        result
    }

    pub fn pool_summary(&self, pool: &str) -> Result<PoolSummary> {
        let table = self.lock_table();
        if !table.pools.contains_key(pool) {
            return Err(SlotdagError::PoolNotFound(pool.to_string()));
        }
        let mut summary = PoolSummary {
            pool: pool.to_string(),
            ..PoolSummary::default()
        };
        for slot in table.slots.values().filter(|s| s.pool == pool) {
            match slot.state {
                SlotState::Available => summary.available += 1,
                SlotState::Allocated => summary.allocated += 1,
                SlotState::Cleaning => summary.cleaning += 1,
                SlotState::Error => summary.error += 1,
            }
        }
        Ok(summary)
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.lock_table().pools.keys().cloned().collect()
    }

    /// Slots of one pool, or of every pool.
    pub fn slots(&self, pool: Option<&str>) -> Vec<Slot> {
        self.lock_table()
            .slots
            .values()
            .filter(|s| pool.is_none_or(|p| s.pool == p))
            .cloned()
            .collect()
    }

    pub fn slot(&self, slot_id: &str) -> Result<Slot> {
        self.lock_table()
            .slots
            .get(slot_id)
            .cloned()
            .ok_or_else(|| SlotdagError::SlotNotFound(slot_id.to_string()))
    }

    /// Take the quarantine notices accumulated since the last call.
    pub fn drain_notices(&self) -> Vec<SlotNotice> {
        std::mem::take(&mut self.lock_table().notices)
    }

    // ---------------------------------------------------------------------

    fn lock_table(&self) -> MutexGuard<'_, PoolTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cleanup with retries, then integrity check with the pool's
    /// corruption policy applied. Errors carry a human-readable reason.
    fn prepare_slot(
        &self,
        slot_id: &str,
        path: &std::path::Path,
        spec: &PoolSpec,
    ) -> std::result::Result<(), String> {
        let cleaned = self.with_attempts(slot_id, "pre-allocation cleanup", || {
            self.workspace.prepare(path, &spec.reference)
        });

        // Broken metadata usually fails the cleanup too; the corruption
        // policy still gets a say in that case.
        let corruption = match (cleaned, self.workspace.verify(path)) {
            (Ok(()), Ok(())) => return Ok(()),
            (Err(reason), Ok(())) => return Err(reason),
            (_, Err(corruption)) => corruption,
        };

        match spec.on_corruption {
            CorruptionPolicy::Quarantine => Err(format!("integrity check failed: {corruption:#}")),
            CorruptionPolicy::Reprovision => {
                warn!(slot = %slot_id, error = %format!("{corruption:#}"), "slot corrupt; re-provisioning");
                self.workspace
                    .reprovision(path, spec.repository.as_deref(), &spec.reference)
                    .and_then(|()| self.workspace.verify(path))
                    .map_err(|e| format!("re-provisioning failed: {e:#}"))
            }
        }
    }

    fn with_attempts(
        &self,
        slot_id: &str,
        what: &str,
        mut op: impl FnMut() -> anyhow::Result<()>,
    ) -> std::result::Result<(), String> {
        let attempts = self.options.cleanup_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match op() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last = format!("{e:#}");
                    warn!(slot = %slot_id, attempt, attempts, error = %last, "{what} failed");
                }
            }
        }
        Err(format!("{what} failed after {attempts} attempts: {last}"))
    }

    fn quarantine(&self, slot_id: &str, reason: String) {
        let mut table = self.lock_table();
        table.owned.remove(slot_id);
        let Some(slot) = table.slots.get_mut(slot_id) else {
            return;
        };
        slot.state = SlotState::Error;
        slot.error = Some(reason.clone());
        let notice = SlotNotice {
            slot_id: slot_id.to_string(),
            pool: slot.pool.clone(),
            reason,
        };
        error!(slot = %slot_id, pool = %notice.pool, reason = %notice.reason, "slot quarantined");
        table.notices.push(notice);
    }

    fn release_lease(&self, slot_id: &str) {
        self.lock_table().owned.remove(slot_id);
        match self.leases.release(&slot_key(slot_id), &self.holder) {
            Ok(true) => {}
            Ok(false) => warn!(slot = %slot_id, "slot lease was reclaimed while held"),
            Err(e) => warn!(slot = %slot_id, error = %e, "failed to release slot lease"),
        }
    }
}

fn insert_slot(table: &mut PoolTable, pool: &str, path: PathBuf) -> Result<Slot> {
    if table.slots.values().any(|s| s.path == path) {
        return Err(SlotdagError::Validation(format!(
            "slot path {path:?} is already registered"
        )));
    }
    let entry = table
        .pools
        .get_mut(pool)
        .ok_or_else(|| SlotdagError::PoolNotFound(pool.to_string()))?;

    let id = format!("{pool}-{}", entry.next_index);
    entry.next_index += 1;
    if !entry.spec.slots.contains(&path) {
        entry.spec.slots.push(path.clone());
    }

    let slot = Slot::new(id.clone(), pool, path);
    table.slots.insert(id, slot.clone());
    Ok(slot)
}
