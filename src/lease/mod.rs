// src/lease/mod.rs

//! Named exclusive leases with timeout and staleness detection.
//!
//! Every cross-process guarantee in slotdag goes through a lease:
//! - `set-<name>` serialises writes to one task set,
//! - `slot-<id>` makes a slot exclusively owned by one holder.
//!
//! A lease is *not* tied to the lifetime of the process that took it. If a
//! holder crashes, the lease record stays behind and is only reclaimed by a
//! stale-lease sweep (`LeaseManager::stale` + `force_reclaim`). Long-lived
//! holders keep their lease fresh with `LeaseManager::renew`.
//!
//! - [`file`] stores lease records next to fs2 advisory locks (production).
//! - [`memory`] keeps them in a map (tests, single-process embedding).

use std::fmt::Debug;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::errors::{Result, SlotdagError};

pub mod file;
pub mod memory;

pub use file::FileLeaseManager;
pub use memory::MemoryLeaseManager;

/// Upper bound for the sleep between two acquisition attempts.
const MAX_POLL_DELAY: Duration = Duration::from_millis(100);

/// Who holds a lease and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_at: Option<DateTime<Utc>>,
}

impl LeaseRecord {
    pub fn new(key: &str, holder: &str) -> Self {
        Self {
            key: key.to_string(),
            holder: holder.to_string(),
            acquired_at: Utc::now(),
            renewed_at: None,
        }
    }

    /// Last sign of life from the holder.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.renewed_at.unwrap_or(self.acquired_at)
    }

    /// A lease neither taken nor renewed within `max_age` is presumed
    /// abandoned.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_seen()) > max_age
    }
}

/// Lease key for a task set.
pub fn set_key(name: &str) -> String {
    format!("set-{name}")
}

/// Lease key for a slot.
pub fn slot_key(slot_id: &str) -> String {
    format!("slot-{slot_id}")
}

/// Abstract lease store.
///
/// Leases are not re-entrant: a holder that already owns a key cannot take
/// it a second time.
pub trait LeaseManager: Send + Sync + Debug {
    /// Take the lease if nobody holds it. Never blocks on another holder.
    fn try_acquire(&self, key: &str, holder: &str) -> Result<bool>;

    /// Drop the lease if `holder` owns it. Returns `false` when the lease
    /// was not held by `holder` (e.g. it was force-reclaimed meanwhile).
    fn release(&self, key: &str, holder: &str) -> Result<bool>;

    /// Refresh the lease's `renewed_at` if `holder` still owns it. Returns
    /// `false` when the lease is gone or held by someone else.
    fn renew(&self, key: &str, holder: &str) -> Result<bool>;

    /// Current record for `key`, if the lease is held.
    fn holder_of(&self, key: &str) -> Result<Option<LeaseRecord>>;

    /// Remove the lease regardless of who holds it.
    fn force_reclaim(&self, key: &str) -> Result<Option<LeaseRecord>>;

    /// All held leases whose key starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<LeaseRecord>>;

    /// Take the lease, polling until `timeout` elapses.
    ///
    /// A zero timeout means exactly one attempt. The wait blocks the calling
    /// thread; on a multi-threaded Tokio runtime the worker's other tasks
    /// are moved off first.
    fn acquire(&self, key: &str, holder: &str, timeout: Duration) -> Result<()> {
        if self.try_acquire(key, holder)? {
            return Ok(());
        }
        if timeout.is_zero() {
            return Err(SlotdagError::LockTimeout(key.to_string()));
        }
        off_runtime_worker(|| poll_acquire(self, key, holder, Instant::now() + timeout))
    }

    fn is_held(&self, key: &str) -> Result<bool> {
        Ok(self.holder_of(key)?.is_some())
    }

    /// Held leases under `prefix` neither taken nor renewed within `max_age`.
    fn stale(&self, prefix: &str, max_age: Duration) -> Result<Vec<LeaseRecord>> {
        let now = Utc::now();
        Ok(self
            .list(prefix)?
            .into_iter()
            .filter(|record| record.is_stale(now, max_age))
            .collect())
    }
}

/// Run a blocking wait without stalling other tasks on a multi-threaded
/// runtime. `block_in_place` is unavailable on current-thread runtimes, so
/// there (and outside Tokio) `f` simply runs inline.
fn off_runtime_worker<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn poll_acquire<L: LeaseManager + ?Sized>(
    leases: &L,
    key: &str,
    holder: &str,
    deadline: Instant,
) -> Result<()> {
    let mut delay = Duration::from_millis(5);
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(SlotdagError::LockTimeout(key.to_string()));
        }
        std::thread::sleep(delay.min(deadline - now));
        delay = (delay * 2).min(MAX_POLL_DELAY);

        if leases.try_acquire(key, holder)? {
            return Ok(());
        }
    }
}
