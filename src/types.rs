use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Ordering applied to the ready queue on every dispatcher tick.
///
/// Every policy breaks ties by creation time (earlier wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Creation order, unmodified.
    Fifo,
    /// Descending priority, FIFO within equal priority.
    Priority,
    /// Priority order, but tasks whose capability has no routing entry are
    /// held back and reported instead of falling through to the default pool.
    Capability,
    /// Rotate across capability groups, favouring the group with the
    /// smallest share of recent assignments.
    FairShare,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy::Priority
    }
}

impl FromStr for SchedulingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(SchedulingPolicy::Fifo),
            "priority" => Ok(SchedulingPolicy::Priority),
            "capability" => Ok(SchedulingPolicy::Capability),
            "fair_share" => Ok(SchedulingPolicy::FairShare),
            other => Err(format!(
                "invalid scheduling policy: {other} (expected \"fifo\", \"priority\", \"capability\" or \"fair_share\")"
            )),
        }
    }
}

/// What the slot pool does with a slot whose VCS metadata is corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionPolicy {
    /// Mark the slot `Error` and leave it out until an operator repairs it.
    Quarantine,
    /// Re-clone the slot from the backing repository and verify again.
    Reprovision,
}

impl Default for CorruptionPolicy {
    fn default() -> Self {
        CorruptionPolicy::Quarantine
    }
}

/// Parse a duration string like `"500ms"`, `"3s"`, `"30m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
