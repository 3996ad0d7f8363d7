// src/engine/queue.rs

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::debug;

use super::TaskKey;
use crate::registry::Task;
use crate::types::SchedulingPolicy;

/// A ready task as last seen in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub key: TaskKey,
    pub task: Task,
}

impl QueuedTask {
    /// Fair-share group: the capability tag, or `""` for untagged tasks.
    pub fn group(&self) -> &str {
        self.task.capability.as_deref().unwrap_or("")
    }
}

/// Creation order: created_at, then sequence, then key for cross-set ties.
fn fifo_cmp(a: &QueuedTask, b: &QueuedTask) -> Ordering {
    a.task
        .created_at
        .cmp(&b.task.created_at)
        .then(a.task.seq.cmp(&b.task.seq))
        .then_with(|| a.key.cmp(&b.key))
}

fn priority_cmp(a: &QueuedTask, b: &QueuedTask) -> Ordering {
    b.task
        .priority
        .cmp(&a.task.priority)
        .then_with(|| fifo_cmp(a, b))
}

/// Sliding window over the capability groups of recent assignments.
#[derive(Debug, Clone)]
pub struct FairShareWindow {
    capacity: usize,
    recent: VecDeque<String>,
}

impl FairShareWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: VecDeque::new(),
        }
    }

    pub fn record(&mut self, group: &str) {
        self.recent.push_back(group.to_string());
        while self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
    }

    /// Assignments to `group` within the window.
    pub fn share(&self, group: &str) -> usize {
        self.recent.iter().filter(|g| g.as_str() == group).count()
    }
}

/// Ready tasks across all active task sets.
///
/// The queue is a mirror of the registry: every tick it is re-synced from
/// `get_ready_tasks`, so anything no longer `Ready` drops out.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: BTreeMap<TaskKey, QueuedTask>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.entries.keys()
    }

    /// Replace everything queued for `set` with `ready`.
    pub fn sync(&mut self, set: &str, ready: Vec<Task>) {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.set != set);
        for task in ready {
            let key = TaskKey::new(set, &task.id);
            self.entries.insert(key.clone(), QueuedTask { key, task });
        }
        debug!(
            task_set = %set,
            queued = self.entries.len(),
            previously = before,
            "ready queue synced"
        );
    }

    /// Drop entries of task sets that are no longer active.
    pub fn retain_sets(&mut self, active: &BTreeSet<String>) {
        self.entries.retain(|key, _| active.contains(&key.set));
    }

    pub fn remove(&mut self, key: &TaskKey) -> Option<QueuedTask> {
        self.entries.remove(key)
    }

    /// Candidates in the order the policy wants them tried.
    pub fn ordered(&self, policy: SchedulingPolicy, window: &FairShareWindow) -> Vec<&QueuedTask> {
        let mut tasks: Vec<&QueuedTask> = self.entries.values().collect();
        match policy {
            SchedulingPolicy::Fifo => {
                tasks.sort_by(|a, b| fifo_cmp(a, b));
                tasks
            }
            SchedulingPolicy::Priority | SchedulingPolicy::Capability => {
                tasks.sort_by(|a, b| priority_cmp(a, b));
                tasks
            }
            SchedulingPolicy::FairShare => fair_share_order(tasks, window),
        }
    }
}

/// Interleave capability groups: repeatedly take the head of the group with
/// the smallest (simulated) share of recent assignments.
fn fair_share_order<'a>(
    tasks: Vec<&'a QueuedTask>,
    window: &FairShareWindow,
) -> Vec<&'a QueuedTask> {
    let mut groups: BTreeMap<&str, VecDeque<&'a QueuedTask>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.group()).or_default().push_back(task);
    }
    for members in groups.values_mut() {
        members.make_contiguous().sort_by(|a, b| priority_cmp(a, b));
    }

    let mut shares: HashMap<&str, usize> = groups
        .keys()
        .map(|group| (*group, window.share(group)))
        .collect();

    let mut ordered = Vec::new();
    loop {
        let next = groups
            .iter()
            .filter_map(|(group, members)| members.front().map(|head| (*group, *head)))
            .min_by(|(ga, ha), (gb, hb)| {
                shares[ga]
                    .cmp(&shares[gb])
                    .then_with(|| priority_cmp(ha, hb))
            });

        let Some((group, _)) = next else {
            break;
        };
        if let Some(task) = groups.get_mut(group).and_then(|m| m.pop_front()) {
            ordered.push(task);
            *shares.entry(group).or_insert(0) += 1;
        }
    }
    ordered
}
