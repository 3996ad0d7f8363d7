// src/registry/graph.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;

use crate::errors::{Result, SlotdagError};
use crate::registry::model::{TaskDefinition, TaskId, TaskSet, TaskState};

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default)]
struct DepNode {
    deps: Vec<TaskId>,
    dependents: Vec<TaskId>,
}

/// Adjacency view of one task set.
///
/// Unlike an ingest-time check this view makes no acyclicity assumption:
/// dependency edits can introduce cycles after creation, and those are
/// surfaced by [`find_blocked_cycles`] rather than rejected.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<TaskId, DepNode>,
}

impl DependencyGraph {
    pub fn from_set(set: &TaskSet) -> Self {
        Self::build(
            set.tasks
                .values()
                .map(|t| (t.id.clone(), t.depends_on.clone())),
        )
    }

    fn build(entries: impl Iterator<Item = (TaskId, Vec<TaskId>)>) -> Self {
        let mut nodes: HashMap<TaskId, DepNode> = HashMap::new();

        for (id, deps) in entries {
            nodes.entry(id).or_default().deps = deps;
        }

        let ids: Vec<TaskId> = nodes.keys().cloned().collect();
        for id in ids {
            let deps = nodes.get(&id).map(|n| n.deps.clone()).unwrap_or_default();
            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(id.clone());
                }
            }
        }

        Self { nodes }
    }

    /// Immediate dependencies of a task.
    pub fn dependencies_of(&self, id: &str) -> &[TaskId] {
        self.nodes.get(id).map(|n| n.deps.as_slice()).unwrap_or(&[])
    }

    /// Immediate dependents of a task (tasks that list this one).
    pub fn dependents_of(&self, id: &str) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }
}

/// Check a task-set definition before it is ingested.
///
/// Rejects empty or duplicate ids, unknown and self dependencies, and
/// cycles (with a description such as `a -> b -> a`).
pub fn validate_definitions(defs: &[TaskDefinition]) -> Result<()> {
    if defs.is_empty() {
        return Err(SlotdagError::Validation(
            "task set must contain at least one task".to_string(),
        ));
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for def in defs {
        if def.id.trim().is_empty() {
            return Err(SlotdagError::Validation("task id must not be empty".to_string()));
        }
        if !ids.insert(def.id.as_str()) {
            return Err(SlotdagError::Validation(format!(
                "duplicate task id '{}'",
                def.id
            )));
        }
    }

    for def in defs {
        validate_dependency_list(&def.id, &def.depends_on, |dep| ids.contains(dep))?;
    }

    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for def in defs {
        graph.add_node(def.id.as_str());
    }
    for def in defs {
        for dep in def.depends_on.iter() {
            graph.add_edge(dep.as_str(), def.id.as_str(), ());
        }
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let start = cycle.node_id();
            let description = cycle_path(&graph, start)
                .map(|path| path.join(" -> "))
                .unwrap_or_else(|| format!("cycle involving task '{start}'"));
            Err(SlotdagError::Validation(format!(
                "dependency cycle detected: {description}"
            )))
        }
    }
}

/// Shared checks for a task's dependency list.
pub(crate) fn validate_dependency_list(
    id: &str,
    deps: &[TaskId],
    exists: impl Fn(&str) -> bool,
) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for dep in deps {
        if dep == id {
            return Err(SlotdagError::Validation(format!(
                "task '{id}' cannot depend on itself"
            )));
        }
        if !exists(dep) {
            return Err(SlotdagError::Validation(format!(
                "task '{id}' has unknown dependency '{dep}'"
            )));
        }
        if !seen.insert(dep.as_str()) {
            return Err(SlotdagError::Validation(format!(
                "task '{id}' lists dependency '{dep}' more than once"
            )));
        }
    }
    Ok(())
}

/// Cycles among `Blocked` tasks of a set.
///
/// Each cycle is returned as its sorted member ids, and the list itself is
/// sorted, so the result is stable across calls and processes.
pub fn find_blocked_cycles(set: &TaskSet) -> Vec<Vec<TaskId>> {
    let blocked: HashSet<&str> = set
        .tasks
        .values()
        .filter(|t| t.state == TaskState::Blocked)
        .map(|t| t.id.as_str())
        .collect();

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for id in blocked.iter().copied() {
        graph.add_node(id);
    }
    for task in set.tasks.values() {
        if !blocked.contains(task.id.as_str()) {
            continue;
        }
        for dep in task.depends_on.iter() {
            if blocked.contains(dep.as_str()) {
                graph.add_edge(dep.as_str(), task.id.as_str(), ());
            }
        }
    }

    let mut cycles: Vec<Vec<TaskId>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| {
            let mut ids: Vec<TaskId> = scc.into_iter().map(str::to_string).collect();
            ids.sort();
            ids
        })
        .collect();
    cycles.sort();
    cycles
}

/// Walk edges from `start` until we come back to it.
fn cycle_path<'a>(graph: &DiGraphMap<&'a str, ()>, start: &'a str) -> Option<Vec<String>> {
    let mut stack: Vec<(&'a str, Vec<&'a str>)> = vec![(start, vec![start])];
    let mut visited: HashSet<&'a str> = HashSet::new();

    while let Some((node, path)) = stack.pop() {
        for next in graph.neighbors(node) {
            if next == start {
                let mut full: Vec<String> = path.iter().map(|s| s.to_string()).collect();
                full.push(start.to_string());
                return Some(full);
            }
            if visited.insert(next) {
                let mut extended = path.clone();
                extended.push(next);
                stack.push((next, extended));
            }
        }
    }

    None
}
