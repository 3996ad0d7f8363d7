// src/registry/ingest.rs

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::registry::model::TaskDefinition;

/// A task set as written by a planner, before ingest.
///
/// ```toml
/// name = "auth"
///
/// [[task]]
/// id = "1"
/// title = "Schema"
/// priority = 5
///
/// [[task]]
/// id = "1.1"
/// depends_on = ["1"]
/// capability = "rust"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSetDefinition {
    pub name: String,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskDefinition>,
}

impl TaskSetDefinition {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

/// Read a task-set definition file.
///
/// Only deserialises; structural checks happen in
/// [`TaskRegistry::create_task_set`](crate::registry::TaskRegistry::create_task_set).
pub fn load_task_set_definition(path: impl AsRef<Path>) -> Result<TaskSetDefinition> {
    let contents = fs::read_to_string(path.as_ref())?;
    TaskSetDefinition::from_toml_str(&contents)
}
