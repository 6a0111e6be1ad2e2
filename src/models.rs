// src/models.rs

use crate::constants::{DEFAULT_ENVIRONMENT, DEFAULT_TASK};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// --- ENGINE CONFIGURATION (What is read from `anvil.toml`) ---

/// Engine-wide settings owned by a `Context`.
///
/// Every field has a default, so an empty or missing `anvil.toml` is valid.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Log every invocation, skip and execution at `trace` level.
    pub trace: bool,
    /// Run top-level tasks on the rayon pool instead of one after another.
    pub parallel: bool,
    /// The environment the build runs in (`development`, `test`, `production`...).
    pub environment: String,
    /// The task invoked when the front end names no task.
    pub default_task: String,
    /// Root directory of the build. Top-level projects live directly under it.
    pub base_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trace: false,
            parallel: false,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            default_task: DEFAULT_TASK.to_string(),
            base_dir: PathBuf::from("."),
        }
    }
}

// --- INTROSPECTION MODELS ---

/// A read-only snapshot of a registered task, used for listings.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    /// Fully qualified task name.
    pub name: String,
    /// Prerequisite names as declared.
    pub prerequisites: Vec<String>,
    /// The task's description, if any.
    pub comment: Option<String>,
    /// Whether the task already ran in this context.
    pub invoked: bool,
}
