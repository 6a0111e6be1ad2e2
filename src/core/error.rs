// src/core/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Every error the engine raises to a caller of `invoke`, `lookup`, `attach` or `load`.
///
/// The engine never retries or swallows these. Errors coming from user code (actions,
/// rule generators, feature loaders, hooks) are kept as the `source` so a front end can
/// walk back to them.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A task's invocation chain revisits a task already on it.
    #[error("Circular dependency detected: {}", .chain.join(" => "))]
    DependencyCycle {
        /// The full chain, ending with the task that closed the cycle.
        chain: Vec<String>,
    },
    /// An action of a task failed.
    #[error("Task '{task}' failed: {source}")]
    TaskExecution {
        /// The task whose action failed.
        task: String,
        /// The invocation chain leading to (and including) the task.
        chain: Vec<String>,
        /// The error raised by the action.
        #[source]
        source: anyhow::Error,
    },
    /// Lookup exhausted literal, scoped, rule and lazy resolution.
    #[error("Don't know how to build task '{name}'")]
    TaskNotFound {
        /// The name as requested.
        name: String,
        /// The scope the name was resolved in.
        scope: Vec<String>,
    },
    /// A rule matched but its generator failed.
    #[error("Rule failed to synthesize task '{name}': {source}")]
    RuleFailed {
        /// The candidate name the rule matched.
        name: String,
        /// The error raised by the generator.
        #[source]
        source: anyhow::Error,
    },
    /// A lazily triggered feature failed to load.
    #[error("Feature '{feature}' failed to load: {source}")]
    FeatureLoad {
        /// The feature identifier.
        feature: String,
        /// The error raised while loading.
        #[source]
        source: anyhow::Error,
    },
    /// Advice was attached to an operation the subject does not define.
    #[error("Cannot advise '{subject}#{operation}': no such operation")]
    AdviceTargetMissing {
        /// The subject name.
        subject: String,
        /// The operation name.
        operation: String,
    },
    /// An operation was called that the subject does not define.
    #[error("Undefined operation '{subject}#{operation}'")]
    UnknownOperation {
        /// The subject name.
        subject: String,
        /// The operation name.
        operation: String,
    },
    /// A symbolic name did not resolve, even after lazy loading.
    #[error("Unresolved symbol '{name}'")]
    UnknownSymbol {
        /// The name as requested.
        name: String,
    },
    /// No plugin of that kind and name is registered or lazily bound.
    #[error("No {kind} named '{name}' is available")]
    UnknownPlugin {
        /// The plugin kind (`compiler`, `tester`...).
        kind: String,
        /// The plugin name.
        name: String,
    },
    /// An extension hook failed while being delivered to a subject.
    #[error("Extension hook on '{chain}' failed for '{subject}': {source}")]
    Extension {
        /// The extension chain name.
        chain: String,
        /// The key of the subject being extended.
        subject: String,
        /// The error raised by the hook.
        #[source]
        source: anyhow::Error,
    },
    /// A project with the same fully qualified name already exists.
    #[error("Project '{name}' is already defined")]
    DuplicateProject {
        /// The fully qualified project name.
        name: String,
    },
    /// The body of a project definition failed.
    #[error("Failed to define project '{name}': {source}")]
    ProjectDefinition {
        /// The fully qualified project name.
        name: String,
        /// The error raised by the body.
        #[source]
        source: anyhow::Error,
    },
    /// A lazily installed stub was called after its context was discarded.
    #[error("The context owning this operation was discarded")]
    ContextDropped,
    /// The configuration file could not be read.
    #[error("Failed to read configuration file '{path}': {source}")]
    ConfigRead {
        /// The path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for `EngineConfig`.
    #[error("Failed to parse TOML file at '{path}': {source}")]
    ConfigParse {
        /// The path to the file.
        path: PathBuf,
        /// The underlying parsing error from the `toml` crate.
        #[source]
        source: toml::de::Error,
    },
}

impl EngineError {
    /// The chain of task names that led to this error, when the error happened
    /// while invoking tasks.
    pub fn task_chain(&self) -> Option<&[String]> {
        match self {
            Self::DependencyCycle { chain } | Self::TaskExecution { chain, .. } => Some(chain),
            _ => None,
        }
    }
}

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::error::Error as _;

    #[test]
    fn test_cycle_message_names_full_chain() {
        let err = EngineError::DependencyCycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Circular dependency detected: a => b => a");
        assert_eq!(err.task_chain().map(<[String]>::len), Some(3));
    }

    #[test]
    fn test_task_execution_keeps_source() {
        let err = EngineError::TaskExecution {
            task: "compile".into(),
            chain: vec!["build".into(), "compile".into()],
            source: anyhow!("javac exited with 1"),
        };
        assert!(err.to_string().contains("compile"));
        let source = err.source().expect("source is preserved");
        assert_eq!(source.to_string(), "javac exited with 1");
        assert_eq!(
            err.task_chain(),
            Some(&["build".to_string(), "compile".to_string()][..])
        );
    }
}
