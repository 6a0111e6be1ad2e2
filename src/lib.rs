//! # anvil
//!
//! A build orchestration engine. Tasks are named, hierarchically namespaced
//! units of work with prerequisites and actions; the engine decides what must
//! run and runs each task at most once per build. Subsystems (compilers, test
//! runners, packagers) plug themselves in through advice, extension chains and
//! lazily loaded features without the engine knowing their concrete types.
//!
//! Everything lives inside a [`Context`]: create one per build (or per test),
//! discard it when done.

/// Names, separators and defaults shared across the engine.
pub mod constants;
/// The engine itself.
pub mod core;
/// Helpers for timing engine phases during development.
pub mod dev_utils;
/// Serializable configuration and listing models.
pub mod models;
pub mod system;

pub use crate::core::{
    advice::{Advice, AdviceHandle, Continue, Flow, Subject},
    application::Application,
    chain::InvocationChain,
    context::{Context, ContextBuilder},
    error::{EngineError, EngineResult},
    extension::{Extensible, ExtensionChain},
    lazy::{FeatureSource, LazyLoader, TriggerPattern},
    plugin::Plugin,
    project::Project,
    registry::RuleMatch,
    scheduler::ActionContext,
    symbols::SymbolTable,
    task::{Staleness, Task},
};
pub use crate::models::{EngineConfig, TaskSummary};
