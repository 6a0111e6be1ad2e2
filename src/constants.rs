// src/constants.rs

/// Separator between the segments of a hierarchical task name (`foo:bar:compile`).
pub const TASK_SEPARATOR: &str = ":";

/// Separator between the segments of a symbolic name (`compiler::javac`).
pub const SYMBOL_SEPARATOR: &str = "::";

/// The task every application invokes before any top-level task.
pub const INITIALIZE_TASK: &str = "anvil:initialize";

/// The task invoked when no top-level task is given.
pub const DEFAULT_TASK: &str = "default";

/// The environment a build runs in when nothing else is configured.
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// The name of the engine configuration file.
pub const CONFIG_FILENAME: &str = "anvil.toml";

/// Overrides `EngineConfig::environment`.
pub const ENV_ENVIRONMENT: &str = "ANVIL_ENV";

/// Overrides `EngineConfig::trace` when set to `1`/`true`.
pub const ENV_TRACE: &str = "ANVIL_TRACE";

/// Overrides `EngineConfig::parallel` when set to `1`/`true`.
pub const ENV_PARALLEL: &str = "ANVIL_PARALLEL";

/// Name of the extension chain applied to every project before its body runs.
pub const BEFORE_DEFINE_CHAIN: &str = "project.before_define";

/// Name of the extension chain applied to every project after its body ran.
pub const AFTER_DEFINE_CHAIN: &str = "project.after_define";

/// Name of the extension chain applied to every application on creation.
pub const APPLICATION_INIT_CHAIN: &str = "application.init";
