//! # Config Loader
//!
//! Produces the `EngineConfig` a `Context` starts with. Settings come from three
//! layers, later layers overriding earlier ones:
//!
//! 1. Built-in defaults (`EngineConfig::default()`).
//! 2. An optional `anvil.toml` file. A missing file is not an error.
//! 3. `ANVIL_*` environment variables.
use crate::{
    constants::{CONFIG_FILENAME, ENV_ENVIRONMENT, ENV_PARALLEL, ENV_TRACE},
    core::error::{EngineError, EngineResult},
    dev_utils,
    models::EngineConfig,
};
use std::{fs, io, path::Path};

/// Reads `path` as an `EngineConfig`. A missing file yields the defaults.
///
/// # Errors
/// `ConfigRead` if the file exists but cannot be read, `ConfigParse` if its content is
/// not valid TOML for `EngineConfig`.
pub fn load(path: &Path) -> EngineResult<EngineConfig> {
    let _timer = dev_utils::BlockTimer::new("config_loader::load");
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("No configuration at '{}', using defaults", path.display());
            return Ok(EngineConfig::default());
        }
        Err(source) => {
            return Err(EngineError::ConfigRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let config: EngineConfig = toml::from_str(&content).map_err(|source| EngineError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Loaded configuration from '{}'", path.display());
    Ok(config)
}

/// Loads `anvil.toml` from `dir`, applies environment overrides and anchors
/// `base_dir` at `dir` when the file leaves it relative.
pub fn discover(dir: &Path) -> EngineResult<EngineConfig> {
    let mut config = load(&dir.join(CONFIG_FILENAME))?;
    if config.base_dir.is_relative() {
        config.base_dir = dir.join(&config.base_dir);
    }
    Ok(from_env(config))
}

/// Applies `ANVIL_ENV`, `ANVIL_TRACE` and `ANVIL_PARALLEL` to `config`.
pub fn from_env(config: EngineConfig) -> EngineConfig {
    apply_overrides(config, |name| std::env::var(name).ok())
}

/// Applies overrides looked up through `var`. Unparseable flags are ignored.
fn apply_overrides<F>(mut config: EngineConfig, var: F) -> EngineConfig
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(environment) = var(ENV_ENVIRONMENT).filter(|v| !v.is_empty()) {
        log::trace!("{} overrides environment: {}", ENV_ENVIRONMENT, environment);
        config.environment = environment;
    }
    if let Some(trace) = var(ENV_TRACE).and_then(|v| parse_flag(&v)) {
        config.trace = trace;
    }
    if let Some(parallel) = var(ENV_PARALLEL).and_then(|v| parse_flag(&v)) {
        config.parallel = parallel;
    }
    config
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        other => {
            log::warn!("Ignoring unrecognized flag value '{}'", other);
            None
        }
    }
}
