// src/core/plugin.rs

use crate::core::{
    commons::{read, write},
    context::Context,
    project::Project,
};
use std::fmt;
use std::sync::{Arc, RwLock};

/// A pluggable implementation of some kind of build step (a compiler, a packager,
/// a test framework). Plugins are selected by kind and name, or by asking which
/// plugins of a kind apply to a project.
pub trait Plugin: Send + Sync {
    /// Identifies the plugin among those of its kind.
    fn name(&self) -> &str;

    /// Returns `true` if this plugin should handle `project`.
    fn applies_to(&self, _project: &Project) -> bool {
        false
    }

    /// Runs the plugin for `project`.
    fn invoke(&self, ctx: &Context, project: &Arc<Project>) -> anyhow::Result<()>;
}

struct Registration {
    kind: String,
    plugin: Arc<dyn Plugin>,
}

/// Registered plugins, grouped by kind, in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<Registration>>,
}

impl PluginRegistry {
    /// Registers `plugin` under `kind`, replacing a plugin of the same kind and name.
    pub fn register(&self, kind: &str, plugin: Arc<dyn Plugin>) {
        let mut plugins = write(&self.plugins);
        if let Some(existing) = plugins
            .iter_mut()
            .find(|r| r.kind == kind && r.plugin.name() == plugin.name())
        {
            log::debug!("Replacing {} plugin '{}'", kind, plugin.name());
            existing.plugin = plugin;
        } else {
            log::debug!("Registered {} plugin '{}'", kind, plugin.name());
            plugins.push(Registration {
                kind: kind.to_string(),
                plugin,
            });
        }
    }

    /// The plugin of `kind` called `name`.
    pub fn get(&self, kind: &str, name: &str) -> Option<Arc<dyn Plugin>> {
        read(&self.plugins)
            .iter()
            .find(|r| r.kind == kind && r.plugin.name() == name)
            .map(|r| Arc::clone(&r.plugin))
    }

    /// Every plugin of `kind`, in registration order.
    pub fn of_kind(&self, kind: &str) -> Vec<Arc<dyn Plugin>> {
        read(&self.plugins)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| Arc::clone(&r.plugin))
            .collect()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins = read(&self.plugins);
        f.debug_list()
            .entries(
                plugins
                    .iter()
                    .map(|r| format!("{}:{}", r.kind, r.plugin.name())),
            )
            .finish()
    }
}
