// src/core/project.rs

use crate::constants::TASK_SEPARATOR;
use crate::core::{
    commons::{read, write},
    extension::Extensible,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// A named unit of the build. Projects nest: a project defined while another
/// project's body runs becomes its child and its tasks live in the child's namespace.
#[derive(Debug)]
pub struct Project {
    name: String,
    local_name: String,
    parent: Option<String>,
    base_dir: PathBuf,
}

impl Project {
    pub(crate) fn new(
        name: String,
        local_name: String,
        parent: Option<String>,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            name,
            local_name,
            parent,
            base_dir,
        }
    }

    /// Fully qualified name, e.g. `"foo:bar"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name relative to the parent, e.g. `"bar"`.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Fully qualified name of the parent project.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Directory relative paths of this project resolve against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolves `relative` against the project's base directory.
    pub fn path_to(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(relative)
    }

    /// Fully qualified name of the project task `local`, e.g. `"foo:compile"`.
    pub fn task_name(&self, local: &str) -> String {
        format!("{}{}{}", self.name, TASK_SEPARATOR, local)
    }
}

impl Extensible for Project {
    fn extension_key(&self) -> String {
        format!("project:{}", self.name)
    }
}

/// Defined projects, in definition order.
#[derive(Debug, Default)]
pub(crate) struct ProjectRegistry {
    projects: RwLock<Vec<Arc<Project>>>,
}

impl ProjectRegistry {
    /// Adds `project` unless its name is taken. Returns `false` on a duplicate.
    pub(crate) fn insert(&self, project: Arc<Project>) -> bool {
        let mut projects = write(&self.projects);
        if projects.iter().any(|p| p.name == project.name) {
            return false;
        }
        projects.push(project);
        true
    }

    pub(crate) fn remove(&self, name: &str) {
        write(&self.projects).retain(|p| p.name != name);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Project>> {
        read(&self.projects).iter().find(|p| p.name == name).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Project>> {
        read(&self.projects).clone()
    }
}
