// src/system/fs.rs

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use crate::core::commons::{read, write};

/// The filesystem as seen by the scheduler: only timestamps matter.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Returns the modification time of `path`, or `None` if it does not exist.
    fn modified(&self, path: &Path) -> Option<SystemTime>;

    /// Returns `true` if `path` exists.
    fn exists(&self, path: &Path) -> bool {
        self.modified(path).is_some()
    }
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn modified(&self, path: &Path) -> Option<SystemTime> {
        match fs::metadata(path).and_then(|metadata| metadata.modified()) {
            Ok(timestamp) => Some(timestamp),
            Err(e) => {
                log::trace!("No timestamp for '{}': {}", path.display(), e);
                None
            }
        }
    }
}

/// An in-memory filesystem holding nothing but timestamps.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    entries: RwLock<HashMap<PathBuf, SystemTime>>,
}

impl MemoryFileSystem {
    /// Creates an empty filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates `path` with the given modification time.
    pub fn touch(&self, path: impl Into<PathBuf>, modified: SystemTime) {
        write(&self.entries).insert(path.into(), modified);
    }

    /// Deletes `path`. Returns `true` if it existed.
    pub fn remove(&self, path: &Path) -> bool {
        write(&self.entries).remove(path).is_some()
    }
}

impl FileSystem for MemoryFileSystem {
    fn modified(&self, path: &Path) -> Option<SystemTime> {
        read(&self.entries).get(path).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_local_modified_for_existing_file() {
        // --- Setup ---
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"hello world").unwrap();
        temp_file.flush().unwrap();

        // --- Execute ---
        let modified = LocalFileSystem.modified(temp_file.path());

        // --- Assert ---
        let timestamp = modified.expect("an existing file has a timestamp");
        let difference = SystemTime::now().duration_since(timestamp).unwrap();
        assert!(difference.as_secs() < 5);
        assert!(LocalFileSystem.exists(temp_file.path()));
    }

    #[test]
    fn test_local_modified_for_missing_file() {
        let missing = Path::new("non_existent_file_for_test.tmp");
        assert!(LocalFileSystem.modified(missing).is_none());
        assert!(!LocalFileSystem.exists(missing));
    }

    #[test]
    fn test_memory_touch_and_remove() {
        let fs = MemoryFileSystem::new();
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        fs.touch("out/app.jar", when);

        assert_eq!(fs.modified(Path::new("out/app.jar")), Some(when));
        assert!(fs.remove(Path::new("out/app.jar")));
        assert!(!fs.exists(Path::new("out/app.jar")));
    }
}
