// src/core/symbols.rs

use crate::core::commons::{read, write};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Named values (compilers, packagers, helpers) that features publish and other
/// code resolves by name, possibly before the providing feature was loaded.
///
/// Values are stored type-erased and handed back as `Arc<T>`; asking for a name with
/// the wrong type behaves as if the name were unknown.
#[derive(Default)]
pub struct SymbolTable {
    entries: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl SymbolTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under `name`, replacing any previous value.
    pub fn register<T: Any + Send + Sync>(&self, name: &str, value: T) {
        self.register_shared(name, Arc::new(value));
    }

    /// Registers an already shared value under `name`.
    pub fn register_shared<T: Any + Send + Sync>(&self, name: &str, value: Arc<T>) {
        if write(&self.entries)
            .insert(name.to_string(), value)
            .is_some()
        {
            log::debug!("Symbol '{}' redefined", name);
        }
    }

    /// The value registered under `name`, if it has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let value = read(&self.entries).get(name).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Returns `true` if a value of any type is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        read(&self.entries).contains_key(name)
    }

    /// Removes the value under `name`. Returns `true` if there was one.
    pub fn remove(&self, name: &str) -> bool {
        write(&self.entries).remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.entries).keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTable")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Javac {
        target: &'static str,
    }

    #[test]
    fn test_register_and_get_typed() {
        let table = SymbolTable::new();
        table.register("Compiler::Javac", Javac { target: "1.8" });

        let javac = table.get::<Javac>("Compiler::Javac").unwrap();
        assert_eq!(javac.target, "1.8");
        assert!(table.get::<String>("Compiler::Javac").is_none());
        assert!(table.get::<Javac>("Compiler::Scalac").is_none());
    }

    #[test]
    fn test_redefine_and_remove() {
        let table = SymbolTable::new();
        table.register("Version", 1u32);
        table.register("Version", 2u32);
        assert_eq!(*table.get::<u32>("Version").unwrap(), 2);

        assert!(table.remove("Version"));
        assert!(!table.contains("Version"));
        assert!(table.names().is_empty());
    }
}
