// src/core/chain.rs

use crate::core::error::{EngineError, EngineResult};
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
struct ChainNode {
    name: String,
    parent: Option<Arc<ChainNode>>,
}

/// The stack of tasks currently being invoked on one call path.
///
/// Chains are persistent: `append` returns a new chain sharing its tail with the
/// original, so every recursive `invoke` holds its own value and nothing is shared
/// between threads. Cycle detection is therefore local to one invocation tree.
#[derive(Debug, Clone, Default)]
pub struct InvocationChain {
    head: Option<Arc<ChainNode>>,
    len: usize,
}

impl InvocationChain {
    /// The chain of a top-level invocation.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a new chain with `name` on top.
    ///
    /// # Errors
    /// `DependencyCycle` naming the full chain if `name` is already on it.
    pub fn append(&self, name: &str) -> EngineResult<Self> {
        if self.contains(name) {
            let mut chain = self.names();
            chain.push(name.to_string());
            return Err(EngineError::DependencyCycle { chain });
        }
        Ok(Self {
            head: Some(Arc::new(ChainNode {
                name: name.to_string(),
                parent: self.head.clone(),
            })),
            len: self.len + 1,
        })
    }

    /// Returns `true` if a task named `name` is being invoked on this path.
    pub fn contains(&self, name: &str) -> bool {
        self.nodes().any(|node| node.name == name)
    }

    /// The task currently being invoked, if any.
    pub fn current(&self) -> Option<&str> {
        self.head.as_deref().map(|node| node.name.as_str())
    }

    /// Task names from the outermost invocation to the current one.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes().map(|node| node.name.clone()).collect();
        names.reverse();
        names
    }

    /// Number of tasks on the chain.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for the chain of a top-level invocation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn nodes(&self) -> impl Iterator<Item = &ChainNode> {
        std::iter::successors(self.head.as_deref(), |node| node.parent.as_deref())
    }
}

impl fmt::Display for InvocationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TOP")?;
        for name in self.names() {
            write!(f, " => {}", name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_shares_tail_and_keeps_original() {
        let root = InvocationChain::empty().append("build").unwrap();
        let left = root.append("compile").unwrap();
        let right = root.append("test").unwrap();

        assert_eq!(left.names(), vec!["build", "compile"]);
        assert_eq!(right.names(), vec!["build", "test"]);
        assert_eq!(root.len(), 1);
        assert_eq!(left.current(), Some("compile"));
        assert_eq!(left.to_string(), "TOP => build => compile");
    }

    #[test]
    fn test_append_detects_cycle() {
        let chain = InvocationChain::empty()
            .append("a")
            .unwrap()
            .append("b")
            .unwrap();

        let err = chain.append("a").unwrap_err();
        match err {
            EngineError::DependencyCycle { chain } => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sibling_chains_do_not_see_each_other() {
        let root = InvocationChain::empty().append("build").unwrap();
        let left = root.append("compile").unwrap();
        assert!(!root.contains("compile"));
        assert!(left.contains("build"));
        assert!(InvocationChain::empty().is_empty());
    }
}
