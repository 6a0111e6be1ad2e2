//! # Task Registry
//!
//! Owns every task of a `Context`, the namespace stack used to qualify new task
//! names, and the rules used to synthesize tasks that were never defined literally.
//!
//! Resolution order for a name looked up in a scope:
//!
//! 1. The literal name.
//! 2. The name qualified with each prefix of the scope, most specific first.
//! 3. Rules, in registration order, tested against those same candidates.
//!
//! Lazy task bindings are consulted by the `Context` after all three fail.
//!
//! The namespace stack is kept per thread: a thread defining tasks inside
//! `with_namespace` never affects the names another thread defines.

use crate::{
    constants::TASK_SEPARATOR,
    core::{
        commons::{join_name, lock, read, scoped_candidates, split_task_reference, write},
        error::{EngineError, EngineResult},
        task::Task,
    },
};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};

/// Builds a task for a name matched by a rule. Returning `Ok(None)` declines the match.
pub type RuleGenerator = Arc<dyn Fn(&RuleMatch<'_>) -> anyhow::Result<Option<Task>> + Send + Sync>;

/// A successful rule match handed to the rule's generator.
#[derive(Debug)]
pub struct RuleMatch<'a> {
    name: &'a str,
    scope: &'a [String],
    captures: Vec<String>,
}

impl RuleMatch<'_> {
    /// The candidate name that matched.
    pub fn name(&self) -> &str {
        self.name
    }

    /// All capture groups, group 1 first. Groups that did not participate are empty.
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    /// One capture group; `1` is the first group.
    pub fn capture(&self, group: usize) -> Option<&str> {
        group
            .checked_sub(1)
            .and_then(|index| self.captures.get(index))
            .map(String::as_str)
    }

    /// A new task named after the match, carrying its captures and scope.
    pub fn task(&self) -> Task {
        Task::new(self.name)
            .with_scope(self.scope.to_vec())
            .with_captures(self.captures.clone())
    }
}

#[derive(Clone)]
struct Rule {
    pattern: Regex,
    generator: RuleGenerator,
}

#[derive(Default)]
struct TaskTable {
    by_name: HashMap<String, Arc<Task>>,
    order: Vec<String>,
}

/// The name → task map of one `Context`.
pub struct TaskRegistry {
    tasks: RwLock<TaskTable>,
    rules: RwLock<Vec<Rule>>,
    scopes: Mutex<HashMap<ThreadId, Vec<String>>>,
}

impl TaskRegistry {
    /// Creates an empty registry at the top-level namespace.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(TaskTable::default()),
            rules: RwLock::new(Vec::new()),
            scopes: Mutex::new(HashMap::new()),
        }
    }

    // --- Namespace Scoping ---

    /// The namespace stack new definitions on this thread are qualified with.
    pub fn current_scope(&self) -> Vec<String> {
        lock(&self.scopes)
            .get(&thread::current().id())
            .cloned()
            .unwrap_or_default()
    }

    /// Runs `f` with `names` pushed onto the namespace stack.
    ///
    /// The previous stack is restored on every exit path, including a panic in `f`.
    pub fn with_namespace<I, S, F, R>(&self, names: I, f: F) -> R
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce() -> R,
    {
        let mut scope = self.current_scope();
        scope.extend(names.into_iter().map(Into::into).filter(|s| !s.is_empty()));
        self.switch_to_namespace(scope, f)
    }

    /// Runs `f` with this thread's namespace stack replaced by `names`, restoring it
    /// afterwards.
    pub fn switch_to_namespace<F, R>(&self, names: Vec<String>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let me = thread::current().id();
        let previous = self.set_scope(me, names);
        let _restore = scopeguard::guard(previous, |previous| {
            self.set_scope(me, previous);
        });
        f()
    }

    fn set_scope(&self, thread: ThreadId, names: Vec<String>) -> Vec<String> {
        let mut scopes = lock(&self.scopes);
        let previous = if names.is_empty() {
            scopes.remove(&thread)
        } else {
            scopes.insert(thread, names)
        };
        previous.unwrap_or_default()
    }

    /// Qualifies `name` with the current namespace. A leading `:` opts out.
    pub fn qualify(&self, name: &str) -> String {
        match name.strip_prefix(TASK_SEPARATOR) {
            Some(absolute) => absolute.to_string(),
            None => {
                let mut segments = self.current_scope();
                segments.push(name.to_string());
                join_name(&segments, TASK_SEPARATOR)
            }
        }
    }

    // --- Definition ---

    /// Creates the task if absent, else merges in the additional prerequisites.
    /// The name is qualified with the current namespace.
    pub fn define<I, S>(&self, name: &str, prerequisites: I) -> Arc<Task>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let task = Task::new(self.qualify(name)).with_prerequisites(prerequisites);
        self.define_task(task)
    }

    /// Registers a fully built task under its own name, merging it into an existing
    /// task of the same name. A task without a scope gets the current namespace.
    pub fn define_task(&self, task: Task) -> Arc<Task> {
        let task = if task.scope().is_empty() {
            task.with_scope(self.current_scope())
        } else {
            task
        };

        let mut table = write(&self.tasks);
        if let Some(existing) = table.by_name.get(task.name()) {
            let existing = Arc::clone(existing);
            drop(table);
            existing.merge(task);
            return existing;
        }
        log::debug!("Defined task '{}'", task.name());
        insert(&mut table, task)
    }

    // --- Lookup ---

    /// Returns the task with exactly this name.
    pub fn get(&self, name: &str) -> Option<Arc<Task>> {
        read(&self.tasks).by_name.get(name).cloned()
    }

    /// Returns `true` if a task with exactly this name exists.
    pub fn contains(&self, name: &str) -> bool {
        read(&self.tasks).by_name.contains_key(name)
    }

    /// Literal and scoped lookup, without rules.
    pub fn find(&self, name: &str, scope: &[String]) -> Option<Arc<Task>> {
        if let Some(task) = self.get(name) {
            return Some(task);
        }
        let (effective, bare) = split_task_reference(name, scope);
        let table = read(&self.tasks);
        scoped_candidates(bare, &effective, TASK_SEPARATOR)
            .iter()
            .find_map(|candidate| table.by_name.get(candidate).cloned())
    }

    /// Every name a lookup of `name` in `scope` may resolve to, most specific first.
    pub fn candidates(&self, name: &str, scope: &[String]) -> Vec<String> {
        let (effective, bare) = split_task_reference(name, scope);
        scoped_candidates(bare, &effective, TASK_SEPARATOR)
    }

    /// Literal, scoped, then rule-based lookup.
    ///
    /// # Errors
    /// `RuleFailed` if a matching rule's generator fails.
    pub fn resolve(&self, name: &str, scope: &[String]) -> EngineResult<Option<Arc<Task>>> {
        if let Some(task) = self.find(name, scope) {
            return Ok(Some(task));
        }
        self.synthesize(name, scope)
    }

    // --- Rules ---

    /// Registers a rule. Rules are tried in registration order.
    pub fn add_rule<F>(&self, pattern: Regex, generator: F)
    where
        F: Fn(&RuleMatch<'_>) -> anyhow::Result<Option<Task>> + Send + Sync + 'static,
    {
        log::debug!("Registered rule /{}/", pattern.as_str());
        write(&self.rules).push(Rule {
            pattern,
            generator: Arc::new(generator),
        });
    }

    /// Tries every rule against every candidate form of `name`, registering and
    /// returning the first task a generator produces.
    ///
    /// # Errors
    /// `RuleFailed` if a matching rule's generator fails.
    pub fn synthesize(&self, name: &str, scope: &[String]) -> EngineResult<Option<Arc<Task>>> {
        let rules = read(&self.rules).clone();
        if rules.is_empty() {
            return Ok(None);
        }
        let (effective, bare) = split_task_reference(name, scope);

        for candidate in scoped_candidates(bare, &effective, TASK_SEPARATOR) {
            for rule in &rules {
                let Some(captures) = rule.pattern.captures(&candidate) else {
                    continue;
                };
                let rule_match = RuleMatch {
                    name: &candidate,
                    scope: &effective,
                    captures: captures
                        .iter()
                        .skip(1)
                        .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
                        .collect(),
                };
                let generated = (rule.generator)(&rule_match).map_err(|source| {
                    EngineError::RuleFailed {
                        name: candidate.clone(),
                        source,
                    }
                })?;
                if let Some(task) = generated {
                    log::debug!(
                        "Rule /{}/ synthesized task '{}'",
                        rule.pattern.as_str(),
                        task.name()
                    );
                    return Ok(Some(self.register_synthesized(task)));
                }
            }
        }
        Ok(None)
    }

    fn register_synthesized(&self, task: Task) -> Arc<Task> {
        let mut table = write(&self.tasks);
        // Another thread may have synthesized the same name first; the first one wins.
        if let Some(existing) = table.by_name.get(task.name()) {
            return Arc::clone(existing);
        }
        insert(&mut table, task)
    }

    // --- Introspection ---

    /// All tasks in definition order.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        let table = read(&self.tasks);
        table
            .order
            .iter()
            .filter_map(|name| table.by_name.get(name).cloned())
            .collect()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        read(&self.tasks).order.len()
    }

    /// Returns `true` if no task is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .field("rules", &read(&self.rules).len())
            .field("scope", &self.current_scope())
            .finish()
    }
}

fn insert(table: &mut TaskTable, task: Task) -> Arc<Task> {
    let name = task.name().to_string();
    let task = Arc::new(task);
    table.order.push(name.clone());
    table.by_name.insert(name, Arc::clone(&task));
    task
}
