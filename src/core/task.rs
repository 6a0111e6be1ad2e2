// src/core/task.rs

use crate::{
    core::{
        commons::{lock, read, write},
        context::Context,
        error::EngineResult,
        scheduler::ActionContext,
    },
    models::TaskSummary,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unit of work attached to a task. Actions run in registration order.
pub type Action = Arc<dyn Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// A custom "does this task need to run?" check.
pub type NeededPredicate = Arc<dyn Fn(&Task, &Context) -> bool + Send + Sync>;

/// Decides whether a task's actions run once its prerequisites are done.
#[derive(Clone)]
pub enum Staleness {
    /// Always run. The task's timestamp is "now".
    Always,
    /// Run if the file is missing or older than any prerequisite.
    File(PathBuf),
    /// Run only if the file is missing. Its timestamp never forces dependents to rebuild.
    FileCreate(PathBuf),
    /// Run if the predicate says so.
    Custom(NeededPredicate),
}

impl fmt::Debug for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::FileCreate(path) => f.debug_tuple("FileCreate").field(path).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Staleness {
    /// Returns `true` if both decide the same way: same kind, same file.
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Always, Self::Always) => true,
            (Self::File(a), Self::File(b)) | (Self::FileCreate(a), Self::FileCreate(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A named unit of work: ordered prerequisites, ordered actions, and a flag that
/// flips once the task has run in this build.
///
/// Tasks are owned by the registry of a `Context` and shared as `Arc<Task>`. The
/// invocation lock guards the invoked flag and the execution of the actions, so two
/// threads invoking the same task never both run it.
pub struct Task {
    name: String,
    scope: Vec<String>,
    captures: Vec<String>,
    staleness: Staleness,
    parallel: AtomicBool,
    comment: RwLock<Option<String>>,
    prerequisites: RwLock<Vec<String>>,
    actions: RwLock<Vec<Action>>,
    invoked: AtomicBool,
    invocation: Mutex<()>,
}

impl Task {
    /// Creates a plain task with no prerequisites and no actions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Vec::new(),
            captures: Vec::new(),
            staleness: Staleness::Always,
            parallel: AtomicBool::new(false),
            comment: RwLock::new(None),
            prerequisites: RwLock::new(Vec::new()),
            actions: RwLock::new(Vec::new()),
            invoked: AtomicBool::new(false),
            invocation: Mutex::new(()),
        }
    }

    // --- Builder ---

    /// Adds prerequisites, skipping names already present.
    pub fn with_prerequisites<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let current = self
            .prerequisites
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        merge_prerequisites(current, prerequisites);
        self
    }

    /// Appends an action.
    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.actions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(action));
        self
    }

    /// Replaces the staleness check.
    pub fn with_staleness(mut self, staleness: Staleness) -> Self {
        self.staleness = staleness;
        self
    }

    /// Sets the description shown in task listings.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        *self.comment.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(comment.into());
        self
    }

    /// Invokes prerequisites on separate threads instead of one after another.
    pub fn with_parallel_prerequisites(self) -> Self {
        self.parallel.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub(crate) fn with_captures(mut self, captures: Vec<String>) -> Self {
        self.captures = captures;
        self
    }

    // --- Accessors ---

    /// The fully qualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace the task was defined in. Prerequisites resolve against it.
    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Capture groups of the rule that synthesized this task (group 1 first).
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    /// One capture group of the synthesizing rule; `1` is the first group.
    pub fn capture(&self, group: usize) -> Option<&str> {
        group
            .checked_sub(1)
            .and_then(|index| self.captures.get(index))
            .map(String::as_str)
    }

    /// Prerequisite names in declaration order.
    pub fn prerequisites(&self) -> Vec<String> {
        read(&self.prerequisites).clone()
    }

    pub(crate) fn actions(&self) -> Vec<Action> {
        read(&self.actions).clone()
    }

    /// Number of registered actions.
    pub fn action_count(&self) -> usize {
        read(&self.actions).len()
    }

    /// The description, if any.
    pub fn comment(&self) -> Option<String> {
        read(&self.comment).clone()
    }

    /// How the scheduler decides whether this task needs to run.
    pub fn staleness(&self) -> &Staleness {
        &self.staleness
    }

    /// Returns `true` if prerequisites are invoked concurrently.
    pub fn is_parallel(&self) -> bool {
        self.parallel.load(Ordering::SeqCst)
    }

    /// Returns `true` once the task has completed in this build.
    pub fn is_invoked(&self) -> bool {
        self.invoked.load(Ordering::SeqCst)
    }

    // --- Mutation ---

    /// Appends prerequisites and, optionally, an action.
    pub fn enhance<I, S>(&self, prerequisites: I, action: Option<Action>) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        merge_prerequisites(&mut write(&self.prerequisites), prerequisites);
        if let Some(action) = action {
            write(&self.actions).push(action);
        }
        self
    }

    /// Appends an action.
    pub fn add_action<F>(&self, action: F) -> &Self
    where
        F: Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.actions).push(Arc::new(action));
        self
    }

    /// Sets the description shown in task listings.
    pub fn set_comment(&self, comment: impl Into<String>) -> &Self {
        *write(&self.comment) = Some(comment.into());
        self
    }

    /// Folds a freshly built definition of the same task into this one. The
    /// existing staleness check is kept.
    pub(crate) fn merge(&self, other: Self) {
        let Self {
            comment,
            prerequisites,
            actions,
            parallel,
            staleness,
            ..
        } = other;
        if !self.staleness.same_as(&staleness) {
            log::warn!(
                "Task '{}' redefined as {:?}; keeping {:?}",
                self.name,
                staleness,
                self.staleness
            );
        }
        merge_prerequisites(
            &mut write(&self.prerequisites),
            prerequisites.into_inner().unwrap_or_else(PoisonError::into_inner),
        );
        write(&self.actions).extend(actions.into_inner().unwrap_or_else(PoisonError::into_inner));
        if let Some(comment) = comment.into_inner().unwrap_or_else(PoisonError::into_inner) {
            *write(&self.comment) = Some(comment);
        }
        if parallel.into_inner() {
            self.parallel.store(true, Ordering::SeqCst);
        }
    }

    // --- Scheduling support ---

    pub(crate) fn lock_invocation(&self) -> MutexGuard<'_, ()> {
        lock(&self.invocation)
    }

    pub(crate) fn mark_invoked(&self) {
        self.invoked.store(true, Ordering::SeqCst);
    }

    /// The time this task's output was last produced, as seen by dependents.
    pub fn timestamp(&self, ctx: &Context) -> SystemTime {
        match &self.staleness {
            Staleness::File(path) => ctx.filesystem().modified(path).unwrap_or(UNIX_EPOCH),
            Staleness::FileCreate(_) => UNIX_EPOCH,
            Staleness::Always | Staleness::Custom(_) => SystemTime::now(),
        }
    }

    /// Decides whether the actions must run, once all prerequisites have completed.
    ///
    /// # Errors
    /// A file task fails if one of its prerequisites cannot be resolved.
    pub fn is_needed(&self, ctx: &Context) -> EngineResult<bool> {
        match &self.staleness {
            Staleness::Always => Ok(true),
            Staleness::FileCreate(path) => Ok(!ctx.filesystem().exists(path)),
            Staleness::Custom(predicate) => Ok(predicate(self, ctx)),
            Staleness::File(path) => {
                let Some(modified) = ctx.filesystem().modified(path) else {
                    return Ok(true);
                };
                for name in self.prerequisites() {
                    let prerequisite = ctx.lookup_in(&name, &self.scope)?;
                    if prerequisite.timestamp(ctx) > modified {
                        log::trace!("'{}' is older than '{}'", self.name, name);
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// A listing snapshot of this task.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            name: self.name.clone(),
            prerequisites: self.prerequisites(),
            comment: self.comment(),
            invoked: self.is_invoked(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("prerequisites", &self.prerequisites())
            .field("actions", &self.action_count())
            .field("staleness", &self.staleness)
            .field("invoked", &self.is_invoked())
            .finish()
    }
}

fn merge_prerequisites<I, S>(current: &mut Vec<String>, additional: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    for name in additional {
        let name = name.into();
        if !current.contains(&name) {
            current.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fs::MemoryFileSystem;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_merge_keeps_existing_staleness() {
        let task = Task::new("x");
        task.merge(
            Task::new("x")
                .with_staleness(Staleness::File(PathBuf::from("x")))
                .with_prerequisites(["y"]),
        );

        assert!(matches!(task.staleness(), Staleness::Always));
        assert_eq!(task.prerequisites(), vec!["y"]);
        assert!(!Staleness::Always.same_as(&Staleness::File(PathBuf::from("x"))));
        assert!(
            Staleness::File(PathBuf::from("x")).same_as(&Staleness::File(PathBuf::from("x")))
        );
    }

    #[test]
    fn test_builder_merges_prerequisites_without_duplicates() {
        let task = Task::new("compile")
            .with_prerequisites(["resources", "generate"])
            .with_prerequisites(["resources", "lint"])
            .with_comment("Compile sources");

        assert_eq!(task.prerequisites(), vec!["resources", "generate", "lint"]);
        assert_eq!(task.comment().as_deref(), Some("Compile sources"));
        assert!(!task.is_invoked());
    }

    #[test]
    fn test_capture_is_one_based() {
        let task = Task::new("test:Something").with_captures(vec!["Something".into()]);
        assert_eq!(task.capture(1), Some("Something"));
        assert_eq!(task.capture(0), None);
        assert_eq!(task.capture(2), None);
    }

    #[test]
    fn test_merge_appends_actions_and_prerequisites() {
        let task = Task::new("package").with_action(|_| Ok(()));
        task.merge(
            Task::new("package")
                .with_prerequisites(["compile"])
                .with_action(|_| Ok(()))
                .with_parallel_prerequisites(),
        );
        assert_eq!(task.action_count(), 2);
        assert_eq!(task.prerequisites(), vec!["compile"]);
        assert!(task.is_parallel());
    }

    #[test]
    fn test_file_task_needed_when_missing_or_stale() {
        let fs = Arc::new(MemoryFileSystem::new());
        let ctx = Context::builder().filesystem(fs.clone()).build();

        ctx.define_file("src/Main.java", Vec::<String>::new());
        let jar = ctx.define_file("target/app.jar", ["src/Main.java"]);

        // Output missing.
        fs.touch("src/Main.java", at(100));
        assert!(jar.is_needed(&ctx).unwrap());

        // Output newer than its source.
        fs.touch("target/app.jar", at(200));
        assert!(!jar.is_needed(&ctx).unwrap());

        // Source touched after the output was produced.
        fs.touch("src/Main.java", at(300));
        assert!(jar.is_needed(&ctx).unwrap());
    }

    #[test]
    fn test_file_create_ignores_prerequisite_age() {
        let fs = Arc::new(MemoryFileSystem::new());
        let ctx = Context::builder().filesystem(fs.clone()).build();
        let dir = ctx.define_task(
            Task::new("target").with_staleness(Staleness::FileCreate(PathBuf::from("target"))),
        );

        assert!(dir.is_needed(&ctx).unwrap());
        fs.touch("target", at(10));
        assert!(!dir.is_needed(&ctx).unwrap());
        assert_eq!(dir.timestamp(&ctx), UNIX_EPOCH);
    }
}
