//! # Context
//!
//! The container every other piece of the engine hangs off: one task registry, one
//! set of subjects, symbols, plugins and projects, the extension chains and the lazy
//! loader. Nothing in the engine is global; two contexts never observe each other,
//! so a test builds a fresh one and drops it when done.

use crate::{
    constants::{
        AFTER_DEFINE_CHAIN, APPLICATION_INIT_CHAIN, BEFORE_DEFINE_CHAIN, SYMBOL_SEPARATOR,
        TASK_SEPARATOR,
    },
    core::{
        advice::Subject,
        application::Application,
        chain::InvocationChain,
        commons::{join_name, read, scoped_candidates, write},
        error::{EngineError, EngineResult},
        extension::{Extensible, ExtensionChain},
        lazy::{FeatureSource, LazyLoader},
        plugin::{Plugin, PluginRegistry},
        project::{Project, ProjectRegistry},
        registry::{RuleMatch, TaskRegistry},
        scheduler,
        symbols::SymbolTable,
        task::{Action, Staleness, Task},
    },
    models::{EngineConfig, TaskSummary},
    system::fs::{FileSystem, LocalFileSystem},
};
use regex::Regex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use uuid::Uuid;

/// Builds a [`Context`] with non-default collaborators.
#[derive(Default)]
pub struct ContextBuilder {
    config: Option<EngineConfig>,
    filesystem: Option<Arc<dyn FileSystem>>,
    feature_source: Option<Arc<dyn FeatureSource>>,
}

impl ContextBuilder {
    /// Starts the context with `config` instead of the defaults.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the local filesystem used for freshness checks.
    pub fn filesystem(mut self, filesystem: Arc<dyn FileSystem>) -> Self {
        self.filesystem = Some(filesystem);
        self
    }

    /// Consulted for features not registered with `LazyLoader::provide`.
    pub fn feature_source(mut self, source: Arc<dyn FeatureSource>) -> Self {
        self.feature_source = Some(source);
        self
    }

    /// Creates the context.
    pub fn build(self) -> Arc<Context> {
        let lazy = match self.feature_source {
            Some(source) => LazyLoader::with_source(source),
            None => LazyLoader::new(),
        };
        let context = Arc::new_cyclic(|me| Context {
            id: Uuid::new_v4(),
            me: me.clone(),
            config: RwLock::new(self.config.unwrap_or_default()),
            env: RwLock::new(HashMap::new()),
            filesystem: self
                .filesystem
                .unwrap_or_else(|| Arc::new(LocalFileSystem)),
            registry: TaskRegistry::new(),
            subjects: RwLock::new(HashMap::new()),
            symbols: SymbolTable::new(),
            plugins: PluginRegistry::default(),
            projects: ProjectRegistry::default(),
            lazy,
            before_define: ExtensionChain::new(BEFORE_DEFINE_CHAIN),
            after_define: ExtensionChain::new(AFTER_DEFINE_CHAIN),
            application_init: ExtensionChain::new(APPLICATION_INIT_CHAIN),
        });
        log::debug!("Created context {}", context.id);
        context
    }
}

impl fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("config", &self.config)
            .field("custom_filesystem", &self.filesystem.is_some())
            .field("feature_source", &self.feature_source.is_some())
            .finish()
    }
}

/// An isolated instance of every engine registry.
pub struct Context {
    id: Uuid,
    me: Weak<Context>,
    config: RwLock<EngineConfig>,
    env: RwLock<HashMap<String, String>>,
    filesystem: Arc<dyn FileSystem>,
    registry: TaskRegistry,
    subjects: RwLock<HashMap<String, Arc<Subject>>>,
    symbols: SymbolTable,
    plugins: PluginRegistry,
    projects: ProjectRegistry,
    lazy: LazyLoader,
    before_define: ExtensionChain<Project>,
    after_define: ExtensionChain<Project>,
    application_init: ExtensionChain<Application>,
}

impl Context {
    /// A context with default configuration and the local filesystem.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Starts building a context with custom collaborators.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Identifies this context in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn weak(&self) -> Weak<Context> {
        self.me.clone()
    }

    // --- Configuration & environment ---

    /// A copy of the current configuration.
    pub fn config(&self) -> EngineConfig {
        read(&self.config).clone()
    }

    /// Replaces the configuration.
    pub fn set_config(&self, config: EngineConfig) {
        *write(&self.config) = config;
    }

    /// Returns `true` if invocations are traced.
    pub fn is_tracing(&self) -> bool {
        read(&self.config).trace
    }

    /// Sets a build variable. Variables live in this context only, never in the
    /// process environment.
    pub fn set_env(&self, name: impl Into<String>, value: impl Into<String>) {
        write(&self.env).insert(name.into(), value.into());
    }

    /// The build variable `name`.
    pub fn env(&self, name: &str) -> Option<String> {
        read(&self.env).get(name).cloned()
    }

    /// All build variables, sorted by name.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = read(&self.env)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.sort();
        vars
    }

    /// The filesystem consulted for file tasks.
    pub fn filesystem(&self) -> &dyn FileSystem {
        self.filesystem.as_ref()
    }

    // --- Tasks ---

    /// The task registry, for direct access to rules and listings.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Defines (or extends) a task in the current namespace.
    pub fn define<I, S>(&self, name: &str, prerequisites: I) -> Arc<Task>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry.define(name, prerequisites)
    }

    /// Defines a task whose output is the file at `path`. File task names are paths
    /// and are never qualified with the namespace.
    pub fn define_file<I, S>(&self, path: impl AsRef<Path>, prerequisites: I) -> Arc<Task>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = path.as_ref();
        self.registry.define_task(
            Task::new(path.to_string_lossy())
                .with_staleness(Staleness::File(path.to_path_buf()))
                .with_prerequisites(prerequisites),
        )
    }

    /// Defines a task that only runs while the file at `path` does not exist.
    pub fn define_file_create<I, S>(&self, path: impl AsRef<Path>, prerequisites: I) -> Arc<Task>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = path.as_ref();
        self.registry.define_task(
            Task::new(path.to_string_lossy())
                .with_staleness(Staleness::FileCreate(path.to_path_buf()))
                .with_prerequisites(prerequisites),
        )
    }

    /// Defines a task whose prerequisites are invoked concurrently.
    pub fn define_multitask<I, S>(&self, name: &str, prerequisites: I) -> Arc<Task>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry.define_task(
            Task::new(self.registry.qualify(name))
                .with_prerequisites(prerequisites)
                .with_parallel_prerequisites(),
        )
    }

    /// Registers a fully built task, merging it into an existing one of the same name.
    pub fn define_task(&self, task: Task) -> Arc<Task> {
        self.registry.define_task(task)
    }

    /// Appends prerequisites and optionally an action to a task, creating it if needed.
    pub fn enhance<I, S>(&self, name: &str, prerequisites: I, action: Option<Action>) -> Arc<Task>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let task = self.registry.define(name, Vec::<String>::new());
        task.enhance(prerequisites, action);
        task
    }

    /// Registers a synthesis rule, tried when a lookup finds no task.
    pub fn rule<F>(&self, pattern: Regex, generator: F)
    where
        F: Fn(&RuleMatch<'_>) -> anyhow::Result<Option<Task>> + Send + Sync + 'static,
    {
        self.registry.add_rule(pattern, generator);
    }

    /// Runs `f` with `names` pushed onto the namespace stack.
    pub fn with_namespace<I, S, F, R>(&self, names: I, f: F) -> R
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce() -> R,
    {
        self.registry.with_namespace(names, f)
    }

    /// This thread's namespace stack.
    pub fn current_scope(&self) -> Vec<String> {
        self.registry.current_scope()
    }

    /// Returns the task with exactly this name, without rules or lazy loading.
    pub fn find_task(&self, name: &str) -> Option<Arc<Task>> {
        self.registry.get(name)
    }

    /// Resolves `name` in the current namespace.
    pub fn lookup(&self, name: &str) -> EngineResult<Arc<Task>> {
        let scope = self.registry.current_scope();
        self.lookup_in(name, &scope)
    }

    /// Resolves `name` in `scope`: literal name, scoped names (most specific first),
    /// rules, then lazily bound features (retrying once). A name that is an existing
    /// file stands for an implicit file task.
    pub fn lookup_in(&self, name: &str, scope: &[String]) -> EngineResult<Arc<Task>> {
        if let Some(task) = self.registry.resolve(name, scope)? {
            return Ok(task);
        }

        // Retry even when nothing was triggered here: another thread may have just
        // finished loading the feature that defines the task.
        let candidates = self.registry.candidates(name, scope);
        let triggered = self.lazy.trigger_task(self, &candidates)?;
        if let Some(task) = self.registry.resolve(name, scope)? {
            log::debug!("Resolved '{}' to '{}' after lazy loading", name, task.name());
            return Ok(task);
        }
        if triggered {
            log::warn!("A feature loaded for task '{}' did not define it", name);
        }

        if self.filesystem.exists(Path::new(name)) {
            log::debug!("Using existing file '{}' as a task", name);
            return Ok(self.define_file(name, Vec::<String>::new()));
        }

        Err(EngineError::TaskNotFound {
            name: name.to_string(),
            scope: scope.to_vec(),
        })
    }

    /// Invokes the task `name` resolves to in the current namespace.
    pub fn invoke(&self, name: &str) -> EngineResult<()> {
        let task = self.lookup(name)?;
        scheduler::invoke(self, &task, &InvocationChain::empty())
    }

    /// Invokes the given tasks concurrently on the rayon pool.
    pub fn invoke_all(&self, names: &[String]) -> EngineResult<()> {
        scheduler::invoke_all(self, names)
    }

    /// Summaries of every task whose name matches `pattern`, in definition order.
    pub fn describe_tasks(&self, pattern: &Regex) -> Vec<TaskSummary> {
        self.registry
            .tasks()
            .iter()
            .filter(|task| pattern.is_match(task.name()))
            .map(|task| task.summary())
            .collect()
    }

    // --- Subjects & symbols ---

    /// The subject named `name`, created on first use.
    pub fn subject(&self, name: &str) -> Arc<Subject> {
        if let Some(subject) = read(&self.subjects).get(name) {
            return Arc::clone(subject);
        }
        Arc::clone(
            write(&self.subjects)
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Subject::new(name))),
        )
    }

    /// Symbols registered so far, without lazy loading.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Shorthand for `symbols().register(name, value)`.
    pub fn register_symbol<T: Any + Send + Sync>(&self, name: &str, value: T) {
        self.symbols.register(name, value);
    }

    /// Resolves a symbol from the top level.
    pub fn resolve_symbol<T: Any + Send + Sync>(&self, name: &str) -> EngineResult<Arc<T>> {
        self.resolve_symbol_in::<T, &str>(name, &[])
    }

    /// Resolves `name` against every enclosing form in `scope` (most specific first),
    /// loading a lazily bound feature on a miss. A leading `::` skips the scope.
    pub fn resolve_symbol_in<T, S>(&self, name: &str, scope: &[S]) -> EngineResult<Arc<T>>
    where
        T: Any + Send + Sync,
        S: AsRef<str>,
    {
        let candidates = match name.strip_prefix(SYMBOL_SEPARATOR) {
            Some(absolute) => vec![absolute.to_string()],
            None => scoped_candidates(name, scope, SYMBOL_SEPARATOR),
        };
        let find = || {
            candidates
                .iter()
                .find_map(|candidate| self.symbols.get::<T>(candidate))
        };
        if let Some(value) = find() {
            return Ok(value);
        }
        let triggered = self.lazy.trigger_symbol(self, &candidates)?;
        if let Some(value) = find() {
            return Ok(value);
        }
        if triggered {
            log::warn!("A feature loaded for symbol '{}' did not define it", name);
        }
        Err(EngineError::UnknownSymbol {
            name: name.to_string(),
        })
    }

    // --- Lazy loading & plugins ---

    /// The feature loader.
    pub fn lazy(&self) -> &LazyLoader {
        &self.lazy
    }

    /// Loads `feature` unless it is already loaded.
    pub fn require(&self, feature: &str) -> EngineResult<()> {
        self.lazy.load(self, feature)
    }

    /// Registers `plugin` under `kind`.
    pub fn register_plugin(&self, kind: &str, plugin: Arc<dyn Plugin>) {
        self.plugins.register(kind, plugin);
    }

    /// The plugin of `kind` named `name`, loading its feature if it is lazily bound.
    pub fn select_plugin(&self, kind: &str, name: &str) -> EngineResult<Arc<dyn Plugin>> {
        if let Some(plugin) = self.plugins.get(kind, name) {
            return Ok(plugin);
        }
        self.lazy.trigger_plugin(self, kind, Some(name))?;
        self.plugins
            .get(kind, name)
            .ok_or_else(|| EngineError::UnknownPlugin {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    /// Every plugin of `kind` that applies to `project`, after loading all lazily
    /// bound plugins of that kind.
    pub fn applicable_plugins(
        &self,
        kind: &str,
        project: &Project,
    ) -> EngineResult<Vec<Arc<dyn Plugin>>> {
        self.lazy.trigger_plugin(self, kind, None)?;
        Ok(self
            .plugins
            .of_kind(kind)
            .into_iter()
            .filter(|plugin| plugin.applies_to(project))
            .collect())
    }

    // --- Projects ---

    /// Hooks run on every project before its body.
    pub fn before_define(&self) -> &ExtensionChain<Project> {
        &self.before_define
    }

    /// Hooks run on every project after its body.
    pub fn after_define(&self) -> &ExtensionChain<Project> {
        &self.after_define
    }

    /// Hooks run on every application created from this context.
    pub fn application_init(&self) -> &ExtensionChain<Application> {
        &self.application_init
    }

    /// Defines a project named `name` in the current namespace.
    ///
    /// Runs the `before_define` hooks, then `body` inside the project's namespace,
    /// then the `after_define` hooks. A project whose body fails is removed again.
    pub fn define_project<F>(&self, name: &str, body: F) -> EngineResult<Arc<Project>>
    where
        F: FnOnce(&Context, &Arc<Project>) -> anyhow::Result<()>,
    {
        let scope = self.registry.current_scope();
        let mut segments = scope.clone();
        segments.push(name.to_string());
        let qualified = join_name(&segments, TASK_SEPARATOR);

        let parent = self.projects.get(&join_name(&scope, TASK_SEPARATOR));
        let base_dir: PathBuf = match &parent {
            Some(parent) => parent.base_dir().join(name),
            None if scope.is_empty() => read(&self.config).base_dir.clone(),
            None => read(&self.config).base_dir.join(name),
        };
        let project = Arc::new(Project::new(
            qualified.clone(),
            name.to_string(),
            parent.map(|p| p.name().to_string()),
            base_dir,
        ));
        if !self.projects.insert(Arc::clone(&project)) {
            return Err(EngineError::DuplicateProject { name: qualified });
        }
        log::debug!("Defining project '{}'", qualified);

        let result = self.before_define.apply(&project).and_then(|()| {
            self.registry
                .with_namespace([name], || body(self, &project))
                .map_err(|source| EngineError::ProjectDefinition {
                    name: qualified.clone(),
                    source,
                })
        });
        let result = result.and_then(|()| self.after_define.apply(&project));

        if let Err(e) = result {
            self.projects.remove(&qualified);
            let key = project.extension_key();
            self.before_define.forget(&key);
            self.after_define.forget(&key);
            return Err(e);
        }
        Ok(project)
    }

    /// The project with the fully qualified `name`.
    pub fn project(&self, name: &str) -> Option<Arc<Project>> {
        self.projects.get(name)
    }

    /// Every project, in definition order.
    pub fn projects(&self) -> Vec<Arc<Project>> {
        self.projects.all()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("tasks", &self.registry.len())
            .field("projects", &self.projects.all().len())
            .field("lazy", &self.lazy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fs::MemoryFileSystem;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_contexts_are_isolated() {
        let first = Context::new();
        let second = Context::new();
        first.define("build", Vec::<String>::new());
        first.set_env("RELEASE", "1");
        first.register_symbol("Answer", 42u32);

        assert!(second.find_task("build").is_none());
        assert!(second.env("RELEASE").is_none());
        assert!(second.resolve_symbol::<u32>("Answer").is_err());
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_lookup_walks_scope_then_fails() {
        let ctx = Context::new();
        ctx.define("compile", Vec::<String>::new());
        ctx.with_namespace(["foo"], || {
            ctx.define("compile", Vec::<String>::new());
            ctx.define("test", Vec::<String>::new());
        });

        let scope = vec!["foo".to_string(), "bar".to_string()];
        // A literal definition wins over the scoped one.
        assert_eq!(ctx.lookup_in("compile", &scope).unwrap().name(), "compile");
        assert_eq!(ctx.lookup_in("test", &scope).unwrap().name(), "foo:test");
        assert_eq!(ctx.lookup_in(":compile", &scope).unwrap().name(), "compile");
        assert_eq!(ctx.lookup_in("^^compile", &scope).unwrap().name(), "compile");

        let err = ctx.lookup_in("package", &scope).unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound { ref name, .. } if name == "package"));
    }

    #[test]
    fn test_existing_file_is_an_implicit_task() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.touch("src/Main.java", UNIX_EPOCH + Duration::from_secs(10));
        let ctx = Context::builder().filesystem(fs.clone()).build();

        let task = ctx.lookup("src/Main.java").unwrap();
        assert!(matches!(task.staleness(), Staleness::File(_)));
        assert!(ctx.lookup("src/Missing.java").is_err());
    }

    #[test]
    fn test_symbol_resolution_in_scope() {
        let ctx = Context::new();
        ctx.register_symbol("Compiler::Javac", "javac".to_string());
        ctx.register_symbol("Javac", "top".to_string());

        let scoped = ctx
            .resolve_symbol_in::<String, _>("Javac", &["Compiler"])
            .unwrap();
        assert_eq!(*scoped, "javac");
        let absolute = ctx
            .resolve_symbol_in::<String, _>("::Javac", &["Compiler"])
            .unwrap();
        assert_eq!(*absolute, "top");

        let err = ctx.resolve_symbol::<String>("Scalac").unwrap_err();
        assert!(matches!(err, EngineError::UnknownSymbol { .. }));
    }

    #[test]
    fn test_define_project_runs_chains_and_namespaces() {
        // --- Setup ---
        let ctx = Context::new();
        let trail = Arc::new(std::sync::Mutex::new(Vec::new()));
        let before = Arc::clone(&trail);
        ctx.before_define()
            .append("record", move |p: &Arc<Project>| {
                before.lock().unwrap().push(format!("before {}", p.name()));
                Ok(())
            })
            .unwrap();
        let after = Arc::clone(&trail);
        ctx.after_define()
            .append("record", move |p: &Arc<Project>| {
                after.lock().unwrap().push(format!("after {}", p.name()));
                Ok(())
            })
            .unwrap();

        // --- Execute ---
        let outer = ctx
            .define_project("foo", |ctx, _| {
                ctx.define("compile", Vec::<String>::new());
                ctx.define_project("bar", |ctx, bar| {
                    ctx.define("compile", [":foo:compile"]);
                    assert_eq!(bar.parent(), Some("foo"));
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();

        // --- Assert ---
        assert_eq!(outer.name(), "foo");
        assert!(ctx.find_task("foo:compile").is_some());
        let child = ctx.find_task("foo:bar:compile").unwrap();
        assert_eq!(child.prerequisites(), vec![":foo:compile"]);
        assert_eq!(
            *trail.lock().unwrap(),
            vec!["before foo", "before foo:bar", "after foo:bar", "after foo"]
        );
        assert_eq!(ctx.project("foo:bar").unwrap().base_dir(), outer.base_dir().join("bar"));
        assert!(ctx.current_scope().is_empty());
    }

    #[test]
    fn test_duplicate_and_failed_projects() {
        let ctx = Context::new();
        ctx.define_project("app", |_, _| Ok(())).unwrap();
        let err = ctx.define_project("app", |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateProject { .. }));

        let err = ctx
            .define_project("broken", |_, _| Err(anyhow::anyhow!("bad layout")))
            .unwrap_err();
        assert!(matches!(err, EngineError::ProjectDefinition { ref name, .. } if name == "broken"));
        assert!(ctx.project("broken").is_none());
        assert_eq!(ctx.projects().len(), 1);
    }

    #[test]
    fn test_describe_tasks_filters_by_pattern() {
        let ctx = Context::new();
        ctx.define("test:unit", Vec::<String>::new())
            .set_comment("Run unit tests");
        ctx.define("test:integration", ["test:unit"]);
        ctx.define("package", Vec::<String>::new());

        let summaries = ctx.describe_tasks(&Regex::new("^test:").unwrap());
        let names: Vec<&str> = summaries.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["test:unit", "test:integration"]);
        assert_eq!(summaries[0].comment.as_deref(), Some("Run unit tests"));
        assert_eq!(summaries[1].prerequisites, vec!["test:unit"]);
    }

    struct Javac;

    impl Plugin for Javac {
        fn name(&self) -> &str {
            "javac"
        }

        fn applies_to(&self, project: &Project) -> bool {
            project.name().starts_with("java")
        }

        fn invoke(&self, ctx: &Context, project: &Arc<Project>) -> anyhow::Result<()> {
            ctx.set_env("COMPILED", project.name());
            Ok(())
        }
    }

    #[test]
    fn test_plugins_load_lazily() {
        let ctx = Context::new();
        ctx.lazy().provide("java", |ctx: &Context| {
            ctx.register_plugin("compiler", Arc::new(Javac));
            Ok(())
        });
        ctx.lazy().bind_plugin("java", "compiler", "javac");

        let project = ctx.define_project("javaapp", |_, _| Ok(())).unwrap();
        let applicable = ctx.applicable_plugins("compiler", &project).unwrap();
        assert_eq!(applicable.len(), 1);
        applicable[0].invoke(&ctx, &project).unwrap();
        assert_eq!(ctx.env("COMPILED").as_deref(), Some("javaapp"));

        assert!(ctx.select_plugin("compiler", "javac").is_ok());
        let err = ctx.select_plugin("compiler", "scalac").err().unwrap();
        assert!(matches!(err, EngineError::UnknownPlugin { .. }));
    }
}
