//! # Lazy loading
//!
//! Features (named bundles of definitions) are loaded on first use. A feature can be
//! bound to symbol names, task names, subject operations or plugins; the first
//! reference to any of them loads the feature, after which the reference resolves
//! against whatever the feature defined.
//!
//! Each feature is loaded at most once per [`LazyLoader`], even when several threads
//! trigger it concurrently: the first thread loads, the others wait for it to finish.
//! A feature that references itself while loading (directly or through another
//! feature) is treated as already satisfied. Loading always happens in the top-level
//! namespace, whatever namespace the triggering reference came from.

use crate::core::{
    advice::{Operation, OperationSlot},
    commons::{lock, read, write},
    context::Context,
    error::{EngineError, EngineResult},
};
use anyhow::bail;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, ThreadId};

/// Code that populates a context with a feature's definitions.
pub type FeatureInit = Arc<dyn Fn(&Context) -> anyhow::Result<()> + Send + Sync>;

/// Matches the names a feature provides.
#[derive(Debug, Clone)]
pub enum TriggerPattern {
    /// One literal name.
    Exact(String),
    /// Any name the expression matches.
    Regex(Regex),
}

impl TriggerPattern {
    /// Returns `true` if `name` is provided by the feature.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Regex(regex) => regex.is_match(name),
        }
    }

    fn matches_any(&self, candidates: &[String]) -> bool {
        candidates.iter().any(|candidate| self.matches(candidate))
    }
}

impl From<&str> for TriggerPattern {
    fn from(name: &str) -> Self {
        Self::Exact(name.to_string())
    }
}

impl From<String> for TriggerPattern {
    fn from(name: String) -> Self {
        Self::Exact(name)
    }
}

impl From<Regex> for TriggerPattern {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

/// Knows how to load features by name.
pub trait FeatureSource: Send + Sync {
    /// Defines everything `feature` provides on `ctx`.
    fn load_feature(&self, ctx: &Context, feature: &str) -> anyhow::Result<()>;
}

/// Features registered in-process as closures.
#[derive(Default)]
pub struct FeatureTable {
    features: RwLock<HashMap<String, FeatureInit>>,
}

impl FeatureTable {
    /// Registers the code that loads `feature`, replacing any previous one.
    pub fn provide<F>(&self, feature: &str, init: F)
    where
        F: Fn(&Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.features).insert(feature.to_string(), Arc::new(init));
    }

    /// Returns `true` if `feature` was registered.
    pub fn contains(&self, feature: &str) -> bool {
        read(&self.features).contains_key(feature)
    }
}

impl fmt::Debug for FeatureTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut features: Vec<String> = read(&self.features).keys().cloned().collect();
        features.sort();
        f.debug_struct("FeatureTable")
            .field("features", &features)
            .finish()
    }
}

impl FeatureSource for FeatureTable {
    fn load_feature(&self, ctx: &Context, feature: &str) -> anyhow::Result<()> {
        let init = read(&self.features).get(feature).cloned();
        match init {
            Some(init) => init(ctx),
            None => bail!("No such feature '{}'", feature),
        }
    }
}

struct NameBinding {
    feature: String,
    patterns: Vec<TriggerPattern>,
}

struct OperationBinding {
    feature: String,
    subject: String,
    operation: String,
    slot: Arc<dyn OperationSlot>,
}

struct PluginBinding {
    feature: String,
    kind: String,
    name: String,
}

#[derive(Default)]
struct Bindings {
    symbols: Vec<NameBinding>,
    tasks: Vec<NameBinding>,
    operations: Vec<OperationBinding>,
    plugins: Vec<PluginBinding>,
}

impl Bindings {
    /// Removes and returns every binding of `feature`.
    fn take_feature(&mut self, feature: &str) -> Bindings {
        fn split<T>(items: &mut Vec<T>, owned_by: impl Fn(&T) -> bool) -> Vec<T> {
            let (taken, kept) = std::mem::take(items).into_iter().partition(owned_by);
            *items = kept;
            taken
        }
        Bindings {
            symbols: split(&mut self.symbols, |b| b.feature == feature),
            tasks: split(&mut self.tasks, |b| b.feature == feature),
            operations: split(&mut self.operations, |b| b.feature == feature),
            plugins: split(&mut self.plugins, |b| b.feature == feature),
        }
    }

    fn restore(&mut self, taken: Bindings) {
        self.symbols.extend(taken.symbols);
        self.tasks.extend(taken.tasks);
        self.operations.extend(taken.operations);
        self.plugins.extend(taken.plugins);
    }

    fn disarm_stubs(&self) {
        for binding in &self.operations {
            binding.slot.set_stub_armed(false);
        }
    }
}

/// Bindings waiting for a trigger, plus those of features being loaded right now.
/// In-flight bindings still match triggers so that a concurrent reference waits for
/// the load instead of missing it.
#[derive(Default)]
struct BindingTable {
    pending: Bindings,
    in_flight: HashMap<String, Bindings>,
}

impl BindingTable {
    fn all(&self) -> impl Iterator<Item = &Bindings> {
        std::iter::once(&self.pending).chain(self.in_flight.values())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Loading(ThreadId),
    Loaded,
}

/// Loads features on first reference.
pub struct LazyLoader {
    table: FeatureTable,
    fallback: Option<Arc<dyn FeatureSource>>,
    bindings: Mutex<BindingTable>,
    states: Mutex<HashMap<String, LoadState>>,
    settled: Condvar,
    before_load: RwLock<HashMap<String, Vec<FeatureInit>>>,
    after_load: RwLock<HashMap<String, Vec<FeatureInit>>>,
}

impl LazyLoader {
    /// A loader that knows only the features registered with [`provide`](Self::provide).
    pub fn new() -> Self {
        Self {
            table: FeatureTable::default(),
            fallback: None,
            bindings: Mutex::new(BindingTable::default()),
            states: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            before_load: RwLock::new(HashMap::new()),
            after_load: RwLock::new(HashMap::new()),
        }
    }

    /// A loader that consults `source` for features not registered in-process.
    pub fn with_source(source: Arc<dyn FeatureSource>) -> Self {
        Self {
            fallback: Some(source),
            ..Self::new()
        }
    }

    /// Registers the code that loads `feature`.
    pub fn provide<F>(&self, feature: &str, init: F)
    where
        F: Fn(&Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.table.provide(feature, init);
    }

    /// Runs `hook` right before `feature` loads.
    pub fn before_load<F>(&self, feature: &str, hook: F)
    where
        F: Fn(&Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.before_load)
            .entry(feature.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    /// Runs `hook` right after `feature` loaded successfully.
    pub fn after_load<F>(&self, feature: &str, hook: F)
    where
        F: Fn(&Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.after_load)
            .entry(feature.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    /// Declares that `feature` defines the symbols matching `patterns`.
    pub fn bind_symbols<P>(&self, feature: &str, patterns: impl IntoIterator<Item = P>)
    where
        P: Into<TriggerPattern>,
    {
        if self.skip_loaded(feature) {
            return;
        }
        lock(&self.bindings).pending.symbols.push(NameBinding {
            feature: feature.to_string(),
            patterns: patterns.into_iter().map(Into::into).collect(),
        });
    }

    /// Declares that `feature` defines the tasks matching `patterns`.
    pub fn bind_tasks<P>(&self, feature: &str, patterns: impl IntoIterator<Item = P>)
    where
        P: Into<TriggerPattern>,
    {
        if self.skip_loaded(feature) {
            return;
        }
        lock(&self.bindings).pending.tasks.push(NameBinding {
            feature: feature.to_string(),
            patterns: patterns.into_iter().map(Into::into).collect(),
        });
    }

    /// Declares that `feature` defines the plugin `kind`/`name`.
    pub fn bind_plugin(&self, feature: &str, kind: &str, name: &str) {
        if self.skip_loaded(feature) {
            return;
        }
        lock(&self.bindings).pending.plugins.push(PluginBinding {
            feature: feature.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        });
    }

    /// Declares that `feature` defines `operation` on `subject`.
    ///
    /// Until the feature loads, calling the operation loads it and then forwards the
    /// call to the real implementation. Advice attached to the operation in the
    /// meantime wraps the forwarded call.
    pub fn bind_operation<A: 'static, R: 'static>(
        &self,
        ctx: &Context,
        subject: &str,
        operation: &str,
        feature: &str,
    ) {
        if self.skip_loaded(feature) {
            return;
        }
        let weak = ctx.weak();
        let (subject_name, operation_name, feature_name) =
            (subject.to_string(), operation.to_string(), feature.to_string());
        let stub: Operation<A, R> = Arc::new(move |args: &A| {
            let ctx = weak.upgrade().ok_or(EngineError::ContextDropped)?;
            log::debug!(
                "Operation '{}#{}' triggered feature '{}'",
                subject_name,
                operation_name,
                feature_name
            );
            ctx.lazy().load(&ctx, &feature_name)?;
            ctx.subject(&subject_name)
                .call_implementation::<A, R>(&operation_name, args)
        });
        let slot = ctx.subject(subject).install_stub(operation, stub);
        lock(&self.bindings).pending.operations.push(OperationBinding {
            feature: feature.to_string(),
            subject: subject.to_string(),
            operation: operation.to_string(),
            slot,
        });
    }

    /// Returns `true` once `feature` has finished loading.
    pub fn is_loaded(&self, feature: &str) -> bool {
        lock(&self.states).get(feature) == Some(&LoadState::Loaded)
    }

    /// Features that still have unresolved bindings, sorted.
    pub fn pending_features(&self) -> Vec<String> {
        let table = lock(&self.bindings);
        let bindings = &table.pending;
        let mut features: Vec<String> = bindings
            .symbols
            .iter()
            .chain(&bindings.tasks)
            .map(|b| b.feature.clone())
            .chain(bindings.operations.iter().map(|b| b.feature.clone()))
            .chain(bindings.plugins.iter().map(|b| b.feature.clone()))
            .collect();
        features.sort();
        features.dedup();
        features
    }

    /// Loads `feature` unless it is loaded already.
    ///
    /// # Errors
    /// `FeatureLoad` if the feature is unknown or its code fails. A failed feature is
    /// not marked loaded and its bindings stay in place.
    pub fn load(&self, ctx: &Context, feature: &str) -> EngineResult<()> {
        if !self.begin_load(feature) {
            return Ok(());
        }
        log::debug!("Loading feature '{}'", feature);
        {
            let mut table = lock(&self.bindings);
            let taken = table.pending.take_feature(feature);
            table.in_flight.insert(feature.to_string(), taken);
        }

        let result = self.run_feature(ctx, feature);

        {
            let mut states = lock(&self.states);
            if result.is_ok() {
                states.insert(feature.to_string(), LoadState::Loaded);
            } else {
                states.remove(feature);
            }
        }
        {
            let mut table = lock(&self.bindings);
            let taken = table.in_flight.remove(feature).unwrap_or_default();
            if result.is_ok() {
                taken.disarm_stubs();
            } else {
                table.pending.restore(taken);
            }
        }
        self.settled.notify_all();

        match &result {
            Ok(()) => log::debug!("Feature '{}' loaded", feature),
            Err(e) => log::debug!("Feature '{}' failed to load: {}", feature, e),
        }
        result
    }

    /// Loads every feature bound to a symbol among `candidates`.
    /// Returns `true` if anything was loaded.
    pub fn trigger_symbol(&self, ctx: &Context, candidates: &[String]) -> EngineResult<bool> {
        let features = {
            let table = lock(&self.bindings);
            features_matching(table.all().flat_map(|b| &b.symbols), candidates)
        };
        self.load_each(ctx, features)
    }

    /// Loads every feature bound to a task among `candidates`.
    /// Returns `true` if anything was loaded.
    pub fn trigger_task(&self, ctx: &Context, candidates: &[String]) -> EngineResult<bool> {
        let features = {
            let table = lock(&self.bindings);
            features_matching(table.all().flat_map(|b| &b.tasks), candidates)
        };
        self.load_each(ctx, features)
    }

    /// Loads the features bound to plugins of `kind`, restricted to `name` if given.
    pub fn trigger_plugin(
        &self,
        ctx: &Context,
        kind: &str,
        name: Option<&str>,
    ) -> EngineResult<bool> {
        let features = {
            let table = lock(&self.bindings);
            unique(
                table
                    .all()
                    .flat_map(|b| &b.plugins)
                    .filter(|b| b.kind == kind && name.is_none_or(|name| b.name == name))
                    .map(|b| b.feature.clone()),
            )
        };
        self.load_each(ctx, features)
    }

    fn load_each(&self, ctx: &Context, features: Vec<String>) -> EngineResult<bool> {
        let triggered = !features.is_empty();
        for feature in features {
            self.load(ctx, &feature)?;
        }
        Ok(triggered)
    }

    /// Claims `feature` for loading on this thread. Returns `false` if there is
    /// nothing to do: the feature is loaded, or this thread is already loading it.
    /// Blocks while another thread is loading it.
    fn begin_load(&self, feature: &str) -> bool {
        let me = thread::current().id();
        let mut states = lock(&self.states);
        loop {
            match states.get(feature) {
                Some(LoadState::Loaded) => return false,
                Some(LoadState::Loading(owner)) if *owner == me => {
                    log::trace!("Feature '{}' is already loading on this thread", feature);
                    return false;
                }
                Some(LoadState::Loading(_)) => {
                    states = self
                        .settled
                        .wait(states)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                None => {
                    states.insert(feature.to_string(), LoadState::Loading(me));
                    return true;
                }
            }
        }
    }

    fn run_feature(&self, ctx: &Context, feature: &str) -> EngineResult<()> {
        let before = read(&self.before_load)
            .get(feature)
            .cloned()
            .unwrap_or_default();
        let after = read(&self.after_load)
            .get(feature)
            .cloned()
            .unwrap_or_default();

        ctx.registry()
            .switch_to_namespace(Vec::new(), || -> anyhow::Result<()> {
                for hook in &before {
                    hook(ctx)?;
                }
                match &self.fallback {
                    Some(fallback) if !self.table.contains(feature) => {
                        fallback.load_feature(ctx, feature)?
                    }
                    _ => self.table.load_feature(ctx, feature)?,
                }
                for hook in &after {
                    hook(ctx)?;
                }
                Ok(())
            })
            .map_err(|source| EngineError::FeatureLoad {
                feature: feature.to_string(),
                source,
            })
    }

    fn skip_loaded(&self, feature: &str) -> bool {
        let loaded = self.is_loaded(feature);
        if loaded {
            log::debug!("Feature '{}' is already loaded; binding ignored", feature);
        }
        loaded
    }
}

impl Default for LazyLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// A loader can itself serve as the source of another loader.
impl FeatureSource for LazyLoader {
    fn load_feature(&self, ctx: &Context, feature: &str) -> anyhow::Result<()> {
        self.load(ctx, feature)?;
        Ok(())
    }
}

impl fmt::Debug for LazyLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaded: Vec<String> = {
            let states = lock(&self.states);
            let mut loaded: Vec<String> = states
                .iter()
                .filter(|(_, state)| **state == LoadState::Loaded)
                .map(|(name, _)| name.clone())
                .collect();
            loaded.sort();
            loaded
        };
        let operations: Vec<String> = lock(&self.bindings)
            .pending
            .operations
            .iter()
            .map(|b| format!("{}#{}", b.subject, b.operation))
            .collect();
        f.debug_struct("LazyLoader")
            .field("loaded", &loaded)
            .field("pending", &self.pending_features())
            .field("operations", &operations)
            .finish()
    }
}

fn features_matching<'a>(
    bindings: impl Iterator<Item = &'a NameBinding>,
    candidates: &[String],
) -> Vec<String> {
    unique(
        bindings
            .filter(|b| b.patterns.iter().any(|p| p.matches_any(candidates)))
            .map(|b| b.feature.clone()),
    )
}

fn unique(features: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for feature in features {
        if !seen.contains(&feature) {
            seen.push(feature);
        }
    }
    seen
}
