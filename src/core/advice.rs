//! # Advice
//!
//! Named operations on a [`Subject`] can be wrapped with before/after/around
//! behavior after they were defined, and unwrapped again, without touching the
//! definition.
//!
//! Each operation keeps its implementation plus an ordered list of advice layers.
//! A call runs the most recently attached layer first; every layer continues into the
//! layer attached before it and the innermost one into the implementation. Detaching
//! a layer removes exactly that entry from the list, so detaching the latest advice
//! restores the previous dispatch exactly.
//!
//! Operations are typed: an operation defined as `Fn(&A) -> anyhow::Result<R>` can
//! only be called, advised or replaced with the same `A` and `R`.

use crate::core::{
    commons::{read, write},
    error::{EngineError, EngineResult},
};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// The implementation of an operation.
pub type Operation<A, R> = Arc<dyn Fn(&A) -> anyhow::Result<R> + Send + Sync>;

/// The continuation handed to `around` advice.
pub type Continue<'a, A, R> = &'a dyn Fn(&A) -> anyhow::Result<R>;

type BeforeHandler<A, R> = Arc<dyn Fn(&A) -> anyhow::Result<Flow<R>> + Send + Sync>;
type AfterHandler<A, R> = Arc<dyn Fn(&A, R) -> anyhow::Result<R> + Send + Sync>;
type AroundHandler<A, R> =
    Arc<dyn Fn(&A, Continue<'_, A, R>) -> anyhow::Result<R> + Send + Sync>;

/// What a `before` advice wants to happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<R> {
    /// Call the advised operation and return its result.
    Continue,
    /// Skip the advised operation and return this value.
    Return(R),
}

/// Behavior attached to an existing operation.
pub enum Advice<A, R> {
    /// Runs first and may short-circuit with its own result.
    Before(BeforeHandler<A, R>),
    /// Receives the operation's result and returns the (possibly replaced) result.
    After(AfterHandler<A, R>),
    /// Decides whether and how to continue into the operation.
    Around(AroundHandler<A, R>),
}

impl<A, R> Advice<A, R> {
    /// Advice that runs before the operation.
    pub fn before<F>(handler: F) -> Self
    where
        F: Fn(&A) -> anyhow::Result<Flow<R>> + Send + Sync + 'static,
    {
        Self::Before(Arc::new(handler))
    }

    /// Advice that runs after the operation and may replace its result.
    pub fn after<F>(handler: F) -> Self
    where
        F: Fn(&A, R) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self::After(Arc::new(handler))
    }

    /// Advice that wraps the operation.
    pub fn around<F>(handler: F) -> Self
    where
        F: Fn(&A, Continue<'_, A, R>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self::Around(Arc::new(handler))
    }

    /// `"before"`, `"after"` or `"around"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Before(_) => "before",
            Self::After(_) => "after",
            Self::Around(_) => "around",
        }
    }
}

impl<A, R> fmt::Debug for Advice<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Advice::{}", self.kind())
    }
}

struct Layer<A, R> {
    id: u64,
    enabled: Arc<AtomicBool>,
    advice: Advice<A, R>,
}

struct SlotState<A, R> {
    implementation: Option<Operation<A, R>>,
    stub: Option<Operation<A, R>>,
    stub_armed: bool,
    layers: Vec<Arc<Layer<A, R>>>,
}

struct Slot<A, R> {
    state: RwLock<SlotState<A, R>>,
}

impl<A, R> Slot<A, R> {
    fn new() -> Self {
        Self {
            state: RwLock::new(SlotState {
                implementation: None,
                stub: None,
                stub_armed: false,
                layers: Vec::new(),
            }),
        }
    }

    /// The real implementation wins over an armed lazy stub.
    fn effective(state: &SlotState<A, R>) -> Option<Operation<A, R>> {
        state.implementation.clone().or_else(|| {
            if state.stub_armed {
                state.stub.clone()
            } else {
                None
            }
        })
    }
}

/// Type-erased view of an operation slot, for handles and lazy bindings.
pub(crate) trait OperationSlot: Send + Sync {
    fn remove_layer(&self, id: u64) -> bool;
    fn has_layer(&self, id: u64) -> bool;
    fn layer_count(&self) -> usize;
    fn is_defined(&self) -> bool;
    fn clear_implementation(&self) -> bool;
    fn set_stub_armed(&self, armed: bool);
    fn dispatches_to_stub(&self) -> bool;
}

impl<A: 'static, R: 'static> OperationSlot for Slot<A, R> {
    fn remove_layer(&self, id: u64) -> bool {
        let mut state = write(&self.state);
        let before = state.layers.len();
        state.layers.retain(|layer| layer.id != id);
        state.layers.len() != before
    }

    fn has_layer(&self, id: u64) -> bool {
        read(&self.state).layers.iter().any(|layer| layer.id == id)
    }

    fn layer_count(&self) -> usize {
        read(&self.state).layers.len()
    }

    fn is_defined(&self) -> bool {
        Self::effective(&read(&self.state)).is_some()
    }

    fn clear_implementation(&self) -> bool {
        write(&self.state).implementation.take().is_some()
    }

    fn set_stub_armed(&self, armed: bool) {
        let mut state = write(&self.state);
        state.stub_armed = armed && state.stub.is_some();
    }

    fn dispatches_to_stub(&self) -> bool {
        let state = read(&self.state);
        state.implementation.is_none() && state.stub_armed
    }
}

struct SlotEntry {
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn OperationSlot>,
}

/// Something whose named operations can be defined, called and advised.
///
/// Subjects are obtained from a `Context` by name (`ctx.subject("project")`), so the
/// collaborators advising an operation never need the concrete type that owns it.
pub struct Subject {
    name: String,
    operations: RwLock<HashMap<String, SlotEntry>>,
    next_advice_id: AtomicU64,
}

impl Subject {
    /// Creates a subject with no operations.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: RwLock::new(HashMap::new()),
            next_advice_id: AtomicU64::new(1),
        }
    }

    /// The subject's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defines (or redefines) the implementation of `operation`.
    ///
    /// Advice already attached to an operation of the same signature stays attached.
    pub fn define<A, R, F>(&self, operation: &str, implementation: F)
    where
        A: 'static,
        R: 'static,
        F: Fn(&A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let slot = self.slot_or_create::<A, R>(operation);
        write(&slot.state).implementation = Some(Arc::new(implementation));
        log::debug!("Defined operation '{}#{}'", self.name, operation);
    }

    /// Removes the implementation of `operation`, keeping attached advice.
    /// Returns `true` if there was one.
    pub fn undefine(&self, operation: &str) -> bool {
        read(&self.operations)
            .get(operation)
            .is_some_and(|entry| entry.erased.clear_implementation())
    }

    /// Returns `true` if `operation` can be called.
    pub fn responds_to(&self, operation: &str) -> bool {
        read(&self.operations)
            .get(operation)
            .is_some_and(|entry| entry.erased.is_defined())
    }

    /// Returns `true` while calls to `operation` go through a lazy stub, that is
    /// before the feature providing it has loaded.
    pub fn is_lazy(&self, operation: &str) -> bool {
        read(&self.operations)
            .get(operation)
            .is_some_and(|entry| entry.erased.dispatches_to_stub())
    }

    /// Number of advice layers currently attached to `operation`.
    pub fn advice_count(&self, operation: &str) -> usize {
        read(&self.operations)
            .get(operation)
            .map_or(0, |entry| entry.erased.layer_count())
    }

    /// Calls `operation` through every enabled advice layer.
    ///
    /// Errors raised by advice or by the implementation are returned unchanged. An
    /// undefined operation fails with `EngineError::UnknownOperation`.
    pub fn call<A: 'static, R: 'static>(&self, operation: &str, args: &A) -> anyhow::Result<R> {
        let (implementation, layers) = {
            let slot = self
                .slot::<A, R>(operation)
                .ok_or_else(|| self.unknown_operation(operation))?;
            let state = read(&slot.state);
            let implementation =
                Slot::effective(&state).ok_or_else(|| self.unknown_operation(operation))?;
            (implementation, state.layers.clone())
        };
        dispatch(&implementation, &layers, args)
    }

    /// Calls the real implementation of `operation` directly, bypassing advice and
    /// lazy stubs.
    pub(crate) fn call_implementation<A: 'static, R: 'static>(
        &self,
        operation: &str,
        args: &A,
    ) -> anyhow::Result<R> {
        let implementation = self
            .slot::<A, R>(operation)
            .and_then(|slot| read(&slot.state).implementation.clone())
            .ok_or_else(|| self.unknown_operation(operation))?;
        implementation(args)
    }

    /// Attaches `advice` to `operation`, wrapping whatever dispatch is current.
    ///
    /// # Errors
    /// `AdviceTargetMissing` if the subject does not define `operation` with this
    /// signature.
    pub fn attach<A: 'static, R: 'static>(
        &self,
        operation: &str,
        advice: Advice<A, R>,
    ) -> EngineResult<AdviceHandle> {
        let operations = read(&self.operations);
        let missing = || EngineError::AdviceTargetMissing {
            subject: self.name.clone(),
            operation: operation.to_string(),
        };
        let entry = operations.get(operation).ok_or_else(missing)?;
        if !entry.erased.is_defined() {
            return Err(missing());
        }
        let slot = Arc::clone(&entry.typed)
            .downcast::<Slot<A, R>>()
            .map_err(|_| missing())?;

        let id = self.next_advice_id.fetch_add(1, Ordering::SeqCst);
        let enabled = Arc::new(AtomicBool::new(true));
        let kind = advice.kind();
        write(&slot.state).layers.push(Arc::new(Layer {
            id,
            enabled: Arc::clone(&enabled),
            advice,
        }));
        log::debug!("Attached {} advice #{} to '{}#{}'", kind, id, self.name, operation);

        Ok(AdviceHandle {
            subject: self.name.clone(),
            operation: operation.to_string(),
            kind,
            id,
            enabled,
            slot: Arc::downgrade(&entry.erased),
        })
    }

    /// Shorthand for `attach(operation, Advice::before(handler))`.
    pub fn before<A, R, F>(&self, operation: &str, handler: F) -> EngineResult<AdviceHandle>
    where
        A: 'static,
        R: 'static,
        F: Fn(&A) -> anyhow::Result<Flow<R>> + Send + Sync + 'static,
    {
        self.attach(operation, Advice::before(handler))
    }

    /// Shorthand for `attach(operation, Advice::after(handler))`.
    pub fn after<A, R, F>(&self, operation: &str, handler: F) -> EngineResult<AdviceHandle>
    where
        A: 'static,
        R: 'static,
        F: Fn(&A, R) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.attach(operation, Advice::after(handler))
    }

    /// Shorthand for `attach(operation, Advice::around(handler))`.
    pub fn around<A, R, F>(&self, operation: &str, handler: F) -> EngineResult<AdviceHandle>
    where
        A: 'static,
        R: 'static,
        F: Fn(&A, Continue<'_, A, R>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.attach(operation, Advice::around(handler))
    }

    /// Installs a lazy stub used while `operation` has no real implementation.
    pub(crate) fn install_stub<A: 'static, R: 'static>(
        &self,
        operation: &str,
        stub: Operation<A, R>,
    ) -> Arc<dyn OperationSlot> {
        let slot = self.slot_or_create::<A, R>(operation);
        {
            let mut state = write(&slot.state);
            state.stub = Some(stub);
            state.stub_armed = true;
        }
        let erased: Arc<dyn OperationSlot> = slot;
        erased
    }

    fn slot<A: 'static, R: 'static>(&self, operation: &str) -> Option<Arc<Slot<A, R>>> {
        read(&self.operations)
            .get(operation)
            .and_then(|entry| Arc::clone(&entry.typed).downcast::<Slot<A, R>>().ok())
    }

    fn slot_or_create<A: 'static, R: 'static>(&self, operation: &str) -> Arc<Slot<A, R>> {
        let mut operations = write(&self.operations);
        if let Some(slot) = operations
            .get(operation)
            .and_then(|entry| Arc::clone(&entry.typed).downcast::<Slot<A, R>>().ok())
        {
            return slot;
        }
        if operations.contains_key(operation) {
            log::debug!(
                "Operation '{}#{}' redefined with a new signature; dropping its advice",
                self.name,
                operation
            );
        }
        let slot = Arc::new(Slot::<A, R>::new());
        operations.insert(
            operation.to_string(),
            SlotEntry {
                typed: Arc::clone(&slot) as Arc<dyn Any + Send + Sync>,
                erased: Arc::clone(&slot) as Arc<dyn OperationSlot>,
            },
        );
        slot
    }

    fn unknown_operation(&self, operation: &str) -> anyhow::Error {
        EngineError::UnknownOperation {
            subject: self.name.clone(),
            operation: operation.to_string(),
        }
        .into()
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut operations: Vec<String> = read(&self.operations).keys().cloned().collect();
        operations.sort();
        f.debug_struct("Subject")
            .field("name", &self.name)
            .field("operations", &operations)
            .finish()
    }
}

fn dispatch<A, R>(
    implementation: &Operation<A, R>,
    layers: &[Arc<Layer<A, R>>],
    args: &A,
) -> anyhow::Result<R> {
    let Some((outermost, inner)) = layers.split_last() else {
        return implementation(args);
    };
    let next = |args: &A| dispatch(implementation, inner, args);
    if !outermost.enabled.load(Ordering::SeqCst) {
        return next(args);
    }
    match &outermost.advice {
        Advice::Before(handler) => match handler(args)? {
            Flow::Continue => next(args),
            Flow::Return(value) => Ok(value),
        },
        Advice::After(handler) => {
            let result = next(args)?;
            handler(args, result)
        }
        Advice::Around(handler) => handler(args, &next),
    }
}

/// Returned by `attach`; detaches, disables or re-enables one advice layer.
pub struct AdviceHandle {
    subject: String,
    operation: String,
    kind: &'static str,
    id: u64,
    enabled: Arc<AtomicBool>,
    slot: Weak<dyn OperationSlot>,
}

impl AdviceHandle {
    /// The advised subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The advised operation.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// `"before"`, `"after"` or `"around"`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Returns `true` while the layer is attached.
    pub fn is_attached(&self) -> bool {
        self.slot
            .upgrade()
            .is_some_and(|slot| slot.has_layer(self.id))
    }

    /// Returns `true` unless the layer was disabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Makes the layer pass calls straight through, without detaching it.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Re-activates a disabled layer.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Removes the layer. Returns `false` if it was already gone.
    pub fn detach(self) -> bool {
        let removed = self
            .slot
            .upgrade()
            .is_some_and(|slot| slot.remove_layer(self.id));
        if removed {
            log::debug!(
                "Detached {} advice #{} from '{}#{}'",
                self.kind,
                self.id,
                self.subject,
                self.operation
            );
        }
        removed
    }
}

impl fmt::Debug for AdviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdviceHandle")
            .field("subject", &self.subject)
            .field("operation", &self.operation)
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    fn compiler() -> Subject {
        let subject = Subject::new("compiler");
        subject.define("compile", |source: &String| Ok(format!("compiled({source})")));
        subject
    }

    #[test]
    fn test_before_continues_or_short_circuits() {
        let subject = compiler();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let handle = subject
            .before("compile", move |source: &String| {
                recorder.lock().unwrap().push(source.clone());
                if source == "cached" {
                    Ok(Flow::Return("from-cache".to_string()))
                } else {
                    Ok(Flow::Continue)
                }
            })
            .unwrap();

        let out: String = subject.call("compile", &"Main".to_string()).unwrap();
        assert_eq!(out, "compiled(Main)");
        let out: String = subject.call("compile", &"cached".to_string()).unwrap();
        assert_eq!(out, "from-cache");
        assert_eq!(*seen.lock().unwrap(), vec!["Main", "cached"]);
        assert_eq!(handle.kind(), "before");
    }

    #[test]
    fn test_after_may_replace_result() {
        let subject = compiler();
        subject
            .after("compile", |_: &String, result: String| Ok(result.to_uppercase()))
            .unwrap();

        let out: String = subject.call("compile", &"a".to_string()).unwrap();
        assert_eq!(out, "COMPILED(A)");
    }

    #[test]
    fn test_around_may_skip_continuation() {
        let subject = compiler();
        subject
            .around::<String, String, _>("compile", |source, next| {
                if source.is_empty() {
                    Ok("nothing".to_string())
                } else {
                    next(&format!("{source}!"))
                }
            })
            .unwrap();

        let out: String = subject.call("compile", &String::new()).unwrap();
        assert_eq!(out, "nothing");
        let out: String = subject.call("compile", &"x".to_string()).unwrap();
        assert_eq!(out, "compiled(x!)");
    }

    #[test]
    fn test_layers_compose_latest_outermost() {
        let subject = compiler();
        subject
            .around::<String, String, _>("compile", |s, next| {
                Ok(format!("[1 {}]", next(s)?))
            })
            .unwrap();
        subject
            .around::<String, String, _>("compile", |s, next| {
                Ok(format!("[2 {}]", next(s)?))
            })
            .unwrap();

        let out: String = subject.call("compile", &"m".to_string()).unwrap();
        assert_eq!(out, "[2 [1 compiled(m)]]");
    }

    #[test]
    fn test_detach_restores_previous_dispatch_exactly() {
        let subject = compiler();
        let first = subject
            .after("compile", |_: &String, r: String| Ok(format!("{r}+1")))
            .unwrap();
        let with_first: String = subject.call("compile", &"m".to_string()).unwrap();

        let second = subject
            .after("compile", |_: &String, r: String| Ok(format!("{r}+2")))
            .unwrap();
        let with_both: String = subject.call("compile", &"m".to_string()).unwrap();
        assert_eq!(with_both, "compiled(m)+1+2");

        assert!(second.detach());
        let after_detach: String = subject.call("compile", &"m".to_string()).unwrap();
        assert_eq!(after_detach, with_first);

        assert!(first.detach());
        let original: String = subject.call("compile", &"m".to_string()).unwrap();
        assert_eq!(original, "compiled(m)");
        assert_eq!(subject.advice_count("compile"), 0);
    }

    #[test]
    fn test_detach_twice_is_noop() {
        let subject = compiler();
        let handle = subject
            .after("compile", |_: &String, r: String| Ok(r))
            .unwrap();
        assert!(handle.is_attached());
        let orphan = AdviceHandle {
            subject: handle.subject.clone(),
            operation: handle.operation.clone(),
            kind: handle.kind,
            id: handle.id,
            enabled: Arc::clone(&handle.enabled),
            slot: handle.slot.clone(),
        };
        assert!(handle.detach());
        assert!(!orphan.is_attached());
        assert!(!orphan.detach());
    }

    #[test]
    fn test_disabled_advice_passes_through() {
        let subject = compiler();
        let handle = subject
            .before("compile", |_: &String| Ok(Flow::Return("blocked".to_string())))
            .unwrap();

        handle.disable();
        let out: String = subject.call("compile", &"m".to_string()).unwrap();
        assert_eq!(out, "compiled(m)");

        handle.enable();
        let out: String = subject.call("compile", &"m".to_string()).unwrap();
        assert_eq!(out, "blocked");
    }

    #[test]
    fn test_attach_to_missing_operation_fails() {
        let subject = compiler();
        let err = subject
            .before("package", |_: &String| Ok(Flow::<String>::Continue))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::AdviceTargetMissing { ref operation, .. } if operation == "package"
        ));

        // Same name, different signature.
        let err = subject
            .before("compile", |_: &u32| Ok(Flow::<String>::Continue))
            .unwrap_err();
        assert!(matches!(err, EngineError::AdviceTargetMissing { .. }));
    }

    #[test]
    fn test_errors_propagate_unchanged() {
        let subject = Subject::new("tester");
        subject.define("run", |_: &()| -> anyhow::Result<u32> { Err(anyhow!("3 failures")) });
        subject
            .after("run", |_: &(), r: u32| Ok(r + 1))
            .unwrap();

        let err = subject.call::<(), u32>("run", &()).unwrap_err();
        assert_eq!(err.to_string(), "3 failures");

        let err = subject.call::<(), u32>("missing", &()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn test_redefine_keeps_advice() {
        let subject = compiler();
        subject
            .after("compile", |_: &String, r: String| Ok(format!("<{r}>")))
            .unwrap();
        subject.define("compile", |s: &String| Ok(format!("v2({s})")));

        let out: String = subject.call("compile", &"m".to_string()).unwrap();
        assert_eq!(out, "<v2(m)>");
    }
}
