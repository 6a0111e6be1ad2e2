//! # Scheduler
//!
//! Drives `invoke`: resolves prerequisites depth-first, runs the task's actions under
//! its own lock, and guarantees that a task runs at most once per build.
//!
//! `invoke` is synchronous. It returns when the whole prerequisite subtree and the
//! task's own actions have completed or failed. Concurrency only comes from several
//! threads invoking independently (see [`invoke_all`]) or from tasks declared with
//! parallel prerequisites.

use crate::{
    core::{
        chain::InvocationChain,
        context::Context,
        error::{EngineError, EngineResult},
        task::Task,
    },
    dev_utils,
};
use rayon::prelude::*;
use std::sync::Arc;
use std::thread;

/// What an action sees while it runs.
#[derive(Debug)]
pub struct ActionContext<'a> {
    ctx: &'a Context,
    task: &'a Task,
    chain: &'a InvocationChain,
}

impl<'a> ActionContext<'a> {
    /// The context the task belongs to.
    pub fn context(&self) -> &'a Context {
        self.ctx
    }

    /// The task being executed.
    pub fn task(&self) -> &'a Task {
        self.task
    }

    /// Shorthand for `task().name()`.
    pub fn name(&self) -> &'a str {
        self.task.name()
    }

    /// One capture group of the rule that synthesized the task; `1` is the first group.
    pub fn capture(&self, group: usize) -> Option<&'a str> {
        self.task.capture(group)
    }

    /// The invocation chain, ending with the task being executed.
    pub fn chain(&self) -> &'a InvocationChain {
        self.chain
    }

    /// Invokes another task from inside this action. The name resolves in the task's
    /// scope and the current chain is carried along, so cycles through actions are
    /// detected too.
    pub fn invoke(&self, name: &str) -> EngineResult<()> {
        let task = self.ctx.lookup_in(name, self.task.scope())?;
        invoke(self.ctx, &task, self.chain)
    }
}

/// Invokes `task` on the call path described by `chain`.
///
/// 1. Refuse tasks already on the chain (dependency cycle).
/// 2. Take the task's lock; return if it already ran.
/// 3. Invoke every prerequisite, in declaration order, with the extended chain.
/// 4. Run the actions, in registration order, if the task is needed.
/// 5. Mark the task invoked.
///
/// A failing prerequisite or action aborts the rest of this task and propagates. The
/// task stays un-invoked, and side effects already performed are not rolled back.
///
/// The chain check happens before the lock so that a task re-entering itself on the
/// same thread reports a cycle instead of waiting on its own lock.
pub fn invoke(ctx: &Context, task: &Arc<Task>, chain: &InvocationChain) -> EngineResult<()> {
    let new_chain = chain.append(task.name())?;
    let _guard = task.lock_invocation();

    if ctx.is_tracing() {
        log::trace!("** Invoke {}", task.name());
    }
    if task.is_invoked() {
        log::trace!("'{}' already invoked, skipping", task.name());
        return Ok(());
    }

    invoke_prerequisites(ctx, task, &new_chain)?;

    if task.is_needed(ctx)? {
        execute(ctx, task, &new_chain)?;
    } else {
        log::trace!("'{}' is up to date, not executing", task.name());
    }

    task.mark_invoked();
    Ok(())
}

fn invoke_prerequisites(
    ctx: &Context,
    task: &Arc<Task>,
    chain: &InvocationChain,
) -> EngineResult<()> {
    let names = task.prerequisites();
    if task.is_parallel() && names.len() > 1 {
        return invoke_prerequisites_concurrently(ctx, task, &names, chain);
    }
    for name in names {
        let prerequisite = ctx.lookup_in(&name, task.scope())?;
        invoke(ctx, &prerequisite, chain)?;
    }
    Ok(())
}

// Scoped threads rather than the rayon pool: the caller holds `task`'s lock while it
// waits, and a pool worker stealing unrelated work here could block on that same lock.
fn invoke_prerequisites_concurrently(
    ctx: &Context,
    task: &Arc<Task>,
    names: &[String],
    chain: &InvocationChain,
) -> EngineResult<()> {
    let prerequisites = names
        .iter()
        .map(|name| ctx.lookup_in(name, task.scope()))
        .collect::<EngineResult<Vec<_>>>()?;

    log::trace!(
        "Invoking {} prerequisites of '{}' concurrently.",
        prerequisites.len(),
        task.name()
    );

    let results: Vec<EngineResult<()>> = thread::scope(|scope| {
        let handles: Vec<_> = prerequisites
            .iter()
            .map(|prerequisite| scope.spawn(move || invoke(ctx, prerequisite, chain)))
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });

    first_failure(results)
}

fn execute(ctx: &Context, task: &Task, chain: &InvocationChain) -> EngineResult<()> {
    let _timer = dev_utils::BlockTimer::new(format!("execute {}", task.name()));
    if ctx.is_tracing() {
        log::trace!("** Execute {}", task.name());
    }

    let action_ctx = ActionContext { ctx, task, chain };
    for action in task.actions() {
        action(&action_ctx).map_err(|source| wrap_action_error(task, chain, source))?;
    }
    Ok(())
}

// Errors raised by a nested `invoke` inside an action are already attributed to the
// task that failed; only foreign errors get wrapped with this task's name and chain.
fn wrap_action_error(task: &Task, chain: &InvocationChain, source: anyhow::Error) -> EngineError {
    match source.downcast::<EngineError>() {
        Ok(
            engine_error @ (EngineError::TaskExecution { .. }
            | EngineError::DependencyCycle { .. }),
        ) => engine_error,
        Ok(other) => EngineError::TaskExecution {
            task: task.name().to_string(),
            chain: chain.names(),
            source: other.into(),
        },
        Err(source) => EngineError::TaskExecution {
            task: task.name().to_string(),
            chain: chain.names(),
            source,
        },
    }
}

/// Invokes each named task from its own top-level chain on the rayon pool.
///
/// Independent subgraphs run concurrently; a task shared between them still runs
/// once, the other callers waiting on its lock. All invocations run to completion;
/// the first failure in `names` order is returned.
pub fn invoke_all(ctx: &Context, names: &[String]) -> EngineResult<()> {
    let tasks = names
        .iter()
        .map(|name| ctx.lookup(name))
        .collect::<EngineResult<Vec<_>>>()?;

    let results: Vec<EngineResult<()>> = tasks
        .par_iter()
        .map(|task| invoke(ctx, task, &InvocationChain::empty()))
        .collect();

    first_failure(results)
}

fn first_failure(results: Vec<EngineResult<()>>) -> EngineResult<()> {
    let mut errors = results.into_iter().filter_map(Result::err);
    let Some(first) = errors.next() else {
        return Ok(());
    };
    for other in errors {
        log::error!("Concurrent invocation also failed: {}", other);
    }
    Err(first)
}
