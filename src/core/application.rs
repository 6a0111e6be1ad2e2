//! # Application
//!
//! The front-end side of a build: turns command arguments into top-level tasks and
//! build variables, runs the initialization task, then the top-level tasks, then the
//! completion or failure hooks. Argument parsing beyond `NAME=value` and task names
//! belongs to whatever front end embeds the engine.

use crate::{
    constants::INITIALIZE_TASK,
    core::{
        chain::InvocationChain,
        commons::{read, write},
        context::Context,
        error::{EngineError, EngineResult},
        extension::Extensible,
        scheduler,
    },
    dev_utils,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

lazy_static! {
    static ref ASSIGNMENT_REGEX: Regex = Regex::new(r"^(\w+)=(.*)$").unwrap();
}

/// Runs after every top-level task succeeded. Receives the tasks that ran.
pub type CompletionHook = Arc<dyn Fn(&Context, &[String]) -> anyhow::Result<()> + Send + Sync>;

/// Runs after a top-level task failed. Receives the error `run` returns.
pub type FailureHook = Arc<dyn Fn(&Context, &EngineError) + Send + Sync>;

/// One build run over a `Context`.
pub struct Application {
    id: Uuid,
    top_level: RwLock<Vec<String>>,
    on_completion: RwLock<Vec<CompletionHook>>,
    on_failure: RwLock<Vec<FailureHook>>,
}

impl Application {
    /// Creates an application, defines the initialization task if needed and applies
    /// the context's `application_init` hooks.
    pub fn new(ctx: &Context) -> EngineResult<Arc<Self>> {
        let application = Arc::new(Self {
            id: Uuid::new_v4(),
            top_level: RwLock::new(Vec::new()),
            on_completion: RwLock::new(Vec::new()),
            on_failure: RwLock::new(Vec::new()),
        });
        ctx.define(&format!(":{}", INITIALIZE_TASK), Vec::<String>::new())
            .set_comment("Initialize the build");
        ctx.application_init().apply(&application)?;
        log::debug!("Application {} ready on context {}", application.id, ctx.id());
        Ok(application)
    }

    /// Identifies this application in logs and extension chains.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Splits `args` into build variables and top-level task names.
    ///
    /// `NAME=value` arguments become build variables on `ctx` with the name upper-cased.
    /// Arguments starting with `-` are left to the front end. With no task names
    /// left, the configured default task is used.
    pub fn collect_tasks<I, S>(&self, ctx: &Context, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tasks = Vec::new();
        for arg in args {
            let arg = arg.as_ref();
            if let Some((name, value)) = parse_assignment(arg) {
                log::debug!("Build variable {}={}", name, value);
                ctx.set_env(name, value);
            } else if arg.starts_with('-') {
                log::debug!("Ignoring option '{}'", arg);
            } else if !arg.is_empty() {
                tasks.push(arg.to_string());
            }
        }
        if tasks.is_empty() {
            tasks.push(ctx.config().default_task);
        }
        *write(&self.top_level) = tasks.clone();
        tasks
    }

    /// The tasks the next `run` invokes.
    pub fn top_level_tasks(&self) -> Vec<String> {
        read(&self.top_level).clone()
    }

    /// Runs `hook` with the top-level task names after every one of them succeeded.
    pub fn on_completion<F>(&self, hook: F)
    where
        F: Fn(&Context, &[String]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.on_completion).push(Arc::new(hook));
    }

    /// Runs `hook` with the error when `run` fails.
    pub fn on_failure<F>(&self, hook: F)
    where
        F: Fn(&Context, &EngineError) + Send + Sync + 'static,
    {
        write(&self.on_failure).push(Arc::new(hook));
    }

    /// Invokes the initialization task, then every top-level task (concurrently when
    /// the configuration asks for it), then the completion or failure hooks.
    ///
    /// A failing completion hook is logged and does not fail the run.
    pub fn run(&self, ctx: &Context) -> EngineResult<()> {
        let _timer = dev_utils::BlockTimer::new("Application::run");
        let tasks = {
            let collected = self.top_level_tasks();
            if collected.is_empty() {
                vec![ctx.config().default_task]
            } else {
                collected
            }
        };

        let result = self.run_tasks(ctx, &tasks);
        match &result {
            Ok(()) => {
                let hooks = read(&self.on_completion).clone();
                for hook in hooks {
                    if let Err(e) = hook(ctx, &tasks) {
                        log::warn!("Completion hook failed: {:#}", e);
                    }
                }
            }
            Err(error) => {
                log::debug!("Build failed: {}", error);
                let hooks = read(&self.on_failure).clone();
                for hook in hooks {
                    hook(ctx, error);
                }
            }
        }
        result
    }

    fn run_tasks(&self, ctx: &Context, tasks: &[String]) -> EngineResult<()> {
        let top: &[String] = &[];
        let initialize = ctx.lookup_in(INITIALIZE_TASK, top)?;
        scheduler::invoke(ctx, &initialize, &InvocationChain::empty())?;

        if ctx.config().parallel && tasks.len() > 1 {
            return ctx.invoke_all(tasks);
        }
        for name in tasks {
            let task = ctx.lookup_in(name, top)?;
            scheduler::invoke(ctx, &task, &InvocationChain::empty())?;
        }
        Ok(())
    }
}

/// Splits `NAME=value` into the upper-cased name and the value.
fn parse_assignment(arg: &str) -> Option<(String, String)> {
    let caps = ASSIGNMENT_REGEX.captures(arg)?;
    let name = caps.get(1)?.as_str().to_uppercase();
    let value = caps.get(2)?.as_str().to_string();
    Some((name, value))
}

impl Extensible for Application {
    fn extension_key(&self) -> String {
        format!("application:{}", self.id)
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("id", &self.id)
            .field("top_level", &self.top_level_tasks())
            .finish()
    }
}
