// tests/scenarios.rs

use anvil::{
    ActionContext, Application, Context, EngineError, Flow, Project, Task,
    system::fs::MemoryFileSystem,
};
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type Log = Arc<Mutex<Vec<String>>>;

fn record(
    log: &Log,
    entry: &str,
) -> impl Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static {
    let log = Arc::clone(log);
    let entry = entry.to_string();
    move |_| {
        log.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

#[test]
fn build_runs_resources_then_compile_then_build() {
    init_logging();
    // --- Setup ---
    let fs = Arc::new(MemoryFileSystem::new());
    let ctx = Context::builder().filesystem(fs.clone()).build();
    let log: Log = Arc::default();

    ctx.define("resources", Vec::<String>::new())
        .add_action(record(&log, "resources"));
    ctx.define("compile", ["resources"])
        .add_action(record(&log, "compile"));
    ctx.define("build", ["compile"]).add_action(record(&log, "build"));

    // --- Execute ---
    ctx.invoke("build").unwrap();
    ctx.invoke("build").unwrap();

    // --- Assert ---
    assert_eq!(*log.lock().unwrap(), vec!["resources", "compile", "build"]);
}

#[test]
fn cycle_fails_before_any_action_runs() {
    init_logging();
    let ctx = Context::new();
    let log: Log = Arc::default();
    ctx.define("a", ["b"]).add_action(record(&log, "a"));
    ctx.define("b", ["a"]).add_action(record(&log, "b"));

    let err = ctx.invoke("a").unwrap_err();

    match err {
        EngineError::DependencyCycle { chain } => assert_eq!(chain, vec!["a", "b", "a"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn independent_tasks_on_two_threads_do_not_interleave() {
    init_logging();
    let ctx = Context::new();
    let log: Log = Arc::default();
    for name in ["x", "y"] {
        let task = ctx.define(name, Vec::<String>::new());
        for step in 1..=3 {
            task.add_action(record(&log, &format!("{name}{step}")));
        }
    }

    std::thread::scope(|scope| {
        for name in ["x", "y"] {
            let ctx = Arc::clone(&ctx);
            scope.spawn(move || ctx.invoke(name).unwrap());
        }
    });

    let entries = log.lock().unwrap().clone();
    assert_eq!(entries.len(), 6);
    for name in ["x", "y"] {
        let steps: Vec<&String> = entries.iter().filter(|e| e.starts_with(name)).collect();
        assert_eq!(steps, vec![&format!("{name}1"), &format!("{name}2"), &format!("{name}3")]);
    }
}

#[test]
fn rule_synthesizes_task_with_capture() {
    init_logging();
    let ctx = Context::new();
    let seen: Log = Arc::default();
    let sink = Arc::clone(&seen);
    ctx.rule(Regex::new(r"^test:(.+)$").unwrap(), move |m| {
        let sink = Arc::clone(&sink);
        Ok(Some(m.task().with_action(move |actx: &ActionContext<'_>| {
            sink.lock()
                .unwrap()
                .push(actx.capture(1).unwrap_or_default().to_string());
            Ok(())
        })))
    });

    let task = ctx.lookup("test:Something").unwrap();
    assert_eq!(task.name(), "test:Something");
    assert!(ctx.find_task("test:Something").is_some());

    ctx.invoke("test:Something").unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["Something"]);
}

#[test]
fn file_task_skips_when_output_is_fresh() {
    init_logging();
    // --- Setup ---
    let fs = Arc::new(MemoryFileSystem::new());
    fs.touch("src/App.java", UNIX_EPOCH + Duration::from_secs(100));
    fs.touch("target/App.class", UNIX_EPOCH + Duration::from_secs(200));
    let ctx = Context::builder().filesystem(fs.clone()).build();
    let log: Log = Arc::default();
    ctx.define_file("target/App.class", ["src/App.java"])
        .add_action(record(&log, "javac"));

    // --- Execute & Assert ---
    ctx.invoke("target/App.class").unwrap();
    assert!(log.lock().unwrap().is_empty());

    let stale = Context::builder().filesystem(fs.clone()).build();
    fs.touch("src/App.java", UNIX_EPOCH + Duration::from_secs(300));
    stale
        .define_file("target/App.class", ["src/App.java"])
        .add_action(record(&log, "javac"));
    stale.invoke("target/App.class").unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["javac"]);
}

#[test]
fn advice_round_trip_restores_behavior() {
    init_logging();
    let ctx = Context::new();
    let calls: Log = Arc::default();
    let sink = Arc::clone(&calls);
    let compiler = ctx.subject("compiler");
    compiler.define("compile", move |source: &String| {
        sink.lock().unwrap().push(source.clone());
        Ok(source.len())
    });

    let baseline: usize = compiler.call("compile", &"Main.java".to_string()).unwrap();
    let handle = compiler
        .before("compile", |source: &String| {
            Ok(if source.is_empty() { Flow::Return(0usize) } else { Flow::Continue })
        })
        .unwrap();
    let around = compiler
        .around::<String, usize, _>("compile", |source, next| Ok(next(source)? * 2))
        .unwrap();
    let advised: usize = compiler.call("compile", &"Main.java".to_string()).unwrap();
    assert_eq!(advised, baseline * 2);

    assert!(around.detach());
    assert!(handle.detach());
    let restored: usize = compiler.call("compile", &"Main.java".to_string()).unwrap();

    assert_eq!(restored, baseline);
    assert_eq!(*calls.lock().unwrap(), vec!["Main.java"; 3]);
}

#[test]
fn late_extension_reaches_existing_and_future_projects_once() {
    init_logging();
    let ctx = Context::new();
    let log: Log = Arc::default();

    let first = ctx.define_project("one", |_, _| Ok(())).unwrap();
    let second = ctx.define_project("two", |_, _| Ok(())).unwrap();

    let sink = Arc::clone(&log);
    ctx.after_define()
        .append("tag", move |project: &Arc<Project>| {
            sink.lock().unwrap().push(project.name().to_string());
            Ok(())
        })
        .unwrap();
    ctx.define_project("three", |_, _| Ok(())).unwrap();
    ctx.after_define().apply(&first).unwrap();
    ctx.after_define().apply(&second).unwrap();

    let mut names = log.lock().unwrap().clone();
    names.sort();
    assert_eq!(names, vec!["one", "three", "two"]);
}

#[test]
fn lazily_bound_task_loads_feature_once_across_threads() {
    init_logging();
    let ctx = Context::new();
    let loads = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&loads);
    ctx.lazy().provide("packaging", move |ctx: &Context| {
        *counter.lock().unwrap() += 1;
        std::thread::sleep(Duration::from_millis(20));
        ctx.define_task(Task::new("package").with_comment("Create the distribution"));
        Ok(())
    });
    ctx.lazy().bind_tasks("packaging", [Regex::new("^package$").unwrap()]);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let ctx = Arc::clone(&ctx);
            scope.spawn(move || ctx.invoke("package").unwrap());
        }
    });

    assert_eq!(*loads.lock().unwrap(), 1);
    assert!(ctx.lazy().is_loaded("packaging"));
    assert!(ctx.find_task("package").unwrap().is_invoked());
}

#[test]
fn failed_action_reports_task_and_chain() {
    init_logging();
    let ctx = Context::new();
    ctx.define("compile", Vec::<String>::new())
        .add_action(|_: &ActionContext<'_>| Err(anyhow::anyhow!("javac exited with 1")));
    ctx.define("build", ["compile"]);

    let err = ctx.invoke("build").unwrap_err();

    assert_eq!(err.task_chain().unwrap(), ["build", "compile"]);
    assert!(matches!(err, EngineError::TaskExecution { ref task, .. } if task == "compile"));
    let source = std::error::Error::source(&err).unwrap();
    assert_eq!(source.to_string(), "javac exited with 1");
    assert!(!ctx.find_task("build").unwrap().is_invoked());
}

#[test]
fn application_runs_requested_tasks() {
    init_logging();
    let ctx = Context::new();
    let log: Log = Arc::default();
    ctx.define("clean", Vec::<String>::new())
        .add_action(record(&log, "clean"));
    ctx.define("package", Vec::<String>::new())
        .add_action(record(&log, "package"));
    let app = Application::new(&ctx).unwrap();

    app.collect_tasks(&ctx, ["clean", "VERSION=1.2", "package"]);
    app.run(&ctx).unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["clean", "package"]);
    assert_eq!(ctx.env("VERSION").as_deref(), Some("1.2"));
}
