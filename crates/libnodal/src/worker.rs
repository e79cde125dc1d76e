//! Runs one script per OS thread and waits for it with an optional timeout.
//!
//! A timed-out thread is not cancelled: the caller gets `timeout` back and
//! the thread keeps running detached until the script returns on its own.
//! Forced termination would need a process per run.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use nodal_protocol::{RunStatus, paths};

use crate::error::EngineError;
use crate::output::OutputSink;
use crate::script::ScriptEngine;
use crate::value::{Context, OUTPUT_KEY, Value};

/// Serializes every execution that changes the process working directory.
static CWD_LOCK: Mutex<()> = Mutex::new(());

/// Holds the working-directory lock while a script runs in `dir`, restoring
/// the previous directory on drop, including when the script failed.
pub struct WorkingDirGuard {
    previous: PathBuf,
    _lock: MutexGuard<'static, ()>,
}

impl WorkingDirGuard {
    pub fn enter(dir: &Path) -> std::io::Result<Self> {
        let lock = CWD_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self {
            previous,
            _lock: lock,
        })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.previous) {
            warn!(
                dir = %self.previous.display(),
                error = %e,
                "failed to restore working directory"
            );
        }
    }
}

/// Everything a worker thread needs to run one script.
pub struct Job {
    pub node: String,
    pub script: String,
    pub globals: Context,
    pub context: Context,
    pub timeout: Option<Duration>,
    /// Working directory for the run, created if missing.
    pub cwd: Option<PathBuf>,
}

impl Job {
    pub fn new(node: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            script: script.into(),
            globals: Context::new(),
            context: Context::new(),
            timeout: None,
            cwd: None,
        }
    }
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub status: RunStatus,
    pub output: String,
    /// Empty unless `status` is not `Finished`.
    pub error: String,
    /// Post-run bindings; `None` when the run timed out.
    pub context: Option<Context>,
}

#[derive(Clone)]
pub struct ExecutionWorker {
    engine: Arc<dyn ScriptEngine>,
}

impl ExecutionWorker {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self { engine }
    }

    pub async fn execute(&self, job: Job, sink: OutputSink) -> ExecutionReport {
        let (done_tx, done_rx) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let thread_sink = sink.clone();
        let timeout = job.timeout;
        let node = job.node.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("nodal-run-{}", paths::sanitize_id(&node)))
            .spawn(move || {
                let report = run_job(engine.as_ref(), job, &thread_sink);
                // The receiver is gone when the run already timed out.
                let _ = done_tx.send(report);
            });
        if let Err(e) = spawned {
            return failed(&sink, format!("failed to start worker thread: {e}"));
        }

        let finished = match timeout {
            Some(limit) => match tokio::time::timeout(limit, done_rx).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        node = %node,
                        timeout_ms = limit.as_millis() as u64,
                        "run timed out; worker thread left running"
                    );
                    return ExecutionReport {
                        status: RunStatus::Timeout,
                        output: sink.transcript(),
                        error: EngineError::ScriptTimeout(limit.as_secs_f64()).to_string(),
                        context: None,
                    };
                }
            },
            None => done_rx.await,
        };

        finished.unwrap_or_else(|_| failed(&sink, "worker thread exited without a result".into()))
    }
}

fn failed(sink: &OutputSink, error: String) -> ExecutionReport {
    ExecutionReport {
        status: RunStatus::Error,
        output: sink.transcript(),
        error,
        context: None,
    }
}

fn run_job(engine: &dyn ScriptEngine, job: Job, sink: &OutputSink) -> ExecutionReport {
    let Job {
        node,
        script,
        globals,
        mut context,
        cwd,
        ..
    } = job;

    let _cwd = match cwd.as_deref().map(enter_dir).transpose() {
        Ok(guard) => guard,
        Err(e) => {
            warn!(node = %node, error = %e, "cannot enter working directory");
            return failed(sink, EngineError::Io(e).to_string());
        }
    };

    debug!(node = %node, "script started");
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.run(&script, &globals, &mut context, sink)
    }));
    sink.finish();

    let output = sink.transcript();
    context.insert(OUTPUT_KEY.to_string(), Value::Str(output.clone()));

    let (status, error) = match result {
        Ok(Ok(())) => (RunStatus::Finished, String::new()),
        Ok(Err(message)) => (RunStatus::Error, EngineError::Script(message).to_string()),
        Err(payload) => (RunStatus::Error, panic_message(payload.as_ref())),
    };
    debug!(node = %node, status = %status, "script stopped");

    ExecutionReport {
        status,
        output,
        error,
        context: Some(context),
    }
}

fn enter_dir(dir: &Path) -> std::io::Result<WorkingDirGuard> {
    std::fs::create_dir_all(dir)?;
    WorkingDirGuard::enter(dir)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("script engine panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("script engine panicked: {s}")
    } else {
        "script engine panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Understands a tiny command language: `set NAME INT`, `print TEXT`,
    /// `sleep MS`, `fail TEXT`, `panic`, `write FILE`.
    struct FakeEngine;

    impl ScriptEngine for FakeEngine {
        fn run(
            &self,
            source: &str,
            globals: &Context,
            context: &mut Context,
            sink: &OutputSink,
        ) -> Result<(), String> {
            for line in source.lines() {
                let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
                match cmd {
                    "set" => {
                        let (name, value) = arg.split_once(' ').ok_or("bad set")?;
                        let value = value.parse().map_err(|_| "bad int")?;
                        context.insert(name.to_string(), Value::Int(value));
                    }
                    "global" => {
                        let value = globals.get(arg).cloned().unwrap_or(Value::Nil);
                        context.insert(arg.to_string(), value);
                    }
                    "print" => sink.write(&format!("{arg}\n")),
                    "sleep" => std::thread::sleep(Duration::from_millis(
                        arg.parse().map_err(|_| "bad ms")?,
                    )),
                    "fail" => return Err(arg.to_string()),
                    "panic" => panic!("engine bug"),
                    "write" => std::fs::write(arg, b"x").map_err(|e| e.to_string())?,
                    other => return Err(format!("unknown command {other}")),
                }
            }
            Ok(())
        }
    }

    fn worker() -> ExecutionWorker {
        ExecutionWorker::new(Arc::new(FakeEngine))
    }

    fn job(script: &str) -> Job {
        Job::new("n1", script)
    }

    #[tokio::test]
    async fn finished_run_returns_bindings_and_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut j = job("set a 1\nprint hello\nglobal G");
        j.context.insert("kept".into(), Value::Bool(true));
        j.globals.insert("G".into(), Value::Int(7));

        let report = worker().execute(j, OutputSink::new("n1", tx)).await;
        assert_eq!(report.status, RunStatus::Finished);
        assert_eq!(report.error, "");
        assert_eq!(report.output, "hello\n");

        let ctx = report.context.expect("context");
        assert_eq!(ctx.get("a"), Some(&Value::Int(1)));
        assert_eq!(ctx.get("kept"), Some(&Value::Bool(true)));
        assert_eq!(ctx.get("G"), Some(&Value::Int(7)));
        assert_eq!(ctx.get(OUTPUT_KEY), Some(&Value::Str("hello\n".into())));

        assert_eq!(rx.recv().await.map(|l| l.text), Some("hello\n".to_string()));
    }

    #[tokio::test]
    async fn script_error_keeps_partial_context() {
        let report = worker()
            .execute(job("set a 1\nfail boom\nset b 2"), OutputSink::detached("n1"))
            .await;
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.error, "boom");
        let ctx = report.context.expect("context");
        assert_eq!(ctx.get("a"), Some(&Value::Int(1)));
        assert_eq!(ctx.get("b"), None);
    }

    #[tokio::test]
    async fn engine_panic_is_contained() {
        let report = worker()
            .execute(job("set a 1\npanic"), OutputSink::detached("n1"))
            .await;
        assert_eq!(report.status, RunStatus::Error);
        assert!(report.error.contains("engine bug"), "{}", report.error);
        assert!(report.context.is_some());
    }

    #[tokio::test]
    async fn timeout_returns_without_waiting_for_the_thread() {
        let mut j = job("print before\nsleep 600\nset late 1");
        j.timeout = Some(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let report = worker().execute(j, OutputSink::detached("n1")).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(report.status, RunStatus::Timeout);
        assert_eq!(report.error, "Execution timed out (0.05s)");
        assert_eq!(report.output, "before\n");
        assert!(report.context.is_none());
    }

    #[tokio::test]
    async fn fast_run_beats_its_timeout() {
        let mut j = job("set a 1");
        j.timeout = Some(Duration::from_secs(5));
        let report = worker().execute(j, OutputSink::detached("n1")).await;
        assert_eq!(report.status, RunStatus::Finished);
    }

    #[tokio::test]
    async fn cwd_applies_during_the_run_and_is_restored() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut j = job("write relative.txt");
        j.cwd = Some(dir.path().to_path_buf());
        let report = worker().execute(j, OutputSink::detached("n1")).await;

        assert_eq!(report.status, RunStatus::Finished, "{}", report.error);
        assert!(dir.path().join("relative.txt").exists());
        assert_ne!(std::env::current_dir().expect("cwd"), dir.path());
    }

    #[tokio::test]
    async fn missing_cwd_is_created_on_the_worker_thread() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("alice");

        let mut j = job("write made.txt");
        j.cwd = Some(dir.clone());
        let report = worker().execute(j, OutputSink::detached("n1")).await;

        assert_eq!(report.status, RunStatus::Finished, "{}", report.error);
        assert!(dir.join("made.txt").exists());
    }

    #[tokio::test]
    async fn unusable_cwd_is_an_error_not_a_crash() {
        let root = tempfile::tempdir().expect("tempdir");
        let file = root.path().join("plain-file");
        std::fs::write(&file, b"x").expect("write");

        let mut j = job("set a 1");
        j.cwd = Some(file.join("nested"));
        let report = worker().execute(j, OutputSink::detached("n1")).await;
        assert_eq!(report.status, RunStatus::Error);
        assert!(report.error.starts_with("io error"), "{}", report.error);
    }
}
