use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use nodal_protocol::{RunNodeRequest, RunStatus, paths};

use crate::context::ContextStore;
use crate::error::EngineError;
use crate::output::OutputSink;
use crate::rate_limit::{CheckResult, RateLimiter};
use crate::value::{Context, Value};
use crate::worker::{ExecutionWorker, Job};

/// Name of the global holding the user's storage directory.
pub const STORAGE_DIR_GLOBAL: &str = "STORAGE_DIR";
/// Name of the global holding the request's `inputs` payload.
pub const INPUTS_GLOBAL: &str = "inputs";

/// The terminal result of one run, as reported to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output: String,
    pub error: String,
}

/// One identified client. Owns the node contexts, the single-run guard and
/// the per-node flood limiter. Lives for the rest of the process once created.
pub struct User {
    id: String,
    contexts: ContextStore,
    running: AtomicBool,
    limiter: Mutex<RateLimiter>,
    storage_dir: Option<PathBuf>,
}

impl User {
    pub fn new(id: impl Into<String>, storage_root: &Path, flood_threshold: Duration) -> Self {
        let id = id.into();
        let storage_dir = paths::user_storage_dir(storage_root, &id);
        Self {
            id,
            contexts: ContextStore::new(),
            running: AtomicBool::new(false),
            limiter: Mutex::new(RateLimiter::new(flood_threshold)),
            storage_dir,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn get_variable(&self, node_id: &str, name: &str) -> Option<Value> {
        self.contexts.get_variable(node_id, name)
    }

    /// Admits a run of `node_id`.
    ///
    /// A held guard is reported before the flood check, and neither rejection
    /// touches the guard or the flood timestamp.
    pub fn try_begin_run(self: &Arc<Self>, node_id: &str) -> Result<RunGuard, EngineError> {
        let mut limiter = self.limiter.lock().unwrap_or_else(PoisonError::into_inner);
        if self.running.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyRunning);
        }
        if let CheckResult::RateLimited { retry_after } = limiter.check(node_id) {
            warn!(
                user = %self.id,
                node = %node_id,
                retry_after_us = retry_after.as_micros() as u64,
                "run rejected by flood gate"
            );
            return Err(EngineError::RateLimited);
        }
        self.running.store(true, Ordering::Release);
        Ok(RunGuard {
            user: Arc::clone(self),
        })
    }

    /// Admits and runs `request` in one step, releasing the guard afterwards.
    pub async fn run(
        self: &Arc<Self>,
        request: &RunNodeRequest,
        worker: &ExecutionWorker,
        sink: OutputSink,
    ) -> Result<RunOutcome, EngineError> {
        let _guard = self.try_begin_run(&request.node)?;
        Ok(self.run_node(request, worker, sink).await)
    }

    /// Executes an admitted run. The caller holds the [`RunGuard`].
    ///
    /// The resolved context is saved before the script starts so dependents
    /// observe something even if the run never completes; it is replaced by
    /// the post-run bindings unless the run timed out.
    pub async fn run_node(
        &self,
        request: &RunNodeRequest,
        worker: &ExecutionWorker,
        sink: OutputSink,
    ) -> RunOutcome {
        let node = request.node.as_str();

        let context = self.contexts.resolve_context(&request.variables);
        self.contexts.save_context(node, context.clone());

        let mut job = Job::new(node, request.code.as_str());
        job.context = context;
        job.globals = self.globals(request);
        job.timeout = request.timeout_duration();
        job.cwd = self.storage_dir.clone();

        let report = worker.execute(job, sink).await;
        if let Some(context) = report.context {
            self.contexts.save_context(node, context);
        }

        info!(
            user = %self.id,
            node = %node,
            status = %report.status,
            output_bytes = report.output.len(),
            "run completed"
        );

        RunOutcome {
            status: report.status,
            output: report.output,
            error: report.error,
        }
    }

    fn globals(&self, request: &RunNodeRequest) -> Context {
        let mut globals = Context::new();
        if let Some(dir) = &self.storage_dir {
            globals.insert(
                STORAGE_DIR_GLOBAL.to_string(),
                Value::Str(dir.display().to_string()),
            );
        }
        if let Some(inputs) = &request.inputs {
            globals.insert(INPUTS_GLOBAL.to_string(), Value::from_json(inputs));
        }
        globals
    }
}

/// Marks the owning user as executing; dropping it clears the mark.
pub struct RunGuard {
    user: Arc<User>,
}

impl RunGuard {
    pub fn user(&self) -> &Arc<User> {
        &self.user
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.user.running.store(false, Ordering::Release);
    }
}
