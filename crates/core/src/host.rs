//! Script host: job lifecycle orchestration.
//!
//! Coordinates a submission end to end:
//! 1. Reject it if a job or debug session is already active (no queueing).
//! 2. Neutralize a shebang line and validate the syntax.
//! 3. Open the job's output sink and start the capture watcher.
//! 4. Dispatch the worker thread.
//! 5. When the worker reports, drain the last output, return the host to
//!    idle, and deliver the terminal result.
//!
//! Only one worker/capture pair exists at a time; the host state is a tagged
//! enum so an active job can only exist inside the `Running` or `Debugging`
//! mode that owns it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rhai::AST;
use serde::Serialize;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilitySet;
use crate::config::{CaptureMode, HostConfig};
use crate::debug::{DebugHandle, DebugOptions, Stepper};
use crate::error::{HostError, ScriptFailure};
use crate::events::{EventBus, JobEvent, JobEventSender, JobEvents};
use crate::job::{JobId, JobKind, JobOutcome, JobStatus, ScriptJob};
use crate::output::{OutputCapture, OutputSink};
use crate::shebang;
use crate::validator::SyntaxValidator;
use crate::worker::ExecutionWorker;

/// Externally visible host mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "job_id", rename_all = "snake_case")]
pub enum HostMode {
    Idle,
    Running(JobId),
    Debugging(JobId),
}

struct ActiveJob {
    job: ScriptJob,
    abort: CancellationToken,
}

enum HostState {
    Idle,
    Running(ActiveJob),
    Debugging(ActiveJob),
}

impl HostState {
    fn active(&self) -> Option<&ActiveJob> {
        match self {
            Self::Idle => None,
            Self::Running(active) | Self::Debugging(active) => Some(active),
        }
    }

    fn mode(&self) -> HostMode {
        match self {
            Self::Idle => HostMode::Idle,
            Self::Running(active) => HostMode::Running(active.job.id()),
            Self::Debugging(active) => HostMode::Debugging(active.job.id()),
        }
    }

    /// Take the active job if it is `job_id`, leaving the host idle.
    fn release(&mut self, job_id: JobId) -> Option<ActiveJob> {
        if self.active().map(|a| a.job.id()) != Some(job_id) {
            return None;
        }
        match std::mem::replace(self, Self::Idle) {
            Self::Idle => None,
            Self::Running(active) | Self::Debugging(active) => Some(active),
        }
    }
}

struct Inner {
    state: HostState,
    /// Event streams handed out at most once through `subscribe`.
    unclaimed: HashMap<JobId, JobEvents>,
    /// Status of the most recently finished job.
    last_finished: Option<(JobId, JobStatus)>,
    /// Set by `shutdown`; no new jobs are accepted afterwards.
    closed: bool,
}

impl Inner {
    /// Rejection for starting a `kind` job now, if any. A run blocked by
    /// another run is `AlreadyRunning`; every other conflict is `Busy`.
    fn admission_error(&self, kind: JobKind) -> Option<HostError> {
        if self.closed {
            return Some(HostError::ShutDown);
        }
        match (&self.state, kind) {
            (HostState::Idle, _) => None,
            (HostState::Running(_), JobKind::Run) => Some(HostError::AlreadyRunning),
            _ => Some(HostError::Busy),
        }
    }
}

struct Shared {
    config: HostConfig,
    capabilities: Arc<CapabilitySet>,
    validator: SyntaxValidator,
    inner: Mutex<Inner>,
    bus: EventBus,
    capture_dir: Mutex<Option<TempDir>>,
    runtime: Handle,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the terminal outcome and return the host to idle. Returns the
    /// job's wall-clock duration in milliseconds.
    fn complete(&self, job_id: JobId, outcome: &JobOutcome) -> Option<i64> {
        let mut inner = self.lock();
        match inner.state.release(job_id) {
            Some(mut active) => {
                active.job.finish(outcome.clone());
                inner.last_finished = Some((job_id, active.job.status()));
                Some((Utc::now() - active.job.submitted_at()).num_milliseconds())
            }
            None => {
                tracing::warn!(%job_id, "Finished job was not the active job");
                None
            }
        }
    }
}

/// Accepts scripts, runs at most one at a time, and streams their output.
///
/// All methods take `&self` and may be called from any thread; the host
/// serializes access to its state internally.
pub struct ScriptHost {
    shared: Arc<Shared>,
}

impl ScriptHost {
    /// Create a host on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(config: HostConfig, capabilities: Arc<CapabilitySet>) -> Self {
        Self::with_runtime(Handle::current(), config, capabilities)
    }

    /// Create a host whose watcher and supervisor tasks run on `runtime`.
    pub fn with_runtime(
        runtime: Handle,
        config: HostConfig,
        capabilities: Arc<CapabilitySet>,
    ) -> Self {
        let capture_dir = match config.capture_mode {
            CaptureMode::Memory => None,
            CaptureMode::TempFile => match capture_dir_in(config.capture_dir.as_deref()) {
                Ok(dir) => Some(dir),
                Err(e) => {
                    tracing::warn!(error = %e, "Output capture unavailable: cannot create capture directory");
                    None
                }
            },
        };

        tracing::info!(
            capabilities = capabilities.len(),
            capture_mode = ?config.capture_mode,
            "Script host ready",
        );

        Self {
            shared: Arc::new(Shared {
                config,
                capabilities,
                validator: SyntaxValidator::new(),
                inner: Mutex::new(Inner {
                    state: HostState::Idle,
                    unclaimed: HashMap::new(),
                    last_finished: None,
                    closed: false,
                }),
                bus: EventBus::default(),
                capture_dir: Mutex::new(capture_dir),
                runtime,
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    pub fn capabilities(&self) -> &Arc<CapabilitySet> {
        &self.shared.capabilities
    }

    pub fn state(&self) -> HostMode {
        self.shared.lock().state.mode()
    }

    /// Status of the active job or of the most recently finished one.
    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        let inner = self.shared.lock();
        if let Some(active) = inner.state.active() {
            if active.job.id() == job_id {
                return Some(active.job.status());
            }
        }
        match inner.last_finished {
            Some((id, status)) if id == job_id => Some(status),
            _ => None,
        }
    }

    /// Validate and start `source`.
    ///
    /// Returns as soon as the worker has been dispatched. Syntax errors and
    /// busy rejections are reported here; everything that happens during
    /// evaluation arrives on the job's event stream.
    pub fn submit(&self, source: &str) -> Result<JobId, HostError> {
        self.ensure_idle(JobKind::Run)?;
        let (source, ast) = self.prepare(source)?;
        let job = ScriptJob::new(JobKind::Run, source);
        self.launch(job, ast, CancellationToken::new(), None)
    }

    /// Start `source` under the stepping debugger.
    pub fn attach_debugger(
        &self,
        source: &str,
        options: DebugOptions,
    ) -> Result<DebugHandle, HostError> {
        self.ensure_idle(JobKind::Debug)?;
        let (source, ast) = self.prepare(source)?;
        let job = ScriptJob::new(JobKind::Debug, source);
        let abort = CancellationToken::new();
        let (stepper, handle) = Stepper::new(
            job.id(),
            &options,
            abort.clone(),
            self.shared.config.debug_halt_poll_interval,
        );
        self.launch(job, ast, abort, Some(Arc::new(stepper)))?;
        Ok(handle)
    }

    /// End the active debug session. Its job finishes as aborted.
    ///
    /// Returns `false` if no debug session was active.
    pub fn detach_debugger(&self) -> bool {
        let inner = self.shared.lock();
        match &inner.state {
            HostState::Debugging(active) => {
                tracing::info!(job_id = %active.job.id(), "Detaching debugger");
                active.abort.cancel();
                true
            }
            _ => false,
        }
    }

    /// Request cooperative cancellation of the active job.
    ///
    /// Fire-and-forget and idempotent. Returns `false` when nothing was
    /// running; requests are never buffered for a later job.
    pub fn abort(&self) -> bool {
        let inner = self.shared.lock();
        match inner.state.active() {
            Some(active) => {
                if !active.abort.is_cancelled() {
                    tracing::info!(job_id = %active.job.id(), "Abort requested");
                }
                active.abort.cancel();
                true
            }
            None => false,
        }
    }

    /// Take the ordered event stream for `job_id`.
    ///
    /// Each job's stream can be claimed once. Streams that were never claimed
    /// are discarded when the next job starts.
    pub fn subscribe(&self, job_id: JobId) -> Result<JobEvents, HostError> {
        self.shared
            .lock()
            .unclaimed
            .remove(&job_id)
            .ok_or(HostError::UnknownJob(job_id))
    }

    /// Observe every job's events. Lossy for slow receivers.
    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.bus.subscribe()
    }

    /// Abort any active job, stop accepting new ones, and remove the capture
    /// directory. Later `submit`/`attach_debugger` calls fail with
    /// [`HostError::ShutDown`].
    pub fn shutdown(&self) {
        self.shared.lock().closed = true;
        self.abort();
        let dir = self
            .shared
            .capture_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove capture directory");
            }
        }
    }

    fn ensure_idle(&self, kind: JobKind) -> Result<(), HostError> {
        self.shared.lock().admission_error(kind).map_or(Ok(()), Err)
    }

    fn prepare(&self, source: &str) -> Result<(Arc<str>, AST), HostError> {
        let source: Arc<str> = shebang::normalize(source).into();
        match self.shared.validator.validate(&source) {
            Ok(ast) => Ok((source, ast)),
            Err(e) => {
                tracing::debug!(line = e.line, message = %e.message, "Script rejected");
                Err(e.into())
            }
        }
    }

    fn launch(
        &self,
        mut job: ScriptJob,
        ast: AST,
        abort: CancellationToken,
        stepper: Option<Arc<Stepper>>,
    ) -> Result<JobId, HostError> {
        let shared = &self.shared;
        let job_id = job.id();
        let kind = job.kind();

        let sink = {
            let dir = shared
                .capture_dir
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            OutputSink::open(
                shared.config.capture_mode,
                dir.as_ref().map(TempDir::path),
                job_id,
            )
        };
        let (events, stream) = JobEventSender::channel(job_id, &shared.bus);
        let events = Arc::new(events);

        {
            let mut inner = shared.lock();
            if let Some(err) = inner.admission_error(kind) {
                return Err(err);
            }
            inner.unclaimed.clear();
            inner.unclaimed.insert(job_id, stream);
            job.mark_running();
            let active = ActiveJob {
                job,
                abort: abort.clone(),
            };
            inner.state = match kind {
                JobKind::Run => HostState::Running(active),
                JobKind::Debug => HostState::Debugging(active),
            };
        }

        // Capture is running before the worker evaluates anything.
        let capture = OutputCapture::start(
            &shared.runtime,
            sink.clone(),
            shared.config.capture_poll_interval,
            Arc::clone(&events),
        );

        let worker = ExecutionWorker {
            job_id,
            ast,
            capabilities: Arc::clone(&shared.capabilities),
            sink,
            abort,
            checkpoint_interval: shared.config.checkpoint_interval,
            max_operations: shared.config.max_operations,
            stepper,
        };
        let (done_tx, done_rx) = oneshot::channel();

        if let Err(e) = worker.spawn(done_tx) {
            tracing::error!(%job_id, error = %e, "Failed to spawn script worker");
            shared.runtime.spawn(capture.finish());
            let mut inner = shared.lock();
            inner.state.release(job_id);
            inner.unclaimed.remove(&job_id);
            return Err(HostError::WorkerSpawn(e));
        }

        tracing::info!(%job_id, ?kind, "Script job started");
        shared
            .runtime
            .spawn(supervise(Arc::clone(shared), job_id, done_rx, capture, events));
        Ok(job_id)
    }
}

/// Create the host's capture directory, under `parent` when configured.
fn capture_dir_in(parent: Option<&Path>) -> std::io::Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("mdscript-capture-");
    match parent {
        Some(parent) => builder.tempdir_in(parent),
        None => builder.tempdir(),
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait for the worker's terminal report, then finish the job in order:
/// final output drain, host back to idle, terminal event.
async fn supervise(
    shared: Arc<Shared>,
    job_id: JobId,
    done: oneshot::Receiver<JobOutcome>,
    capture: OutputCapture,
    events: Arc<JobEventSender>,
) {
    let outcome = done.await.unwrap_or_else(|_| {
        tracing::error!(%job_id, "Script worker exited without reporting");
        JobOutcome::Failed(ScriptFailure::worker_lost())
    });

    capture.finish().await;
    let duration_ms = shared.complete(job_id, &outcome);

    match &outcome {
        JobOutcome::Failed(failure) => tracing::info!(
            %job_id,
            status = %outcome.status(),
            ?duration_ms,
            line = failure.line,
            message = %failure.message,
            "Script job finished",
        ),
        _ => tracing::info!(
            %job_id,
            status = %outcome.status(),
            ?duration_ms,
            "Script job finished",
        ),
    }

    events.finish(outcome);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
