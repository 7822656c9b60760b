//! Execution worker.
//!
//! Runs one compiled script on a dedicated OS thread. The engine is built
//! fresh for the job, with the capability table and the job's output sink
//! bound into it, and is dropped before the outcome is reported.
//!
//! Abort is cooperative: the engine's progress hook checks the job's
//! cancellation token every `checkpoint_interval` operations and the debugger
//! hook checks it before every node. A capability function that blocks for a
//! long time without returning to the evaluator delays the abort until it
//! returns.

use std::io;
use std::sync::Arc;
use std::thread;

use rhai::debugger::DebuggerCommand;
use rhai::{ASTNode, Dynamic, Engine, EvalAltResult, Position, Scope, AST};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilitySet;
use crate::debug::{self, StepPoint, Stepper};
use crate::error::ScriptFailure;
use crate::job::{JobId, JobOutcome};
use crate::output::OutputSink;

/// Everything a worker needs to evaluate one job.
pub struct ExecutionWorker {
    pub(crate) job_id: JobId,
    pub(crate) ast: AST,
    pub(crate) capabilities: Arc<CapabilitySet>,
    pub(crate) sink: OutputSink,
    pub(crate) abort: CancellationToken,
    pub(crate) checkpoint_interval: u64,
    pub(crate) max_operations: u64,
    pub(crate) stepper: Option<Arc<Stepper>>,
}

impl ExecutionWorker {
    /// Run on a new named thread and report the outcome through `done`.
    ///
    /// If the thread dies without reporting (a panic inside a capability),
    /// `done` is dropped and the receiver observes the closed channel.
    pub(crate) fn spawn(self, done: oneshot::Sender<JobOutcome>) -> io::Result<()> {
        let job_id = self.job_id;
        thread::Builder::new()
            .name(format!("script-worker-{job_id}"))
            .spawn(move || {
                let outcome = self.run();
                if done.send(outcome).is_err() {
                    tracing::debug!(%job_id, "Job outcome had no receiver");
                }
            })?;
        Ok(())
    }

    /// Evaluate the script on the current thread.
    pub fn run(self) -> JobOutcome {
        if self.abort.is_cancelled() {
            return JobOutcome::Aborted;
        }

        let mut engine = self.build_engine();
        let mut scope = Scope::new();
        self.capabilities.bind(&mut engine, &mut scope);

        tracing::debug!(job_id = %self.job_id, "Evaluation started");
        let result = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast);

        // Release the job's bindings before anyone learns it is over.
        drop(scope);
        drop(engine);

        match result {
            Ok(value) => JobOutcome::Completed(value),
            Err(err) => classify(*err),
        }
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();

        let sink = self.sink.clone();
        engine.on_print(move |text| sink.write_str(&format!("{text}\n")));

        let sink = self.sink.clone();
        engine.on_debug(move |text, _source, pos| {
            let line = pos.line().unwrap_or(0);
            sink.write_str(&format!("[debug] line {line}: {text}\n"));
        });

        let sink = self.sink.clone();
        engine.register_fn("write", move |value: Dynamic| sink.write_str(&value.to_string()));

        let abort = self.abort.clone();
        let every = self.checkpoint_interval.max(1);
        engine.on_progress(move |ops| {
            (ops % every == 0 && abort.is_cancelled()).then_some(Dynamic::UNIT)
        });

        if self.max_operations > 0 {
            engine.set_max_operations(self.max_operations);
        }

        if let Some(stepper) = &self.stepper {
            let stepper = Arc::clone(stepper);
            // Rhai flags the debugger API as volatile through `#[deprecated]`.
            #[allow(deprecated)]
            engine.register_debugger(
                |_engine, debugger| debugger,
                move |context, _event, node, _source, pos| {
                    let point = StepPoint {
                        is_stmt: matches!(node, ASTNode::Stmt(_)),
                        line: pos.line(),
                        column: pos.position().unwrap_or(0),
                        depth: context.call_level(),
                    };
                    match stepper.on_step(point, || debug::snapshot(context.scope())) {
                        Ok(()) => Ok(DebuggerCommand::StepInto),
                        Err(debug::Terminate) => Err(terminated(pos)),
                    }
                },
            );
        }

        engine
    }
}

fn terminated(pos: Position) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorTerminated(Dynamic::UNIT, pos))
}

/// Map an evaluation error onto a terminal outcome.
fn classify(mut err: EvalAltResult) -> JobOutcome {
    if is_termination(&err) {
        return JobOutcome::Aborted;
    }
    let pos = err.take_position();
    JobOutcome::Failed(ScriptFailure::new(pos.line().unwrap_or(0), err.to_string()))
}

/// Termination raised inside a script function arrives wrapped in call
/// frames.
fn is_termination(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_termination(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => is_termination(inner),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
