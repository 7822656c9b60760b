//! Interactive stepping debugger.
//!
//! A debug session evaluates a script on the regular worker, but the engine
//! calls back into a [`Stepper`] before every AST node. The stepper decides
//! whether to halt (breakpoint, step, entry, pause request) and, while
//! halted, waits for controller commands in short slices so that abort
//! requests are still noticed promptly.
//!
//! The UI side drives the session through a [`DebugHandle`].

use std::collections::BTreeSet;
use std::sync::mpsc as std_mpsc;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rhai::Scope;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::job::JobId;

/// Options for [`ScriptHost::attach_debugger`](crate::host::ScriptHost::attach_debugger).
#[derive(Debug, Clone)]
pub struct DebugOptions {
    /// 1-based source lines to halt on.
    pub breakpoints: Vec<usize>,
    /// Halt before the first statement.
    pub stop_on_entry: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            breakpoints: Vec::new(),
            stop_on_entry: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Entry,
    Breakpoint,
    Step,
    Request,
}

/// A variable visible at the halt point, rendered for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub constant: bool,
}

/// Notifications sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebugEvent {
    Paused {
        job_id: JobId,
        line: usize,
        /// Script function call depth (`0` at top level).
        depth: usize,
        reason: PauseReason,
        locals: Vec<Variable>,
    },
    Resumed {
        job_id: JobId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebugCommand {
    Resume,
    StepInto,
    StepOver,
    StepOut,
    Pause,
    SetBreakpoint(usize),
    ClearBreakpoint(usize),
}

/// Controller side of a debug session.
#[derive(Debug)]
pub struct DebugHandle {
    job_id: JobId,
    commands: std_mpsc::Sender<DebugCommand>,
    events: mpsc::UnboundedReceiver<DebugEvent>,
}

impl DebugHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the next pause/resume notification. Returns `None` once the
    /// session has ended.
    pub async fn next_event(&mut self) -> Option<DebugEvent> {
        self.events.recv().await
    }

    /// Continue until the next breakpoint. Returns `false` if the session
    /// has already ended, here and in the other command methods.
    pub fn resume(&self) -> bool {
        self.send(DebugCommand::Resume)
    }

    /// Halt at the next statement, entering called functions.
    pub fn step_into(&self) -> bool {
        self.send(DebugCommand::StepInto)
    }

    /// Halt at the next statement at the current call depth or shallower.
    pub fn step_over(&self) -> bool {
        self.send(DebugCommand::StepOver)
    }

    /// Halt once the current function has returned.
    pub fn step_out(&self) -> bool {
        self.send(DebugCommand::StepOut)
    }

    /// Ask a running script to halt at its next statement.
    pub fn pause(&self) -> bool {
        self.send(DebugCommand::Pause)
    }

    pub fn set_breakpoint(&self, line: usize) -> bool {
        self.send(DebugCommand::SetBreakpoint(line))
    }

    pub fn clear_breakpoint(&self, line: usize) -> bool {
        self.send(DebugCommand::ClearBreakpoint(line))
    }

    fn send(&self, command: DebugCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Stepper (worker side)
// ---------------------------------------------------------------------------

/// Returned when the session must stop evaluating.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Terminate;

/// One evaluator callback, reduced to what the stepper needs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepPoint {
    pub is_stmt: bool,
    pub line: Option<usize>,
    /// 1-based column, `0` when unknown.
    pub column: usize,
    pub depth: usize,
}

/// Where the most recent statement started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StmtSite {
    line: usize,
    column: usize,
    depth: usize,
}

impl StmtSite {
    /// Whether `next` continues the same visit to a line: a later statement
    /// on that line in the same frame. Reaching the same or an earlier column
    /// again means the line is being executed anew (a loop pass).
    fn continues_into(&self, next: &StmtSite) -> bool {
        self.line == next.line && self.depth == next.depth && next.column > self.column
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepMode {
    Run,
    Into,
    Over { depth: usize },
    Out { depth: usize },
}

#[derive(Debug)]
struct Session {
    commands: std_mpsc::Receiver<DebugCommand>,
    mode: StepMode,
    breakpoints: BTreeSet<usize>,
    pause_requested: Option<PauseReason>,
    last_stmt: Option<StmtSite>,
    /// The controller went away; run to completion without halting.
    detached: bool,
}

impl Session {
    fn pause_reason(&mut self, site: StmtSite) -> Option<PauseReason> {
        if let Some(reason) = self.pause_requested.take() {
            return Some(reason);
        }
        if self.last_stmt.is_some_and(|last| last.continues_into(&site)) {
            return None;
        }
        let StmtSite { line, depth, .. } = site;
        match self.mode {
            StepMode::Into => return Some(PauseReason::Step),
            StepMode::Over { depth: d } if depth <= d => return Some(PauseReason::Step),
            StepMode::Out { depth: d } if depth < d => return Some(PauseReason::Step),
            _ => {}
        }
        self.breakpoints
            .contains(&line)
            .then_some(PauseReason::Breakpoint)
    }

    /// Apply a command. Returns the new mode if the command resumes
    /// execution.
    fn apply(&mut self, command: DebugCommand, depth: usize) -> Option<StepMode> {
        match command {
            DebugCommand::Resume => Some(StepMode::Run),
            DebugCommand::StepInto => Some(StepMode::Into),
            DebugCommand::StepOver => Some(StepMode::Over { depth }),
            DebugCommand::StepOut => Some(StepMode::Out { depth }),
            DebugCommand::Pause => {
                self.pause_requested = Some(PauseReason::Request);
                None
            }
            DebugCommand::SetBreakpoint(line) => {
                self.breakpoints.insert(line);
                None
            }
            DebugCommand::ClearBreakpoint(line) => {
                self.breakpoints.remove(&line);
                None
            }
        }
    }

    /// Apply commands queued while the script was running.
    fn drain_queued(&mut self, depth: usize) {
        loop {
            match self.commands.try_recv() {
                // Resume/step while running only matter for the mode of
                // an already running script; `Run` stays `Run`.
                Ok(command) => {
                    if let Some(mode) = self.apply(command, depth) {
                        self.mode = mode;
                    }
                }
                Err(std_mpsc::TryRecvError::Empty) => break,
                Err(std_mpsc::TryRecvError::Disconnected) => {
                    self.detach();
                    break;
                }
            }
        }
    }

    fn detach(&mut self) {
        self.detached = true;
        self.mode = StepMode::Run;
        self.breakpoints.clear();
        self.pause_requested = None;
    }
}

/// Worker-side half of a debug session, called from the engine's debugger
/// hook on the worker thread.
#[derive(Debug)]
pub(crate) struct Stepper {
    job_id: JobId,
    session: Mutex<Session>,
    events: mpsc::UnboundedSender<DebugEvent>,
    abort: CancellationToken,
    halt_poll: Duration,
}

impl Stepper {
    /// Create both halves of a session.
    pub(crate) fn new(
        job_id: JobId,
        options: &DebugOptions,
        abort: CancellationToken,
        halt_poll: Duration,
    ) -> (Self, DebugHandle) {
        let (command_tx, command_rx) = std_mpsc::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = Session {
            commands: command_rx,
            mode: StepMode::Run,
            breakpoints: options.breakpoints.iter().copied().collect(),
            pause_requested: options.stop_on_entry.then_some(PauseReason::Entry),
            last_stmt: None,
            detached: false,
        };

        let stepper = Self {
            job_id,
            session: Mutex::new(session),
            events: event_tx,
            abort,
            halt_poll,
        };
        let handle = DebugHandle {
            job_id,
            commands: command_tx,
            events: event_rx,
        };
        (stepper, handle)
    }

    /// Evaluator checkpoint. Halts if the session says so; `locals` is only
    /// evaluated when halting.
    pub(crate) fn on_step<F>(&self, point: StepPoint, locals: F) -> Result<(), Terminate>
    where
        F: FnOnce() -> Vec<Variable>,
    {
        if self.abort.is_cancelled() {
            return Err(Terminate);
        }

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        session.drain_queued(point.depth);
        if session.detached || !point.is_stmt {
            return Ok(());
        }
        let Some(line) = point.line else {
            return Ok(());
        };

        let site = StmtSite {
            line,
            column: point.column,
            depth: point.depth,
        };
        let reason = session.pause_reason(site);
        session.last_stmt = Some(site);
        match reason {
            Some(reason) => self.halt(&mut session, reason, line, point.depth, locals()),
            None => Ok(()),
        }
    }

    fn halt(
        &self,
        session: &mut Session,
        reason: PauseReason,
        line: usize,
        depth: usize,
        locals: Vec<Variable>,
    ) -> Result<(), Terminate> {
        tracing::debug!(job_id = %self.job_id, line, depth, ?reason, "Debugger halted");
        self.emit(DebugEvent::Paused {
            job_id: self.job_id,
            line,
            depth,
            reason,
            locals,
        });

        loop {
            if self.abort.is_cancelled() {
                return Err(Terminate);
            }
            match session.commands.recv_timeout(self.halt_poll) {
                Ok(command) => {
                    if let Some(mode) = session.apply(command, depth) {
                        session.mode = mode;
                        break;
                    }
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    tracing::debug!(job_id = %self.job_id, "Debug controller gone, running to completion");
                    session.detach();
                    break;
                }
            }
        }

        self.emit(DebugEvent::Resumed {
            job_id: self.job_id,
        });
        Ok(())
    }

    fn emit(&self, event: DebugEvent) {
        // Fails only when the handle has been dropped.
        let _ = self.events.send(event);
    }
}

/// Render the variables in `scope` for a pause notification.
pub(crate) fn snapshot(scope: &Scope<'_>) -> Vec<Variable> {
    scope
        .iter()
        .map(|(name, constant, value)| Variable {
            name: name.to_string(),
            value: value.to_string(),
            constant,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn stmt(line: usize, depth: usize) -> StepPoint {
        stmt_at(line, 1, depth)
    }

    fn stmt_at(line: usize, column: usize, depth: usize) -> StepPoint {
        StepPoint {
            is_stmt: true,
            line: Some(line),
            column,
            depth,
        }
    }

    fn new_stepper(options: DebugOptions) -> (Arc<Stepper>, DebugHandle, CancellationToken) {
        let abort = CancellationToken::new();
        let (stepper, handle) =
            Stepper::new(JobId::new(), &options, abort.clone(), Duration::from_millis(5));
        (Arc::new(stepper), handle, abort)
    }

    /// Drive `lines` through the stepper on a separate thread, like the
    /// worker does.
    fn run_lines(
        stepper: Arc<Stepper>,
        lines: Vec<(usize, usize)>,
    ) -> thread::JoinHandle<Result<(), Terminate>> {
        let points = lines.into_iter().map(|(line, depth)| stmt(line, depth)).collect();
        run_points(stepper, points)
    }

    fn run_points(
        stepper: Arc<Stepper>,
        points: Vec<StepPoint>,
    ) -> thread::JoinHandle<Result<(), Terminate>> {
        thread::spawn(move || {
            for point in points {
                stepper.on_step(point, Vec::new)?;
            }
            Ok(())
        })
    }

    async fn expect_paused(handle: &mut DebugHandle) -> (usize, PauseReason) {
        loop {
            match handle.next_event().await.expect("session ended early") {
                DebugEvent::Paused { line, reason, .. } => return (line, reason),
                DebugEvent::Resumed { .. } => continue,
            }
        }
    }

    #[test]
    fn expressions_and_unpositioned_nodes_never_halt() {
        let (stepper, _handle, _abort) = new_stepper(DebugOptions::default());
        let expr = StepPoint {
            is_stmt: false,
            line: Some(1),
            column: 1,
            depth: 0,
        };
        assert_eq!(stepper.on_step(expr, Vec::new), Ok(()));
        let nowhere = StepPoint {
            is_stmt: true,
            line: None,
            column: 0,
            depth: 0,
        };
        assert_eq!(stepper.on_step(nowhere, Vec::new), Ok(()));
    }

    #[test]
    fn abort_terminates_before_halting() {
        let (stepper, _handle, abort) = new_stepper(DebugOptions::default());
        abort.cancel();
        assert_eq!(stepper.on_step(stmt(1, 0), Vec::new), Err(Terminate));
    }

    #[tokio::test]
    async fn stops_on_entry_then_breakpoint() {
        let (stepper, mut handle, _abort) = new_stepper(DebugOptions {
            breakpoints: vec![3],
            stop_on_entry: true,
        });
        let worker = run_lines(Arc::clone(&stepper), vec![(1, 0), (2, 0), (3, 0), (4, 0)]);
        drop(stepper);

        assert_eq!(expect_paused(&mut handle).await, (1, PauseReason::Entry));
        assert!(handle.resume());
        assert_eq!(expect_paused(&mut handle).await, (3, PauseReason::Breakpoint));
        assert!(handle.resume());

        assert!(worker.join().expect("join").is_ok());
        let job_id = handle.job_id();
        assert_eq!(handle.next_event().await, Some(DebugEvent::Resumed { job_id }));
        assert_eq!(handle.next_event().await, None);
    }

    #[tokio::test]
    async fn step_over_skips_deeper_frames() {
        let (stepper, mut handle, _abort) = new_stepper(DebugOptions::default());
        // Line 5 calls a function whose body (lines 1-2) runs at depth 1.
        let worker = run_lines(
            Arc::clone(&stepper),
            vec![(5, 0), (1, 1), (2, 1), (6, 0)],
        );
        drop(stepper);

        assert_eq!(expect_paused(&mut handle).await, (5, PauseReason::Entry));
        assert!(handle.step_over());
        assert_eq!(expect_paused(&mut handle).await, (6, PauseReason::Step));
        assert!(handle.resume());
        assert!(worker.join().expect("join").is_ok());
    }

    #[tokio::test]
    async fn step_into_and_out() {
        let (stepper, mut handle, _abort) = new_stepper(DebugOptions::default());
        let worker = run_lines(
            Arc::clone(&stepper),
            vec![(5, 0), (1, 1), (2, 1), (6, 0)],
        );
        drop(stepper);

        assert_eq!(expect_paused(&mut handle).await, (5, PauseReason::Entry));
        assert!(handle.step_into());
        assert_eq!(expect_paused(&mut handle).await, (1, PauseReason::Step));
        assert!(handle.step_out());
        assert_eq!(expect_paused(&mut handle).await, (6, PauseReason::Step));
        assert!(handle.resume());
        assert!(worker.join().expect("join").is_ok());
    }

    #[tokio::test]
    async fn breakpoint_in_loop_body_halts_every_pass() {
        let (stepper, mut handle, _abort) = new_stepper(DebugOptions {
            breakpoints: vec![3],
            stop_on_entry: false,
        });
        // `for` header on line 2, body statement on line 3, three passes.
        let mut points = vec![stmt_at(2, 1, 0)];
        points.extend([stmt_at(3, 5, 0); 3]);
        let worker = run_points(Arc::clone(&stepper), points);
        drop(stepper);

        for _ in 0..3 {
            assert_eq!(expect_paused(&mut handle).await, (3, PauseReason::Breakpoint));
            assert!(handle.resume());
        }
        assert!(worker.join().expect("join").is_ok());
    }

    #[tokio::test]
    async fn statements_sharing_a_line_halt_once_per_visit() {
        let (stepper, mut handle, _abort) = new_stepper(DebugOptions {
            breakpoints: vec![1],
            stop_on_entry: false,
        });
        // `let a = 1; let b = 2;` on line 1, then line 2.
        let worker = run_points(
            Arc::clone(&stepper),
            vec![stmt_at(1, 1, 0), stmt_at(1, 12, 0), stmt_at(2, 1, 0)],
        );
        drop(stepper);

        assert_eq!(expect_paused(&mut handle).await, (1, PauseReason::Breakpoint));
        assert!(handle.resume());
        assert!(worker.join().expect("join").is_ok());
        let job_id = handle.job_id();
        assert_eq!(handle.next_event().await, Some(DebugEvent::Resumed { job_id }));
        assert_eq!(handle.next_event().await, None);
    }

    #[tokio::test]
    async fn step_over_stops_on_next_loop_pass() {
        let (stepper, mut handle, _abort) = new_stepper(DebugOptions {
            breakpoints: vec![3],
            stop_on_entry: false,
        });
        let worker = run_points(
            Arc::clone(&stepper),
            vec![stmt_at(2, 1, 0), stmt_at(3, 5, 0), stmt_at(3, 5, 0), stmt_at(5, 1, 0)],
        );
        drop(stepper);

        assert_eq!(expect_paused(&mut handle).await, (3, PauseReason::Breakpoint));
        assert!(handle.clear_breakpoint(3));
        assert!(handle.step_over());
        assert_eq!(expect_paused(&mut handle).await, (3, PauseReason::Step));
        assert!(handle.step_over());
        assert_eq!(expect_paused(&mut handle).await, (5, PauseReason::Step));
        assert!(handle.resume());
        assert!(worker.join().expect("join").is_ok());
    }

    #[tokio::test]
    async fn abort_while_halted_terminates() {
        let (stepper, mut handle, abort) = new_stepper(DebugOptions::default());
        let worker = run_lines(Arc::clone(&stepper), vec![(1, 0), (2, 0)]);
        drop(stepper);

        assert_eq!(expect_paused(&mut handle).await, (1, PauseReason::Entry));
        abort.cancel();
        assert_eq!(worker.join().expect("join"), Err(Terminate));
    }

    #[test]
    fn dropped_controller_runs_to_completion() {
        let (stepper, handle, _abort) = new_stepper(DebugOptions {
            breakpoints: vec![2],
            stop_on_entry: false,
        });
        drop(handle);
        let worker = run_lines(stepper, vec![(1, 0), (2, 0), (3, 0)]);
        assert!(worker.join().expect("join").is_ok());
    }

    #[test]
    fn snapshot_renders_scope() {
        let mut scope = Scope::new();
        scope.push("frame", 3_i64);
        scope.push_constant("label", "CA");
        let vars = snapshot(&scope);
        assert_eq!(
            vars,
            vec![
                Variable {
                    name: "frame".to_string(),
                    value: "3".to_string(),
                    constant: false,
                },
                Variable {
                    name: "label".to_string(),
                    value: "CA".to_string(),
                    constant: true,
                },
            ]
        );
    }
}
