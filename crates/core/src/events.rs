//! Job events delivered to the UI layer.
//!
//! Every job produces any number of [`OutputChunk`]s followed by exactly one
//! [`JobResult`]. Each job has its own lossless, ordered stream
//! ([`JobEvents`], obtained via
//! [`ScriptHost::subscribe`](crate::host::ScriptHost::subscribe)); the same
//! events are also fanned out on a host-wide [`EventBus`] for observers that
//! tolerate lag.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::job::{JobId, JobOutcome};

/// A piece of text a running job wrote to its output channel.
///
/// Chunks follow poll timing, not line structure: a chunk may end mid-line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputChunk {
    pub job_id: JobId,
    pub text: String,
}

/// Terminal report for a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: JobId,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Output(OutputChunk),
    Finished(JobResult),
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Output(chunk) => chunk.job_id,
            Self::Finished(result) => result.job_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-job stream
// ---------------------------------------------------------------------------

/// Ordered event stream for one job.
///
/// Ends after the [`JobEvent::Finished`] event has been yielded.
#[derive(Debug)]
pub struct JobEvents {
    job_id: JobId,
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl JobEvents {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the next event. Returns `None` once the terminal event has
    /// been consumed.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Consume the stream, concatenating all output, and return it together
    /// with the terminal outcome.
    pub async fn collect_output(mut self) -> (String, Option<JobOutcome>) {
        let mut output = String::new();
        while let Some(event) = self.recv().await {
            match event {
                JobEvent::Output(chunk) => output.push_str(&chunk.text),
                JobEvent::Finished(result) => return (output, Some(result.outcome)),
            }
        }
        (output, None)
    }
}

impl Stream for JobEvents {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Producer side of one job's events.
///
/// Publishes each event to the job's own stream and to the host bus. The
/// job stream closes when the last sender is dropped; the host drops it
/// right after [`finish`](Self::finish).
#[derive(Debug)]
pub(crate) struct JobEventSender {
    job_id: JobId,
    tx: mpsc::UnboundedSender<JobEvent>,
    bus: broadcast::Sender<JobEvent>,
}

impl JobEventSender {
    pub(crate) fn channel(job_id: JobId, bus: &EventBus) -> (Self, JobEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Self {
            job_id,
            tx,
            bus: bus.sender.clone(),
        };
        (sender, JobEvents { job_id, rx })
    }

    pub(crate) fn output(&self, text: String) {
        self.publish(JobEvent::Output(OutputChunk {
            job_id: self.job_id,
            text,
        }));
    }

    pub(crate) fn finish(&self, outcome: JobOutcome) {
        self.publish(JobEvent::Finished(JobResult {
            job_id: self.job_id,
            outcome,
        }));
    }

    fn publish(&self, event: JobEvent) {
        // Both sends only fail when nobody is listening.
        let _ = self.bus.send(event.clone());
        let _ = self.tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// Host-wide bus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of every job's events.
///
/// When the buffer is full, the oldest un-consumed events are dropped and
/// slow receivers observe `RecvError::Lagged`. Consumers that need every
/// chunk use the per-job [`JobEvents`] stream instead.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
