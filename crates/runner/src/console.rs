//! Console driver: submit one script and stream its output.
//!
//! The console never interprets output; chunks are written as they arrive
//! and flushed immediately so long-running analyses show progress. An
//! interrupt (Ctrl-C) or the optional deadline turns into a single abort
//! request; the loop then keeps draining until the terminal result arrives.

use std::future;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use mdscript_core::{JobEvent, JobOutcome, ScriptHost};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Exit code for a job that was aborted (interrupt or deadline).
pub const EXIT_ABORTED: i32 = 130;

/// Read a script file as UTF-8.
pub async fn load_script(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read script {}", path.display()))
}

/// Submit `source` and copy its output to `out` until the job finishes.
///
/// Cancelling `interrupt` or reaching `timeout` aborts the job. Syntax
/// errors are returned as errors; everything else ends in a [`JobOutcome`].
pub async fn run_script<W>(
    host: &ScriptHost,
    source: &str,
    timeout: Option<Duration>,
    interrupt: &CancellationToken,
    out: &mut W,
) -> anyhow::Result<JobOutcome>
where
    W: AsyncWrite + Unpin,
{
    let job_id = host.submit(source)?;
    let mut events = host.subscribe(job_id)?;
    tracing::debug!(%job_id, ?timeout, "Streaming script output");

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut abort_sent = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(JobEvent::Output(chunk)) => {
                    out.write_all(chunk.text.as_bytes()).await?;
                    out.flush().await?;
                }
                Some(JobEvent::Finished(result)) => return Ok(result.outcome),
                None => bail!("Event stream for job {job_id} ended without a result"),
            },
            _ = interrupt.cancelled(), if !abort_sent => {
                tracing::info!(%job_id, "Interrupted, aborting script");
                host.abort();
                abort_sent = true;
            }
            _ = &mut deadline, if !abort_sent => {
                tracing::warn!(%job_id, ?timeout, "Script exceeded its time limit, aborting");
                host.abort();
                abort_sent = true;
            }
        }
    }
}

/// Process exit code for a finished job.
pub fn exit_code(outcome: &JobOutcome) -> i32 {
    match outcome {
        JobOutcome::Completed(_) => 0,
        JobOutcome::Failed(_) => 1,
        JobOutcome::Aborted => EXIT_ABORTED,
    }
}
