//! Output sink and capture watcher.
//!
//! Scripts never talk to the UI directly. Everything they print goes into an
//! [`OutputSink`] owned by the host and bound into the job's engine. An
//! [`OutputCapture`] task polls the sink on a short fixed interval and turns
//! whatever has accumulated into one [`OutputChunk`](crate::events::OutputChunk).
//!
//! Capture is best-effort: if the conduit cannot be opened or read, the job
//! still runs and simply produces no output events.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::CaptureMode;
use crate::events::JobEventSender;
use crate::job::JobId;

/// Backing store between the script (writer) and the watcher (reader).
pub trait OutputConduit: Send + Sync {
    /// Append bytes. Failures are swallowed; output is best-effort.
    fn write(&self, bytes: &[u8]);

    /// Take everything written since the previous drain.
    fn drain(&self) -> io::Result<Vec<u8>>;
}

/// In-process conduit.
#[derive(Debug, Default)]
pub struct MemoryConduit {
    buf: Mutex<Vec<u8>>,
}

impl OutputConduit for MemoryConduit {
    fn write(&self, bytes: &[u8]) {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    fn drain(&self) -> io::Result<Vec<u8>> {
        Ok(std::mem::take(
            &mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner),
        ))
    }
}

/// Temporary-file conduit. The file is deleted when the conduit is dropped.
#[derive(Debug)]
pub struct FileConduit {
    writer: Mutex<NamedTempFile>,
    reader: Mutex<File>,
}

impl FileConduit {
    /// Create a fresh capture file inside `dir`.
    pub fn create_in(dir: &Path) -> io::Result<Self> {
        let writer = tempfile::Builder::new()
            .prefix("capture-")
            .suffix(".out")
            .tempfile_in(dir)?;
        let reader = writer.reopen()?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .path()
            .to_path_buf()
    }
}

impl OutputConduit for FileConduit {
    fn write(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(bytes).and_then(|()| writer.flush()) {
            tracing::trace!(error = %e, "Dropped output write to capture file");
        }
    }

    fn drain(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Conduit used when capture is unavailable: discards everything.
#[derive(Debug, Default)]
pub struct NullConduit;

impl OutputConduit for NullConduit {
    fn write(&self, _bytes: &[u8]) {}

    fn drain(&self) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Cheaply cloneable handle to a job's output conduit.
#[derive(Clone)]
pub struct OutputSink {
    conduit: Arc<dyn OutputConduit>,
}

impl OutputSink {
    pub fn new(conduit: Arc<dyn OutputConduit>) -> Self {
        Self { conduit }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryConduit::default()))
    }

    /// Open a sink for `mode`. Falls back to a discarding sink when the
    /// capture file cannot be created.
    pub fn open(mode: CaptureMode, dir: Option<&Path>, job_id: JobId) -> Self {
        match (mode, dir) {
            (CaptureMode::Memory, _) => Self::memory(),
            (CaptureMode::TempFile, Some(dir)) => match FileConduit::create_in(dir) {
                Ok(conduit) => Self::new(Arc::new(conduit)),
                Err(e) => {
                    tracing::warn!(%job_id, error = %e, "Output capture unavailable");
                    Self::new(Arc::new(NullConduit))
                }
            },
            (CaptureMode::TempFile, None) => {
                tracing::warn!(%job_id, "Output capture unavailable: no capture directory");
                Self::new(Arc::new(NullConduit))
            }
        }
    }

    pub fn write_str(&self, text: &str) {
        self.conduit.write(text.as_bytes());
    }

    pub fn drain(&self) -> io::Result<Vec<u8>> {
        self.conduit.drain()
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Capture watcher
// ---------------------------------------------------------------------------

/// Running watcher for one job.
#[derive(Debug)]
pub struct OutputCapture {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl OutputCapture {
    /// Start polling `sink` every `interval` on the given runtime.
    pub(crate) fn start(
        runtime: &tokio::runtime::Handle,
        sink: OutputSink,
        interval: Duration,
        events: Arc<JobEventSender>,
    ) -> Self {
        let stop = CancellationToken::new();
        let handle = runtime.spawn(watch(sink, interval, events, stop.clone()));
        Self { stop, handle }
    }

    /// Perform a final drain and wait for the watcher to exit.
    ///
    /// Call only after the worker has reported its terminal state, so output
    /// written in the last instants of execution is not lost.
    pub async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Output capture task ended abnormally");
        }
    }
}

async fn watch(
    sink: OutputSink,
    interval: Duration,
    events: Arc<JobEventSender>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut decoder = ChunkDecoder::default();
    let mut available = true;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                if available {
                    poll_once(&sink, &mut decoder, &events, &mut available);
                }
                if let Some(text) = decoder.flush() {
                    events.output(text);
                }
                break;
            }
            _ = ticker.tick() => {
                if available {
                    poll_once(&sink, &mut decoder, &events, &mut available);
                }
            }
        }
    }
}

fn poll_once(
    sink: &OutputSink,
    decoder: &mut ChunkDecoder,
    events: &JobEventSender,
    available: &mut bool,
) {
    match sink.drain() {
        Ok(bytes) => {
            if let Some(text) = decoder.push(bytes) {
                tracing::trace!(bytes = text.len(), "Captured output chunk");
                events.output(text);
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Output capture unavailable, dropping further output");
            *available = false;
        }
    }
}

/// Turns raw drained bytes into text chunks without splitting a UTF-8
/// sequence across two chunks.
#[derive(Debug, Default)]
struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    /// Append `bytes` and return the longest complete text prefix, if any.
    fn push(&mut self, bytes: Vec<u8>) -> Option<String> {
        if self.pending.is_empty() {
            self.pending = bytes;
        } else {
            self.pending.extend_from_slice(&bytes);
        }
        if self.pending.is_empty() {
            return None;
        }

        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Incomplete sequence at the end: hold it back for the next poll.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Genuinely invalid bytes: emit everything lossily.
            Err(_) => self.pending.len(),
        };
        if complete == 0 {
            return None;
        }

        let rest = self.pending.split_off(complete);
        let head = std::mem::replace(&mut self.pending, rest);
        Some(match String::from_utf8(head) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    /// Emit whatever is still held back.
    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, JobEvent};

    #[test]
    fn memory_conduit_drains_incrementally() {
        let sink = OutputSink::memory();
        sink.write_str("frame 1\n");
        sink.write_str("frame 2");
        assert_eq!(sink.drain().expect("drain"), b"frame 1\nframe 2");
        assert!(sink.drain().expect("drain").is_empty());
        sink.write_str("\n");
        assert_eq!(sink.drain().expect("drain"), b"\n");
    }

    #[test]
    fn file_conduit_drains_incrementally_and_cleans_up() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let conduit = FileConduit::create_in(dir.path()).expect("create conduit");
        let path = conduit.path();
        assert!(path.exists());

        conduit.write(b"abc");
        assert_eq!(conduit.drain().expect("drain"), b"abc");
        conduit.write(b"def");
        conduit.write(b"ghi");
        assert_eq!(conduit.drain().expect("drain"), b"defghi");
        assert!(conduit.drain().expect("drain").is_empty());

        drop(conduit);
        assert!(!path.exists(), "capture file should be removed on drop");
    }

    #[test]
    fn missing_capture_dir_degrades_to_null_sink() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let gone = dir.path().join("does-not-exist");
        let sink = OutputSink::open(CaptureMode::TempFile, Some(&gone), JobId::new());
        sink.write_str("lost");
        assert!(sink.drain().expect("drain").is_empty());
    }

    #[test]
    fn decoder_holds_back_split_utf8() {
        let mut decoder = ChunkDecoder::default();
        let angstrom = "Å".as_bytes();
        assert_eq!(angstrom.len(), 2);

        let mut first = b"d = 1.5 ".to_vec();
        first.push(angstrom[0]);
        assert_eq!(decoder.push(first).as_deref(), Some("d = 1.5 "));

        let mut second = vec![angstrom[1]];
        second.extend_from_slice(b"\n");
        assert_eq!(decoder.push(second).as_deref(), Some("Å\n"));
        assert_eq!(decoder.flush(), None);
    }

    #[test]
    fn decoder_flushes_dangling_bytes_lossily() {
        let mut decoder = ChunkDecoder::default();
        assert_eq!(decoder.push(vec![0xE2, 0x84]), None);
        let flushed = decoder.flush().expect("dangling bytes");
        assert!(flushed.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn capture_streams_then_drains_on_finish() {
        let bus = EventBus::default();
        let job_id = JobId::new();
        let (sender, mut events) = JobEventSender::channel(job_id, &bus);
        let sender = Arc::new(sender);
        let sink = OutputSink::memory();

        let capture = OutputCapture::start(
            &tokio::runtime::Handle::current(),
            sink.clone(),
            Duration::from_millis(5),
            Arc::clone(&sender),
        );

        sink.write_str("early ");
        tokio::time::sleep(Duration::from_millis(30)).await;
        sink.write_str("late");
        capture.finish().await;
        drop(sender);

        let mut text = String::new();
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Output(chunk) => text.push_str(&chunk.text),
                JobEvent::Finished(_) => panic!("capture never sends a result"),
            }
        }
        assert_eq!(text, "early late");
    }
}
