//! Append-only record sinks and the background writer that feeds them.
//!
//! Run-state snapshots and pipeline events share one durability contract:
//! an append either succeeds or its failure is reported on a diagnostic
//! channel, and the caller that triggered it is never blocked. A
//! [`BackgroundWriter`] owns a single Tokio task per sink, so appends for one
//! run reach the sink in exactly the order they were sent.
//!
//! ```text
//! StateStore::write ──send──▶ [unbounded channel] ──▶ writer task ──▶ RecordSink::append
//!                                                         │
//!                                                         └─ Err ──▶ SinkDiagnostics
//! ```

use crate::error::SinkError;
use futures::future::BoxFuture;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Boxed future returned by [`RecordSink::append`].
pub type SinkFuture<'a> = BoxFuture<'a, Result<(), SinkError>>;

/// Destination for append-only records of type `R`.
///
/// Uses a boxed future so that the trait is dyn-compatible.
pub trait RecordSink<R>: Send + Sync {
    fn append<'a>(&'a self, record: &'a R) -> SinkFuture<'a>;
}

// ── Diagnostics ────────────────────────────────────────────────────

/// One failed append, as seen by the diagnostic channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailureReport {
    /// Which writer failed (`"state"` or `"events"`).
    pub sink: &'static str,
    pub message: String,
}

/// Shared collector for sink failures.
///
/// Failures are logged with `warn!` and kept so callers can inspect them
/// after a run. Cloning shares the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SinkDiagnostics(Arc<Mutex<Vec<SinkFailureReport>>>);

impl SinkDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, sink: &'static str, error: &SinkError) {
        warn!("{sink} sink append failed: {error}");
        let mut failures = self.0.lock().unwrap_or_else(|e| e.into_inner());
        failures.push(SinkFailureReport {
            sink,
            message: error.to_string(),
        });
    }

    pub fn failures(&self) -> Vec<SinkFailureReport> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn failure_count(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ── Background writer ──────────────────────────────────────────────

/// Fire-and-forget writer: [`send`](Self::send) never blocks or fails, and
/// records are appended to the sink in send order by a dedicated task.
pub struct BackgroundWriter<R> {
    label: &'static str,
    tx: mpsc::UnboundedSender<R>,
    handle: JoinHandle<()>,
    diagnostics: SinkDiagnostics,
}

impl<R> std::fmt::Debug for BackgroundWriter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWriter")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl<R: Send + Sync + 'static> BackgroundWriter<R> {
    /// Spawn the writer task on the current Tokio runtime.
    ///
    /// Returns [`SinkError::Other`] when called outside a runtime.
    pub fn spawn(
        label: &'static str,
        sink: Arc<dyn RecordSink<R>>,
        diagnostics: SinkDiagnostics,
    ) -> Result<Self, SinkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SinkError::Other(format!("{label} writer needs a tokio runtime: {e}")))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<R>();
        let task_diagnostics = diagnostics.clone();
        let handle = runtime.spawn(async move {
            let mut written = 0usize;
            while let Some(record) = rx.recv().await {
                match sink.append(&record).await {
                    Ok(()) => written += 1,
                    Err(e) => task_diagnostics.report(label, &e),
                }
            }
            debug!("{label} writer drained ({written} record(s) appended)");
        });

        Ok(Self {
            label,
            tx,
            handle,
            diagnostics,
        })
    }

    /// Queue a record for appending. Never blocks the caller.
    pub fn send(&self, record: R) {
        if self.tx.send(record).is_err() {
            self.diagnostics.report(self.label, &SinkError::Closed);
        }
    }

    /// Stop accepting records and wait until every queued record has been
    /// handed to the sink.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            self.diagnostics
                .report(self.label, &SinkError::Other(format!("writer task failed: {e}")));
        }
    }
}

// ── Sinks ──────────────────────────────────────────────────────────

/// Appends each record as one JSON line to a file, creating the file and
/// its parent directory on first use.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Per-run file `{dir}/{run_id}.jsonl`.
    pub fn for_run(dir: impl AsRef<Path>, run_id: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{run_id}.jsonl")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<R: Serialize + Sync> RecordSink<R> for JsonlSink {
    fn append<'a>(&'a self, record: &'a R) -> SinkFuture<'a> {
        Box::pin(async move {
            let mut line = serde_json::to_string(record)?;
            line.push('\n');

            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

/// Keeps records in memory. Cloning shares the same buffer, so a test can
/// hand one clone to a writer and inspect the other.
#[derive(Debug)]
pub struct MemorySink<R>(Arc<Mutex<Vec<R>>>);

impl<R> Clone for MemorySink<R> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<R> Default for MemorySink<R> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<R: Clone> MemorySink<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<R> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Clone + Send + Sync> RecordSink<R> for MemorySink<R> {
    fn append<'a>(&'a self, record: &'a R) -> SinkFuture<'a> {
        Box::pin(async move {
            self.0
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(record.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Line {
        n: u32,
    }

    struct FailingSink;

    impl RecordSink<Line> for FailingSink {
        fn append<'a>(&'a self, _record: &'a Line) -> SinkFuture<'a> {
            Box::pin(async { Err(SinkError::Other("disk full".into())) })
        }
    }

    #[tokio::test]
    async fn writer_preserves_send_order() {
        let sink = MemorySink::<Line>::new();
        let writer =
            BackgroundWriter::<Line>::spawn("test", Arc::new(sink.clone()), SinkDiagnostics::new())
                .unwrap();
        for n in 0..100 {
            writer.send(Line { n });
        }
        writer.close().await;

        let ns: Vec<u32> = sink.records().iter().map(|l| l.n).collect();
        assert_eq!(ns, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failures_go_to_diagnostics_not_caller() {
        let diagnostics = SinkDiagnostics::new();
        let writer =
            BackgroundWriter::<Line>::spawn("state", Arc::new(FailingSink), diagnostics.clone())
                .unwrap();
        writer.send(Line { n: 1 });
        writer.send(Line { n: 2 });
        writer.close().await;

        let failures = diagnostics.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].sink, "state");
        assert!(failures[0].message.contains("disk full"));
    }

    #[test]
    fn spawn_outside_runtime_is_an_error() {
        let result = BackgroundWriter::<Line>::spawn(
            "test",
            Arc::new(MemorySink::<Line>::new()),
            SinkDiagnostics::new(),
        );
        assert!(matches!(result, Err(SinkError::Other(_))));
    }

    #[tokio::test]
    async fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::for_run(dir.path().join("logs"), "run-1");
        sink.append(&Line { n: 1 }).await.unwrap();
        sink.append(&Line { n: 2 }).await.unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<Line> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![Line { n: 1 }, Line { n: 2 }]);
        assert!(sink.path().ends_with("logs/run-1.jsonl"));
    }
}
