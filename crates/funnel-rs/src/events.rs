//! Structured event recording for pipeline runs.
//!
//! Components report what they did through [`PipelineEvent`] variants handed
//! to the run's [`EventRecorder`]. Each event is:
//!
//! 1. mirrored to `tracing` (lifecycle at `info`, detail at `debug`),
//! 2. passed to any registered observers,
//! 3. flattened into an [`EventRecord`] and queued on the event sink, if one
//!    is attached. The sink append happens on a background task; failures go
//!    to [`SinkDiagnostics`] and never reach the emitting component.
//!
//! [`CompactionRecord`]s are additionally retained in memory so the run can
//! report its size accounting without reading the sink back.

use crate::context::gate::CompactionRecord;
use crate::error::SinkError;
use crate::pipeline::stage::StageKind;
use crate::state::sink::{BackgroundWriter, RecordSink, SinkDiagnostics};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted while a run executes.
#[derive(Debug)]
pub enum PipelineEvent<'a> {
    /// The controller is about to execute the first stage.
    RunStart { run_id: &'a str, stage_count: usize },
    /// A stage is about to invoke its logic.
    StageStart {
        stage: &'a str,
        index: usize,
        kind: StageKind,
        /// Time since the run's recorder was created.
        run_elapsed: Duration,
    },
    /// A stage finished, successfully or not.
    StageEnd {
        stage: &'a str,
        index: usize,
        elapsed: Duration,
        ok: bool,
    },
    /// A compactor is about to receive its raw input.
    TokenInput { stage: &'a str, raw_tokens: usize },
    /// A compaction was committed.
    Compaction(&'a CompactionRecord),
    /// Every stage succeeded.
    RunCompleted {
        run_id: &'a str,
        output_tokens: usize,
    },
    /// A stage failed and the run stopped.
    RunAborted { stage: &'a str, cause: &'a str },
}

impl PipelineEvent<'_> {
    /// Event name written to the sink.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::RunStart { .. } => "run_start",
            PipelineEvent::StageStart { .. } => "stage_start",
            PipelineEvent::StageEnd { .. } => "stage_end",
            PipelineEvent::TokenInput { .. } => "token_input",
            PipelineEvent::Compaction(_) => "compaction",
            PipelineEvent::RunCompleted { .. } => "run_completed",
            PipelineEvent::RunAborted { .. } => "run_aborted",
        }
    }

    /// Event-specific fields of the sink record.
    pub fn payload(&self) -> Map<String, Value> {
        let value = match self {
            PipelineEvent::RunStart {
                run_id,
                stage_count,
            } => json!({ "run": run_id, "stage_count": stage_count }),
            PipelineEvent::StageStart {
                stage,
                index,
                kind,
                run_elapsed,
            } => json!({
                "stage": stage,
                "index": index,
                "kind": kind,
                "run_elapsed_ms": run_elapsed.as_secs_f64() * 1000.0,
            }),
            PipelineEvent::StageEnd {
                stage,
                index,
                elapsed,
                ok,
            } => json!({
                "stage": stage,
                "index": index,
                "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
                "ok": ok,
            }),
            PipelineEvent::TokenInput { stage, raw_tokens } => {
                json!({ "stage": stage, "raw_tokens": raw_tokens })
            }
            PipelineEvent::Compaction(record) => {
                serde_json::to_value(record).unwrap_or_else(|_| json!({}))
            }
            PipelineEvent::RunCompleted {
                run_id,
                output_tokens,
            } => json!({ "run": run_id, "output_tokens": output_tokens }),
            PipelineEvent::RunAborted { stage, cause } => {
                json!({ "stage": stage, "cause": cause })
            }
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// One line of the event log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub event: String,
    pub run_id: String,
    /// Unix time in seconds.
    pub ts: f64,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Boxed observer callback.
type EventCallback = Box<dyn Fn(&PipelineEvent<'_>) + Send + Sync>;

// ── Recorder ───────────────────────────────────────────────────────

/// Append-only event log for one run.
pub struct EventRecorder {
    run_id: String,
    writer: Option<BackgroundWriter<EventRecord>>,
    observers: Vec<EventCallback>,
    compactions: Vec<CompactionRecord>,
    emitted: usize,
    started: Instant,
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("run_id", &self.run_id)
            .field("observers", &self.observers.len())
            .field("compactions", &self.compactions.len())
            .field("emitted", &self.emitted)
            .finish_non_exhaustive()
    }
}

impl EventRecorder {
    /// Create a recorder that only logs through `tracing`.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            writer: None,
            observers: Vec::new(),
            compactions: Vec::new(),
            emitted: 0,
            started: Instant::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Queue every subsequent event on `sink`.
    ///
    /// Spawns a writer task, so this must run inside a Tokio runtime.
    pub fn attach_sink(
        &mut self,
        sink: Arc<dyn RecordSink<EventRecord>>,
        diagnostics: SinkDiagnostics,
    ) -> Result<(), SinkError> {
        self.writer = Some(BackgroundWriter::spawn("events", sink, diagnostics)?);
        Ok(())
    }

    /// Register a callback invoked for every event, in registration order.
    pub fn observe(&mut self, callback: impl Fn(&PipelineEvent<'_>) + Send + Sync + 'static) {
        self.observers.push(Box::new(callback));
    }

    /// Wait for queued events to reach the sink and detach it.
    pub async fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
    }

    /// Record an event.
    pub fn emit(&mut self, event: &PipelineEvent<'_>) {
        log_event(event);
        for observer in &self.observers {
            observer(event);
        }
        if let PipelineEvent::Compaction(record) = event {
            self.compactions.push((*record).clone());
        }
        if let Some(ref writer) = self.writer {
            writer.send(EventRecord {
                event: event.name().to_string(),
                run_id: self.run_id.clone(),
                ts: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
                payload: event.payload(),
            });
        }
        self.emitted += 1;
    }

    /// Compactions recorded so far, in commit order.
    pub fn compactions(&self) -> &[CompactionRecord] {
        &self.compactions
    }

    /// Time since this recorder was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

fn log_event(event: &PipelineEvent<'_>) {
    match event {
        PipelineEvent::RunStart {
            run_id,
            stage_count,
        } => {
            info!("[{run_id}] starting pipeline ({stage_count} stages)");
        }
        PipelineEvent::StageStart {
            stage,
            index,
            kind,
            run_elapsed,
        } => {
            info!(
                "[stage {index}] {stage} ({kind}) starting at +{:.1}s",
                run_elapsed.as_secs_f64()
            );
        }
        PipelineEvent::StageEnd {
            stage,
            index,
            elapsed,
            ok,
        } => {
            if *ok {
                info!(
                    "[stage {index}] {stage} finished in {:.1}s",
                    elapsed.as_secs_f64()
                );
            } else {
                warn!(
                    "[stage {index}] {stage} failed after {:.1}s",
                    elapsed.as_secs_f64()
                );
            }
        }
        PipelineEvent::TokenInput { stage, raw_tokens } => {
            debug!("{stage}: compacting ~{raw_tokens} raw tokens");
        }
        PipelineEvent::Compaction(record) => {
            info!(
                "{}: {} -> {} tokens ({:.2}% reduction), {} removed",
                record.stage_name,
                record.raw_size_tokens,
                record.summary_size_tokens,
                record.reduction_percent,
                record.raw_key,
            );
            if record.exceeded_cap
                && let Some(cap) = record.max_output_tokens
            {
                warn!(
                    "{}: summary of {} tokens exceeds cap of {cap}",
                    record.stage_name, record.summary_size_tokens,
                );
            }
        }
        PipelineEvent::RunCompleted {
            run_id,
            output_tokens,
        } => {
            info!("[{run_id}] pipeline completed (~{output_tokens} output tokens)");
        }
        PipelineEvent::RunAborted { stage, cause } => {
            warn!("pipeline aborted at {stage}: {cause}");
        }
    }
}
