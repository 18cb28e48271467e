//! Pipeline construction and run orchestration.
//!
//! A [`Pipeline`] is the validated, immutable stage list plus the settings
//! that are constant for every run of it. It is built once with
//! [`PipelineBuilder`] and shared (`Arc<Pipeline>`) by any number of
//! [`PipelineController`]s, each of which owns exactly one [`RunState`].
//!
//! # Run lifecycle
//!
//! ```text
//! Pending ──run()──▶ Running(0) ──▶ Running(1) ──▶ ... ──▶ Completed
//!                         │              │
//!                         └──────────────┴──▶ Aborted { stage, cause }
//! ```
//!
//! Stages execute strictly in declaration order. `Completed` and `Aborted`
//! are terminal: a controller runs once, and a retry means a new controller
//! (optionally seeded from the aborted run's [`snapshot`](PipelineController::snapshot)).

use super::runner::StageRunner;
use super::stage::{StageDescriptor, StageKind, StageLogic};
use crate::context::gate::CompactionRecord;
use crate::context::meter::{CharRatioMeter, SizeMeter};
use crate::context::window::SlidingWindow;
use crate::error::PipelineError;
use crate::events::{EventRecord, EventRecorder, PipelineEvent};
use crate::state::sink::{RecordSink, SinkDiagnostics};
use crate::state::store::{StateRecord, StateStore};
use crate::{DEFAULT_RETENTION_LIMIT, QUERY_KEY, Turn, TurnRole};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::debug;

/// Generate a unique identifier for a run.
pub fn generate_run_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Counter separates runs created within the same clock tick.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts:x}-{count:04x}")
}

// ── Pipeline ───────────────────────────────────────────────────────

struct PipelineStage {
    descriptor: StageDescriptor,
    logic: Arc<dyn StageLogic>,
}

/// A validated stage list and the settings shared by all of its runs.
pub struct Pipeline {
    stages: Vec<PipelineStage>,
    retention_limit: usize,
    system_turns: Vec<String>,
    meter: Arc<dyn SizeMeter>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "stages",
                &self.stages.iter().map(|s| &s.descriptor.name).collect::<Vec<_>>(),
            )
            .field("retention_limit", &self.retention_limit)
            .field("system_turns", &self.system_turns.len())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn descriptors(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.iter().map(|s| &s.descriptor)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn retention_limit(&self) -> usize {
        self.retention_limit
    }

    pub fn system_turns(&self) -> &[String] {
        &self.system_turns
    }

    pub fn meter(&self) -> &dyn SizeMeter {
        &*self.meter
    }

    /// Key the final stage writes.
    pub fn output_key(&self) -> Option<&str> {
        self.stages.last().map(|s| s.descriptor.output_key.as_str())
    }
}

/// Builder for [`Pipeline`].
///
/// ```ignore
/// let pipeline = PipelineBuilder::new()
///     .retention_limit(6)
///     .system_turn("Answer in English.")
///     .producer("market_agent", ["user_query"], "market_raw", producer)
///     .compactor("market_summarizer", "market_raw", "market_summary", 180, compactor)
///     .synthesis("decision_agent", ["market_summary"], "decision", None, decider)
///     .build()?;
/// ```
pub struct PipelineBuilder {
    stages: Vec<PipelineStage>,
    retention_limit: usize,
    system_turns: Vec<String>,
    meter: Arc<dyn SizeMeter>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            retention_limit: DEFAULT_RETENTION_LIMIT,
            system_turns: Vec::new(),
            meter: Arc::new(CharRatioMeter::default()),
        }
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage with its logic.
    pub fn stage(mut self, descriptor: StageDescriptor, logic: impl StageLogic + 'static) -> Self {
        self.stages.push(PipelineStage {
            descriptor,
            logic: Arc::new(logic),
        });
        self
    }

    pub fn producer<I, S>(
        self,
        name: impl Into<String>,
        input_keys: I,
        output_key: impl Into<String>,
        logic: impl StageLogic + 'static,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stage(
            StageDescriptor::producer(name, input_keys, output_key),
            logic,
        )
    }

    pub fn compactor(
        self,
        name: impl Into<String>,
        raw_key: impl Into<String>,
        summary_key: impl Into<String>,
        max_output_tokens: usize,
        logic: impl StageLogic + 'static,
    ) -> Self {
        self.stage(
            StageDescriptor::compactor(name, raw_key, summary_key, max_output_tokens),
            logic,
        )
    }

    pub fn synthesis<I, S>(
        self,
        name: impl Into<String>,
        input_keys: I,
        output_key: impl Into<String>,
        max_output_tokens: Option<usize>,
        logic: impl StageLogic + 'static,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stage(
            StageDescriptor::synthesis(name, input_keys, output_key, max_output_tokens),
            logic,
        )
    }

    /// Append pre-built descriptors, asking `logic_for` for each stage's
    /// logic. Fails with [`PipelineError::MissingLogic`] if it returns `None`.
    pub fn descriptors<F>(
        mut self,
        descriptors: impl IntoIterator<Item = StageDescriptor>,
        mut logic_for: F,
    ) -> Result<Self, PipelineError>
    where
        F: FnMut(&StageDescriptor) -> Option<Arc<dyn StageLogic>>,
    {
        for descriptor in descriptors {
            let logic = logic_for(&descriptor)
                .ok_or_else(|| PipelineError::MissingLogic(descriptor.name.clone()))?;
            self.stages.push(PipelineStage { descriptor, logic });
        }
        Ok(self)
    }

    /// Non-system turns kept in each run's window.
    pub fn retention_limit(mut self, limit: usize) -> Self {
        self.retention_limit = limit;
        self
    }

    /// Add a system turn seeded into every run's window. Never evicted.
    pub fn system_turn(mut self, content: impl Into<String>) -> Self {
        self.system_turns.push(content.into());
        self
    }

    pub fn meter(mut self, meter: impl SizeMeter + 'static) -> Self {
        self.meter = Arc::new(meter);
        self
    }

    /// Validate the stage list and freeze it.
    ///
    /// Rules: at least one stage; unique names; exactly one synthesis stage,
    /// in last position; compactors read exactly one key and carry a cap;
    /// producers carry no cap; synthesis never reads a key some compactor
    /// deletes.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        validate(self.stages.iter().map(|s| &s.descriptor))?;
        Ok(Pipeline {
            stages: self.stages,
            retention_limit: self.retention_limit,
            system_turns: self.system_turns,
            meter: self.meter,
        })
    }
}

fn validate<'a>(stages: impl Iterator<Item = &'a StageDescriptor>) -> Result<(), PipelineError> {
    let stages: Vec<&StageDescriptor> = stages.collect();
    let Some(last) = stages.last() else {
        return Err(PipelineError::Empty);
    };

    let mut names = HashSet::new();
    let mut compacted = HashSet::new();
    for (i, stage) in stages.iter().enumerate() {
        if !names.insert(stage.name.as_str()) {
            return Err(PipelineError::DuplicateStage(stage.name.clone()));
        }
        match stage.kind {
            StageKind::Producer => {
                if stage.max_output_tokens.is_some() {
                    return Err(PipelineError::UnexpectedCap(stage.name.clone()));
                }
            }
            StageKind::Compactor => {
                if stage.input_keys.len() != 1 {
                    return Err(PipelineError::CompactorInputs {
                        stage: stage.name.clone(),
                        found: stage.input_keys.len(),
                    });
                }
                if stage.input_keys[0] == stage.output_key {
                    return Err(PipelineError::CompactorKeys(stage.name.clone()));
                }
                if stage.max_output_tokens.is_none() {
                    return Err(PipelineError::MissingCap(stage.name.clone()));
                }
                compacted.insert(stage.input_keys[0].as_str());
            }
            StageKind::Synthesis => {
                if i + 1 != stages.len() {
                    return Err(PipelineError::SynthesisNotLast(stage.name.clone()));
                }
            }
        }
    }

    if last.kind != StageKind::Synthesis {
        return Err(PipelineError::MissingSynthesis);
    }
    if let Some(key) = last
        .input_keys
        .iter()
        .find(|k| compacted.contains(k.as_str()))
    {
        return Err(PipelineError::SynthesisReadsRaw {
            stage: last.name.clone(),
            key: key.clone(),
        });
    }
    Ok(())
}

// ── Run state ──────────────────────────────────────────────────────

/// Where a run is in its lifecycle.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    /// Executing the stage at this index.
    Running(usize),
    Completed,
    Aborted {
        stage: String,
        cause: String,
    },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted { .. })
    }
}

/// Everything one run owns. Never shared between runs.
#[derive(Debug)]
pub struct RunState {
    run_id: String,
    store: StateStore,
    window: SlidingWindow,
    executed: Vec<StageDescriptor>,
}

impl RunState {
    fn new(run_id: String, retention_limit: usize) -> Self {
        Self {
            store: StateStore::new(run_id.clone()),
            window: SlidingWindow::new(retention_limit),
            executed: Vec::new(),
            run_id,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    /// Stages that completed successfully, in execution order.
    pub fn executed(&self) -> &[StageDescriptor] {
        &self.executed
    }
}

/// Serializable summary of a run.
#[derive(Serialize, Clone, Debug)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub output: Option<String>,
    pub stages_executed: Vec<String>,
    pub compactions: Vec<CompactionRecord>,
    pub total_raw_tokens: usize,
    pub total_summary_tokens: usize,
    /// Reduction across every compaction, computed like a single one.
    pub overall_reduction_percent: f64,
    pub window: Vec<Turn>,
    pub evicted_turns: usize,
    pub snapshot: BTreeMap<String, String>,
    pub sink_failures: usize,
}

// ── Controller ─────────────────────────────────────────────────────

/// Drives one run of a [`Pipeline`].
pub struct PipelineController {
    pipeline: Arc<Pipeline>,
    state: RunState,
    recorder: EventRecorder,
    status: RunStatus,
    output: Option<String>,
    seed: BTreeMap<String, String>,
    state_sink: Option<Arc<dyn RecordSink<StateRecord>>>,
    event_sink: Option<Arc<dyn RecordSink<EventRecord>>>,
    diagnostics: SinkDiagnostics,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("run_id", &self.state.run_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    /// Prepare a run with a fresh identifier. Nothing executes until
    /// [`run`](Self::run).
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let run_id = generate_run_id();
        let mut state = RunState::new(run_id.clone(), pipeline.retention_limit);
        for content in &pipeline.system_turns {
            state.window.push(TurnRole::System, content.clone());
        }
        Self {
            recorder: EventRecorder::new(run_id),
            pipeline,
            state,
            status: RunStatus::Pending,
            output: None,
            seed: BTreeMap::new(),
            state_sink: None,
            event_sink: None,
            diagnostics: SinkDiagnostics::new(),
        }
    }

    /// Stream a state snapshot to `sink` after every store mutation.
    pub fn with_state_sink(mut self, sink: Arc<dyn RecordSink<StateRecord>>) -> Self {
        self.state_sink = Some(sink);
        self
    }

    /// Append every event of the run to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn RecordSink<EventRecord>>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Share a diagnostics handle for sink failures.
    pub fn with_diagnostics(mut self, diagnostics: SinkDiagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Pre-populate the store before the query is written, e.g. with the
    /// snapshot of an aborted run. Every stage still executes.
    pub fn with_seed(mut self, snapshot: BTreeMap<String, String>) -> Self {
        self.seed = snapshot;
        self
    }

    /// Register an event callback.
    pub fn observe(mut self, callback: impl Fn(&PipelineEvent<'_>) + Send + Sync + 'static) -> Self {
        self.recorder.observe(callback);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    /// Execute every stage in order.
    ///
    /// Returns the final stage's output. On a stage failure the run moves to
    /// [`RunStatus::Aborted`] and its state stays inspectable. Calling this
    /// a second time fails with [`PipelineError::AlreadyStarted`].
    pub async fn run(&mut self, query: &str) -> Result<String, PipelineError> {
        if self.status != RunStatus::Pending {
            return Err(PipelineError::AlreadyStarted(self.state.run_id.clone()));
        }
        self.attach_sinks();

        let pipeline = Arc::clone(&self.pipeline);
        self.status = RunStatus::Running(0);
        self.recorder.emit(&PipelineEvent::RunStart {
            run_id: &self.state.run_id,
            stage_count: pipeline.len(),
        });

        if !self.seed.is_empty() {
            self.state.store.extend(std::mem::take(&mut self.seed));
        }
        self.state.store.write(QUERY_KEY, query);
        self.state.window.push(TurnRole::User, query);

        let mut last_output = String::new();
        for (index, stage) in pipeline.stages.iter().enumerate() {
            self.status = RunStatus::Running(index);
            let result = StageRunner::new(
                &mut self.state.store,
                &mut self.state.window,
                &mut self.recorder,
                pipeline.meter(),
            )
            .run(index, &stage.descriptor, stage.logic.as_ref())
            .await;

            match result {
                Ok(output) => {
                    self.state.executed.push(stage.descriptor.clone());
                    last_output = output;
                }
                Err(failure) => {
                    let cause = failure.cause.to_string();
                    self.recorder.emit(&PipelineEvent::RunAborted {
                        stage: &failure.stage,
                        cause: &cause,
                    });
                    self.status = RunStatus::Aborted {
                        stage: failure.stage.clone(),
                        cause,
                    };
                    self.close_sinks().await;
                    return Err(failure.into());
                }
            }
        }

        self.status = RunStatus::Completed;
        self.recorder.emit(&PipelineEvent::RunCompleted {
            run_id: &self.state.run_id,
            output_tokens: pipeline.meter().measure(&last_output),
        });
        self.output = Some(last_output.clone());
        self.close_sinks().await;
        Ok(last_output)
    }

    /// Stop a run whose [`run`](Self::run) future was dropped mid-stage,
    /// e.g. by a caller's timeout.
    ///
    /// The run moves to [`RunStatus::Aborted`] at the stage that was
    /// executing, `run_aborted` is emitted, and queued records are flushed.
    /// Runs that already reached a terminal status are left alone.
    pub async fn abort(&mut self, cause: &str) {
        let RunStatus::Running(index) = self.status else {
            return;
        };
        let pipeline = Arc::clone(&self.pipeline);
        let stage = pipeline
            .stages
            .get(index)
            .map_or("", |s| s.descriptor.name.as_str());
        self.state.store.set_stage(None);
        self.recorder.emit(&PipelineEvent::RunAborted { stage, cause });
        self.status = RunStatus::Aborted {
            stage: stage.to_string(),
            cause: cause.to_string(),
        };
        self.close_sinks().await;
    }

    fn attach_sinks(&mut self) {
        if let Some(sink) = self.state_sink.take()
            && let Err(e) = self.state.store.attach_sink(sink, self.diagnostics.clone())
        {
            self.diagnostics.report("state", &e);
        }
        if let Some(sink) = self.event_sink.take()
            && let Err(e) = self.recorder.attach_sink(sink, self.diagnostics.clone())
        {
            self.diagnostics.report("events", &e);
        }
    }

    async fn close_sinks(&mut self) {
        self.state.store.close_log().await;
        self.recorder.close().await;
        debug!(
            "[{}] sinks closed ({} failure(s))",
            self.state.run_id,
            self.diagnostics.failure_count()
        );
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Current contents of the run's store, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.state.store.snapshot()
    }

    /// Current sliding window.
    pub fn window(&self) -> Vec<Turn> {
        self.state.window.get()
    }

    pub fn compactions(&self) -> &[CompactionRecord] {
        self.recorder.compactions()
    }

    /// Final output, available once the run has completed.
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn diagnostics(&self) -> &SinkDiagnostics {
        &self.diagnostics
    }

    pub fn report(&self) -> RunReport {
        let compactions = self.recorder.compactions().to_vec();
        let total_raw_tokens = compactions.iter().map(|c| c.raw_size_tokens).sum();
        let total_summary_tokens = compactions.iter().map(|c| c.summary_size_tokens).sum();
        RunReport {
            run_id: self.state.run_id.clone(),
            status: self.status.clone(),
            output: self.output.clone(),
            stages_executed: self.state.executed.iter().map(|s| s.name.clone()).collect(),
            overall_reduction_percent: crate::context::gate::reduction_percent(
                total_raw_tokens,
                total_summary_tokens,
            ),
            compactions,
            total_raw_tokens,
            total_summary_tokens,
            window: self.state.window.get(),
            evicted_turns: self.state.window.evicted(),
            snapshot: self.snapshot(),
            sink_failures: self.diagnostics.failure_count(),
        }
    }
}
