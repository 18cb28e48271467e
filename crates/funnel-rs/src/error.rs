//! Error taxonomy for pipeline runs.
//!
//! Only two kinds of failure ever reach a caller: a [`StageFailure`] (stage
//! logic gave up, the run aborts) and a [`PipelineError`] (the stage list was
//! rejected at construction, or a controller was asked to run twice). Sink
//! failures are a separate diagnostic channel: they are reported through
//! [`SinkDiagnostics`](crate::state::sink::SinkDiagnostics) and never
//! propagate into the run. Reading an absent key is not an error at all.

use thiserror::Error;

/// Failure raised by external stage logic (producer, compactor, synthesis).
///
/// Carries a plain message, the way upstream HTTP/LLM failures are usually
/// reported. [`is_transient`](Self::is_transient) classifies it for the
/// retry decorator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StageLogicError {
    message: String,
}

impl StageLogicError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure looks retryable (rate limits, 5xx, timeouts).
    pub fn is_transient(&self) -> bool {
        crate::pipeline::retry::classify(&self.message) == crate::pipeline::retry::FailureKind::Transient
    }
}

impl From<String> for StageLogicError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for StageLogicError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A [`StageLogicError`] attributed to the stage that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stage '{stage}' failed: {cause}")]
pub struct StageFailure {
    pub stage: String,
    #[source]
    pub cause: StageLogicError,
}

impl StageFailure {
    pub fn new(stage: impl Into<String>, cause: StageLogicError) -> Self {
        Self {
            stage: stage.into(),
            cause,
        }
    }
}

/// Failure of a persistence or event sink append.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("sink writer is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// A turn was appended out of sequence order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("turn sequence {sequence} does not follow {last}")]
pub struct OutOfOrderTurn {
    pub sequence: u64,
    pub last: u64,
}

/// Errors from building or driving a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,
    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),
    #[error("pipeline must end in exactly one synthesis stage")]
    MissingSynthesis,
    #[error("synthesis stage '{0}' must be the last stage")]
    SynthesisNotLast(String),
    #[error("compactor '{stage}' must read exactly one key, found {found}")]
    CompactorInputs { stage: String, found: usize },
    #[error("compactor '{0}' writes its summary over the key it compacts")]
    CompactorKeys(String),
    #[error("compactor '{0}' needs an output cap")]
    MissingCap(String),
    #[error("stage '{0}' is a producer and cannot carry an output cap")]
    UnexpectedCap(String),
    #[error("synthesis stage '{stage}' reads raw key '{key}'")]
    SynthesisReadsRaw { stage: String, key: String },
    #[error("no stage logic registered for '{0}'")]
    MissingLogic(String),
    #[error("run {0} has already started")]
    AlreadyStarted(String),
    #[error(transparent)]
    Stage(#[from] StageFailure),
}

/// Errors from loading a [`PipelineConfig`](crate::config::PipelineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}
