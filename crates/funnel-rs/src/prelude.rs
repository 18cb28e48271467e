//! Commonly used types, for `use funnel_rs::prelude::*`.

pub use crate::config::PipelineConfig;
pub use crate::context::{CharRatioMeter, CompactionRecord, SizeMeter, SlidingWindow};
pub use crate::error::{PipelineError, StageFailure, StageLogicError};
pub use crate::events::{EventRecord, PipelineEvent};
pub use crate::logic::{ChatClient, ChatLogic, ExtractiveLogic};
pub use crate::pipeline::{
    FnLogic, Pipeline, PipelineBuilder, PipelineController, RetryConfig, RetryLogic, RunReport,
    RunStatus, StageDescriptor, StageInput, StageKind, StageLogic, StageRequest,
    research_pipeline, research_stages,
};
pub use crate::state::{JsonlSink, MemorySink, SinkDiagnostics, StateRecord, StateStore};
pub use crate::{QUERY_KEY, Turn, TurnRole};
