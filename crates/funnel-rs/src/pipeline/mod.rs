//! Stage definitions and run orchestration.
//!
//! - [`stage`]: [`StageDescriptor`] and the [`StageLogic`] seam.
//! - [`runner`]: [`StageRunner`], one stage against one run's state.
//! - [`controller`]: [`PipelineBuilder`], [`Pipeline`], and the
//!   [`PipelineController`] state machine.
//! - [`research`]: the default eleven-stage research topology.
//! - [`retry`]: [`RetryLogic`], a backoff decorator for stage logic.

pub mod controller;
pub mod research;
pub mod retry;
pub mod runner;
pub mod stage;

pub use controller::{
    Pipeline, PipelineBuilder, PipelineController, RunReport, RunState, RunStatus,
    generate_run_id,
};
pub use research::{SUMMARY_TOKEN_CAP, research_pipeline, research_stages};
pub use retry::{FailureKind, RetryConfig, RetryLogic, classify};
pub use runner::StageRunner;
pub use stage::{
    FnLogic, StageDescriptor, StageFuture, StageInput, StageKind, StageLogic, StageRequest,
};
