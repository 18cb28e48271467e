//! Staged research pipeline with a bounded context lifecycle.
//!
//! `funnel-rs` runs a fixed sequence of *producer* stages, each generating a
//! large raw artifact, interleaved with *compactor* stages that reduce each
//! artifact to a bounded summary, and ends in one *synthesis* stage that
//! reads only summaries. What the stages say is up to the caller: every stage
//! is a [`StageLogic`](pipeline::stage::StageLogic) implementor. This crate
//! owns the part that decides what each stage may read, how much of it, and
//! when raw artifacts are discarded.
//!
//! # Getting started
//!
//! ```ignore
//! use funnel_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let logic = ExtractiveLogic::default();
//!     let pipeline = PipelineBuilder::new()
//!         .producer("market_agent", ["user_query"], "market_raw", logic.clone())
//!         .compactor("market_summarizer", "market_raw", "market_summary", 180, logic.clone())
//!         .synthesis("decision_agent", ["market_summary"], "decision", None, logic)
//!         .build()?;
//!
//!     let mut controller = PipelineController::new(pipeline.into());
//!     let decision = controller.run("EV charging in Europe").await?;
//!     println!("{decision}");
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Measure text:** [`SizeMeter`](context::meter::SizeMeter) and the
//!   default [`CharRatioMeter`](context::meter::CharRatioMeter).
//! - **Conversation history:** [`SlidingWindow`](context::window::SlidingWindow)
//!   keeps every system turn plus the most recent non-system turns.
//! - **Compaction:** [`CompactionGate`](context::gate::CompactionGate) turns a
//!   raw key into a summary key and deletes the raw, recording a
//!   [`CompactionRecord`](context::gate::CompactionRecord).
//! - **Run state:** [`StateStore`](state::store::StateStore), with snapshots
//!   streamed to a [`RecordSink`](state::sink::RecordSink) in the background.
//! - **Events:** [`EventRecorder`](events::EventRecorder).
//! - **Orchestration:** [`PipelineController`](pipeline::controller::PipelineController).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Size metering, sliding window, compaction gate |
//! | [`state`] | Run-scoped key/value store and append-only sinks |
//! | [`events`] | Structured event recording and `tracing` mirroring |
//! | [`pipeline`] | Stage descriptors, runner, controller, retry, research topology |
//! | [`logic`] | Bundled stage logic: offline extractive and LLM-backed chat |
//! | [`config`] | Pipeline configuration from JSON and environment |

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod logic;
pub mod pipeline;
pub mod prelude;
pub mod state;

use serde::{Deserialize, Serialize};

// ── Constants ──────────────────────────────────────────────────────

/// Non-system turns kept by a [`SlidingWindow`](context::window::SlidingWindow)
/// unless configured otherwise.
pub const DEFAULT_RETENTION_LIMIT: usize = 6;

/// State key under which the run's query is stored before the first stage.
pub const QUERY_KEY: &str = "user_query";

// ── Turn types ─────────────────────────────────────────────────────

/// Role of a turn in the sliding window.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Agent,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnRole::System => write!(f, "system"),
            TurnRole::User => write!(f, "user"),
            TurnRole::Agent => write!(f, "agent"),
        }
    }
}

/// One role-tagged message in the sliding window.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    /// Monotonic position assigned by the window on append.
    pub sequence: u64,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>, sequence: u64) -> Self {
        Self {
            role,
            content: content.into(),
            sequence,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == TurnRole::System
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_role_serializes_lowercase() {
        let turn = Turn::new(TurnRole::Agent, "summary", 3);
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "agent");
        assert_eq!(json["sequence"], 3);
        assert_eq!(TurnRole::System.to_string(), "system");
    }

    #[test]
    fn only_system_turns_are_pinned() {
        assert!(Turn::new(TurnRole::System, "rules", 0).is_system());
        assert!(!Turn::new(TurnRole::User, "query", 1).is_system());
    }
}
