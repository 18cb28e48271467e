//! Pipeline configuration.
//!
//! [`PipelineConfig`] holds everything that is constant for a run: the
//! stage list, window retention, pinned system turns, where logs go, and
//! which models the chat logic uses. Defaults reproduce the research
//! pipeline; a JSON file can override any field, and a few settings can be
//! overlaid from the environment.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `LLM_MODEL` | `model` |
//! | `SUMMARY_MODEL` | `summary_model` |
//! | `FUNNEL_RETENTION` | `retention_limit` |

use crate::DEFAULT_RETENTION_LIMIT;
use crate::error::ConfigError;
use crate::logic::DEFAULT_MODEL;
use crate::pipeline::research::{SUMMARY_TOKEN_CAP, research_stages};
use crate::pipeline::stage::{StageDescriptor, StageKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Non-system turns kept in the window. Default: `6`.
    pub retention_limit: usize,
    /// Output cap applied to compactors that do not set their own.
    /// Default: `180`.
    pub compactor_cap: usize,
    /// Ordered stage list. Default: the research topology.
    pub stages: Vec<StageDescriptor>,
    /// System turns pinned into every run's window.
    pub system_turns: Vec<String>,
    /// Directory for per-run state logs. Default: `state_logs`.
    pub state_log_dir: PathBuf,
    /// Event log file. Default: `token_log.jsonl`.
    pub event_log: PathBuf,
    /// Chat model for producers and synthesis. Default: `gpt-3.5-turbo`.
    pub model: String,
    /// Chat model for compactors; falls back to `model`.
    pub summary_model: Option<String>,
    /// Attach web search to producer requests. Default: `true`.
    pub web_search: bool,
    /// Retries for transient stage failures. Default: `0`.
    pub max_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retention_limit: DEFAULT_RETENTION_LIMIT,
            compactor_cap: SUMMARY_TOKEN_CAP,
            stages: research_stages(SUMMARY_TOKEN_CAP),
            system_turns: Vec::new(),
            state_log_dir: PathBuf::from("state_logs"),
            event_log: PathBuf::from("token_log.jsonl"),
            model: DEFAULT_MODEL.to_string(),
            summary_model: None,
            web_search: true,
            max_retries: 0,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        debug!("loaded config from {} ({} stages)", path.display(), config.stages.len());
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Apply environment overrides on top of `self`.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_vars(|name| std::env::var(name).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(model) = var("LLM_MODEL").filter(|m| !m.is_empty()) {
            self.model = model;
        }
        if let Some(model) = var("SUMMARY_MODEL").filter(|m| !m.is_empty()) {
            self.summary_model = Some(model);
        }
        if let Some(value) = var("FUNNEL_RETENTION") {
            self.retention_limit = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "FUNNEL_RETENTION",
                value,
            })?;
        }
        Ok(self)
    }

    /// Stage list with `compactor_cap` filled in where a compactor has none.
    pub fn resolved_stages(&self) -> Vec<StageDescriptor> {
        self.stages
            .iter()
            .cloned()
            .map(|mut stage| {
                if stage.kind == StageKind::Compactor && stage.max_output_tokens.is_none() {
                    stage.max_output_tokens = Some(self.compactor_cap);
                }
                stage
            })
            .collect()
    }
}
