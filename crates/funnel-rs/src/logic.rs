//! Bundled stage logic.
//!
//! - [`ExtractiveLogic`]: deterministic and offline. Producers restate their
//!   inputs and window, compactors keep the leading words that fit the cap,
//!   synthesis lists its inputs. Useful for dry runs and tests.
//! - [`ChatLogic`]: sends each stage to an OpenAI-compatible chat
//!   completions endpoint (OpenRouter by default), with the research
//!   instruction for the stage as the system message.

use crate::context::meter::{CharRatioMeter, SizeMeter};
use crate::error::StageLogicError;
use crate::pipeline::research::instruction_for;
use crate::pipeline::stage::{StageFuture, StageKind, StageLogic, StageRequest};
use crate::{Turn, TurnRole};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ── Extractive ─────────────────────────────────────────────────────

/// Deterministic, network-free stage logic.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveLogic {
    meter: CharRatioMeter,
}

impl ExtractiveLogic {
    /// Use `meter` when fitting compactor and synthesis output to a cap.
    pub fn with_meter(meter: CharRatioMeter) -> Self {
        Self { meter }
    }

    fn produce(&self, request: &StageRequest<'_>) -> String {
        let mut out = format!("{} findings\n", request.stage);
        for input in request.inputs {
            out.push_str(&format!("- topic: {input}\n"));
        }
        for turn in request.window {
            out.push_str(&format!("- context ({}): {}\n", turn.role, turn.content));
        }
        out
    }

    fn synthesize(&self, request: &StageRequest<'_>) -> String {
        let mut out = format!("{} based on {} input(s):\n", request.stage, request.inputs.len());
        for input in request.inputs.iter().filter(|i| !i.is_empty()) {
            out.push_str(&format!("- {input}\n"));
        }
        out
    }

    /// Longest word prefix of `text` that measures at most `cap` tokens.
    pub fn fit_to_cap(&self, text: &str, cap: usize) -> String {
        let mut out = String::new();
        for word in text.split_whitespace() {
            let candidate = if out.is_empty() {
                word.to_string()
            } else {
                format!("{out} {word}")
            };
            if self.meter.measure(&candidate) > cap {
                break;
            }
            out = candidate;
        }
        out
    }
}

impl StageLogic for ExtractiveLogic {
    fn run<'a>(&'a self, request: StageRequest<'a>) -> StageFuture<'a> {
        Box::pin(async move {
            let output = match request.kind {
                StageKind::Producer => self.produce(&request),
                StageKind::Compactor => {
                    let raw = request.inputs.first().map_or("", String::as_str);
                    match request.max_output_tokens {
                        Some(cap) => self.fit_to_cap(raw, cap),
                        None => raw.to_string(),
                    }
                }
                StageKind::Synthesis => {
                    let text = self.synthesize(&request);
                    match request.max_output_tokens {
                        Some(cap) => self.fit_to_cap(&text, cap),
                        None => text,
                    }
                }
            };
            Ok(output)
        })
    }
}

// ── Chat completions ───────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for every stage.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Completion budget for stages without an output cap.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Turn> for Message {
    fn from(turn: &Turn) -> Self {
        match turn.role {
            TurnRole::System => Message::system(turn.content.clone()),
            TurnRole::User => Message::user(turn.content.clone()),
            TurnRole::Agent => Message::assistant(turn.content.clone()),
        }
    }
}

/// Server-side plugin attached to a request. Only web search is used.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "id")]
pub enum Plugin {
    #[serde(rename = "web")]
    Web {
        #[serde(skip_serializing_if = "Option::is_none")]
        max_results: Option<u32>,
    },
}

/// Chat completion request body.
#[derive(Serialize, Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<Plugin>>,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// Async HTTP client for a chat completions endpoint.
#[derive(Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, StageLogicError> {
        Self::with_url(api_key, OPENROUTER_URL)
    }

    pub fn with_url(api_key: impl Into<String>, url: impl Into<String>) -> Result<Self, StageLogicError> {
        let client = reqwest::Client::builder()
            .user_agent("funnel-rs/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| StageLogicError::new(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        })
    }

    /// Read the API key from `OPENROUTER_KEY`.
    pub fn from_env() -> Result<Self, StageLogicError> {
        let api_key = std::env::var("OPENROUTER_KEY")
            .map_err(|_| StageLogicError::new("OPENROUTER_KEY not set"))?;
        Self::new(api_key)
    }

    /// Send a request and return the first choice's text.
    pub async fn complete(&self, body: &ChatRequest) -> Result<String, StageLogicError> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}",
            body.model,
            body.messages.len(),
            body.max_tokens,
        );
        let start = Instant::now();

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "funnel-rs")
            .json(body)
            .send()
            .await
            .map_err(|e| StageLogicError::new(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| StageLogicError::new(format!("failed to read response: {e}")))?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(StageLogicError::new(format!("chat API HTTP {status}: {text}")));
        }
        parse_completion(&text)
    }
}

fn parse_completion(text: &str) -> Result<String, StageLogicError> {
    let parsed: RawChatResponse = serde_json::from_str(text)
        .map_err(|e| StageLogicError::new(format!("failed to parse response: {e}")))?;

    if let Some(err) = parsed.error {
        return Err(StageLogicError::new(format!("chat API error: {}", err.message)));
    }
    if let Some(ref usage) = parsed.usage {
        trace!(
            "token usage: prompt={}, completion={}, total={}",
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
            usage.total_tokens.unwrap_or(0),
        );
    }
    parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| StageLogicError::new("empty model response"))
}

/// LLM-backed stage logic.
///
/// Producers may use the provider's web-search plugin in place of a
/// retrieval tool. Compactors can run on a cheaper summary model.
#[derive(Debug, Clone)]
pub struct ChatLogic {
    client: ChatClient,
    model: String,
    summary_model: Option<String>,
    temperature: f32,
    web_search: bool,
}

impl ChatLogic {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            summary_model: None,
            temperature: 0.3,
            web_search: false,
        }
    }

    /// Model used by compactor stages.
    pub fn with_summary_model(mut self, model: Option<String>) -> Self {
        self.summary_model = model;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Attach the web-search plugin to producer requests.
    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.web_search = enabled;
        self
    }

    /// Request body for one stage invocation.
    pub fn build_request(&self, request: &StageRequest<'_>) -> ChatRequest {
        let mut messages = vec![Message::system(instruction_for(
            request.stage,
            request.kind,
            request.max_output_tokens,
        ))];
        messages.extend(request.window.iter().map(Message::from));
        messages.push(Message::user(stage_prompt(request)));

        let model = match (request.kind, &self.summary_model) {
            (StageKind::Compactor, Some(summary)) => summary.clone(),
            _ => self.model.clone(),
        };
        let plugins = (self.web_search && request.kind == StageKind::Producer)
            .then(|| vec![Plugin::Web { max_results: None }]);

        ChatRequest {
            model,
            messages,
            max_tokens: request
                .max_output_tokens
                .map_or(DEFAULT_MAX_TOKENS, |cap| u32::try_from(cap).unwrap_or(u32::MAX)),
            temperature: self.temperature,
            plugins,
        }
    }
}

fn stage_prompt(request: &StageRequest<'_>) -> String {
    match request.kind {
        StageKind::Producer => format!("Topic:\n{}", request.inputs.join("\n")),
        StageKind::Compactor => format!(
            "TEXT:\n{}",
            request.inputs.first().map_or("", String::as_str)
        ),
        StageKind::Synthesis => request
            .inputs
            .iter()
            .enumerate()
            .map(|(i, text)| format!("Summary {}:\n{text}", i + 1))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

impl StageLogic for ChatLogic {
    fn run<'a>(&'a self, request: StageRequest<'a>) -> StageFuture<'a> {
        Box::pin(async move {
            let body = self.build_request(&request);
            self.client.complete(&body).await
        })
    }
}
