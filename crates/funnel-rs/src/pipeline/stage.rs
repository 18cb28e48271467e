//! Stage descriptors and the stage-logic seam.
//!
//! A [`StageDescriptor`] is static configuration: which keys a stage may
//! read, which key it writes, and (for compactors and synthesis) an output
//! cap. What a stage actually *does* lives behind the [`StageLogic`] trait,
//! which receives the resolved input texts and the current context window
//! and returns the output text. The core never looks inside.

use crate::Turn;
use crate::error::StageLogicError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Boxed future returned by [`StageLogic::run`].
pub type StageFuture<'a> = BoxFuture<'a, Result<String, StageLogicError>>;

/// What a stage does with the store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Generates a raw artifact.
    Producer,
    /// Replaces a raw artifact with a bounded summary.
    Compactor,
    /// Reads summaries and writes the run's final output.
    Synthesis,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Producer => write!(f, "producer"),
            StageKind::Compactor => write!(f, "compactor"),
            StageKind::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Static configuration for one pipeline stage.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: String,
    pub kind: StageKind,
    /// Keys the stage may read, in the order its logic receives them.
    pub input_keys: Vec<String>,
    /// Key the stage writes.
    pub output_key: String,
    /// Advisory output cap in tokens. Compactor and synthesis stages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<usize>,
}

impl StageDescriptor {
    pub fn producer<I, S>(name: impl Into<String>, input_keys: I, output_key: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: StageKind::Producer,
            input_keys: input_keys.into_iter().map(Into::into).collect(),
            output_key: output_key.into(),
            max_output_tokens: None,
        }
    }

    pub fn compactor(
        name: impl Into<String>,
        raw_key: impl Into<String>,
        summary_key: impl Into<String>,
        max_output_tokens: usize,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Compactor,
            input_keys: vec![raw_key.into()],
            output_key: summary_key.into(),
            max_output_tokens: Some(max_output_tokens),
        }
    }

    pub fn synthesis<I, S>(
        name: impl Into<String>,
        input_keys: I,
        output_key: impl Into<String>,
        max_output_tokens: Option<usize>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: StageKind::Synthesis,
            input_keys: input_keys.into_iter().map(Into::into).collect(),
            output_key: output_key.into(),
            max_output_tokens,
        }
    }
}

/// Everything a stage's logic may see for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct StageRequest<'a> {
    pub stage: &'a str,
    pub kind: StageKind,
    /// Input texts in `input_keys` order; absent keys arrive as `""`.
    pub inputs: &'a [String],
    /// The sliding window as of this invocation.
    pub window: &'a [Turn],
    pub max_output_tokens: Option<usize>,
}

impl StageRequest<'_> {
    pub fn to_owned(&self) -> StageInput {
        StageInput {
            stage: self.stage.to_string(),
            kind: self.kind,
            inputs: self.inputs.to_vec(),
            window: self.window.to_vec(),
            max_output_tokens: self.max_output_tokens,
        }
    }
}

/// Owned copy of a [`StageRequest`], handed to [`FnLogic`] closures.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInput {
    pub stage: String,
    pub kind: StageKind,
    pub inputs: Vec<String>,
    pub window: Vec<Turn>,
    pub max_output_tokens: Option<usize>,
}

/// The external behavior of a stage: `(inputs, window) -> output`.
///
/// Implementations may block on network calls; the controller treats each
/// call as one opaque suspension point with no timeout of its own. Uses a
/// boxed future so that the trait is dyn-compatible.
///
/// # Example
///
/// ```ignore
/// struct Upper;
///
/// impl StageLogic for Upper {
///     fn run<'a>(&'a self, request: StageRequest<'a>) -> StageFuture<'a> {
///         Box::pin(async move { Ok(request.inputs.join("\n").to_uppercase()) })
///     }
/// }
/// ```
pub trait StageLogic: Send + Sync {
    fn run<'a>(&'a self, request: StageRequest<'a>) -> StageFuture<'a>;
}

impl<T: StageLogic + ?Sized> StageLogic for Arc<T> {
    fn run<'a>(&'a self, request: StageRequest<'a>) -> StageFuture<'a> {
        (**self).run(request)
    }
}

impl<T: StageLogic + ?Sized> StageLogic for Box<T> {
    fn run<'a>(&'a self, request: StageRequest<'a>) -> StageFuture<'a> {
        (**self).run(request)
    }
}

/// Type-erased closure behind [`FnLogic`].
type ErasedHandler = Box<dyn Fn(StageInput) -> StageFuture<'static> + Send + Sync>;

/// Closure-based [`StageLogic`].
///
/// The closure receives an owned [`StageInput`] and returns a future, so it
/// can move what it needs into the future without lifetime gymnastics:
///
/// ```ignore
/// let producer = FnLogic::new(|input| async move {
///     Ok(format!("findings for {}", input.inputs[0]))
/// });
/// ```
pub struct FnLogic {
    handler: ErasedHandler,
}

impl FnLogic {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(StageInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, StageLogicError>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |input| Box::pin(handler(input))),
        }
    }
}

impl std::fmt::Debug for FnLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnLogic").finish_non_exhaustive()
    }
}

impl StageLogic for FnLogic {
    fn run<'a>(&'a self, request: StageRequest<'a>) -> StageFuture<'a> {
        (self.handler)(request.to_owned())
    }
}
