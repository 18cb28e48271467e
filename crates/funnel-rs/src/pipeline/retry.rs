//! Retry with exponential backoff around stage logic.
//!
//! The controller never retries: a failed stage aborts the run. Callers who
//! want upstream hiccups (429, 5xx, timeouts) smoothed over wrap a stage's
//! logic in [`RetryLogic`] before handing it to the builder. Only failures
//! that [`classify`] as [`FailureKind::Transient`] are retried; everything
//! else is returned on the spot.

use super::stage::{StageFuture, StageLogic, StageRequest};
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently [`RetryLogic`] re-invokes a stage.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first failure. Zero disables retrying.
    pub max_retries: u32,
    /// Wait before the first re-invocation.
    pub base_delay: Duration,
    /// No wait exceeds this, however many attempts have failed.
    pub max_delay: Duration,
    /// Each wait is this many times the previous one.
    pub backoff_factor: f64,
    /// Trim waits by a small per-attempt amount so concurrent runs hitting
    /// the same upstream do not retry in lockstep.
    pub stagger: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_factor: 2.0,
            stagger: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Wait before re-invocation number `attempt`, counting from 0.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let grown = self.base_delay.mul_f64(self.backoff_factor.powi(attempt as i32));
        let wait = grown.min(self.max_delay);
        if self.stagger {
            // 100%, 90%, 80%, then around again.
            wait.mul_f64(1.0 - 0.1 * f64::from(attempt % 3))
        } else {
            wait
        }
    }
}

/// Whether a stage failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate limits, upstream 5xx, dropped connections, timeouts.
    Transient,
    /// Rejected requests: retrying sends the same bad input again.
    Permanent,
    /// Anything else, e.g. an empty model response. Not retried.
    Unknown,
}

/// Classify a stage failure by its message.
///
/// An `HTTP <status>` marker decides on its own: 429 and 5xx are transient,
/// every other 4xx is permanent. Without one, network wording marks the
/// failure transient.
pub fn classify(message: &str) -> FailureKind {
    if let Some(status) = http_status(message) {
        return match status {
            429 | 500..=599 => FailureKind::Transient,
            400..=499 => FailureKind::Permanent,
            _ => FailureKind::Unknown,
        };
    }
    let lower = message.to_lowercase();
    const NETWORK: [&str; 6] = [
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "broken pipe",
        "request failed:",
    ];
    if NETWORK.iter().any(|m| lower.contains(m)) {
        FailureKind::Transient
    } else if lower.contains("unauthorized") || lower.contains("invalid") {
        FailureKind::Permanent
    } else {
        FailureKind::Unknown
    }
}

/// First `HTTP <3 digits>` status in `message`.
fn http_status(message: &str) -> Option<u16> {
    message.match_indices("HTTP ").find_map(|(at, marker)| {
        let digits = message.get(at + marker.len()..at + marker.len() + 3)?;
        digits.parse().ok()
    })
}

/// [`StageLogic`] decorator that re-invokes the inner logic on transient
/// errors.
#[derive(Debug, Clone)]
pub struct RetryLogic<L> {
    inner: L,
    config: RetryConfig,
}

impl<L: StageLogic> RetryLogic<L> {
    pub fn new(inner: L, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl<L: StageLogic> StageLogic for RetryLogic<L> {
    fn run<'a>(&'a self, request: StageRequest<'a>) -> StageFuture<'a> {
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                match self.inner.run(request).await {
                    Ok(output) => return Ok(output),
                    Err(e) => {
                        if attempt < self.config.max_retries && e.is_transient() {
                            let delay = self.config.backoff(attempt);
                            warn!(
                                "{}: transient error (attempt {}/{}): {e}. Retrying in {delay:?}...",
                                request.stage,
                                attempt + 1,
                                self.config.max_retries,
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        } else {
                            if attempt > 0 {
                                debug!("{}: giving up after {attempt} retries", request.stage);
                            }
                            return Err(e);
                        }
                    }
                }
            }
        })
    }
}
