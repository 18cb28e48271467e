//! Context lifecycle: size metering, the sliding window, and compaction.
//!
//! Every stage of a run sees a bounded slice of state. This module provides
//! the three pieces that keep it bounded:
//!
//! 1. **[`meter`]**: [`SizeMeter`] estimates the token cost of a text blob.
//!    Deterministic, so reduction accounting is reproducible.
//!
//! 2. **[`window`]**: [`SlidingWindow`] keeps every system turn plus the most
//!    recent non-system turns up to a retention limit.
//!
//! 3. **[`gate`]**: [`CompactionGate`] replaces a raw artifact with its
//!    summary and deletes the raw, recording before/after sizes.

pub mod gate;
pub mod meter;
pub mod window;

// Re-export commonly used items at the module level.
pub use gate::{CompactionGate, CompactionRecord, reduction_percent};
pub use meter::{CharRatioMeter, DEFAULT_CHARS_PER_TOKEN, SizeMeter};
pub use window::SlidingWindow;
