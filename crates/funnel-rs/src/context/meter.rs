//! Token-cost estimation for artifacts and turns.
//!
//! Exact tokenization depends on the model behind a stage, which this crate
//! never sees. The meter only needs to be stable: the same text must always
//! cost the same, so reduction percentages and tests are reproducible.

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Measures the cost of a text blob in tokens.
///
/// Implementations must be pure: `measure("")` is `0` and identical input
/// always yields identical output.
pub trait SizeMeter: Send + Sync {
    fn measure(&self, text: &str) -> usize;
}

/// Estimates tokens from the number of Unicode scalar values.
///
/// Counts `char`s rather than bytes so multi-byte scripts are not inflated,
/// and rounds up so any non-empty text costs at least one token.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioMeter {
    chars_per_token: f64,
}

impl CharRatioMeter {
    /// Create a meter with a calibrated chars-per-token ratio. Non-positive
    /// or non-finite ratios fall back to the default.
    pub fn with_ratio(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioMeter {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl SizeMeter for CharRatioMeter {
    fn measure(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count();
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Counts whitespace-separated words. Handy in tests where sizes should be
/// obvious from the fixture text.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordMeter;

impl SizeMeter for WordMeter {
    fn measure(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_costs_nothing() {
        assert_eq!(CharRatioMeter::default().measure(""), 0);
        assert_eq!(WordMeter.measure(""), 0);
    }

    #[test]
    fn measure_is_deterministic() {
        let meter = CharRatioMeter::default();
        let text = "Market size reached $45B in 2024, growing 18% YoY.";
        let first = meter.measure(text);
        for _ in 0..10 {
            assert_eq!(meter.measure(text), first);
        }
    }

    #[test]
    fn non_empty_text_costs_at_least_one_token() {
        assert_eq!(CharRatioMeter::default().measure("a"), 1);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let meter = CharRatioMeter::with_ratio(1.0);
        assert_eq!(meter.measure("héllo"), 5);
        assert_eq!(meter.measure("日本語"), 3);
    }

    #[test]
    fn ratio_scales_estimate() {
        let text = "x".repeat(700);
        assert_eq!(CharRatioMeter::default().measure(&text), 200);
        assert_eq!(CharRatioMeter::with_ratio(7.0).measure(&text), 100);
    }

    #[test]
    fn invalid_ratio_falls_back_to_default() {
        assert_eq!(
            CharRatioMeter::with_ratio(0.0).chars_per_token(),
            DEFAULT_CHARS_PER_TOKEN
        );
        assert_eq!(
            CharRatioMeter::with_ratio(f64::NAN).chars_per_token(),
            DEFAULT_CHARS_PER_TOKEN
        );
    }

    #[test]
    fn word_meter_counts_words() {
        assert_eq!(WordMeter.measure("  one two\nthree  "), 3);
    }
}
