//! Character-ratio token estimation.
//!
//! Neither estimator is a tokenizer. Counts are `ceil(chars / ratio)` over
//! Unicode scalar values and must be treated as heuristics.

/// Estimates tokens from character length with a fixed ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    pub chars_per_token: f64,
}

impl TokenEstimator {
    /// Ratio used when sizing chunks for embedding.
    pub const CHUNKER: Self = Self { chars_per_token: 3.5 };

    /// Ratio used when fitting memories into a context window.
    pub const CONTEXT: Self = Self { chars_per_token: 4.0 };

    pub fn new(chars_per_token: f64) -> Self {
        Self { chars_per_token }
    }

    pub fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as usize
    }

    /// Inverse of [`estimate`](Self::estimate): characters that fit in `tokens`.
    pub fn chars_for(&self, tokens: usize) -> usize {
        (tokens as f64 * self.chars_per_token).floor() as usize
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::CHUNKER
    }
}
