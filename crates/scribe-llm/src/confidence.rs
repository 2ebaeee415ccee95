//! Confidence scoring from per-token log-probabilities.
//!
//! Providers that support logprobs attach a `(token, logprob)` list to the
//! result; this module collapses it into summary metrics callers can gate on.

use serde::{Deserialize, Serialize};

/// Probability below which a token counts as low-confidence.
const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// One generated token with its log-probability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    /// Token text as returned by the provider.
    pub token: String,
    /// Natural-log probability of the token.
    pub logprob: f64,
}

/// Summary confidence metrics over a token sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceSummary {
    /// Mean token probability.
    pub mean: f64,
    /// Minimum token probability.
    pub min: f64,
    /// Maximum token probability.
    pub max: f64,
    /// Number of tokens with probability below 0.5.
    pub low_confidence_count: usize,
}

/// Aggregate per-token log-probabilities into summary metrics.
///
/// Each logprob is converted to a probability via `exp`. Empty input yields
/// the all-zero summary, not an error.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn summarize_logprobs(tokens: &[TokenLogprob]) -> ConfidenceSummary {
    if tokens.is_empty() {
        return ConfidenceSummary::default();
    }

    let mut sum = 0.0f64;
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut low = 0usize;

    for t in tokens {
        let p = t.logprob.exp();
        sum += p;
        min = min.min(p);
        max = max.max(p);
        if p < LOW_CONFIDENCE_THRESHOLD {
            low += 1;
        }
    }

    ConfidenceSummary {
        mean: sum / tokens.len() as f64,
        min,
        max,
        low_confidence_count: low,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
