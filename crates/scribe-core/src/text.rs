//! Text utilities shared across the adapter crates.

// ─────────────────────────────────────────────────────────────────────────────
// Truncation
// ─────────────────────────────────────────────────────────────────────────────

/// Truncate a string for log previews, appending an ellipsis when cut.
///
/// Truncation is character-based so multi-byte UTF-8 never splits.
#[must_use]
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{truncated}…")
}

// ─────────────────────────────────────────────────────────────────────────────
// Token estimation
// ─────────────────────────────────────────────────────────────────────────────

/// Rough token estimate: one token per four characters.
///
/// Used for the long-prompt bookending threshold and the Groq context-size
/// warnings. Deliberately cheap; never used for billing.
#[must_use]
pub fn estimate_tokens(s: &str) -> usize {
    s.chars().count().div_ceil(4)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
