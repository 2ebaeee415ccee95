//! Response validation for structured-output completions.
//!
//! The validator classifies raw model output (refusal / empty / truncated /
//! malformed JSON / preamble-postamble) and extracts clean structured data.
//! It is purely descriptive: it never fails and never mutates caller state.
//! Callers decide whether to retry, accept with warnings, or give up.

use serde_json::Value;

use scribe_core::text::truncate_str;

// ─────────────────────────────────────────────────────────────────────────────
// Options and report
// ─────────────────────────────────────────────────────────────────────────────

/// What the caller expects from the response text.
#[derive(Clone, Debug, Default)]
pub struct ValidationOptions {
    /// Expect a JSON payload.
    pub expect_json: bool,
    /// Expect the top-level JSON value to be an array (implies `expect_json`).
    pub expect_array: bool,
    /// Dot-separated field paths that must resolve in the parsed value.
    pub required_fields: Vec<String>,
    /// Minimum acceptable text length in characters.
    pub min_length: Option<usize>,
    /// Maximum acceptable text length in characters.
    pub max_length: Option<usize>,
}

/// Outcome of validating one response.
///
/// Invariants: `confidence == 0.0` implies `!is_valid`; a detected refusal
/// caps confidence at 0.1 and short-circuits all further checks.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    /// Whether the response satisfies every expectation.
    pub is_valid: bool,
    /// Hard failures.
    pub errors: Vec<String>,
    /// Soft findings that did not invalidate the response on their own.
    pub warnings: Vec<String>,
    /// Aggregate confidence in `[0, 1]`.
    pub confidence: f64,
    /// The model declined the task.
    pub is_refusal: bool,
    /// Output appears cut off.
    pub is_truncated: bool,
    /// Conversational text preceded the payload.
    pub had_preamble: bool,
    /// Conversational text followed the payload.
    pub had_postamble: bool,
    /// Parsed JSON value, when extraction succeeded.
    pub parsed: Option<Value>,
    /// Payload text after preamble/postamble stripping and bracket bounding.
    pub cleaned_text: Option<String>,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            is_valid: true,
            confidence: 1.0,
            ..Self::default()
        }
    }

    fn penalize(&mut self, factor: f64) {
        self.confidence = (self.confidence * factor).clamp(0.0, 1.0);
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(error.into());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Refusal detection
// ─────────────────────────────────────────────────────────────────────────────

/// Phrases that indicate the model declined the task. Matched against the
/// lowercased head of the response; there is no explicit API signal for this.
const REFUSAL_PATTERNS: &[&str] = &[
    "i cannot",
    "i can't",
    "i can not",
    "i'm sorry",
    "i am sorry",
    "i apologize",
    "as an ai",
    "i'm unable",
    "i am unable",
    "i'm not able",
    "i am not able",
    "i won't",
    "i will not",
    "unfortunately, i",
];

/// How much of the response head the refusal scan covers.
const REFUSAL_SCAN_CHARS: usize = 200;

fn detect_refusal(text: &str) -> bool {
    // A payload that already starts with a JSON bracket is never treated as
    // a refusal, even if it contains apology-like strings.
    if text.starts_with('{') || text.starts_with('[') {
        return false;
    }
    let head: String = text
        .chars()
        .take(REFUSAL_SCAN_CHARS)
        .collect::<String>()
        .to_lowercase();
    REFUSAL_PATTERNS.iter().any(|p| head.contains(p))
}

// ─────────────────────────────────────────────────────────────────────────────
// Preamble / postamble stripping
// ─────────────────────────────────────────────────────────────────────────────

/// Conversational lead-ins recognized as preamble.
const PREAMBLE_STARTS: &[&str] = &[
    "here is", "here's", "here are", "sure", "certainly", "okay", "of course", "below is",
    "the following", "this is the",
];

/// Trailing pleasantries recognized as postamble.
const POSTAMBLE_STARTS: &[&str] = &[
    "let me know",
    "i hope",
    "hope this",
    "feel free",
    "is there anything",
    "note:",
    "please note",
];

fn is_preamble_line(line: &str) -> bool {
    let lower = line.trim().to_lowercase();
    lower.starts_with("```")
        || lower.ends_with(':')
        || PREAMBLE_STARTS.iter().any(|p| lower.starts_with(p))
}

fn is_postamble_line(line: &str) -> bool {
    let lower = line.trim().to_lowercase();
    lower.starts_with("```") || POSTAMBLE_STARTS.iter().any(|p| lower.starts_with(p))
}

/// Strip recognized preamble/postamble from the ends of `text`, recording
/// findings on the report.
fn strip_surrounding_prose<'a>(text: &'a str, report: &mut ValidationReport) -> &'a str {
    let mut current = text;

    // Full code-fence unwrap is the common well-behaved case: one strip,
    // lighter penalty.
    if let Some(unwrapped) = unwrap_code_fence(current) {
        report.had_preamble = true;
        report.had_postamble = true;
        report.penalize(0.95);
        report.warnings.push("unwrapped code fence".into());
        return unwrapped.trim();
    }

    // Line spans as byte offsets into `current`, newlines included.
    let spans = line_spans(current);

    // Leading lines before the first bracket line.
    if let Some(first_payload) = spans
        .iter()
        .position(|&(s, e)| current[s..e].trim_start().starts_with(['{', '[']))
    {
        let leading = &spans[..first_payload];
        let nonempty =
            |&&(s, e): &&(usize, usize)| !current[s..e].trim().is_empty();
        if leading.iter().any(|span| nonempty(&span)) {
            if leading
                .iter()
                .filter(nonempty)
                .all(|&(s, e)| is_preamble_line(&current[s..e]))
            {
                current = &current[spans[first_payload].0..];
                report.had_preamble = true;
                report.penalize(0.9);
                report.warnings.push("stripped preamble".into());
            } else {
                report
                    .warnings
                    .push("unrecognized leading content before payload".into());
            }
        }
    }

    // Trailing lines after the last bracket line.
    let spans = line_spans(current);
    if let Some(last_payload) = spans
        .iter()
        .rposition(|&(s, e)| current[s..e].trim_end().ends_with(['}', ']']))
    {
        let trailing = &spans[last_payload + 1..];
        let nonempty =
            |&&(s, e): &&(usize, usize)| !current[s..e].trim().is_empty();
        if trailing.iter().any(|span| nonempty(&span)) {
            if trailing
                .iter()
                .filter(nonempty)
                .all(|&(s, e)| is_postamble_line(&current[s..e]))
            {
                current = &current[..spans[last_payload].1];
                report.had_postamble = true;
                report.penalize(0.9);
                report.warnings.push("stripped postamble".into());
            } else {
                report
                    .warnings
                    .push("unrecognized trailing content after payload".into());
            }
        }
    }

    current.trim()
}

/// Byte spans of each line, newline excluded from the span content.
fn line_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    for segment in text.split_inclusive('\n') {
        let end = start + segment.len();
        let content_end = start + segment.trim_end_matches(['\n', '\r']).len();
        spans.push((start, content_end));
        start = end;
    }
    spans
}

/// Unwrap a response that is exactly one fenced code block.
fn unwrap_code_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    // Drop the info string ("json", "JSON", …) on the opening line.
    let body_start = rest.find('\n')?;
    let body = &rest[body_start + 1..];
    let body = body.trim_end();
    body.strip_suffix("```").map(str::trim_end)
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate raw completion text against the caller's expectations.
///
/// Never panics and never returns an error — findings are data.
#[must_use]
pub fn validate_response(text: &str, options: &ValidationOptions) -> ValidationReport {
    let mut report = ValidationReport::ok();

    let trimmed = text.trim();
    if trimmed.is_empty() {
        report.confidence = 0.0;
        report.fail("empty response");
        return report;
    }

    if detect_refusal(trimmed) {
        report.is_refusal = true;
        report.confidence = 0.1;
        report.fail("model refused the task");
        return report;
    }

    let char_count = trimmed.chars().count();
    if let Some(min) = options.min_length {
        if char_count < min {
            report.penalize(0.5);
            report.fail(format!("response length {char_count} below minimum {min}"));
        }
    }
    if let Some(max) = options.max_length {
        if char_count > max {
            report.penalize(0.8);
            report.is_truncated = true;
            report
                .warnings
                .push(format!("response length {char_count} above maximum {max}"));
        }
    }

    if !options.expect_json && !options.expect_array {
        report.cleaned_text = Some(trimmed.to_string());
        return report;
    }

    let cleaned = strip_surrounding_prose(trimmed, &mut report);

    let (open, close) = if options.expect_array {
        ('[', ']')
    } else {
        ('{', '}')
    };

    let Some(start) = cleaned.find(open) else {
        report.fail(format!("no opening '{open}' found in response"));
        mark_truncation_from_braces(trimmed, &mut report);
        return report;
    };
    let Some(end) = cleaned.rfind(close) else {
        report.fail(format!("no closing '{close}' found in response"));
        mark_truncation_from_braces(trimmed, &mut report);
        return report;
    };
    if end < start {
        report.fail("closing bracket precedes opening bracket");
        return report;
    }

    let candidate = &cleaned[start..=end];
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) => {
            if options.expect_array && !value.is_array() {
                report.penalize(0.3);
                report.fail("expected a JSON array, found a different type");
            } else if !options.expect_array && !value.is_object() {
                report.penalize(0.3);
                report.fail("expected a JSON object, found a different type");
            }

            check_required_fields(&value, &options.required_fields, &mut report);

            report.cleaned_text = Some(candidate.to_string());
            report.parsed = Some(value);
        }
        Err(e) => {
            report.penalize(0.3);
            report.fail(format!(
                "JSON parse error at offset {}: {} (context: {})",
                parse_error_offset(candidate, &e),
                e,
                parse_error_context(candidate, &e),
            ));
            mark_truncation_from_braces(trimmed, &mut report);
        }
    }

    if report.confidence <= f64::EPSILON {
        report.is_valid = false;
    }
    report
}

/// Confirm each dot-separated field path resolves to a defined value.
///
/// Any missing path invalidates; the 0.5 penalty is applied once, not per
/// path.
fn check_required_fields(value: &Value, paths: &[String], report: &mut ValidationReport) {
    let mut any_missing = false;
    for path in paths {
        if resolve_path(value, path).is_none() {
            report.fail(format!("required field missing: {path}"));
            any_missing = true;
        }
    }
    if any_missing {
        report.penalize(0.5);
    }
}

fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}

/// Heuristic: an unbalanced opening-brace surplus in the raw text suggests
/// the output was cut off mid-structure.
fn mark_truncation_from_braces(raw: &str, report: &mut ValidationReport) {
    let opens = raw.matches('{').count();
    let closes = raw.matches('}').count();
    if opens > closes {
        report.is_truncated = true;
        report
            .warnings
            .push(format!("unbalanced braces ({opens} open, {closes} close)"));
    }
}

fn parse_error_offset(candidate: &str, e: &serde_json::Error) -> usize {
    let line = e.line().max(1);
    let column = e.column();
    let preceding: usize = candidate
        .lines()
        .take(line - 1)
        .map(|l| l.len() + 1)
        .sum();
    preceding + column.saturating_sub(1)
}

fn parse_error_context(candidate: &str, e: &serde_json::Error) -> String {
    let offset = parse_error_offset(candidate, e);
    let start = offset.saturating_sub(24);
    // Snap to char boundaries.
    let start = (0..=start).rev().find(|i| candidate.is_char_boundary(*i)).unwrap_or(0);
    let end = (offset + 24).min(candidate.len());
    let end = (end..=candidate.len())
        .find(|i| candidate.is_char_boundary(*i))
        .unwrap_or(candidate.len());
    truncate_str(&candidate[start..end].replace('\n', " "), 60)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
