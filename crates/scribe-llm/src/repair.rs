//! Heuristic repair for malformed JSON text.
//!
//! Applied only on demand, never automatically inside the validator.
//! Heuristics run in a fixed order and each records a diagnostic entry when
//! it changes the text:
//!
//! 1. strip trailing commas before a closing bracket
//! 2. insert a missing comma between adjacent object/array boundaries
//! 3. convert single-quoted keys to double-quoted
//! 4. quote bare identifier keys
//! 5. append missing closing braces/brackets
//!
//! Repair never guarantees validity — it only improves the odds. Already
//! valid input is returned untouched with an empty fix list.

/// Result of a repair pass: the (possibly) corrected text and the list of
/// fixes that were applied, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Repaired text.
    pub text: String,
    /// Human-readable descriptions of the fixes applied, in order.
    pub fixes: Vec<String>,
}

/// Attempt to repair malformed JSON text.
#[must_use]
pub fn repair_json(input: &str) -> RepairOutcome {
    // Valid input passes through untouched — keeps the pass idempotent.
    if serde_json::from_str::<serde_json::Value>(input).is_ok() {
        return RepairOutcome {
            text: input.to_string(),
            fixes: Vec::new(),
        };
    }

    let mut fixes = Vec::new();
    let mut text = input.to_string();

    let (stripped, count) = strip_trailing_commas(&text);
    if count > 0 {
        fixes.push(format!("removed {count} trailing comma(s)"));
        text = stripped;
    }

    let (joined, count) = insert_missing_commas(&text);
    if count > 0 {
        fixes.push(format!("inserted {count} missing comma(s)"));
        text = joined;
    }

    let (requoted, count) = double_quote_single_quoted_keys(&text);
    if count > 0 {
        fixes.push(format!("converted {count} single-quoted key(s)"));
        text = requoted;
    }

    let (quoted, count) = quote_bare_keys(&text);
    if count > 0 {
        fixes.push(format!("quoted {count} bare key(s)"));
        text = quoted;
    }

    let (balanced, appended) = balance_brackets(&text);
    if !appended.is_empty() {
        fixes.push(format!("appended closing sequence \"{appended}\""));
        text = balanced;
    }

    RepairOutcome { text, fixes }
}

/// Iterate characters with an in-double-quoted-string flag.
///
/// The callback receives `(ch, in_string)` and pushes replacement output.
fn scan(input: &str, mut f: impl FnMut(char, bool, &mut String)) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in input.chars() {
        let was_in_string = in_string;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if ch == '"' {
            in_string = true;
        }
        f(ch, was_in_string || in_string, &mut out);
    }
    out
}

/// Next non-whitespace character at or after `pos`.
fn next_significant(chars: &[char], pos: usize) -> Option<char> {
    chars[pos..].iter().copied().find(|c| !c.is_whitespace())
}

fn strip_trailing_commas(input: &str) -> (String, usize) {
    let chars: Vec<char> = input.chars().collect();
    let mut count = 0usize;
    let mut idx = 0usize;
    let out = scan(input, |ch, in_string, out| {
        let here = idx;
        idx += 1;
        if !in_string
            && ch == ','
            && matches!(next_significant(&chars, here + 1), Some('}' | ']'))
        {
            count += 1;
            return;
        }
        out.push(ch);
    });
    (out, count)
}

fn insert_missing_commas(input: &str) -> (String, usize) {
    let chars: Vec<char> = input.chars().collect();
    let mut count = 0usize;
    let mut idx = 0usize;
    let out = scan(input, |ch, in_string, out| {
        let here = idx;
        idx += 1;
        out.push(ch);
        if !in_string
            && matches!(ch, '}' | ']')
            && matches!(next_significant(&chars, here + 1), Some('{' | '['))
        {
            out.push(',');
            count += 1;
        }
    });
    (out, count)
}

fn double_quote_single_quoted_keys(input: &str) -> (String, usize) {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut count = 0usize;
    let mut i = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == '\'' {
            // Find the closing quote, then require a ':' after it for this to
            // be a key position.
            if let Some(close) = chars[i + 1..].iter().position(|&c| c == '\'') {
                let close = i + 1 + close;
                if next_significant(&chars, close + 1) == Some(':') {
                    out.push('"');
                    out.extend(&chars[i + 1..close]);
                    out.push('"');
                    count += 1;
                    i = close + 1;
                    continue;
                }
            }
        }
        out.push(ch);
        i += 1;
    }
    (out, count)
}

fn quote_bare_keys(input: &str) -> (String, usize) {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut count = 0usize;
    let mut i = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    // Last significant character emitted outside strings.
    let mut prev_significant: Option<char> = None;

    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == '"' {
            in_string = true;
            prev_significant = Some(ch);
            out.push(ch);
            i += 1;
            continue;
        }
        // A bare key: identifier in key position ({ or , before, : after).
        if (ch.is_ascii_alphabetic() || ch == '_')
            && matches!(prev_significant, Some('{' | ','))
        {
            let start = i;
            let mut end = i;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            if next_significant(&chars, end) == Some(':') {
                out.push('"');
                out.extend(&chars[start..end]);
                out.push('"');
                count += 1;
                prev_significant = Some('"');
                i = end;
                continue;
            }
        }
        if !ch.is_whitespace() {
            prev_significant = Some(ch);
        }
        out.push(ch);
        i += 1;
    }
    (out, count)
}

fn balance_brackets(input: &str) -> (String, String) {
    let mut stack: Vec<char> = Vec::new();
    let _ = scan(input, |ch, in_string, _out| {
        if in_string {
            return;
        }
        match ch {
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    let _ = stack.pop();
                }
            }
            _ => {}
        }
    });

    if stack.is_empty() {
        return (input.to_string(), String::new());
    }
    let appended: String = stack.iter().rev().collect();
    (format!("{input}{appended}"), appended)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
