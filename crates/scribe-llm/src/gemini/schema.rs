//! Schema normalization for the Gemini API.
//!
//! The API accepts a restricted JSON Schema dialect and rejects requests
//! carrying several common keywords, so supplied schemas are normalized
//! before use: redundant wrapper envelopes are unwrapped and unsupported
//! keywords stripped recursively.

use serde_json::Value;

/// Keywords the Gemini schema dialect rejects.
const UNSUPPORTED_KEYS: &[&str] = &[
    "$schema",
    "$defs",
    "definitions",
    "additionalProperties",
    "default",
    "examples",
    "title",
];

/// Normalize a caller-supplied schema for the Gemini API.
#[must_use]
pub fn normalize_schema(schema: &Value) -> Value {
    strip_unsupported(unwrap_envelope(schema))
}

/// Unwrap redundant envelopes around the actual schema.
///
/// Callers sometimes pass the whole OpenAI-style response-format object
/// (`{"json_schema": {"name": ..., "schema": {...}}}`) or just the inner
/// `{"name": ..., "schema": {...}}` wrapper; the schema itself is what
/// Gemini wants.
fn unwrap_envelope(schema: &Value) -> &Value {
    let mut current = schema;
    loop {
        let Some(obj) = current.as_object() else {
            return current;
        };
        if let Some(inner) = obj.get("json_schema") {
            current = inner;
            continue;
        }
        // {"name"/"strict"/..., "schema": {...}} wrapper, but not a real
        // schema that happens to have a "schema" property
        if let Some(inner) = obj.get("schema") {
            if !obj.contains_key("type") && !obj.contains_key("properties") {
                current = inner;
                continue;
            }
        }
        return current;
    }
}

fn strip_unsupported(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => Value::Object(
            obj.iter()
                .filter(|(key, _)| !UNSUPPORTED_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), strip_unsupported(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_unsupported).collect()),
        other => other.clone(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_schema_passes_through() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        assert_eq!(normalize_schema(&schema), schema);
    }

    #[test]
    fn strips_unsupported_keys_recursively() {
        let schema = json!({
            "$schema": "https://json-schema.org/draft-07/schema",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "name": {"type": "string", "default": "x", "title": "Name"}
            }
        });
        let normalized = normalize_schema(&schema);
        assert!(normalized.get("$schema").is_none());
        assert!(normalized.get("additionalProperties").is_none());
        assert!(normalized["properties"]["name"].get("default").is_none());
        assert!(normalized["properties"]["name"].get("title").is_none());
        assert_eq!(normalized["properties"]["name"]["type"], "string");
    }

    #[test]
    fn unwraps_response_format_envelope() {
        let envelope = json!({
            "json_schema": {
                "name": "response",
                "strict": true,
                "schema": {"type": "object", "properties": {"v": {"type": "number"}}}
            }
        });
        let normalized = normalize_schema(&envelope);
        assert_eq!(normalized["type"], "object");
        assert!(normalized.get("name").is_none());
    }

    #[test]
    fn unwraps_bare_schema_wrapper() {
        let envelope = json!({
            "name": "thing",
            "schema": {"type": "array", "items": {"type": "string"}}
        });
        let normalized = normalize_schema(&envelope);
        assert_eq!(normalized["type"], "array");
    }

    #[test]
    fn schema_property_named_schema_not_unwrapped() {
        // A real schema with a property called "schema" must stay intact.
        let schema = json!({
            "type": "object",
            "properties": {"schema": {"type": "string"}}
        });
        assert_eq!(normalize_schema(&schema), schema);
    }

    #[test]
    fn strips_inside_arrays() {
        let schema = json!({
            "type": "object",
            "anyOf": [
                {"type": "string", "examples": ["a"]},
                {"type": "number", "default": 1}
            ]
        });
        let normalized = normalize_schema(&schema);
        assert!(normalized["anyOf"][0].get("examples").is_none());
        assert!(normalized["anyOf"][1].get("default").is_none());
    }
}
