//! Shared chat-completions wire layer.
//!
//! The OpenAI-compatible back-end and both Groq model families speak the same
//! `/chat/completions` dialect; this module holds the request/response types,
//! the HTTP send path, and API error parsing they share. Provider-specific
//! payload quirks stay in the adapter modules.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use scribe_core::retry::parse_retry_after_header;

use crate::confidence::TokenLogprob;
use crate::provider::{ProviderError, ProviderResult, TokenUsage};

// ─────────────────────────────────────────────────────────────────────────────
// Request types
// ─────────────────────────────────────────────────────────────────────────────

/// One conversation turn on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"developer"`, `"user"` or `"assistant"`.
    pub role: String,
    /// Turn text.
    pub content: String,
}

impl ChatMessage {
    /// Build a turn from a role string and content.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A `/chat/completions` request body.
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    /// Model id.
    pub model: String,
    /// Ordered conversation turns.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Output token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Nucleus-sampling threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Reproducibility seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Structured-output format directive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    /// Stop sequences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Request per-token log-probabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    /// Predicted-output hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Value>,
    /// Reasoning-effort toggle (model families that support it).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Whether to stream the response.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl ChatRequest {
    /// A request with only the required fields set.
    #[must_use]
    pub fn new(model: String, messages: Vec<ChatMessage>) -> Self {
        Self {
            model,
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
            seed: None,
            response_format: None,
            stop: None,
            logprobs: None,
            prediction: None,
            reasoning_effort: None,
            stream: false,
        }
    }
}

/// The loose JSON-object response format directive.
#[must_use]
pub fn json_object_format() -> Value {
    json!({"type": "json_object"})
}

/// The strict schema-validated response format directive.
#[must_use]
pub fn json_schema_format(schema: &Value) -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "response",
            "strict": true,
            "schema": schema,
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Response types
// ─────────────────────────────────────────────────────────────────────────────

/// A non-streaming `/chat/completions` response body.
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    /// Model that served the request.
    #[serde(default)]
    pub model: Option<String>,
    /// Completion choices; the adapters use the first.
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    /// Token accounting.
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

/// One completion choice.
#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    /// The assistant message.
    #[serde(default)]
    pub message: Option<ChatChoiceMessage>,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: Option<String>,
    /// Per-token log-probabilities, when requested.
    #[serde(default)]
    pub logprobs: Option<ChatLogprobs>,
}

/// The message inside a choice.
#[derive(Debug, Deserialize)]
pub struct ChatChoiceMessage {
    /// Produced text.
    #[serde(default)]
    pub content: Option<String>,
}

/// Logprob container inside a choice.
#[derive(Debug, Deserialize)]
pub struct ChatLogprobs {
    /// Per-token entries.
    #[serde(default)]
    pub content: Option<Vec<ChatTokenLogprob>>,
}

/// One token with its log-probability.
#[derive(Debug, Deserialize)]
pub struct ChatTokenLogprob {
    /// Token text.
    pub token: String,
    /// Natural-log probability.
    pub logprob: f64,
}

/// Token accounting on the wire.
#[derive(Debug, Deserialize)]
pub struct ChatUsage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Tokens generated.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Prompt plus completion.
    #[serde(default)]
    pub total_tokens: u64,
}

impl From<ChatUsage> for TokenUsage {
    fn from(usage: ChatUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

/// Flatten a choice's logprob container into the scorer's input shape.
#[must_use]
pub fn collect_logprobs(choice: &ChatChoice) -> Option<Vec<TokenLogprob>> {
    let entries = choice.logprobs.as_ref()?.content.as_ref()?;
    Some(
        entries
            .iter()
            .map(|t| TokenLogprob {
                token: t.token.clone(),
                logprob: t.logprob,
            })
            .collect(),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming chunk types
// ─────────────────────────────────────────────────────────────────────────────

/// One streamed `/chat/completions` chunk.
#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    /// Incremental choices.
    #[serde(default)]
    pub choices: Vec<ChatChunkChoice>,
}

/// One choice inside a streamed chunk.
#[derive(Debug, Deserialize)]
pub struct ChatChunkChoice {
    /// Incremental delta.
    #[serde(default)]
    pub delta: ChatChunkDelta,
    /// Present on the final chunk for this choice.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The delta payload of a streamed chunk.
#[derive(Debug, Default, Deserialize)]
pub struct ChatChunkDelta {
    /// Text fragment, absent on role/metadata chunks.
    #[serde(default)]
    pub content: Option<String>,
}

/// Extract the text fragment from one streamed SSE data payload.
///
/// Role-only and metadata chunks carry no content and yield `None`.
#[must_use]
pub fn chunk_text(data: &str) -> Option<String> {
    let chunk: ChatChunk = serde_json::from_str(data).ok()?;
    chunk
        .choices
        .into_iter()
        .next()?
        .delta
        .content
        .filter(|c| !c.is_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP send path
// ─────────────────────────────────────────────────────────────────────────────

/// Bearer-auth headers for a chat request.
pub fn bearer_headers(api_key: &str) -> ProviderResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let auth_value = format!("Bearer {api_key}");
    let _ = headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&auth_value).map_err(|e| ProviderError::Config {
            message: format!("Invalid API key header: {e}"),
        })?,
    );
    Ok(headers)
}

/// POST a JSON body and return the raw response, converting non-2xx
/// statuses to typed errors. Also used by the Gemini adapter, whose error
/// envelope [`parse_api_error`] already understands.
pub async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    body: &T,
) -> ProviderResult<reqwest::Response> {
    let response = client.post(url).headers(headers).json(body).send().await?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after_header);
    let text = response.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), retry_after, &text))
}

/// POST a chat request with Bearer auth.
pub async fn post_chat(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    request: &ChatRequest,
) -> ProviderResult<reqwest::Response> {
    post_json(client, url, bearer_headers(api_key)?, request).await
}

/// Build the typed error for a non-2xx response.
fn status_error(status: u16, retry_after_ms: Option<u64>, body: &str) -> ProviderError {
    let info = parse_api_error(body, status);
    if status == 429 {
        return ProviderError::RateLimited {
            retry_after_ms: retry_after_ms.unwrap_or(0),
            message: info.message,
        };
    }
    ProviderError::Api {
        status,
        message: info.message,
        code: info.code,
        retryable: info.retryable,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API error parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parsed API error information.
pub struct ApiErrorInfo {
    /// Human-readable error message.
    pub message: String,
    /// Provider-specific error code (e.g. `"model_not_found"`, `"NOT_FOUND"`).
    pub code: Option<String>,
    /// Whether the request can be retried (429 or 5xx).
    pub retryable: bool,
}

/// Parse an API error response body into structured error info.
///
/// Handles multiple error envelope formats:
/// - Standard: `{"error": {"message": "...", "type": "..."}}`
/// - Google:   `{"error": {"message": "...", "status": "..."}}`
/// - Detail:   `{"detail": "..."}`
/// - Flat:     `{"message": "...", "code": "..."}`
///
/// Falls back to the raw body text when nothing matches.
pub fn parse_api_error(body: &str, status: u16) -> ApiErrorInfo {
    let retryable = status == 429 || status >= 500;

    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = json["error"]["message"].as_str() {
            let code = json["error"]["type"]
                .as_str()
                .or_else(|| json["error"]["status"].as_str())
                .map(String::from);
            return ApiErrorInfo {
                message: msg.to_string(),
                code,
                retryable,
            };
        }

        if let Some(msg) = json["detail"].as_str().or_else(|| json["message"].as_str()) {
            let code = json["code"]
                .as_str()
                .or_else(|| json["type"].as_str())
                .map(String::from);
            return ApiErrorInfo {
                message: msg.to_string(),
                code,
                retryable,
            };
        }

        // Valid JSON but unrecognized structure — include raw body
        return ApiErrorInfo {
            message: format!("HTTP {status}: {body}"),
            code: None,
            retryable,
        };
    }

    ApiErrorInfo {
        message: format!("HTTP {status}: {body}"),
        code: None,
        retryable,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
