//! # Completion Provider Contract
//!
//! Core abstraction for the completion back-ends. Every adapter
//! (OpenAI-compatible, Gemini, Groq/Llama, Groq/Qwen) implements
//! [`CompletionProvider`] to expose a unified request/stream/health surface.
//!
//! Adapter instances hold only read-only configuration set at construction;
//! all per-call state is scoped to the call, so one instance can serve
//! concurrent calls without interference.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::error;

use scribe_core::messages::{Message, ProviderKind};
use scribe_core::retry::RetryConfig;

use crate::confidence::TokenLogprob;
use crate::validation::{ValidationOptions, ValidationReport};

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Default per-request timeout when neither the call nor the adapter
/// specifies one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline used by [`CompletionProvider::health_check`].
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Prompt issued by the shared health check.
const HEALTH_CHECK_PROMPT: &str =
    "Return exactly this JSON object and nothing else: {\"status\": \"healthy\"}";

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Provider returned an API error.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error description.
        message: String,
        /// Provider-specific error code.
        code: Option<String>,
        /// Whether this error can be retried.
        retryable: bool,
    },

    /// Rate limited by the provider (HTTP 429).
    #[error("Rate limited: retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested retry delay in milliseconds.
        retry_after_ms: u64,
        /// Error description.
        message: String,
    },

    /// The per-attempt deadline elapsed.
    #[error("Request timed out after {elapsed_ms}ms")]
    Timeout {
        /// Deadline that elapsed, in milliseconds.
        elapsed_ms: u64,
    },

    /// The caller cancelled the request. Never retried.
    #[error("Request cancelled by caller")]
    Cancelled,

    /// Adapter misconfiguration (missing API key, missing model, bad URL).
    #[error("Configuration error: {message}")]
    Config {
        /// Error description.
        message: String,
    },
}

impl ProviderError {
    /// Whether this error is retryable.
    ///
    /// Only transient transport failures and retryable API statuses (5xx,
    /// 429) qualify. Timeouts surface to the caller; a deliberate
    /// cancellation is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| {
                        s == reqwest::StatusCode::TOO_MANY_REQUESTS || s.is_server_error()
                    })
            }
            Self::RateLimited { .. } => true,
            Self::Api { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::Cancelled | Self::Json(_) | Self::Config { .. } => false,
        }
    }

    /// Extract the suggested retry delay in milliseconds, if available.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Error category string for log fields and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Http(_) => "network",
            Self::Json(_) => "parse",
            Self::Api { .. } => "api",
            Self::RateLimited { .. } => "rate_limit",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Config { .. } => "config",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only adapter configuration, fixed at construction.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// API key for the back-end.
    pub api_key: String,
    /// Base URL override; each adapter supplies its own default.
    pub base_url: Option<String>,
    /// Default model id.
    pub model: String,
    /// Default per-request timeout.
    pub timeout: Option<Duration>,
}

impl AdapterConfig {
    /// Construct a config with just a key and model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: model.into(),
            timeout: None,
        }
    }

    /// Validate that the required fields are present.
    ///
    /// Adapters call this from their constructors so a missing API key or
    /// default model fails immediately, not on first request.
    pub fn validate(&self, kind: ProviderKind) -> ProviderResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(ProviderError::Config {
                message: format!("{kind}: API key is required"),
            });
        }
        if self.model.trim().is_empty() {
            return Err(ProviderError::Config {
                message: format!("{kind}: default model is required"),
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Structured-output mode requested by the caller.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum OutputMode {
    /// Free-form text.
    #[default]
    Text,
    /// Loose JSON: any syntactically valid JSON object.
    Json,
    /// Schema-validated JSON object.
    Schema(serde_json::Value),
    /// JSON array at the top level.
    Array,
}

impl OutputMode {
    /// Whether any structured output was requested.
    pub fn is_structured(&self) -> bool {
        !matches!(self, Self::Text)
    }

    /// The schema, when schema-validated mode was requested.
    pub fn schema(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Schema(s) => Some(s),
            _ => None,
        }
    }
}

/// Options for one completion call.
///
/// All fields are optional — adapters apply their per-provider defaults.
/// The options are read-only during the call; retries rebuild the payload
/// from scratch rather than mutating anything here.
#[derive(Clone, Debug)]
pub struct CompletionOptions {
    /// Model override; defaults to the adapter's configured model.
    pub model: Option<String>,
    /// Single user message. Ignored when `messages` is supplied.
    pub user_message: Option<String>,
    /// Ordered conversation turns. Authoritative over `user_message`.
    pub messages: Option<Vec<Message>>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Maximum output tokens.
    pub max_tokens: Option<u32>,
    /// Nucleus-sampling threshold.
    pub top_p: Option<f64>,
    /// Structured-output mode.
    pub output: OutputMode,
    /// Dot-separated field paths that must resolve in structured output.
    pub required_fields: Vec<String>,
    /// Minimum acceptable response length in characters.
    pub min_length: Option<usize>,
    /// Maximum acceptable response length in characters.
    pub max_length: Option<usize>,
    /// Per-attempt deadline; defaults to the adapter's configured timeout.
    pub timeout: Option<Duration>,
    /// External cancellation signal owned by the caller.
    pub cancel: Option<CancellationToken>,
    /// Reproducibility seed. For structured requests without an explicit
    /// seed, adapters that support seeding derive one from the system prompt.
    pub seed: Option<u64>,
    /// Request per-token log-probabilities where the provider supports them.
    pub logprobs: bool,
    /// Retry on structured-output validation failure.
    pub retry_on_validation: bool,
    /// Retry policy override (attempts, backoff, jitter).
    pub retry: Option<RetryConfig>,
    /// Hard-constraint turn placed first in priority (OpenAI-compatible).
    pub hard_constraint: Option<String>,
    /// Predicted-output hint for faster structured responses
    /// (OpenAI-compatible).
    pub prediction: Option<String>,
    /// Suppress visible chain-of-thought where the model supports the
    /// toggle (Groq/Qwen). `None` applies the per-provider default.
    pub suppress_reasoning: Option<bool>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: None,
            user_message: None,
            messages: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            output: OutputMode::Text,
            required_fields: Vec::new(),
            min_length: None,
            max_length: None,
            timeout: None,
            cancel: None,
            seed: None,
            logprobs: false,
            retry_on_validation: true,
            retry: None,
            hard_constraint: None,
            prediction: None,
            suppress_reasoning: None,
        }
    }
}

impl CompletionOptions {
    /// Options used by the shared health check: structured output, small
    /// budget, short deadline, no retries.
    #[must_use]
    pub fn health_check() -> Self {
        Self {
            output: OutputMode::Json,
            max_tokens: Some(50),
            timeout: Some(HEALTH_CHECK_TIMEOUT),
            retry_on_validation: false,
            retry: Some(RetryConfig::none()),
            ..Self::default()
        }
    }

    /// Validation expectations derived from these options.
    #[must_use]
    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            expect_json: self.output.is_structured(),
            expect_array: matches!(self.output, OutputMode::Array),
            required_fields: self.required_fields.clone(),
            min_length: self.min_length,
            max_length: self.max_length,
        }
    }

    /// Effective retry policy for this call.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    /// The conversation turns, normalized: the turn list is authoritative
    /// when both it and `user_message` are supplied.
    #[must_use]
    pub fn turns(&self) -> Vec<Message> {
        if let Some(messages) = &self.messages {
            return messages.clone();
        }
        match &self.user_message {
            Some(content) => vec![Message::user(content.clone())],
            None => Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Token accounting reported by the provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
    /// Prompt plus completion.
    pub total_tokens: u64,
}

/// Metadata attached to a completion result.
#[derive(Clone, Debug)]
pub struct ResultMetadata {
    /// Which back-end produced the text.
    pub provider: ProviderKind,
    /// Model id that served the request.
    pub model: String,
    /// Token accounting, when reported.
    pub usage: Option<TokenUsage>,
    /// Provider finish reason (`"stop"`, `"length"`, …).
    pub finish_reason: Option<String>,
    /// Per-token log-probabilities, when requested and supported.
    pub logprobs: Option<Vec<TokenLogprob>>,
    /// Validation findings for structured requests.
    pub validation: Option<ValidationReport>,
}

/// One completed (non-streaming) request.
///
/// Immutable once constructed — a retry produces a brand-new result.
#[derive(Clone, Debug)]
pub struct CompletionResult {
    /// Produced text.
    pub text: String,
    /// Result metadata.
    pub metadata: ResultMetadata,
}

/// Health probe outcome. Never an error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the probe round-tripped successfully.
    pub healthy: bool,
    /// Which provider was probed.
    pub provider: ProviderKind,
    /// Error message when unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Seed derivation
// ─────────────────────────────────────────────────────────────────────────────

/// Derive a deterministic reproducibility seed from the system prompt.
///
/// Structured requests without an explicit seed use this so repeated calls
/// with the same logical request are comparable while different prompts get
/// different seeds. SHA-256 is stable, not a cryptographic requirement.
#[must_use]
pub fn derive_seed(system_prompt: &str) -> u64 {
    let digest = Sha256::digest(system_prompt.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or([0u8; 8]))
}

/// Effective seed for a request: explicit wins, then derived for structured
/// requests, else none.
#[must_use]
pub fn effective_seed(system_prompt: &str, options: &CompletionOptions) -> Option<u64> {
    if options.seed.is_some() {
        return options.seed;
    }
    options
        .output
        .is_structured()
        .then(|| derive_seed(system_prompt))
}

// ─────────────────────────────────────────────────────────────────────────────
// The contract
// ─────────────────────────────────────────────────────────────────────────────

/// Sink receiving incremental text chunks during streaming.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Stream of incremental text chunks produced by one streaming attempt.
pub type TextChunkStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = ProviderResult<String>> + Send>>;

/// Core completion provider trait.
///
/// Implementors must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait CompletionProvider: Send + Sync + std::fmt::Debug {
    /// Provider identifier.
    fn kind(&self) -> ProviderKind;

    /// Configured default model id.
    fn model(&self) -> &str;

    /// Run one completion to completion, including retry/validation.
    async fn complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
    ) -> ProviderResult<CompletionResult>;

    /// Stream a completion, pushing chunks to `sink` in receipt order and
    /// returning the full concatenated text.
    async fn stream_complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
        sink: ChunkSink<'_>,
    ) -> ProviderResult<String>;

    /// Probe the back-end with one minimal structured request.
    ///
    /// Catches every error internally; never propagates.
    async fn health_check(&self) -> HealthStatus {
        let options = CompletionOptions::health_check();
        match self.complete(HEALTH_CHECK_PROMPT, &options).await {
            Ok(result) => {
                let valid = result
                    .metadata
                    .validation
                    .as_ref()
                    .is_none_or(|v| v.is_valid);
                HealthStatus {
                    healthy: valid,
                    provider: self.kind(),
                    error: (!valid).then(|| "health probe returned invalid JSON".to_string()),
                }
            }
            Err(e) => {
                error!(provider = %self.kind(), error = %e, "health check failed");
                HealthStatus {
                    healthy: false,
                    provider: self.kind(),
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
