//! OpenAI-compatible provider.
//!
//! Speaks the stock `/chat/completions` dialect. Structured output uses
//! strict schema validation when a schema is supplied, loose JSON-object
//! mode otherwise. Long prompts get the formatting instructions repeated at
//! the end ("bookending") to counteract attention decay, and callers can
//! supply a hard-constraint turn, a reproducibility seed, and a
//! predicted-output hint.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument, warn};

use scribe_core::messages::ProviderKind;
use scribe_core::text::{estimate_tokens, truncate_str};

use crate::abort::AbortState;
use crate::chat::{
    ChatMessage, ChatRequest, ChatResponse, chunk_text, collect_logprobs, json_object_format,
    json_schema_format, post_chat,
};
use crate::provider::{
    AdapterConfig, ChunkSink, CompletionOptions, CompletionProvider, CompletionResult,
    DEFAULT_TIMEOUT, OutputMode, ProviderError, ProviderResult, ResultMetadata, effective_seed,
};
use crate::retry::{complete_with_retry, stream_with_retry};
use crate::sse::response_text_stream;
use crate::validation::validate_response;

/// Default API endpoint.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Temperature for structured requests without an explicit override.
const STRUCTURED_TEMPERATURE: f64 = 0.0;

/// Temperature for free-form requests without an explicit override.
const FREE_FORM_TEMPERATURE: f64 = 0.7;

/// Estimated prompt size past which the formatting reminder is repeated at
/// the end of the conversation.
const BOOKEND_TOKEN_THRESHOLD: usize = 30_000;

/// Reminder appended when bookending a structured prompt with no explicit
/// hard constraint.
const JSON_REMINDER: &str =
    "Respond with only valid JSON. Do not include explanations or surrounding text.";

/// OpenAI-compatible completion provider.
#[derive(Debug)]
pub struct OpenAiProvider {
    config: AdapterConfig,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a new provider. Fails immediately when the API key or default
    /// model is missing.
    pub fn new(config: AdapterConfig) -> ProviderResult<Self> {
        config.validate(ProviderKind::OpenAi)?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    /// Create a new provider with a shared HTTP client.
    pub fn with_client(config: AdapterConfig, client: reqwest::Client) -> ProviderResult<Self> {
        config.validate(ProviderKind::OpenAi)?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url())
    }

    fn model_for(&self, options: &CompletionOptions) -> String {
        options.model.clone().unwrap_or_else(|| self.config.model.clone())
    }

    fn timeout_for(&self, options: &CompletionOptions) -> std::time::Duration {
        options
            .timeout
            .or(self.config.timeout)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Assemble the conversation turns.
    ///
    /// Pure function of `(system_prompt, options)` so a retry rebuilds from
    /// scratch and nothing injected on one attempt leaks into the next. The
    /// hard-constraint turn goes first in priority, and long prompts get the
    /// formatting reminder bookended at the end.
    fn build_messages(&self, system_prompt: &str, options: &CompletionOptions) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if let Some(constraint) = &options.hard_constraint {
            messages.push(ChatMessage::new("system", constraint.clone()));
        }
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::new("system", system_prompt));
        }
        for turn in options.turns() {
            messages.push(ChatMessage::new(turn.role.as_str(), turn.content));
        }

        let estimated: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        if estimated > BOOKEND_TOKEN_THRESHOLD {
            let reminder = options.hard_constraint.clone().or_else(|| {
                options
                    .output
                    .is_structured()
                    .then(|| JSON_REMINDER.to_string())
            });
            if let Some(reminder) = reminder {
                debug!(estimated, "bookending formatting reminder onto long prompt");
                messages.push(ChatMessage::new("system", reminder));
            }
        }
        messages
    }

    fn build_request(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
        stream: bool,
    ) -> ChatRequest {
        let structured = options.output.is_structured();
        let mut request = ChatRequest::new(
            self.model_for(options),
            self.build_messages(system_prompt, options),
        );
        request.temperature = Some(options.temperature.unwrap_or(if structured {
            STRUCTURED_TEMPERATURE
        } else {
            FREE_FORM_TEMPERATURE
        }));
        request.max_tokens = options.max_tokens;
        request.top_p = options.top_p;
        request.seed = effective_seed(system_prompt, options);
        request.response_format = match &options.output {
            OutputMode::Text => None,
            OutputMode::Schema(schema) => Some(json_schema_format(schema)),
            OutputMode::Json | OutputMode::Array => Some(json_object_format()),
        };
        if options.logprobs {
            request.logprobs = Some(true);
        }
        if let Some(prediction) = &options.prediction {
            request.prediction = Some(json!({"type": "content", "content": prediction}));
        }
        request.stream = stream;
        request
    }

    async fn attempt_complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
        attempt: u32,
    ) -> ProviderResult<CompletionResult> {
        let request = self.build_request(system_prompt, options, false);
        debug!(
            model = %request.model,
            attempt,
            message_count = request.messages.len(),
            structured = options.output.is_structured(),
            "sending chat completion request"
        );

        let abort = AbortState::new(self.timeout_for(options), options.cancel.clone());
        let response = abort
            .run(async {
                let response = post_chat(
                    &self.client,
                    &self.completions_url(),
                    &self.config.api_key,
                    &request,
                )
                .await?;
                response
                    .json::<ChatResponse>()
                    .await
                    .map_err(ProviderError::from)
            })
            .await?;

        Ok(self.finish_result(response, &request.model, options))
    }

    fn finish_result(
        &self,
        response: ChatResponse,
        requested_model: &str,
        options: &CompletionOptions,
    ) -> CompletionResult {
        let choice = response.choices.into_iter().next();
        let logprobs = choice.as_ref().and_then(collect_logprobs);
        let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
        let text = choice
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();

        let validation = options.output.is_structured().then(|| {
            let report = validate_response(&text, &options.validation_options());
            if !report.is_valid {
                warn!(
                    provider = "openai",
                    errors = ?report.errors,
                    confidence = report.confidence,
                    preview = %truncate_str(&text, 120),
                    "structured response failed validation"
                );
            }
            report
        });

        CompletionResult {
            text,
            metadata: ResultMetadata {
                provider: ProviderKind::OpenAi,
                model: response.model.unwrap_or_else(|| requested_model.to_string()),
                usage: response.usage.map(Into::into),
                finish_reason,
                logprobs,
                validation,
            },
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(provider = "openai", model = %self.model_for(options)))]
    async fn complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
    ) -> ProviderResult<CompletionResult> {
        let retry = options.retry_config();
        let retry_on_validation = options.retry_on_validation && options.output.is_structured();
        complete_with_retry(
            ProviderKind::OpenAi,
            &retry,
            retry_on_validation,
            options.cancel.as_ref(),
            |attempt| Box::pin(self.attempt_complete(system_prompt, options, attempt)),
        )
        .await
    }

    #[instrument(skip_all, fields(provider = "openai", model = %self.model_for(options)))]
    async fn stream_complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
        sink: ChunkSink<'_>,
    ) -> ProviderResult<String> {
        let retry = options.retry_config();
        stream_with_retry(
            ProviderKind::OpenAi,
            &retry,
            options.cancel.as_ref(),
            sink,
            |attempt| {
                Box::pin(async move {
                    let request = self.build_request(system_prompt, options, true);
                    debug!(model = %request.model, attempt, "opening completion stream");

                    let abort = AbortState::new(self.timeout_for(options), options.cancel.clone());
                    let response = abort
                        .run(post_chat(
                            &self.client,
                            &self.completions_url(),
                            &self.config.api_key,
                            &request,
                        ))
                        .await?;
                    Ok(response_text_stream(response, abort, chunk_text))
                })
            },
        )
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use scribe_core::retry::RetryConfig;
    use serde_json::Value;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> OpenAiProvider {
        let config = AdapterConfig {
            api_key: "sk-test".into(),
            base_url: Some(server.uri()),
            model: "gpt-test".into(),
            timeout: Some(Duration::from_secs(5)),
        };
        OpenAiProvider::new(config).unwrap()
    }

    fn quick_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 10,
            jitter_factor: 0.0,
        }
    }

    fn completion_body(content: &str) -> Value {
        serde_json::json!({
            "model": "gpt-test",
            "choices": [{
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        })
    }

    // ── Request building ─────────────────────────────────────────────────

    #[test]
    fn structured_temperature_defaults_to_zero() {
        let config = AdapterConfig::new("k", "m");
        let provider = OpenAiProvider::new(config).unwrap();
        let options = CompletionOptions {
            output: OutputMode::Json,
            ..Default::default()
        };
        let request = provider.build_request("sys", &options, false);
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.response_format.unwrap()["type"], "json_object");
        // Structured requests without an explicit seed get a derived one.
        assert!(request.seed.is_some());
    }

    #[test]
    fn free_form_temperature_defaults() {
        let provider = OpenAiProvider::new(AdapterConfig::new("k", "m")).unwrap();
        let request = provider.build_request("sys", &CompletionOptions::default(), false);
        assert_eq!(request.temperature, Some(0.7));
        assert!(request.response_format.is_none());
        assert!(request.seed.is_none());
    }

    #[test]
    fn schema_mode_uses_strict_format() {
        let provider = OpenAiProvider::new(AdapterConfig::new("k", "m")).unwrap();
        let schema = serde_json::json!({"type": "object"});
        let options = CompletionOptions {
            output: OutputMode::Schema(schema),
            ..Default::default()
        };
        let request = provider.build_request("sys", &options, false);
        let format = request.response_format.unwrap();
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["strict"], true);
    }

    #[test]
    fn hard_constraint_goes_first() {
        let provider = OpenAiProvider::new(AdapterConfig::new("k", "m")).unwrap();
        let options = CompletionOptions {
            hard_constraint: Some("Only output French.".into()),
            user_message: Some("hello".into()),
            ..Default::default()
        };
        let messages = provider.build_messages("sys", &options);
        assert_eq!(messages[0].content, "Only output French.");
        assert_eq!(messages[1].content, "sys");
        assert_eq!(messages[2].content, "hello");
    }

    #[test]
    fn empty_prompts_make_minimal_request() {
        let provider = OpenAiProvider::new(AdapterConfig::new("k", "m")).unwrap();
        let messages = provider.build_messages("", &CompletionOptions::default());
        assert!(messages.is_empty());
    }

    #[test]
    fn long_structured_prompt_is_bookended() {
        let provider = OpenAiProvider::new(AdapterConfig::new("k", "m")).unwrap();
        // ~40k estimated tokens at 4 chars per token
        let long_prompt = "x".repeat(160_000);
        let options = CompletionOptions {
            output: OutputMode::Json,
            user_message: Some("go".into()),
            ..Default::default()
        };
        let messages = provider.build_messages(&long_prompt, &options);
        assert_eq!(messages.last().unwrap().content, JSON_REMINDER);
    }

    #[test]
    fn short_prompt_not_bookended() {
        let provider = OpenAiProvider::new(AdapterConfig::new("k", "m")).unwrap();
        let options = CompletionOptions {
            output: OutputMode::Json,
            user_message: Some("go".into()),
            ..Default::default()
        };
        let messages = provider.build_messages("short", &options);
        assert_eq!(messages.last().unwrap().content, "go");
    }

    #[test]
    fn construction_requires_api_key() {
        assert_matches!(
            OpenAiProvider::new(AdapterConfig::new("", "m")),
            Err(ProviderError::Config { .. })
        );
    }

    // ── Transport round trips ────────────────────────────────────────────

    #[tokio::test]
    async fn complete_returns_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-test"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hello")))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let options = CompletionOptions {
            user_message: Some("hi".into()),
            ..Default::default()
        };
        let result = provider.complete("sys", &options).await.unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(result.metadata.usage.unwrap().total_tokens, 16);
        assert_eq!(result.metadata.finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.metadata.provider, ProviderKind::OpenAi);
    }

    #[tokio::test]
    async fn malformed_then_valid_retries_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body("sorry, no json here")),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body(r#"{"ok": true}"#)),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let options = CompletionOptions {
            output: OutputMode::Json,
            user_message: Some("data please".into()),
            retry: Some(quick_retry()),
            ..Default::default()
        };
        let result = provider.complete("sys", &options).await.unwrap();
        assert!(result.metadata.validation.unwrap().is_valid);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn http_429_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_string(r#"{"error":{"message":"Rate limited"}}"#),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("recovered")))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let options = CompletionOptions {
            retry: Some(quick_retry()),
            ..Default::default()
        };
        let result = provider.complete("sys", &options).await.unwrap();
        assert_eq!(result.text, "recovered");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn http_400_fails_after_one_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":{"message":"Bad request"}}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let options = CompletionOptions {
            retry: Some(quick_retry()),
            ..Default::default()
        };
        let err = provider.complete("sys", &options).await.unwrap_err();
        assert_matches!(err, ProviderError::Api { status: 400, retryable: false, .. });
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_transport_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("late"))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let options = CompletionOptions {
            timeout: Some(Duration::from_millis(50)),
            retry: Some(RetryConfig::none()),
            ..Default::default()
        };
        let err = provider.complete("sys", &options).await.unwrap_err();
        assert_matches!(err, ProviderError::Timeout { .. });
    }

    #[tokio::test]
    async fn external_cancel_beats_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("late"))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        token.cancel();
        let provider = provider_for(&server);
        let options = CompletionOptions {
            timeout: Some(Duration::from_secs(60)),
            cancel: Some(token),
            retry: Some(RetryConfig::none()),
            ..Default::default()
        };
        let err = provider.complete("sys", &options).await.unwrap_err();
        assert_matches!(err, ProviderError::Cancelled);
    }

    #[tokio::test]
    async fn health_check_reports_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body(r#"{"status":"healthy"}"#)),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let status = provider.health_check().await;
        assert!(status.healthy);
        assert_eq!(status.provider, ProviderKind::OpenAi);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn health_check_never_propagates_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let status = provider.health_check().await;
        assert!(!status.healthy);
        assert!(status.error.is_some());
    }

    // ── Streaming ────────────────────────────────────────────────────────

    fn sse_body(fragments: &[&str]) -> String {
        let mut body = String::new();
        for fragment in fragments {
            let chunk = serde_json::json!({
                "choices": [{"delta": {"content": fragment}, "finish_reason": null}]
            });
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[tokio::test]
    async fn stream_delivers_chunks_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body(&["Hel", "lo ", "there"])),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let options = CompletionOptions {
            user_message: Some("hi".into()),
            ..Default::default()
        };
        let mut received = Vec::new();
        let mut sink = |chunk: &str| received.push(chunk.to_string());
        let text = provider
            .stream_complete("sys", &options, &mut sink)
            .await
            .unwrap();
        assert_eq!(text, "Hello there");
        assert_eq!(received, vec!["Hel", "lo ", "there"]);
    }

    #[tokio::test]
    async fn stream_retries_failed_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body(&["ok"])),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let options = CompletionOptions {
            retry: Some(quick_retry()),
            ..Default::default()
        };
        let mut sink = |_: &str| {};
        let text = provider
            .stream_complete("sys", &options, &mut sink)
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}
