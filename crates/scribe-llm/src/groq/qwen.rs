//! Groq-hosted Qwen provider.
//!
//! Qwen follows instructions well enough to skip Llama's scaffolding, but it
//! is a reasoning model: without a suppression directive, structured requests
//! come back wrapped in visible chain-of-thought. The adapter defaults the
//! directive to "off" for structured output so the model emits a direct
//! answer. Schema mode is unsupported upstream and downgraded to JSON-object
//! mode with a logged notice.

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use scribe_core::messages::ProviderKind;
use scribe_core::text::truncate_str;

use crate::abort::AbortState;
use crate::chat::{
    ChatMessage, ChatRequest, ChatResponse, chunk_text, collect_logprobs, json_object_format,
    post_chat,
};
use crate::provider::{
    AdapterConfig, ChunkSink, CompletionOptions, CompletionProvider, CompletionResult,
    DEFAULT_TIMEOUT, OutputMode, ProviderError, ProviderResult, ResultMetadata, effective_seed,
};
use crate::retry::{complete_with_retry, stream_with_retry};
use crate::sse::response_text_stream;
use crate::validation::validate_response;

use super::{DEFAULT_BASE_URL, FREE_FORM_TEMPERATURE};

/// Temperature for structured requests without an explicit override.
const STRUCTURED_TEMPERATURE: f64 = 0.5;

/// Reasoning-effort value that suppresses visible chain-of-thought.
const REASONING_OFF: &str = "none";

/// Groq-hosted Qwen completion provider.
#[derive(Debug)]
pub struct GroqQwenProvider {
    config: AdapterConfig,
    client: reqwest::Client,
}

impl GroqQwenProvider {
    /// Create a new provider. Fails immediately when the API key or default
    /// model is missing.
    pub fn new(config: AdapterConfig) -> ProviderResult<Self> {
        config.validate(ProviderKind::GroqQwen)?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    /// Create a new provider with a shared HTTP client.
    pub fn with_client(config: AdapterConfig, client: reqwest::Client) -> ProviderResult<Self> {
        config.validate(ProviderKind::GroqQwen)?;
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

    fn build_messages(system_prompt: &str, options: &CompletionOptions) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::new("system", system_prompt));
        }
        for turn in options.turns() {
            messages.push(ChatMessage::new(turn.role.as_str(), turn.content));
        }
        messages
    }

    /// Whether to suppress visible reasoning: the explicit option wins, and
    /// structured requests default to suppression.
    fn suppress_reasoning(options: &CompletionOptions) -> bool {
        options
            .suppress_reasoning
            .unwrap_or_else(|| options.output.is_structured())
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
            Self::build_messages(system_prompt, options),
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
            OutputMode::Schema(_) => {
                // Schema mode is unsupported upstream; downgrade.
                warn!(
                    provider = "groq-qwen",
                    "schema-validated output unsupported; downgrading to JSON-object mode"
                );
                Some(json_object_format())
            }
            OutputMode::Json | OutputMode::Array => Some(json_object_format()),
        };
        if Self::suppress_reasoning(options) {
            request.reasoning_effort = Some(REASONING_OFF.to_string());
        }
        if options.logprobs {
            request.logprobs = Some(true);
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
            reasoning_suppressed = request.reasoning_effort.is_some(),
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

        Ok(Self::finish_result(response, &request.model, options))
    }

    fn finish_result(
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
                    provider = "groq-qwen",
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
                provider: ProviderKind::GroqQwen,
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
impl CompletionProvider for GroqQwenProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GroqQwen
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(provider = "groq-qwen", model = %self.model_for(options)))]
    async fn complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
    ) -> ProviderResult<CompletionResult> {
        let retry = options.retry_config();
        let retry_on_validation = options.retry_on_validation && options.output.is_structured();
        complete_with_retry(
            ProviderKind::GroqQwen,
            &retry,
            retry_on_validation,
            options.cancel.as_ref(),
            |attempt| Box::pin(self.attempt_complete(system_prompt, options, attempt)),
        )
        .await
    }

    #[instrument(skip_all, fields(provider = "groq-qwen", model = %self.model_for(options)))]
    async fn stream_complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
        sink: ChunkSink<'_>,
    ) -> ProviderResult<String> {
        let retry = options.retry_config();
        stream_with_retry(
            ProviderKind::GroqQwen,
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
