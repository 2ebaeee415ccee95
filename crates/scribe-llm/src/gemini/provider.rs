//! Gemini provider implementation.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use tracing::{debug, instrument, warn};

use scribe_core::messages::{ProviderKind, Role};
use scribe_core::text::truncate_str;

use crate::abort::AbortState;
use crate::chat::post_json;
use crate::provider::{
    AdapterConfig, ChunkSink, CompletionOptions, CompletionProvider, CompletionResult,
    DEFAULT_TIMEOUT, ProviderError, ProviderResult, ResultMetadata,
};
use crate::retry::{complete_with_retry, stream_with_retry};
use crate::sse::response_text_stream;
use crate::validation::validate_response;

use super::schema::normalize_schema;
use super::types::{
    GeminiContent, GeminiPart, GeminiRequest, GeminiResponse, GenerationConfig, SystemInstruction,
};

/// Default API endpoint.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// MIME type requesting structured JSON output.
const JSON_MIME_TYPE: &str = "application/json";

/// Gemini completion provider.
#[derive(Debug)]
pub struct GeminiProvider {
    config: AdapterConfig,
    client: reqwest::Client,
}

impl GeminiProvider {
    /// Create a new provider. Fails immediately when the API key or default
    /// model is missing.
    pub fn new(config: AdapterConfig) -> ProviderResult<Self> {
        config.validate(ProviderKind::Gemini)?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    /// Create a new provider with a shared HTTP client.
    pub fn with_client(config: AdapterConfig, client: reqwest::Client) -> ProviderResult<Self> {
        config.validate(ProviderKind::Gemini)?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
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

    /// The API key travels as a query parameter, not a header.
    fn api_url(&self, model: &str, action: &str, sse: bool) -> String {
        let suffix = if sse { "&alt=sse" } else { "" };
        format!(
            "{}/models/{model}:{action}?key={}{suffix}",
            self.base_url(),
            self.config.api_key
        )
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    /// Map conversation turns onto Gemini's two-role scheme.
    ///
    /// System instructions go in the dedicated request field; system and
    /// developer turns inside the conversation have no Gemini counterpart and
    /// become user turns.
    fn build_contents(options: &CompletionOptions) -> Vec<GeminiContent> {
        options
            .turns()
            .into_iter()
            .map(|turn| GeminiContent {
                role: match turn.role {
                    Role::Assistant => "model".to_string(),
                    Role::System | Role::Developer | Role::User => "user".to_string(),
                },
                parts: vec![GeminiPart { text: turn.content }],
            })
            .collect()
    }

    fn build_request(&self, system_prompt: &str, options: &CompletionOptions) -> GeminiRequest {
        let structured = options.output.is_structured();
        let generation_config = GenerationConfig {
            temperature: options.temperature,
            max_output_tokens: options.max_tokens,
            top_p: options.top_p,
            response_mime_type: structured.then(|| JSON_MIME_TYPE.to_string()),
            response_schema: options.output.schema().map(normalize_schema),
        };
        let has_config = generation_config.temperature.is_some()
            || generation_config.max_output_tokens.is_some()
            || generation_config.top_p.is_some()
            || generation_config.response_mime_type.is_some();

        GeminiRequest {
            contents: Self::build_contents(options),
            system_instruction: (!system_prompt.is_empty()).then(|| SystemInstruction {
                parts: vec![GeminiPart {
                    text: system_prompt.to_string(),
                }],
            }),
            generation_config: has_config.then_some(generation_config),
        }
    }

    async fn attempt_complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
        attempt: u32,
    ) -> ProviderResult<CompletionResult> {
        let model = self.model_for(options);
        let request = self.build_request(system_prompt, options);
        debug!(
            model = %model,
            attempt,
            content_count = request.contents.len(),
            structured = options.output.is_structured(),
            "sending generateContent request"
        );

        let url = self.api_url(&model, "generateContent", false);
        let abort = AbortState::new(self.timeout_for(options), options.cancel.clone());
        let response = abort
            .run(async {
                let response = post_json(&self.client, &url, Self::headers(), &request).await?;
                response
                    .json::<GeminiResponse>()
                    .await
                    .map_err(ProviderError::from)
            })
            .await?;

        Ok(Self::finish_result(response, model, options))
    }

    fn finish_result(
        response: GeminiResponse,
        model: String,
        options: &CompletionOptions,
    ) -> CompletionResult {
        let text = response.first_candidate_text();
        let finish_reason = response
            .candidates
            .first()
            .and_then(|c| c.finish_reason.clone());

        let validation = options.output.is_structured().then(|| {
            let report = validate_response(&text, &options.validation_options());
            if !report.is_valid {
                warn!(
                    provider = "gemini",
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
                provider: ProviderKind::Gemini,
                model,
                usage: response.usage_metadata.map(Into::into),
                finish_reason,
                // Gemini does not expose per-token log-probabilities
                logprobs: None,
                validation,
            },
        }
    }
}

/// Extract the text of one streamed chunk.
fn gemini_chunk_text(data: &str) -> Option<String> {
    let chunk: GeminiResponse = serde_json::from_str(data).ok()?;
    let text = chunk.first_candidate_text();
    (!text.is_empty()).then_some(text)
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(provider = "gemini", model = %self.model_for(options)))]
    async fn complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
    ) -> ProviderResult<CompletionResult> {
        let retry = options.retry_config();
        let retry_on_validation = options.retry_on_validation && options.output.is_structured();
        complete_with_retry(
            ProviderKind::Gemini,
            &retry,
            retry_on_validation,
            options.cancel.as_ref(),
            |attempt| Box::pin(self.attempt_complete(system_prompt, options, attempt)),
        )
        .await
    }

    #[instrument(skip_all, fields(provider = "gemini", model = %self.model_for(options)))]
    async fn stream_complete(
        &self,
        system_prompt: &str,
        options: &CompletionOptions,
        sink: ChunkSink<'_>,
    ) -> ProviderResult<String> {
        let retry = options.retry_config();
        stream_with_retry(
            ProviderKind::Gemini,
            &retry,
            options.cancel.as_ref(),
            sink,
            |attempt| {
                Box::pin(async move {
                    let model = self.model_for(options);
                    let request = self.build_request(system_prompt, options);
                    debug!(model = %model, attempt, "opening generateContent stream");

                    let url = self.api_url(&model, "streamGenerateContent", true);
                    let abort = AbortState::new(self.timeout_for(options), options.cancel.clone());
                    let response = abort
                        .run(post_json(&self.client, &url, Self::headers(), &request))
                        .await?;
                    Ok(response_text_stream(response, abort, gemini_chunk_text))
                })
            },
        )
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
