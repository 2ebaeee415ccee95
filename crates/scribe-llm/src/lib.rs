//! # scribe-llm
//!
//! Unified completion contract over heterogeneous chat back-ends.
//!
//! Four adapters share one [`CompletionProvider`] trait — OpenAI-compatible,
//! Gemini, and the Groq-hosted Llama and Qwen families — each translating
//! the normalized request into its provider-native payload. Around them:
//! - SSE stream decoding tolerant of arbitrary read boundaries
//! - retry orchestration with exponential backoff and jitter
//! - response validation (refusal / truncation / preamble detection) with
//!   confidence scoring from per-token log-probabilities
//! - heuristic JSON repair for diagnostics
//! - per-attempt cancellation and deadline control
//! - provider factory: `create_provider(kind, config) -> Box<dyn CompletionProvider>`

#![deny(unsafe_code)]

pub mod abort;
pub mod chat;
pub mod confidence;
pub mod gemini;
pub mod groq;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod repair;
pub mod retry;
pub mod sse;
pub mod validation;

pub use abort::AbortState;
pub use confidence::{ConfidenceSummary, TokenLogprob, summarize_logprobs};
pub use gemini::GeminiProvider;
pub use groq::{GroqLlamaProvider, GroqQwenProvider};
pub use openai::OpenAiProvider;
pub use provider::{
    AdapterConfig, ChunkSink, CompletionOptions, CompletionProvider, CompletionResult,
    HealthStatus, OutputMode, ProviderError, ProviderResult, ResultMetadata, TokenUsage,
};
pub use registry::{create_provider, create_provider_by_id};
pub use repair::{RepairOutcome, repair_json};
pub use sse::SseDecoder;
pub use validation::{ValidationOptions, ValidationReport, validate_response};
