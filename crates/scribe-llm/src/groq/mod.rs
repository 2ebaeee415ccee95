//! Groq-hosted model families.
//!
//! Both families speak the OpenAI-compatible chat dialect over Groq's
//! endpoint but need very different prompt framing:
//!
//! - [`llama`] — heavy structured-output scaffolding: delimiter-wrapped user
//!   data, a trailing JSON-only reminder, a pre-seeded assistant turn, stop
//!   sequences, and an aggressive output cap.
//! - [`qwen`] — minimal framing, but a reasoning-suppression directive so
//!   structured requests get a direct answer instead of visible
//!   chain-of-thought.

pub mod llama;
pub mod qwen;

pub use llama::GroqLlamaProvider;
pub use qwen::GroqQwenProvider;

/// Default Groq API endpoint (OpenAI-compatible surface).
pub(crate) const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Temperature for free-form requests without an explicit override, shared
/// by both families.
pub(crate) const FREE_FORM_TEMPERATURE: f64 = 0.7;
