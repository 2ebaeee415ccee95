//! Gemini provider.
//!
//! Google's generative model API: system instructions live in a dedicated
//! request field (never a conversation turn), structured output is requested
//! via a JSON response MIME type, and supplied schemas are normalized before
//! use because the API rejects several common JSON Schema keywords.

mod provider;
pub mod schema;
mod types;

pub use provider::GeminiProvider;
