//! Provider registry.
//!
//! One factory keyed on provider id, so callers select a back-end by data
//! instead of branching on provider-specific constructors.

use scribe_core::messages::ProviderKind;

use crate::gemini::GeminiProvider;
use crate::groq::{GroqLlamaProvider, GroqQwenProvider};
use crate::openai::OpenAiProvider;
use crate::provider::{AdapterConfig, CompletionProvider, ProviderError, ProviderResult};

/// Construct the adapter for a provider kind.
///
/// Fails immediately on invalid configuration, same as the per-provider
/// constructors.
pub fn create_provider(
    kind: ProviderKind,
    config: AdapterConfig,
) -> ProviderResult<Box<dyn CompletionProvider>> {
    Ok(match kind {
        ProviderKind::OpenAi => Box::new(OpenAiProvider::new(config)?),
        ProviderKind::Gemini => Box::new(GeminiProvider::new(config)?),
        ProviderKind::GroqLlama => Box::new(GroqLlamaProvider::new(config)?),
        ProviderKind::GroqQwen => Box::new(GroqQwenProvider::new(config)?),
    })
}

/// Construct the adapter for a provider id string (e.g. `"gemini"`).
pub fn create_provider_by_id(
    id: &str,
    config: AdapterConfig,
) -> ProviderResult<Box<dyn CompletionProvider>> {
    let kind = ProviderKind::from_id(id).ok_or_else(|| ProviderError::Config {
        message: format!("unknown provider id: {id}"),
    })?;
    create_provider(kind, config)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn factory_builds_every_kind() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Gemini,
            ProviderKind::GroqLlama,
            ProviderKind::GroqQwen,
        ] {
            let provider = create_provider(kind, AdapterConfig::new("key", "model")).unwrap();
            assert_eq!(provider.kind(), kind);
            assert_eq!(provider.model(), "model");
        }
    }

    #[test]
    fn factory_by_id() {
        let provider = create_provider_by_id("groq-llama", AdapterConfig::new("k", "m")).unwrap();
        assert_eq!(provider.kind(), ProviderKind::GroqLlama);
    }

    #[test]
    fn unknown_id_is_config_error() {
        let err = create_provider_by_id("mystery", AdapterConfig::new("k", "m")).unwrap_err();
        assert_matches!(err, ProviderError::Config { .. });
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn invalid_config_propagates() {
        let err = create_provider(ProviderKind::Gemini, AdapterConfig::new("", "m")).unwrap_err();
        assert_matches!(err, ProviderError::Config { .. });
    }
}
