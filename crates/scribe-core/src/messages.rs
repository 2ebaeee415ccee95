//! Conversation turns and provider identifiers.
//!
//! A completion request carries either a single user message or an ordered
//! list of [`Message`] turns. Four roles are modeled; providers that lack a
//! native representation for a role fold it into the nearest equivalent
//! (e.g. Gemini keeps a dedicated system-instruction field for the top-level
//! system prompt but maps in-conversation `system` and `developer` turns to
//! `user` turns).

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Roles and messages
// ─────────────────────────────────────────────────────────────────────────────

/// Conversation turn role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// Developer instructions (OpenAI-style; treated as system elsewhere).
    Developer,
    /// End-user input.
    User,
    /// Model output (including pre-seeded turns).
    Assistant,
}

impl Role {
    /// Wire-format string for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Developer => "developer",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One conversation turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Turn role.
    pub role: Role,
    /// Turn text content.
    pub content: String,
}

impl Message {
    /// Construct a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Construct a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Construct an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// The four completion back-ends behind the shared adapter contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// OpenAI-compatible chat-completions API.
    OpenAi,
    /// Google generative model API (Gemini).
    Gemini,
    /// Llama model family hosted on Groq.
    GroqLlama,
    /// Qwen model family hosted on Groq.
    GroqQwen,
}

impl ProviderKind {
    /// Stable string id used for registry lookup and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::GroqLlama => "groq-llama",
            Self::GroqQwen => "groq-qwen",
        }
    }

    /// Parse a provider id string. Unknown ids return `None`.
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "openai" => Some(Self::OpenAi),
            "gemini" | "google" => Some(Self::Gemini),
            "groq-llama" => Some(Self::GroqLlama),
            "groq-qwen" => Some(Self::GroqQwen),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
