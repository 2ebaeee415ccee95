//! # scribe-core
//!
//! Foundation types and utilities shared by the scribe completion adapters.
//!
//! This crate provides the vocabulary the adapter crates depend on:
//!
//! - **Messages**: `Role` / `Message` conversation turns and the
//!   `ProviderKind` identifier for the four supported back-ends
//! - **Retry**: `RetryConfig` plus the portable backoff and
//!   `Retry-After` parsing building blocks (the async retry execution
//!   lives in `scribe-llm`, which has access to tokio)
//! - **Text**: truncation for log previews and the chars/4 token estimate

#![deny(unsafe_code)]

pub mod messages;
pub mod retry;
pub mod text;

pub use messages::{Message, ProviderKind, Role};
pub use retry::RetryConfig;
