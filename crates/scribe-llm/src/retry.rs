//! # Completion Retry
//!
//! Exponential-backoff retry orchestration shared by all adapters.
//!
//! **Key constraint for streaming**: a retry is only possible while nothing
//! has reached the caller's sink. Once the first chunk is delivered the
//! request cannot be restarted (the caller may have already acted on the
//! text), so later failures pass straight through.
//!
//! Retries cover transient failures (retryable API statuses, rate limits,
//! connection errors) and, for non-streaming structured requests, validation
//! failures. Deliberate cancellation is never retried.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use scribe_core::messages::ProviderKind;
use scribe_core::retry::{RetryConfig, calculate_backoff_delay_with_random};

use crate::provider::{
    ChunkSink, CompletionResult, ProviderError, ProviderResult, TextChunkStream,
};

/// Boxed attempt future, produced fresh for every try.
pub type AttemptFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;

/// Backoff delay for one retry, combining exponential backoff with the
/// provider's `Retry-After` suggestion (the larger of the two wins).
fn retry_delay(attempt: u32, config: &RetryConfig, retry_after_ms: Option<u64>) -> u64 {
    let backoff_ms = calculate_backoff_delay_with_random(
        attempt,
        config.base_delay_ms,
        config.max_delay_ms,
        config.jitter_factor,
        rand::random::<f64>(),
    );
    retry_after_ms.map_or(backoff_ms, |ra| backoff_ms.max(ra))
}

/// Sleep for a retry delay, aborting early on cancellation.
async fn retry_sleep(delay_ms: u64, cancel: Option<&CancellationToken>) -> ProviderResult<()> {
    let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
    match cancel {
        Some(token) => {
            tokio::select! {
                () = sleep => Ok(()),
                () = token.cancelled() => Err(ProviderError::Cancelled),
            }
        }
        None => {
            sleep.await;
            Ok(())
        }
    }
}

fn record_retry(provider: ProviderKind, category: &'static str) {
    metrics::counter!(
        "completion_retries_total",
        "provider" => provider.as_str(),
        "category" => category
    )
    .increment(1);
}

/// Run a completion attempt factory with retry.
///
/// `attempt_fn` receives the zero-based attempt number and must build a fresh
/// request each time. With the default config the request runs at most three
/// times: the first attempt plus two retries.
///
/// Two distinct retry triggers share the budget: retryable transport/API
/// errors, and — when `retry_on_validation` is set — a structured result
/// whose validation report came back invalid. When the budget runs out on an
/// invalid result, the result is still returned with its report attached so
/// the caller decides whether "invalid but present" is acceptable.
pub async fn complete_with_retry<'a, F>(
    provider: ProviderKind,
    config: &RetryConfig,
    retry_on_validation: bool,
    cancel: Option<&CancellationToken>,
    attempt_fn: F,
) -> ProviderResult<CompletionResult>
where
    F: Fn(u32) -> AttemptFuture<'a, CompletionResult>,
{
    let mut attempt = 0u32;
    loop {
        match attempt_fn(attempt).await {
            Ok(result) => {
                let invalid = result
                    .metadata
                    .validation
                    .as_ref()
                    .is_some_and(|v| !v.is_valid);
                if !(invalid && retry_on_validation) || attempt >= config.max_retries {
                    return Ok(result);
                }
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        return Ok(result);
                    }
                }

                attempt += 1;
                let delay_ms = retry_delay(attempt, config, None);
                record_retry(provider, "validation");
                debug!(
                    provider = %provider,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms,
                    "retrying after validation failure"
                );

                retry_sleep(delay_ms, cancel).await?;
            }
            Err(err) => {
                if !err.is_retryable() || attempt >= config.max_retries {
                    if attempt > 0 {
                        warn!(
                            provider = %provider,
                            attempts = attempt + 1,
                            category = err.category(),
                            "giving up after retries"
                        );
                    }
                    return Err(err);
                }
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        return Err(ProviderError::Cancelled);
                    }
                }

                attempt += 1;
                let delay_ms = retry_delay(attempt, config, err.retry_after_ms());
                record_retry(provider, err.category());
                debug!(
                    provider = %provider,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms,
                    category = err.category(),
                    "retrying after error"
                );

                retry_sleep(delay_ms, cancel).await?;
            }
        }
    }
}

/// Run a streaming attempt factory with retry, forwarding chunks to `sink`.
///
/// `attempt_fn` creates a fresh chunk stream per attempt. Chunks reach the
/// sink in receipt order; the full concatenated text is returned once the
/// stream closes. Failures before the first delivered chunk retry within
/// budget; once anything has reached the sink, every failure is terminal.
pub async fn stream_with_retry<'a, F>(
    provider: ProviderKind,
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    sink: ChunkSink<'_>,
    mut attempt_fn: F,
) -> ProviderResult<String>
where
    F: FnMut(u32) -> AttemptFuture<'a, TextChunkStream>,
{
    let mut attempt = 0u32;
    let mut delivered = false;
    loop {
        let err = match attempt_fn(attempt).await {
            Ok(mut stream) => {
                let mut text = String::new();
                let mut failure = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => {
                            delivered = true;
                            sink(&chunk);
                            text.push_str(&chunk);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                match failure {
                    None => return Ok(text),
                    Some(e) => e,
                }
            }
            Err(e) => e,
        };

        if delivered {
            warn!(
                provider = %provider,
                category = err.category(),
                "stream failed after chunks were delivered; not retrying"
            );
            return Err(err);
        }
        if !err.is_retryable() || attempt >= config.max_retries {
            return Err(err);
        }
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
        }

        attempt += 1;
        let delay_ms = retry_delay(attempt, config, err.retry_after_ms());
        record_retry(provider, err.category());
        debug!(
            provider = %provider,
            attempt,
            delay_ms,
            category = err.category(),
            "retrying stream before first delivery"
        );

        retry_sleep(delay_ms, cancel).await?;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::provider::ResultMetadata;

    fn quick_config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 10,
            jitter_factor: 0.0,
        }
    }

    fn ok_result() -> CompletionResult {
        CompletionResult {
            text: "ok".into(),
            metadata: ResultMetadata {
                provider: ProviderKind::OpenAi,
                model: "m".into(),
                usage: None,
                finish_reason: None,
                logprobs: None,
                validation: None,
            },
        }
    }

    fn server_error() -> ProviderError {
        ProviderError::Api {
            status: 500,
            message: "Server error".into(),
            code: None,
            retryable: true,
        }
    }

    fn chunk_stream(chunks: Vec<ProviderResult<String>>) -> TextChunkStream {
        Box::pin(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn first_attempt_success_no_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result =
            complete_with_retry(ProviderKind::OpenAi, &quick_config(), false, None, move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ok_result())
                })
            })
            .await;
        assert_matches!(result, Ok(_));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result =
            complete_with_retry(ProviderKind::OpenAi, &quick_config(), false, None, move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(server_error())
                    } else {
                        Ok(ok_result())
                    }
                })
            })
            .await;
        assert_matches!(result, Ok(_));
        // 2 failures + 1 success = default budget of 3 attempts
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result =
            complete_with_retry(ProviderKind::Gemini, &quick_config(), false, None, move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<CompletionResult, _>(server_error())
                })
            })
            .await;
        assert_matches!(result, Err(ProviderError::Api { status: 500, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result =
            complete_with_retry(ProviderKind::OpenAi, &quick_config(), false, None, move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<CompletionResult, _>(ProviderError::Api {
                        status: 400,
                        message: "Bad request".into(),
                        code: None,
                        retryable: false,
                    })
                })
            })
            .await;
        assert_matches!(result, Err(ProviderError::Api { status: 400, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result =
            complete_with_retry(ProviderKind::OpenAi, &quick_config(), false, None, move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<CompletionResult, _>(ProviderError::Cancelled)
                })
            })
            .await;
        assert_matches!(result, Err(ProviderError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retry_config_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result = complete_with_retry(
            ProviderKind::OpenAi,
            &RetryConfig::none(),
            false,
            None,
            move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<CompletionResult, _>(server_error())
                })
            },
        )
        .await;
        assert_matches!(result, Err(_));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_after_dominates_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let start = tokio::time::Instant::now();
        let result = complete_with_retry(
            ProviderKind::GroqLlama,
            &quick_config(),
            false,
            None,
            move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ProviderError::RateLimited {
                            retry_after_ms: 50,
                            message: "Rate limited".into(),
                        })
                    } else {
                        Ok(ok_result())
                    }
                })
            },
        )
        .await;
        assert_matches!(result, Ok(_));
        // 1ms backoff base, so the 50ms Retry-After must have been honored.
        assert!(start.elapsed().as_millis() >= 50);
    }

    fn invalid_result() -> CompletionResult {
        let mut result = ok_result();
        result.metadata.validation = Some(crate::validation::ValidationReport {
            is_valid: false,
            confidence: 0.3,
            errors: vec!["JSON parse error".into()],
            ..Default::default()
        });
        result
    }

    fn valid_result() -> CompletionResult {
        let mut result = ok_result();
        result.metadata.validation = Some(crate::validation::ValidationReport {
            is_valid: true,
            confidence: 1.0,
            ..Default::default()
        });
        result
    }

    #[tokio::test]
    async fn invalid_validation_retried_then_valid() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result =
            complete_with_retry(ProviderKind::OpenAi, &quick_config(), true, None, move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(invalid_result())
                    } else {
                        Ok(valid_result())
                    }
                })
            })
            .await
            .unwrap();
        assert!(result.metadata.validation.unwrap().is_valid);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_result_returned_when_budget_spent() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result =
            complete_with_retry(ProviderKind::OpenAi, &quick_config(), true, None, move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Ok(invalid_result())
                })
            })
            .await
            .unwrap();
        // Invalid but present: returned with the report, not thrown.
        assert!(!result.metadata.validation.unwrap().is_valid);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_retry_disabled_returns_first_result() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result =
            complete_with_retry(ProviderKind::OpenAi, &quick_config(), false, None, move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Ok(invalid_result())
                })
            })
            .await
            .unwrap();
        assert!(!result.metadata.validation.unwrap().is_valid);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_forwards_chunks_in_order() {
        let mut received = Vec::new();
        let mut sink = |chunk: &str| received.push(chunk.to_string());
        let text = stream_with_retry(
            ProviderKind::OpenAi,
            &quick_config(),
            None,
            &mut sink,
            |_| {
                Box::pin(async {
                    Ok(chunk_stream(vec![
                        Ok("Hello".to_string()),
                        Ok(", ".to_string()),
                        Ok("world".to_string()),
                    ]))
                })
            },
        )
        .await
        .unwrap();
        assert_eq!(text, "Hello, world");
        assert_eq!(received, vec!["Hello", ", ", "world"]);
    }

    #[tokio::test]
    async fn stream_no_retry_after_delivery() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let mut sink = |_: &str| {};
        let result = stream_with_retry(
            ProviderKind::OpenAi,
            &quick_config(),
            None,
            &mut sink,
            move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    // One chunk reaches the sink, then the connection dies.
                    Ok(chunk_stream(vec![
                        Ok("partial".to_string()),
                        Err(server_error()),
                    ]))
                })
            },
        )
        .await;
        assert_matches!(result, Err(ProviderError::Api { status: 500, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_retries_before_delivery() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let mut sink = |_: &str| {};
        let result = stream_with_retry(
            ProviderKind::OpenAi,
            &quick_config(),
            None,
            &mut sink,
            move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(server_error())
                    } else {
                        Ok(chunk_stream(vec![Ok("streamed".to_string())]))
                    }
                })
            },
        )
        .await;
        assert_matches!(result, Ok(text) if text == "streamed");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stream_error_before_any_chunk_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let mut sink = |_: &str| {};
        let result = stream_with_retry(
            ProviderKind::OpenAi,
            &quick_config(),
            None,
            &mut sink,
            move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        // Stream opens, then fails before yielding any text.
                        Ok(chunk_stream(vec![Err(server_error())]))
                    } else {
                        Ok(chunk_stream(vec![Ok("ok".to_string())]))
                    }
                })
            },
        )
        .await;
        assert_matches!(result, Ok(text) if text == "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sleep_aborts_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let result = retry_sleep(10_000, Some(&token)).await;
        assert_matches!(result, Err(ProviderError::Cancelled));
    }
}
