//! Per-attempt cancellation and deadline control.
//!
//! Every request attempt gets one [`AbortState`] combining the caller's
//! external cancellation token with the attempt deadline. Both paths funnel
//! into one internal token, and a flag records which fired first so the
//! resulting error is classified exactly once: a deadline becomes
//! [`ProviderError::Timeout`], an external cancel becomes
//! [`ProviderError::Cancelled`]. Cancellation always wins the tie.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::provider::{ProviderError, ProviderResult};

/// Combined cancel-or-deadline controller for one request attempt.
pub struct AbortState {
    token: CancellationToken,
    timed_out: Arc<AtomicBool>,
    deadline: Duration,
    watcher: tokio::task::JoinHandle<()>,
}

impl AbortState {
    /// Arm a new controller with the attempt deadline and the caller's
    /// optional cancellation token.
    #[must_use]
    pub fn new(deadline: Duration, external: Option<CancellationToken>) -> Self {
        let token = CancellationToken::new();
        let timed_out = Arc::new(AtomicBool::new(false));

        let watcher = {
            let token = token.clone();
            let timed_out = Arc::clone(&timed_out);
            let external = external.unwrap_or_default();
            tokio::spawn(async move {
                tokio::select! {
                    // Cancellation wins when both are ready.
                    biased;
                    () = external.cancelled() => {}
                    () = tokio::time::sleep(deadline) => {
                        timed_out.store(true, Ordering::SeqCst);
                    }
                }
                token.cancel();
            })
        };

        Self {
            token,
            timed_out,
            deadline,
            watcher,
        }
    }

    /// Run a future until it resolves or this controller aborts it.
    pub async fn run<T, F>(&self, fut: F) -> ProviderResult<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        tokio::select! {
            result = fut => result,
            () = self.token.cancelled() => Err(self.abort_error()),
        }
    }

    /// Whether the controller has fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Classify an abort that has already happened.
    #[must_use]
    pub fn abort_error(&self) -> ProviderError {
        if self.timed_out.load(Ordering::SeqCst) {
            ProviderError::Timeout {
                elapsed_ms: u64::try_from(self.deadline.as_millis()).unwrap_or(u64::MAX),
            }
        } else {
            ProviderError::Cancelled
        }
    }
}

impl Drop for AbortState {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
