// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Exponential backoff retry for transient [`ModelError`]s.
//!
//! `ContextOverflow` and `Fatal` errors are returned immediately — the caller
//! (the agent loop) is responsible for reacting to a context overflow by
//! compacting rather than blindly retrying.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ModelError;

/// Result of a successful call, annotated with how many attempts it took.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Number of attempts made, including the first (non-retry) call.
    pub attempts: u32,
}

/// Call `f` up to `max_retries + 1` times, doubling the wait after each
/// transient failure starting from `base_wait`.
///
/// Non-transient errors (`Fatal`, `ContextOverflow`) are returned on the
/// first occurrence without retrying.
pub async fn retry_with_backoff<F, Fut, T>(
    max_retries: u32,
    base_wait: Duration,
    mut f: F,
) -> Result<RetryOutcome<T>, ModelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 0;
    let mut wait = base_wait;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(RetryOutcome { value, attempts: attempt }),
            Err(err) if err.is_retryable() && attempt <= max_retries => {
                warn!(attempt, wait_secs = wait.as_secs(), error = %err, "retrying after transient model error");
                tokio::time::sleep(wait).await;
                wait *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}
