// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded retry with jittered backoff for retryable storage errors.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::Result;

/// Retry policy for storage operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, first try included.
    pub max_attempts: usize,
    /// Base backoff; doubles per attempt.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (1-based), with up to 50% jitter.
    fn backoff(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << (attempt - 1).min(16) as u32);
        let capped = exp.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..0.5);
        capped.mul_f64(1.0 + jitter)
    }
}

/// Run `op` until it succeeds, fails non-retryably, or exhausts the
/// policy. Only errors whose [`is_retryable`](crate::EngineError::is_retryable)
/// is true are retried.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying storage operation"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
