//! Bounded exponential backoff for authority calls.
//!
//! Only errors whose kind is retryable (`Timeout`, `Conexion`, `Servidor`)
//! are retried. Everything else returns after the first attempt with its
//! cause intact. Cancellation is observed while an attempt runs and during
//! every wait, and returns the cancellation error instead of a retry error.

use std::future::Future;
use std::time::Duration;

use sii_core::SiiError;

use crate::context::CallContext;

/// Backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub initial_wait: Duration,
    /// Upper bound on any wait.
    pub max_wait: Duration,
    /// Growth factor between waits.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (0-based), capped at `max_wait`.
    pub fn wait_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.initial_wait.as_millis() as f64 * factor;
        let cap = self.max_wait.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            self.max_wait
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `max_retries` retries are spent. `op` receives the 1-based attempt number.
pub async fn execute<T, F, Fut>(ctx: &CallContext, config: &RetryConfig, mut op: F) -> Result<T, SiiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SiiError>>,
{
    let mut attempt: u32 = 0;
    loop {
        ctx.check()?;
        attempt += 1;

        let result = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            result = op(attempt) => result,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() {
            return Err(err);
        }
        if attempt > config.max_retries {
            tracing::error!(attempts = attempt, error = %err, "retries exhausted");
            return Err(err.after_attempts(attempt));
        }

        let wait = config.wait_for(attempt - 1);
        tracing::warn!(
            attempt,
            max_retries = config.max_retries,
            wait_ms = wait.as_millis() as u64,
            error = %err,
            "authority call failed, retrying"
        );
        tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
