//! Per-call context: cancellation, deadline and session token.

use std::sync::Arc;
use std::time::Duration;

use sii_core::SiiError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// Carried through every blocking operation. Cheap to clone; clones share
/// the cancellation signal.
#[derive(Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    token: Option<Arc<Zeroizing<String>>>,
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl CallContext {
    /// Context without deadline or token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an external cancellation signal.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fail once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Fail once `timeout` has elapsed from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Attach a session token, sent as the `TOKEN` cookie.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Arc::new(Zeroizing::new(token.into())));
        self
    }

    /// The session token, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.as_str())
    }

    /// The cancellation signal.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this context and its clones.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if cancelled or past the deadline.
    pub fn check(&self) -> Result<(), SiiError> {
        if self.cancel.is_cancelled() {
            return Err(SiiError::cancelled());
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(SiiError::deadline_exceeded());
        }
        Ok(())
    }

    /// Resolves with the cancellation error once cancelled or past the
    /// deadline. Pending forever otherwise.
    pub async fn done(&self) -> SiiError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => SiiError::cancelled(),
                _ = tokio::time::sleep_until(deadline) => SiiError::deadline_exceeded(),
            },
            None => {
                self.cancel.cancelled().await;
                SiiError::cancelled()
            }
        }
    }
}
