// crates/resilience/src/context.rs
//! Caller context: cancellation, deadline and correlation id
//!
//! Every blocking guard operation takes a [`CallContext`]. Cancelling it or
//! letting its deadline pass unblocks the waiter with a
//! [`CancelReason`](crate::CancelReason).

use crate::error::{CancelReason, ResilienceError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token, optional deadline and optional correlation id of a call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    correlation_id: Option<String>,
}

impl CallContext {
    /// A context that is never cancelled and has no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context around an existing token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    /// Sets a deadline `timeout` from now, keeping an earlier existing one
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets the deadline, keeping an earlier existing one
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Derives a child context. Cancelling the parent cancels the child;
    /// cancelling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// Derives a child context with a (possibly tighter) deadline
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        self.child().with_deadline(deadline)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Time left until the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fails if the context is already done
    pub fn check(&self) -> Result<(), CancelReason> {
        if self.token.is_cancelled() {
            return Err(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(CancelReason::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Tags a guard error with this context's correlation id
    pub(crate) fn annotate(&self, err: ResilienceError) -> ResilienceError {
        match &self.correlation_id {
            Some(id) => err.with_correlation_id(id.clone()),
            None => err,
        }
    }

    /// Resolves once the token fires or the deadline passes
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => CancelReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_context_is_never_done() {
        let ctx = CallContext::new();
        assert!(ctx.check().is_ok());
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = CallContext::new()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(5));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_child_cancellation_is_one_way() {
        let parent = CallContext::new().with_correlation_id("req-1");
        let child = parent.child();
        assert_eq!(child.correlation_id(), Some("req-1"));

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert_eq!(other.check(), Err(CancelReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_resolves_at_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let start = Instant::now();
        assert_eq!(ctx.done().await, CancelReason::DeadlineExceeded);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(ctx.check(), Err(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_done_resolves_on_cancel() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(60));
        let handle = ctx.clone();
        tokio::spawn(async move { handle.cancel() });
        assert_eq!(ctx.done().await, CancelReason::Cancelled);
    }
}
