// crates/resilience/src/lib.rs
//! Resilience patterns for guarding calls to unreliable dependencies
//!
//! This crate provides:
//! - Circuit breaker with bounded half-open probing
//! - Token bucket rate limiting, per guard or per key
//! - Concurrency bulkhead with a FIFO wait queue
//! - Retry with exponential backoff and jitter
//! - Per-operation timeouts
//!
//! Every guard validates its configuration at construction, reports
//! rejections as typed [`ResilienceError`]s and publishes state changes
//! through an optional [`EventSink`]. Blocking operations take a
//! [`CallContext`] whose cancellation or deadline unblocks them.
//!
//! # Example
//!
//! ```rust
//! use platform_resilience::{
//!     CallContext, CircuitBreaker, CircuitBreakerConfig, ResilienceError, RetryConfig, RetryPolicy,
//! };
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ResilienceError> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::new(
//!     "policy-store",
//!     5,
//!     Duration::from_secs(30),
//! ))?;
//! let retry = RetryPolicy::new(RetryConfig::new(3).with_base_delay(Duration::from_millis(50)))?;
//!
//! let ctx = CallContext::new().with_correlation_id("req-42");
//! let decision = retry
//!     .execute(&ctx, |ctx| {
//!         let breaker = breaker.clone();
//!         async move { breaker.execute(&ctx, |_| async { Ok::<_, ResilienceError>("allow") }).await }
//!     })
//!     .await?;
//!
//! assert_eq!(decision, "allow");
//! # Ok(())
//! # }
//! ```

mod bulkhead;
mod circuit_breaker;
mod context;
mod error;
mod event;
mod policy;
mod rate_limiter;
mod registry;
mod retry;
mod serde_duration;
mod timeout;
mod validation;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadStatus};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};
pub use context::CallContext;
pub use error::{
    chain_contains, error_chain, get_error_code, is_bulkhead_full, is_cancelled, is_circuit_open,
    is_invalid_policy, is_rate_limited, is_retry_exhausted, is_timeout, CancelReason, ErrorBase,
    ErrorCode, ErrorReport, ResilienceError, ResilienceResult, SharedError,
};
pub use event::{
    CollectingEmitter, EmitError, Emitter, Event, EventBuilder, EventSink, EventType, LogEmitter,
};
pub use policy::ResiliencePolicy;
pub use rate_limiter::{
    KeyedRateLimiter, RateLimitAlgorithm, RateLimitDecision, RateLimitHeaders, RateLimiter,
    RateLimiterConfig, RateLimiterStatus,
};
pub use registry::{GuardRegistry, RegistrySnapshot};
pub use retry::{
    default_retryable, parse_retry_after, HttpResponse, HttpStatusError, RetryConfig, RetryPolicy,
};
pub use timeout::{with_timeout, TimeoutConfig, TimeoutManager};
pub use validation::{PolicyConfig, Validator};
