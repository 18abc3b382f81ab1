// crates/resilience/src/error.rs
//! Error types for resilience operations
//!
//! Every guard rejects with a [`ResilienceError`]. Each variant carries a
//! shared [`ErrorBase`] record whose [`ErrorCode`] identifies the variant and
//! survives wrapping, so callers branch on codes rather than concrete types:
//!
//! ```rust
//! use platform_resilience::{get_error_code, is_rate_limited, ErrorCode, ResilienceError};
//! use std::time::Duration;
//!
//! let err = ResilienceError::rate_limited("cache", 100, 0, Duration::from_millis(10));
//! assert!(is_rate_limited(&err));
//! assert_eq!(get_error_code(&err), Some(ErrorCode::RateLimited));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// A shared error cause. Shared so that errors stay `Clone`.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Stable identifier of an error variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CircuitOpen,
    RateLimited,
    Timeout,
    BulkheadFull,
    RetryExhausted,
    InvalidPolicy,
    /// The caller cancelled the call or its deadline passed
    Cancelled,
}

impl ErrorCode {
    /// Returns the wire form of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::BulkheadFull => "BULKHEAD_FULL",
            ErrorCode::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorCode::InvalidPolicy => "INVALID_POLICY",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }

    /// HTTP status a transport layer should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::CircuitOpen | ErrorCode::BulkheadFull => 503,
            ErrorCode::RateLimited => 429,
            ErrorCode::Timeout => 504,
            ErrorCode::RetryExhausted => 502,
            ErrorCode::InvalidPolicy => 500,
            ErrorCode::Cancelled => 499,
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::CircuitOpen => "circuit breaker is open",
            ErrorCode::RateLimited => "rate limit exceeded",
            ErrorCode::Timeout => "operation timed out",
            ErrorCode::BulkheadFull => "bulkhead is full",
            ErrorCode::RetryExhausted => "retry attempts exhausted",
            ErrorCode::InvalidPolicy => "invalid policy",
            ErrorCode::Cancelled => "operation cancelled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a caller-side wait ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelReason {
    /// The cancellation token fired
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Record shared by every typed resilience error
#[derive(Debug, Clone)]
pub struct ErrorBase {
    pub code: ErrorCode,
    pub service: String,
    pub correlation_id: Option<String>,
    pub message: String,
    pub cause: Option<SharedError>,
}

impl ErrorBase {
    /// Creates a base record without cause or correlation id
    pub fn new(code: ErrorCode, service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            service: service.into(),
            correlation_id: None,
            message: message.into(),
            cause: None,
        }
    }
}

impl fmt::Display for ErrorBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.service, self.message)?;
        if let Some(ref cause) = self.cause {
            write!(f, " (cause: {})", cause)?;
        }
        Ok(())
    }
}

/// Errors produced by the resilience guards
#[derive(Debug, Clone)]
pub enum ResilienceError {
    /// A raw base error carrying only a code. Canonical match targets are
    /// built this way.
    Base(ErrorBase),

    /// The circuit breaker rejected the call without invoking it
    CircuitOpen {
        base: ErrorBase,
        reset_at: DateTime<Utc>,
        failure_rate: f64,
    },

    /// The token bucket had no token for the call
    RateLimited {
        base: ErrorBase,
        limit: u32,
        remaining: u32,
        retry_after: Duration,
    },

    /// The operation did not finish before its deadline
    Timeout {
        base: ErrorBase,
        timeout: Duration,
        operation: String,
    },

    /// No permit and no room in the wait queue
    BulkheadFull {
        base: ErrorBase,
        partition: String,
        max_concurrent: usize,
        queue_size: usize,
    },

    /// Every attempt failed; the last failure is the cause
    RetryExhausted { base: ErrorBase, attempts: u32 },

    /// A guard configuration failed validation
    InvalidPolicy {
        base: ErrorBase,
        policy_name: String,
        field: String,
        reason: String,
    },

    /// The caller's context was cancelled or its deadline passed
    Cancelled { base: ErrorBase, reason: CancelReason },

    /// The guarded operation's own error
    Operation(SharedError),
}

impl ResilienceError {
    /// A code-only error usable as a match target for [`ResilienceError::is`]
    pub fn canonical(code: ErrorCode) -> Self {
        ResilienceError::Base(ErrorBase::new(code, "", code.default_message()))
    }

    pub fn circuit_open(
        service: impl Into<String>,
        reset_at: DateTime<Utc>,
        failure_rate: f64,
    ) -> Self {
        ResilienceError::CircuitOpen {
            base: ErrorBase::new(
                ErrorCode::CircuitOpen,
                service,
                format!(
                    "circuit breaker is open, resets at {}",
                    reset_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                ),
            ),
            reset_at,
            failure_rate,
        }
    }

    pub fn rate_limited(
        service: impl Into<String>,
        limit: u32,
        remaining: u32,
        retry_after: Duration,
    ) -> Self {
        ResilienceError::RateLimited {
            base: ErrorBase::new(
                ErrorCode::RateLimited,
                service,
                format!(
                    "rate limit exceeded ({}/{}), retry after {:?}",
                    remaining, limit, retry_after
                ),
            ),
            limit,
            remaining,
            retry_after,
        }
    }

    pub fn timeout(
        service: impl Into<String>,
        operation: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let operation = operation.into();
        ResilienceError::Timeout {
            base: ErrorBase::new(
                ErrorCode::Timeout,
                service,
                format!("operation '{}' timed out after {:?}", operation, timeout),
            ),
            timeout,
            operation,
        }
    }

    pub fn bulkhead_full(
        service: impl Into<String>,
        partition: impl Into<String>,
        max_concurrent: usize,
        queue_size: usize,
    ) -> Self {
        let partition = partition.into();
        ResilienceError::BulkheadFull {
            base: ErrorBase::new(
                ErrorCode::BulkheadFull,
                service,
                format!(
                    "bulkhead '{}' is full (max: {}, queue: {})",
                    partition, max_concurrent, queue_size
                ),
            ),
            partition,
            max_concurrent,
            queue_size,
        }
    }

    pub fn retry_exhausted(service: impl Into<String>, attempts: u32, last_error: Self) -> Self {
        let mut base = ErrorBase::new(
            ErrorCode::RetryExhausted,
            service,
            format!("all {} retry attempts exhausted", attempts),
        );
        base.cause = Some(Arc::new(last_error));
        ResilienceError::RetryExhausted { base, attempts }
    }

    pub fn invalid_policy(
        policy_name: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let policy_name = policy_name.into();
        let field = field.into();
        let reason = reason.into();
        ResilienceError::InvalidPolicy {
            base: ErrorBase::new(
                ErrorCode::InvalidPolicy,
                policy_name.clone(),
                format!("invalid policy '{}': field '{}' {}", policy_name, field, reason),
            ),
            policy_name,
            field,
            reason,
        }
    }

    pub fn cancelled(service: impl Into<String>, reason: CancelReason) -> Self {
        let mut base = ErrorBase::new(ErrorCode::Cancelled, service, reason.to_string());
        base.cause = Some(Arc::new(reason));
        ResilienceError::Cancelled { base, reason }
    }

    /// Wraps an operation's own error
    pub fn operation<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ResilienceError::Operation(Arc::new(err))
    }

    /// Wraps an already boxed operation error
    pub fn from_boxed(err: Box<dyn StdError + Send + Sync + 'static>) -> Self {
        ResilienceError::Operation(Arc::from(err))
    }

    /// Attaches a correlation id. No-op on operation errors.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        if let Some(base) = self.base_mut() {
            base.correlation_id = Some(correlation_id.into());
        }
        self
    }

    /// Attaches a cause. No-op on operation errors.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        if let Some(base) = self.base_mut() {
            base.cause = Some(Arc::new(cause));
        }
        self
    }

    /// The shared base record, absent for operation errors
    pub fn base(&self) -> Option<&ErrorBase> {
        match self {
            ResilienceError::Base(base)
            | ResilienceError::CircuitOpen { base, .. }
            | ResilienceError::RateLimited { base, .. }
            | ResilienceError::Timeout { base, .. }
            | ResilienceError::BulkheadFull { base, .. }
            | ResilienceError::RetryExhausted { base, .. }
            | ResilienceError::InvalidPolicy { base, .. }
            | ResilienceError::Cancelled { base, .. } => Some(base),
            ResilienceError::Operation(_) => None,
        }
    }

    fn base_mut(&mut self) -> Option<&mut ErrorBase> {
        match self {
            ResilienceError::Base(base)
            | ResilienceError::CircuitOpen { base, .. }
            | ResilienceError::RateLimited { base, .. }
            | ResilienceError::Timeout { base, .. }
            | ResilienceError::BulkheadFull { base, .. }
            | ResilienceError::RetryExhausted { base, .. }
            | ResilienceError::InvalidPolicy { base, .. }
            | ResilienceError::Cancelled { base, .. } => Some(base),
            ResilienceError::Operation(_) => None,
        }
    }

    /// Code of this error, absent for operation errors
    pub fn code(&self) -> Option<ErrorCode> {
        self.base().map(|base| base.code)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.base().and_then(|base| base.correlation_id.as_deref())
    }

    /// Equality by code
    pub fn is(&self, target: &ResilienceError) -> bool {
        matches!((self.code(), target.code()), (Some(a), Some(b)) if a == b)
    }

    /// True for caller-side cancellation, which says nothing about the
    /// downstream dependency
    pub fn is_cancellation(&self) -> bool {
        self.code() == Some(ErrorCode::Cancelled)
    }

    /// Wait hint carried by the error, if any. A reset time already in the
    /// past yields zero.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ResilienceError::RateLimited { retry_after, .. } => Some(*retry_after),
            ResilienceError::CircuitOpen { reset_at, .. } => {
                Some((*reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            }
            _ => None,
        }
    }

    /// The operation error wrapped by [`ResilienceError::Operation`]
    pub fn operation_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            ResilienceError::Operation(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }

    /// Serializable summary for transport layers
    pub fn report(&self) -> ErrorReport {
        match self.base() {
            Some(base) => ErrorReport {
                code: Some(base.code),
                service: base.service.clone(),
                message: base.message.clone(),
                correlation_id: base.correlation_id.clone(),
                cause: base.cause.as_ref().map(|c| c.to_string()),
            },
            None => ErrorReport {
                code: None,
                service: String::new(),
                message: self.to_string(),
                correlation_id: None,
                cause: None,
            },
        }
    }
}

impl fmt::Display for ResilienceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::Operation(inner) => fmt::Display::fmt(inner, f),
            other => match other.base() {
                Some(base) => fmt::Display::fmt(base, f),
                None => Ok(()),
            },
        }
    }
}

impl StdError for ResilienceError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ResilienceError::Operation(inner) => inner.source(),
            other => other
                .base()
                .and_then(|base| base.cause.as_deref())
                .map(|cause| cause as &(dyn StdError + 'static)),
        }
    }
}

impl From<std::io::Error> for ResilienceError {
    fn from(err: std::io::Error) -> Self {
        ResilienceError::operation(err)
    }
}

/// Flattened, serializable view of a [`ResilienceError`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: Option<ErrorCode>,
    pub service: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Walks an error and its causes. Operation wrappers yield the wrapped
/// error itself rather than skipping to its source.
pub fn error_chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&current| {
        match current.downcast_ref::<ResilienceError>() {
            Some(ResilienceError::Operation(inner)) => {
                Some(inner.as_ref() as &(dyn StdError + 'static))
            }
            _ => current.source(),
        }
    })
}

/// Code of the outermost coded resilience error in the chain
pub fn get_error_code(err: &(dyn StdError + 'static)) -> Option<ErrorCode> {
    error_chain(err)
        .filter_map(|e| e.downcast_ref::<ResilienceError>())
        .find_map(ResilienceError::code)
}

/// True if any error in the chain has the same code as `target`
pub fn chain_contains(err: &(dyn StdError + 'static), target: &ResilienceError) -> bool {
    error_chain(err)
        .filter_map(|e| e.downcast_ref::<ResilienceError>())
        .any(|e| e.is(target))
}

fn has_code(err: &(dyn StdError + 'static), code: ErrorCode) -> bool {
    get_error_code(err) == Some(code)
}

pub fn is_circuit_open(err: &(dyn StdError + 'static)) -> bool {
    has_code(err, ErrorCode::CircuitOpen)
}

pub fn is_rate_limited(err: &(dyn StdError + 'static)) -> bool {
    has_code(err, ErrorCode::RateLimited)
}

pub fn is_timeout(err: &(dyn StdError + 'static)) -> bool {
    has_code(err, ErrorCode::Timeout)
}

pub fn is_bulkhead_full(err: &(dyn StdError + 'static)) -> bool {
    has_code(err, ErrorCode::BulkheadFull)
}

pub fn is_retry_exhausted(err: &(dyn StdError + 'static)) -> bool {
    has_code(err, ErrorCode::RetryExhausted)
}

pub fn is_invalid_policy(err: &(dyn StdError + 'static)) -> bool {
    has_code(err, ErrorCode::InvalidPolicy)
}

pub fn is_cancelled(err: &(dyn StdError + 'static)) -> bool {
    has_code(err, ErrorCode::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream wrapper: {0}")]
    struct Wrapper(#[source] ResilienceError);

    #[test]
    fn test_display_format() {
        let err = ResilienceError::timeout("policy-store", "evaluate", Duration::from_secs(5));
        assert_eq!(
            err.to_string(),
            "[TIMEOUT] policy-store: operation 'evaluate' timed out after 5s"
        );
    }

    #[test]
    fn test_display_includes_cause() {
        let last = ResilienceError::operation(std::io::Error::other("connection reset"));
        let err = ResilienceError::retry_exhausted("cache", 3, last);
        assert_eq!(
            err.to_string(),
            "[RETRY_EXHAUSTED] cache: all 3 retry attempts exhausted (cause: connection reset)"
        );
    }

    #[test]
    fn test_cause_chain_reaches_original_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ResilienceError::retry_exhausted("db", 2, ResilienceError::from(io));

        let found = error_chain(&err)
            .filter_map(|e| e.downcast_ref::<std::io::Error>())
            .next();
        assert_eq!(
            found.map(|e| e.kind()),
            Some(std::io::ErrorKind::ConnectionRefused)
        );
    }

    #[test]
    fn test_is_matches_by_code() {
        let err = ResilienceError::bulkhead_full("mfa", "totp", 2, 1);
        assert!(err.is(&ResilienceError::canonical(ErrorCode::BulkheadFull)));
        assert!(!err.is(&ResilienceError::canonical(ErrorCode::Timeout)));

        let op = ResilienceError::operation(std::io::Error::other("x"));
        assert!(!op.is(&op.clone()));
    }

    #[test]
    fn test_predicates_accept_raw_base_error() {
        let raw = ResilienceError::Base(ErrorBase::new(ErrorCode::CircuitOpen, "svc", "open"));
        assert!(is_circuit_open(&raw));
        assert!(!is_rate_limited(&raw));

        let typed = ResilienceError::circuit_open("svc", Utc::now(), 0.5);
        assert!(is_circuit_open(&typed));
    }

    #[test]
    fn test_code_survives_foreign_wrapping() {
        let inner = ResilienceError::rate_limited("api", 10, 0, Duration::from_millis(100));
        let wrapped = Wrapper(inner);
        assert!(is_rate_limited(&wrapped));
        assert_eq!(get_error_code(&wrapped), Some(ErrorCode::RateLimited));

        let op = ResilienceError::operation(Wrapper(ResilienceError::canonical(ErrorCode::Timeout)));
        assert_eq!(get_error_code(&op), Some(ErrorCode::Timeout));
    }

    #[test]
    fn test_outermost_code_wins() {
        let err = ResilienceError::retry_exhausted(
            "svc",
            3,
            ResilienceError::canonical(ErrorCode::CircuitOpen),
        );
        assert!(is_retry_exhausted(&err));
        assert!(!is_circuit_open(&err));
        assert!(chain_contains(
            &err,
            &ResilienceError::canonical(ErrorCode::CircuitOpen)
        ));
    }

    #[test]
    fn test_get_error_code_absent_for_foreign_errors() {
        let io = std::io::Error::other("plain");
        assert_eq!(get_error_code(&io), None);
        assert_eq!(
            get_error_code(&ResilienceError::operation(std::io::Error::other("x"))),
            None
        );
    }

    #[test]
    fn test_invalid_policy_fields() {
        let err = ResilienceError::invalid_policy("retry", "max_attempts", "must be positive");
        match &err {
            ResilienceError::InvalidPolicy {
                policy_name,
                field,
                reason,
                ..
            } => {
                assert_eq!(policy_name, "retry");
                assert_eq!(field, "max_attempts");
                assert_eq!(reason, "must be positive");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert!(is_invalid_policy(&err));
        assert!(err.to_string().contains("field 'max_attempts' must be positive"));
    }

    #[test]
    fn test_correlation_id_and_report() {
        let err = ResilienceError::timeout("session", "load", Duration::from_millis(50))
            .with_correlation_id("req-42");
        assert_eq!(err.correlation_id(), Some("req-42"));

        let report = err.report();
        assert_eq!(report.code, Some(ErrorCode::Timeout));
        assert_eq!(report.correlation_id.as_deref(), Some("req-42"));

        let json = serde_json::to_value(&report).expect("report serializes");
        assert_eq!(json["code"], "TIMEOUT");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::CircuitOpen.http_status(), 503);
        assert_eq!(ErrorCode::BulkheadFull.http_status(), 503);
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::RetryExhausted.http_status(), 502);
    }

    #[test]
    fn test_cancelled_is_distinct() {
        let err = ResilienceError::cancelled("svc", CancelReason::DeadlineExceeded);
        assert!(is_cancelled(&err));
        assert!(err.is_cancellation());
        assert!(!is_timeout(&err));
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[test]
    fn test_rate_limited_retry_after() {
        let err = ResilienceError::rate_limited("svc", 5, 0, Duration::from_millis(200));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(200)));
    }
}
