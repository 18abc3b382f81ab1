// crates/resilience/src/retry.rs
//! Retry policies with exponential backoff
//!
//! Delays grow as `base_delay * multiplier^attempt`, clamped to
//! `[base_delay, max_delay]`, with symmetric jitter applied on top and the
//! result clamped again. Only errors accepted by the policy's predicate are
//! retried; anything else is returned after a single call.

use crate::context::CallContext;
use crate::error::{ResilienceError, ResilienceResult};
use crate::event::{Event, EventSink, EventType};
use crate::validation::{PolicyConfig, Validator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub name: String,
    /// Maximum number of attempts (including the first attempt)
    pub max_attempts: u32,
    #[serde(with = "crate::serde_duration")]
    pub base_delay: Duration,
    #[serde(with = "crate::serde_duration")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay used as the jitter range, in `[0, 1]`
    pub jitter: f64,
    /// HTTP statuses retried by [`RetryPolicy::execute_http`]
    pub retryable_status_codes: Vec<u16>,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable_status_codes(mut self, codes: impl Into<Vec<u16>>) -> Self {
        self.retryable_status_codes = codes.into();
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
            retryable_status_codes: vec![429, 502, 503, 504],
        }
    }
}

impl PolicyConfig for RetryConfig {
    fn policy_name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> ResilienceResult<()> {
        let policy = "retry";
        Validator::not_empty(&self.name, policy, "name")?;
        Validator::positive(self.max_attempts, policy, "max_attempts")?;
        Validator::positive_duration(self.base_delay, policy, "base_delay")?;
        Validator::at_least(self.max_delay, self.base_delay, policy, "max_delay")?;
        Validator::at_least(self.multiplier, 1.0, policy, "multiplier")?;
        Validator::in_range(self.jitter, 0.0, 1.0, policy, "jitter")?;
        Ok(())
    }
}

/// A response whose status decides whether [`RetryPolicy::execute_http`]
/// tries again
pub trait HttpResponse {
    fn status(&self) -> u16;
    fn header(&self, name: &str) -> Option<&str>;
}

/// Last retryable HTTP status seen before retries ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("retryable HTTP status {status}")]
pub struct HttpStatusError {
    pub status: u16,
}

/// Parses a `Retry-After` value given as delta-seconds or an HTTP-date.
/// Dates in the past yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now())
        .to_std()
        .ok()
        .filter(|delay| !delay.is_zero())
}

/// Default classification: rate limiting, timeouts and transient I/O
/// failures are worth another attempt
pub fn default_retryable(err: &ResilienceError) -> bool {
    use crate::error::ErrorCode;

    match err {
        ResilienceError::Operation(inner) => {
            std::iter::successors(Some(inner.as_ref() as &(dyn StdError + 'static)), |&e| {
                e.source()
            })
            .filter_map(|e| e.downcast_ref::<io::Error>())
            .any(is_transient_io)
        }
        other => matches!(
            other.code(),
            Some(ErrorCode::RateLimited) | Some(ErrorCode::Timeout)
        ),
    }
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::UnexpectedEof
    )
}

type Predicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

enum Attempt<T> {
    Done(ResilienceResult<T>),
    Retry {
        error: ResilienceError,
        hint: Option<Duration>,
    },
}

/// Retry policy
#[derive(Clone)]
pub struct RetryPolicy {
    config: Arc<RetryConfig>,
    retryable: Predicate,
    events: EventSink,
}

impl RetryPolicy {
    /// Creates a new retry policy using [`default_retryable`]
    pub fn new(config: RetryConfig) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            retryable: Arc::new(default_retryable),
            events: EventSink::none(),
        })
    }

    /// Replaces the retryable-error predicate
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn is_retryable(&self, err: &ResilienceError) -> bool {
        (self.retryable)(err)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.config.retryable_status_codes.contains(&status)
    }

    /// Delay before retry number `attempt + 1`, without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.config.base_delay.as_nanos() as f64 * self.config.multiplier.powi(exponent);
        self.clamp_nanos(nanos)
    }

    /// [`backoff`](Self::backoff) with jitter applied and re-clamped
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt).as_nanos() as f64;
        if self.config.jitter <= 0.0 {
            return self.clamp_nanos(delay);
        }
        let range = delay * self.config.jitter;
        self.clamp_nanos(delay - range + fastrand::f64() * 2.0 * range)
    }

    /// The larger of the computed delay and a server hint, capped at
    /// `max_delay`
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = self.calculate_delay(attempt);
        match hint {
            Some(hint) => delay.max(hint).min(self.config.max_delay),
            None => delay,
        }
    }

    fn clamp_nanos(&self, nanos: f64) -> Duration {
        let min = self.config.base_delay.as_nanos() as f64;
        let max = self.config.max_delay.as_nanos() as f64;
        if nanos.is_nan() {
            return self.config.base_delay;
        }
        Duration::from_nanos(nanos.max(min).min(max) as u64)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached
    pub async fn execute<F, Fut, T, E>(&self, ctx: &CallContext, mut operation: F) -> ResilienceResult<T>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let retryable = &self.retryable;
        self.run(ctx, |ctx| {
            let call = operation(ctx);
            async move {
                match call.await.map_err(Into::into) {
                    Ok(value) => Attempt::Done(Ok(value)),
                    Err(error) if retryable(&error) => Attempt::Retry {
                        hint: error.retry_after(),
                        error,
                    },
                    Err(error) => Attempt::Done(Err(error)),
                }
            }
        })
        .await
    }

    /// Like [`execute`](Self::execute) for HTTP calls: responses with a
    /// retryable status are retried, honouring their `Retry-After` header.
    /// Other responses are returned as they are.
    pub async fn execute_http<F, Fut, R, E>(&self, ctx: &CallContext, mut operation: F) -> ResilienceResult<R>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: HttpResponse,
        E: Into<ResilienceError>,
    {
        let retryable = &self.retryable;
        let name = self.config.name.as_str();
        self.run(ctx, |ctx| {
            let call = operation(ctx);
            async move {
                match call.await.map_err(Into::into) {
                    Ok(response) if self.is_retryable_status(response.status()) => {
                        let status = response.status();
                        let hint = response.header("Retry-After").and_then(parse_retry_after);
                        let error = if status == 429 {
                            ResilienceError::rate_limited(name, 0, 0, hint.unwrap_or_default())
                        } else {
                            ResilienceError::operation(HttpStatusError { status })
                        };
                        Attempt::Retry { error, hint }
                    }
                    Ok(response) => Attempt::Done(Ok(response)),
                    Err(error) if retryable(&error) => Attempt::Retry {
                        hint: error.retry_after(),
                        error,
                    },
                    Err(error) => Attempt::Done(Err(error)),
                }
            }
        })
        .await
    }

    async fn run<T, F, Fut>(&self, ctx: &CallContext, mut attempt_once: F) -> ResilienceResult<T>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let name = self.config.name.as_str();
        let mut attempts = 0;

        loop {
            if let Err(reason) = ctx.check() {
                return Err(ctx.annotate(ResilienceError::cancelled(name, reason)));
            }

            let (error, hint) = match attempt_once(ctx.clone()).await {
                Attempt::Done(result) => return result,
                Attempt::Retry { error, hint } => (error, hint),
            };
            attempts += 1;

            if attempts >= self.config.max_attempts {
                log::warn!(
                    "Retry '{}' exhausted after {} attempts: {}",
                    name,
                    attempts,
                    error
                );
                self.events.emit(
                    Event::builder(EventType::RetryExhausted, name)
                        .correlation_id(ctx.correlation_id())
                        .metadata("attempts", attempts)
                        .metadata("error", error.to_string())
                        .build(),
                );
                return Err(ctx.annotate(ResilienceError::retry_exhausted(name, attempts, error)));
            }

            let delay = self.delay_with_hint(attempts - 1, hint);
            log::debug!(
                "Retry '{}' attempt {} failed, retrying in {:?}: {}",
                name,
                attempts,
                delay,
                error
            );
            self.events.emit(
                Event::builder(EventType::RetryAttempt, name)
                    .correlation_id(ctx.correlation_id())
                    .metadata("attempt", attempts)
                    .metadata("delay_ms", delay.as_millis() as u64)
                    .metadata("error", error.to_string())
                    .build(),
            );

            tokio::select! {
                biased;
                reason = ctx.done() => {
                    return Err(ctx.annotate(ResilienceError::cancelled(name, reason)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_chain, is_retry_exhausted, CancelReason};
    use crate::event::CollectingEmitter;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::new(max_attempts)
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_secs(1))
                .with_jitter(0.0),
        )
        .expect("valid config")
    }

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[derive(Debug)]
    struct FakeResponse {
        status: u16,
        retry_after: Option<String>,
    }

    impl FakeResponse {
        fn new(status: u16) -> Self {
            Self {
                status,
                retry_after: None,
            }
        }

        fn with_retry_after(mut self, value: &str) -> Self {
            self.retry_after = Some(value.to_string());
            self
        }
    }

    impl HttpResponse for FakeResponse {
        fn status(&self) -> u16 {
            self.status
        }

        fn header(&self, name: &str) -> Option<&str> {
            name.eq_ignore_ascii_case("retry-after")
                .then_some(self.retry_after.as_deref())
                .flatten()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());

        let cases = [
            (RetryConfig::new(0), "max_attempts"),
            (
                RetryConfig::default()
                    .with_base_delay(Duration::from_secs(2))
                    .with_max_delay(Duration::from_secs(1)),
                "max_delay",
            ),
            (RetryConfig::default().with_multiplier(0.5), "multiplier"),
            (RetryConfig::default().with_jitter(1.5), "jitter"),
            (RetryConfig::default().with_base_delay(Duration::ZERO), "base_delay"),
        ];
        for (config, expected) in cases {
            match RetryPolicy::new(config) {
                Err(ResilienceError::InvalidPolicy { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected InvalidPolicy for {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_backoff_grows_and_clamps() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(1)),
        )
        .expect("valid config");

        let delays: Vec<u64> = (0..6).map(|a| policy.backoff(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(10))
                .with_jitter(0.1),
        )
        .expect("valid config");

        for _ in 0..200 {
            let delay = policy.calculate_delay(2);
            assert!(delay >= Duration::from_millis(360), "{delay:?}");
            assert!(delay <= Duration::from_millis(440), "{delay:?}");

            let first = policy.calculate_delay(0);
            assert!(first >= Duration::from_millis(100));
            assert!(first <= Duration::from_millis(110));
        }
    }

    #[test]
    fn test_delay_with_hint() {
        let policy = policy(3);
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_millis(500))),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(30))),
            Duration::from_secs(1)
        );
        assert_eq!(policy.delay_with_hint(1, None), Duration::from_millis(20));
    }

    #[test]
    fn test_default_classifier() {
        assert!(default_retryable(&ResilienceError::rate_limited(
            "api",
            1,
            0,
            Duration::from_secs(1)
        )));
        assert!(default_retryable(&ResilienceError::timeout(
            "api",
            "get",
            Duration::from_secs(1)
        )));
        assert!(default_retryable(&ResilienceError::operation(refused())));
        assert!(!default_retryable(&ResilienceError::operation(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied"
        ))));
        assert!(!default_retryable(&ResilienceError::circuit_open(
            "api",
            Utc::now(),
            1.0
        )));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);

        let future = (Utc::now() + chrono::Duration::seconds(30)).to_rfc2822();
        let delay = parse_retry_after(&future).expect("future date parses");
        assert!(delay > Duration::from_secs(28) && delay <= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_single_call() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = policy(3)
            .execute(&CallContext::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(io::Error::new(io::ErrorKind::InvalidData, "bad payload")) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Operation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retried_until_success() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = policy(3)
            .execute(&CallContext::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(refused())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30) && elapsed < Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_preserves_last_cause() {
        let collector = Arc::new(CollectingEmitter::new());
        let policy = policy(3).with_events(EventSink::from(collector.clone()));

        let err = policy
            .execute(&CallContext::new(), |_| async { Err::<(), _>(refused()) })
            .await
            .unwrap_err();

        assert!(is_retry_exhausted(&err));
        assert!(matches!(err, ResilienceError::RetryExhausted { attempts: 3, .. }));
        let io_error = error_chain(&err)
            .find_map(|e| e.downcast_ref::<io::Error>())
            .expect("io error in chain");
        assert_eq!(io_error.kind(), io::ErrorKind::ConnectionRefused);

        assert_eq!(collector.events_of(EventType::RetryAttempt).len(), 2);
        assert_eq!(collector.events_of(EventType::RetryExhausted).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_honoured() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(
            RetryConfig::new(2)
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_secs(10)),
        )
        .expect("valid config");

        let start = Instant::now();
        let result = policy
            .execute(&CallContext::new(), |_| {
                let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err(ResilienceError::rate_limited("api", 5, 0, Duration::from_secs(3)))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some("done"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(
            RetryConfig::new(5)
                .with_base_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(5)),
        )
        .expect("valid config");
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));

        let result = policy
            .execute(&ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(refused()) }
            })
            .await;

        match result {
            Err(ResilienceError::Cancelled { reason, .. }) => {
                assert_eq!(reason, CancelReason::DeadlineExceeded)
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let ctx = CallContext::new();
        ctx.cancel();
        let calls = AtomicU32::new(0);

        let result = policy(3)
            .execute(&ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ResilienceError>(()) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let calls = AtomicU32::new(0);
        let policy = policy(4).retry_if(|_| true);

        let result = policy
            .execute(&CallContext::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(io::Error::new(io::ErrorKind::InvalidData, "bad")) }
            })
            .await;

        assert!(is_retry_exhausted(&result.unwrap_err()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_retry_honours_retry_after() {
        let responses = Mutex::new(VecDeque::from(vec![
            FakeResponse::new(503),
            FakeResponse::new(503).with_retry_after("2"),
            FakeResponse::new(200),
        ]));
        let start = Instant::now();

        let response = policy(3)
            .execute_http(&CallContext::new(), |_| {
                let next = responses.lock().expect("responses lock").pop_front();
                async move { next.ok_or_else(|| io::Error::other("no more responses")) }
            })
            .await
            .expect("eventually succeeds");

        assert_eq!(response.status, 200);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1010) && elapsed < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_non_retryable_status_returned() {
        let calls = AtomicU32::new(0);
        let response = policy(3)
            .execute_http(&CallContext::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ResilienceError>(FakeResponse::new(404)) }
            })
            .await
            .expect("404 is returned as a response");

        assert_eq!(response.status, 404);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_exhaustion_causes() {
        let err = policy(2)
            .execute_http(&CallContext::new(), |_| async {
                Ok::<_, ResilienceError>(FakeResponse::new(429).with_retry_after("1"))
            })
            .await
            .unwrap_err();
        let cause = err
            .source()
            .and_then(|e| e.downcast_ref::<ResilienceError>())
            .expect("cause is a resilience error");
        assert!(matches!(cause, ResilienceError::RateLimited { .. }));

        let err = policy(2)
            .execute_http(&CallContext::new(), |_| async {
                Ok::<_, ResilienceError>(FakeResponse::new(502))
            })
            .await
            .unwrap_err();
        let status = error_chain(&err)
            .find_map(|e| e.downcast_ref::<HttpStatusError>())
            .expect("status error in chain");
        assert_eq!(status.status, 502);
    }
}
