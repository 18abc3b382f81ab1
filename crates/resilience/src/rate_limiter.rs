// crates/resilience/src/rate_limiter.rs
//! Rate limiting implementation
//!
//! Three algorithms are available, chosen by [`RateLimitAlgorithm`]:
//!
//! - Token bucket (default): the bucket holds at most `burst_size` tokens and
//!   refills at `rate` tokens per `window`. Each admitted call consumes one
//!   token.
//! - Sliding window: at most `rate` calls within any `window`-long span.
//! - Fixed window: at most `rate` calls per window; the window restarts at
//!   the first call after the previous one ended.

use crate::context::CallContext;
use crate::error::{ResilienceError, ResilienceResult};
use crate::event::{Event, EventSink, EventType};
use crate::validation::{PolicyConfig, Validator};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Admission algorithm of a rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitAlgorithm::TokenBucket => write!(f, "token_bucket"),
            RateLimitAlgorithm::SlidingWindow => write!(f, "sliding_window"),
            RateLimitAlgorithm::FixedWindow => write!(f, "fixed_window"),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub name: String,
    pub algorithm: RateLimitAlgorithm,
    /// Tokens added per `window`, or calls allowed per `window` for the
    /// window algorithms
    pub rate: u32,
    #[serde(with = "crate::serde_duration")]
    pub window: Duration,
    /// Bucket capacity; token bucket only
    pub burst_size: u32,
}

impl RateLimiterConfig {
    pub fn new(name: impl Into<String>, rate: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            rate,
            window,
            ..Self::default()
        }
    }

    pub fn with_burst_size(mut self, burst_size: u32) -> Self {
        self.burst_size = burst_size;
        self
    }

    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Most calls admitted back to back from a fresh state
    pub fn limit(&self) -> u32 {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => self.burst_size,
            RateLimitAlgorithm::SlidingWindow | RateLimitAlgorithm::FixedWindow => self.rate,
        }
    }

    fn tokens_per_sec(&self) -> f64 {
        f64::from(self.rate) / self.window.as_secs_f64()
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            algorithm: RateLimitAlgorithm::TokenBucket,
            rate: 100,
            window: Duration::from_secs(1),
            burst_size: 10,
        }
    }
}

impl PolicyConfig for RateLimiterConfig {
    fn policy_name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> ResilienceResult<()> {
        let policy = "rate_limit";
        Validator::not_empty(&self.name, policy, "name")?;
        Validator::positive(self.rate, policy, "rate")?;
        Validator::positive_duration(self.window, policy, "window")?;
        Validator::positive(self.burst_size, policy, "burst_size")?;
        Ok(())
    }
}

/// Outcome of a single admission check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Zero when allowed
    #[serde(with = "crate::serde_duration")]
    pub retry_after: Duration,
}

impl RateLimitDecision {
    fn allowed(limit: u32, remaining: u32) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    fn rejected(limit: u32, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after,
        }
    }
}

/// The `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`
/// values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the full limit is available again
    #[serde(with = "crate::serde_duration")]
    pub reset_after: Duration,
}

impl RateLimitHeaders {
    /// Header name/value pairs, reset in whole seconds rounded up
    pub fn to_pairs(&self) -> [(&'static str, String); 3] {
        let reset_secs = self.reset_after.as_secs() + u64::from(self.reset_after.subsec_nanos() > 0);
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", reset_secs.to_string()),
        ]
    }
}

/// Read-only snapshot of a limiter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStatus {
    pub name: String,
    /// Tokens in the bucket, or free slots in the current window
    pub available_tokens: f64,
    pub admitted: u64,
    pub rejected: u64,
    pub config: RateLimiterConfig,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    tokens_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            capacity: f64::from(config.burst_size),
            tokens: f64::from(config.burst_size),
            tokens_per_sec: config.tokens_per_sec(),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.tokens_at(now);
        self.last_refill = now;
    }

    /// Token count at `now` without recording the refill
    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.tokens_per_sec).min(self.capacity)
    }

    /// Refills, then takes one token or reports how long until one is
    /// available
    fn consume(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.wait_for(1.0 - self.tokens))
        }
    }

    fn remaining(&self) -> u32 {
        self.tokens.floor() as u32
    }

    fn wait_for(&self, tokens: f64) -> Duration {
        Duration::try_from_secs_f64(tokens.max(0.0) / self.tokens_per_sec).unwrap_or(Duration::MAX)
    }

    fn decide(&mut self, limit: u32, now: Instant) -> RateLimitDecision {
        match self.consume(now) {
            Ok(()) => RateLimitDecision::allowed(limit, self.remaining()),
            Err(retry_after) => RateLimitDecision::rejected(limit, retry_after),
        }
    }

    fn headers(&mut self, limit: u32, now: Instant) -> RateLimitHeaders {
        self.refill(now);
        RateLimitHeaders {
            limit,
            remaining: self.remaining(),
            reset_after: self.wait_for(self.capacity - self.tokens),
        }
    }
}

/// Timestamps of admitted calls within the last window, oldest first
#[derive(Debug, Clone)]
struct SlidingLog {
    limit: u32,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingLog {
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            limit: config.rate,
            window: config.window,
            admitted: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) < self.window {
                break;
            }
            self.admitted.pop_front();
        }
    }

    fn in_window(&self) -> u32 {
        u32::try_from(self.admitted.len()).unwrap_or(u32::MAX)
    }

    fn until_expired(&self, at: Instant, now: Instant) -> Duration {
        (at + self.window).saturating_duration_since(now)
    }

    fn decide(&mut self, now: Instant) -> RateLimitDecision {
        self.expire(now);
        if self.in_window() < self.limit {
            self.admitted.push_back(now);
            RateLimitDecision::allowed(self.limit, self.limit - self.in_window())
        } else {
            let retry_after = self
                .admitted
                .front()
                .map_or(Duration::ZERO, |&oldest| self.until_expired(oldest, now));
            RateLimitDecision::rejected(self.limit, retry_after)
        }
    }

    fn headers(&mut self, now: Instant) -> RateLimitHeaders {
        self.expire(now);
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.limit.saturating_sub(self.in_window()),
            reset_after: self
                .admitted
                .back()
                .map_or(Duration::ZERO, |&newest| self.until_expired(newest, now)),
        }
    }

    fn is_drained(&self, now: Instant) -> bool {
        self.admitted
            .back()
            .is_none_or(|&newest| now.saturating_duration_since(newest) >= self.window)
    }
}

#[derive(Debug, Clone)]
struct FixedCounter {
    limit: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl FixedCounter {
    fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            limit: config.rate,
            window: config.window,
            count: 0,
            window_start: now,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }

    fn roll(&mut self, now: Instant) {
        if self.expired(now) {
            self.count = 0;
            self.window_start = now;
        }
    }

    fn window_left(&self, now: Instant) -> Duration {
        (self.window_start + self.window).saturating_duration_since(now)
    }

    fn decide(&mut self, now: Instant) -> RateLimitDecision {
        self.roll(now);
        if self.count < self.limit {
            self.count += 1;
            RateLimitDecision::allowed(self.limit, self.limit - self.count)
        } else {
            RateLimitDecision::rejected(self.limit, self.window_left(now))
        }
    }

    fn headers(&mut self, now: Instant) -> RateLimitHeaders {
        self.roll(now);
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.limit - self.count,
            reset_after: if self.count == 0 {
                Duration::ZERO
            } else {
                self.window_left(now)
            },
        }
    }

    fn is_drained(&self, now: Instant) -> bool {
        self.count == 0 || self.expired(now)
    }
}

/// Admission state for one limiter or one key
#[derive(Debug, Clone)]
enum Meter {
    Bucket(TokenBucket, u32),
    Sliding(SlidingLog),
    Fixed(FixedCounter),
}

impl Meter {
    fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        match config.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                Meter::Bucket(TokenBucket::new(config, now), config.burst_size)
            }
            RateLimitAlgorithm::SlidingWindow => Meter::Sliding(SlidingLog::new(config)),
            RateLimitAlgorithm::FixedWindow => Meter::Fixed(FixedCounter::new(config, now)),
        }
    }

    fn decide(&mut self, now: Instant) -> RateLimitDecision {
        match self {
            Meter::Bucket(bucket, limit) => bucket.decide(*limit, now),
            Meter::Sliding(log) => log.decide(now),
            Meter::Fixed(counter) => counter.decide(now),
        }
    }

    fn headers(&mut self, now: Instant) -> RateLimitHeaders {
        match self {
            Meter::Bucket(bucket, limit) => bucket.headers(*limit, now),
            Meter::Sliding(log) => log.headers(now),
            Meter::Fixed(counter) => counter.headers(now),
        }
    }

    fn available(&mut self, now: Instant) -> f64 {
        match self {
            Meter::Bucket(bucket, _) => {
                bucket.refill(now);
                bucket.tokens
            }
            other => f64::from(other.headers(now).remaining),
        }
    }

    /// True when the state is indistinguishable from a fresh one
    fn is_drained(&self, now: Instant) -> bool {
        match self {
            Meter::Bucket(bucket, _) => bucket.tokens_at(now) >= bucket.capacity,
            Meter::Sliding(log) => log.is_drained(now),
            Meter::Fixed(counter) => counter.is_drained(now),
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    meter: Meter,
    admitted: u64,
    rejected: u64,
}

fn rejection(
    config: &RateLimiterConfig,
    events: &EventSink,
    decision: &RateLimitDecision,
    correlation_id: Option<&str>,
) -> ResilienceError {
    log::debug!(
        "Rate limiter '{}' rejected call, retry after {:?}",
        config.name,
        decision.retry_after
    );
    events.emit(
        Event::builder(EventType::RateLimited, config.name.clone())
            .correlation_id(correlation_id)
            .metadata("algorithm", config.algorithm.to_string())
            .metadata("limit", decision.limit)
            .metadata("retry_after_ms", decision.retry_after.as_millis() as u64)
            .build(),
    );
    ResilienceError::rate_limited(
        config.name.clone(),
        decision.limit,
        decision.remaining,
        decision.retry_after,
    )
}

/// Rate limiter for one guarded dependency
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: Arc<RateLimiterConfig>,
    state: Arc<Mutex<LimiterState>>,
    events: EventSink,
}

impl RateLimiter {
    /// Creates a new rate limiter with its full limit available
    pub fn new(config: RateLimiterConfig) -> ResilienceResult<Self> {
        config.validate()?;
        let meter = Meter::new(&config, Instant::now());
        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(LimiterState {
                meter,
                admitted: 0,
                rejected: 0,
            })),
            events: EventSink::none(),
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits the call if the limit allows it
    pub fn allow(&self) -> RateLimitDecision {
        let mut state = self.lock();
        let decision = state.meter.decide(Instant::now());
        if decision.allowed {
            state.admitted += 1;
        } else {
            state.rejected += 1;
        }
        decision
    }

    /// Like [`allow`](Self::allow), but a rejection is a `RateLimited` error
    pub fn try_acquire(&self) -> ResilienceResult<()> {
        self.acquire(None)
    }

    fn acquire(&self, correlation_id: Option<&str>) -> ResilienceResult<()> {
        let decision = self.allow();
        if decision.allowed {
            Ok(())
        } else {
            Err(rejection(&self.config, &self.events, &decision, correlation_id))
        }
    }

    /// Executes an operation if the limit allows it
    pub async fn execute<F, Fut, T, E>(&self, ctx: &CallContext, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        if let Err(reason) = ctx.check() {
            return Err(ctx.annotate(ResilienceError::cancelled(self.name(), reason)));
        }
        self.acquire(ctx.correlation_id())
            .map_err(|e| ctx.annotate(e))?;
        operation(ctx.clone()).await.map_err(Into::into)
    }

    /// Current header values; does not admit a call
    pub fn headers(&self) -> RateLimitHeaders {
        self.lock().meter.headers(Instant::now())
    }

    pub fn status(&self) -> RateLimiterStatus {
        let mut state = self.lock();
        RateLimiterStatus {
            name: self.config.name.clone(),
            available_tokens: state.meter.available(Instant::now()),
            admitted: state.admitted,
            rejected: state.rejected,
            config: (*self.config).clone(),
        }
    }
}

#[derive(Debug)]
struct Tracked {
    meter: Meter,
    /// Last admission check for the key
    last_seen: Instant,
}

/// Independent limits per key, sharing one configuration
#[derive(Debug)]
pub struct KeyedRateLimiter<K> {
    config: Arc<RateLimiterConfig>,
    meters: Mutex<HashMap<K, Tracked>>,
    events: EventSink,
}

impl<K> KeyedRateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: RateLimiterConfig) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            meters: Mutex::new(HashMap::new()),
            events: EventSink::none(),
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Tracked>> {
        self.meters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allow(&self, key: &K) -> RateLimitDecision {
        let now = Instant::now();
        let mut meters = self.lock();
        match meters.get_mut(key) {
            Some(tracked) => {
                tracked.last_seen = now;
                tracked.meter.decide(now)
            }
            None => {
                let mut meter = Meter::new(&self.config, now);
                let decision = meter.decide(now);
                meters.insert(
                    key.clone(),
                    Tracked {
                        meter,
                        last_seen: now,
                    },
                );
                decision
            }
        }
    }

    pub fn try_acquire(&self, key: &K) -> ResilienceResult<()> {
        let decision = self.allow(key);
        if decision.allowed {
            Ok(())
        } else {
            Err(rejection(&self.config, &self.events, &decision, None))
        }
    }

    /// Header values for `key`; unseen keys report the full limit
    pub fn headers(&self, key: &K) -> RateLimitHeaders {
        let now = Instant::now();
        match self.lock().get_mut(key) {
            Some(tracked) => tracked.meter.headers(now),
            None => RateLimitHeaders {
                limit: self.config.limit(),
                remaining: self.config.limit(),
                reset_after: Duration::ZERO,
            },
        }
    }

    /// Drops keys not checked for at least `idle_for` whose state has fully
    /// recovered. Returns how many were removed.
    pub fn prune_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let mut meters = self.lock();
        let before = meters.len();
        meters.retain(|_, tracked| {
            let idle = now.saturating_duration_since(tracked.last_seen) >= idle_for;
            !(idle && tracked.meter.is_drained(now))
        });
        let removed = before - meters.len();
        if removed > 0 {
            log::debug!(
                "Rate limiter '{}' pruned {} idle keys",
                self.config.name,
                removed
            );
        }
        removed
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
