// crates/resilience/src/circuit_breaker.rs
//! Circuit breaker pattern implementation
//!
//! The breaker starts Closed. Once `failure_threshold` consecutive failures
//! are observed it opens and fails fast until `timeout` has elapsed; it then
//! admits up to `half_open_requests` concurrent probes. A single probe
//! failure reopens it, `success_threshold` consecutive probe successes close
//! it again.

use crate::context::CallContext;
use crate::error::{ResilienceError, ResilienceResult};
use crate::event::{Event, EventSink, EventType};
use crate::validation::{PolicyConfig, Validator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if the dependency recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Name of the guarded dependency
    pub name: String,
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    #[serde(with = "crate::serde_duration")]
    pub timeout: Duration,
    /// Concurrent probes admitted while half-open
    pub half_open_requests: u32,
}

impl CircuitBreakerConfig {
    /// Creates a new configuration
    pub fn new(name: impl Into<String>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            timeout,
            ..Self::default()
        }
    }

    /// Sets the success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Sets the number of concurrent half-open probes
    pub fn with_half_open_requests(mut self, requests: u32) -> Self {
        self.half_open_requests = requests;
        self
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_requests: 1,
        }
    }
}

impl PolicyConfig for CircuitBreakerConfig {
    fn policy_name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> ResilienceResult<()> {
        let policy = "circuit_breaker";
        Validator::not_empty(&self.name, policy, "name")?;
        Validator::positive(self.failure_threshold, policy, "failure_threshold")?;
        Validator::positive(self.success_threshold, policy, "success_threshold")?;
        Validator::positive_duration(self.timeout, policy, "timeout")?;
        Validator::positive(self.half_open_requests, policy, "half_open_requests")?;
        Ok(())
    }
}

/// Read-only snapshot for health and metrics collectors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub failure_rate: f64,
    /// Calls rejected without being invoked, since creation
    pub rejected: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub reset_at: Option<DateTime<Utc>>,
    pub config: CircuitBreakerConfig,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    reset_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    reset_at_utc: Option<DateTime<Utc>>,
    /// Bumped on every transition; outcomes from older generations are stale
    generation: u64,
    /// Calls and failures observed since the circuit last closed
    calls: u64,
    failures: u64,
    rejected: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            reset_at: None,
            opened_at_utc: None,
            reset_at_utc: None,
            generation: 0,
            calls: 0,
            failures: 0,
            rejected: 0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.failures as f64 / self.calls as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Caller-side cancellation; says nothing about the dependency
    Ignored,
}

struct Transition {
    from: CircuitState,
    to: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failure_rate: f64,
}

/// Holds an admission until the outcome is recorded. A probe whose future
/// is dropped before completing frees its half-open slot here.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: Outcome, correlation_id: Option<&str>) {
        self.settled = true;
        self.breaker
            .record(self.admission, self.generation, outcome, correlation_id);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.release_probe(self.generation);
        }
    }
}

/// Circuit breaker implementation
///
/// Clones share state, so one breaker per dependency can be handed to every
/// caller.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
    events: EventSink,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker after validating the configuration
    pub fn new(config: CircuitBreakerConfig) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState::new())),
            events: EventSink::none(),
        })
    }

    /// Routes state-change events to `events`
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets the current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of state, counters and config
    pub fn status(&self) -> CircuitBreakerStatus {
        let state = self.lock();
        CircuitBreakerStatus {
            name: self.config.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            half_open_in_flight: state.half_open_in_flight,
            failure_rate: state.failure_rate(),
            rejected: state.rejected,
            opened_at: state.opened_at_utc,
            reset_at: state.reset_at_utc,
            config: (*self.config).clone(),
        }
    }

    /// Executes an operation through the circuit breaker
    ///
    /// The operation runs outside the breaker's lock and receives a clone
    /// of the caller's context.
    pub async fn execute<F, Fut, T, E>(&self, ctx: &CallContext, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        if let Err(reason) = ctx.check() {
            return Err(ctx.annotate(ResilienceError::cancelled(self.name(), reason)));
        }

        let permit = self.admit(ctx.correlation_id()).map_err(|e| ctx.annotate(e))?;
        let result = operation(ctx.clone()).await.map_err(Into::into);

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_cancellation() => Outcome::Ignored,
            Err(_) => Outcome::Failure,
        };
        permit.settle(outcome, ctx.correlation_id());
        result
    }

    /// Records a successful operation performed outside `execute`
    pub fn record_success(&self) {
        let generation = self.lock().generation;
        self.record(Admission::Normal, generation, Outcome::Success, None);
    }

    /// Records a failed operation performed outside `execute`
    pub fn record_failure(&self) {
        let generation = self.lock().generation;
        self.record(Admission::Normal, generation, Outcome::Failure, None);
    }

    /// Forces the circuit closed and clears all counters
    pub fn reset(&self) {
        let transition = {
            let mut state = self.lock();
            let from = state.state;
            self.close(&mut state);
            (from != CircuitState::Closed).then(|| Transition {
                from,
                to: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                failure_rate: 0.0,
            })
        };
        if let Some(transition) = transition {
            self.announce(transition, None);
        }
    }

    fn admit(&self, correlation_id: Option<&str>) -> ResilienceResult<Permit<'_>> {
        let now = Instant::now();
        let mut transition = None;

        let decision = {
            let mut state = self.lock();
            let admission = match state.state {
                CircuitState::Closed => Some(Admission::Normal),
                CircuitState::Open => match state.reset_at {
                    Some(reset_at) if now < reset_at => None,
                    _ => {
                        state.state = CircuitState::HalfOpen;
                        state.consecutive_successes = 0;
                        state.half_open_in_flight = 1;
                        state.generation += 1;
                        transition = Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            consecutive_failures: state.consecutive_failures,
                            consecutive_successes: 0,
                            failure_rate: state.failure_rate(),
                        });
                        Some(Admission::Probe)
                    }
                },
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight < self.config.half_open_requests {
                        state.half_open_in_flight += 1;
                        Some(Admission::Probe)
                    } else {
                        None
                    }
                }
            };

            match admission {
                Some(admission) => Ok((admission, state.generation)),
                None => {
                    state.rejected += 1;
                    // A saturated half-open circuit may admit again as soon as a probe settles
                    let reset_at = match state.state {
                        CircuitState::HalfOpen => Utc::now(),
                        _ => state.reset_at_utc.unwrap_or_else(Utc::now),
                    };
                    Err(ResilienceError::circuit_open(
                        self.config.name.clone(),
                        reset_at,
                        state.failure_rate(),
                    ))
                }
            }
        };

        if let Some(transition) = transition {
            self.announce(transition, correlation_id);
        }

        match decision {
            Ok((admission, generation)) => Ok(Permit {
                breaker: self,
                admission,
                generation,
                settled: false,
            }),
            Err(e) => {
                log::debug!("Circuit breaker '{}' rejected call", self.config.name);
                Err(e)
            }
        }
    }

    fn record(
        &self,
        admission: Admission,
        generation: u64,
        outcome: Outcome,
        correlation_id: Option<&str>,
    ) {
        let transition = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            if admission == Admission::Probe {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }

            match (state.state, outcome) {
                (_, Outcome::Ignored) | (CircuitState::Open, _) => None,
                (CircuitState::Closed, Outcome::Success) => {
                    state.calls += 1;
                    state.consecutive_failures = 0;
                    None
                }
                (CircuitState::Closed, Outcome::Failure) => {
                    state.calls += 1;
                    state.failures += 1;
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.failure_threshold {
                        Some(self.trip(&mut state))
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, Outcome::Success) => {
                    state.calls += 1;
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        let transition = Transition {
                            from: CircuitState::HalfOpen,
                            to: CircuitState::Closed,
                            consecutive_failures: state.consecutive_failures,
                            consecutive_successes: state.consecutive_successes,
                            failure_rate: state.failure_rate(),
                        };
                        self.close(&mut state);
                        Some(transition)
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, Outcome::Failure) => {
                    state.calls += 1;
                    state.failures += 1;
                    Some(self.trip(&mut state))
                }
            }
        };

        if let Some(transition) = transition {
            self.announce(transition, correlation_id);
        }
    }

    fn release_probe(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation && state.state == CircuitState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    fn trip(&self, state: &mut BreakerState) -> Transition {
        let from = state.state;
        state.state = CircuitState::Open;
        state.consecutive_successes = 0;
        state.half_open_in_flight = 0;
        state.reset_at = Some(Instant::now() + self.config.timeout);
        let now = Utc::now();
        state.opened_at_utc = Some(now);
        state.reset_at_utc = Some(utc_after(now, self.config.timeout));
        state.generation += 1;

        Transition {
            from,
            to: CircuitState::Open,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: 0,
            failure_rate: state.failure_rate(),
        }
    }

    fn close(&self, state: &mut BreakerState) {
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        state.half_open_in_flight = 0;
        state.reset_at = None;
        state.opened_at_utc = None;
        state.reset_at_utc = None;
        state.calls = 0;
        state.failures = 0;
        state.generation += 1;
    }

    fn announce(&self, transition: Transition, correlation_id: Option<&str>) {
        if transition.to == CircuitState::Open {
            log::warn!(
                "Circuit breaker '{}' opened ({} -> {}, consecutive failures: {})",
                self.config.name,
                transition.from,
                transition.to,
                transition.consecutive_failures
            );
        } else {
            log::info!(
                "Circuit breaker '{}' transitioned {} -> {}",
                self.config.name,
                transition.from,
                transition.to
            );
        }

        let event_type = match transition.to {
            CircuitState::Open => EventType::CircuitOpened,
            CircuitState::HalfOpen => EventType::CircuitHalfOpened,
            CircuitState::Closed => EventType::CircuitClosed,
        };
        self.events.emit(
            Event::builder(event_type, self.config.name.clone())
                .correlation_id(correlation_id)
                .metadata("previous_state", transition.from.to_string())
                .metadata("new_state", transition.to.to_string())
                .metadata("consecutive_failures", transition.consecutive_failures)
                .metadata("consecutive_successes", transition.consecutive_successes)
                .metadata("failure_rate", transition.failure_rate)
                .build(),
        );
    }
}

fn utc_after(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
