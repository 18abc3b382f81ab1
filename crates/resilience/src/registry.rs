// crates/resilience/src/registry.rs
//! Named guards shared across a service
//!
//! The registry is an ordinary value owned by the service; there is no
//! process-wide instance. Every guard it creates reports to the registry's
//! event sink.

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadStatus};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::error::ResilienceResult;
use crate::event::EventSink;
use crate::policy::ResiliencePolicy;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStatus};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::timeout::{TimeoutConfig, TimeoutManager};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

type Guards<G> = RwLock<HashMap<String, G>>;

fn get_or_create<G, F>(guards: &Guards<G>, name: &str, create: F) -> ResilienceResult<G>
where
    G: Clone,
    F: FnOnce() -> ResilienceResult<G>,
{
    if let Some(guard) = guards
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
    {
        return Ok(guard.clone());
    }

    let mut guards = guards.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(guard) = guards.get(name) {
        return Ok(guard.clone());
    }
    let guard = create()?;
    guards.insert(name.to_string(), guard.clone());
    Ok(guard)
}

fn insert<G>(guards: &Guards<G>, name: &str, guard: G) {
    guards
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_string(), guard);
}

fn sorted_values<G: Clone>(guards: &Guards<G>) -> Vec<(String, G)> {
    let mut values: Vec<(String, G)> = guards
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(name, guard)| (name.clone(), guard.clone()))
        .collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
}

/// Point-in-time status of every registered guard, sorted by name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub circuit_breakers: Vec<CircuitBreakerStatus>,
    pub rate_limiters: Vec<RateLimiterStatus>,
    pub bulkheads: Vec<BulkheadStatus>,
    pub retry_policies: Vec<RetryConfig>,
    pub timeouts: Vec<TimeoutConfig>,
}

/// Registry of named guards
#[derive(Debug, Default)]
pub struct GuardRegistry {
    events: EventSink,
    circuit_breakers: Guards<CircuitBreaker>,
    rate_limiters: Guards<RateLimiter>,
    bulkheads: Guards<Bulkhead>,
    retry_policies: Guards<RetryPolicy>,
    timeouts: Guards<TimeoutManager>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose guards report to `events`
    pub fn with_events(events: EventSink) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// The breaker registered under `name`, created with default settings
    /// if there is none
    pub fn circuit_breaker(&self, name: &str) -> ResilienceResult<CircuitBreaker> {
        get_or_create(&self.circuit_breakers, name, || {
            self.build_circuit_breaker(CircuitBreakerConfig {
                name: name.to_string(),
                ..CircuitBreakerConfig::default()
            })
        })
    }

    pub fn rate_limiter(&self, name: &str) -> ResilienceResult<RateLimiter> {
        get_or_create(&self.rate_limiters, name, || {
            self.build_rate_limiter(RateLimiterConfig {
                name: name.to_string(),
                ..RateLimiterConfig::default()
            })
        })
    }

    pub fn bulkhead(&self, name: &str) -> ResilienceResult<Bulkhead> {
        get_or_create(&self.bulkheads, name, || {
            self.build_bulkhead(BulkheadConfig {
                name: name.to_string(),
                ..BulkheadConfig::default()
            })
        })
    }

    pub fn retry_policy(&self, name: &str) -> ResilienceResult<RetryPolicy> {
        get_or_create(&self.retry_policies, name, || {
            self.build_retry_policy(RetryConfig::default().with_name(name))
        })
    }

    pub fn timeout_manager(&self, name: &str) -> ResilienceResult<TimeoutManager> {
        get_or_create(&self.timeouts, name, || {
            self.build_timeout_manager(TimeoutConfig::default().with_name(name))
        })
    }

    /// Creates a breaker from `config`, replacing any breaker of that name
    pub fn register_circuit_breaker(&self, config: CircuitBreakerConfig) -> ResilienceResult<CircuitBreaker> {
        let breaker = self.build_circuit_breaker(config)?;
        insert(&self.circuit_breakers, breaker.name(), breaker.clone());
        log::info!("Registered circuit breaker '{}'", breaker.name());
        Ok(breaker)
    }

    pub fn register_rate_limiter(&self, config: RateLimiterConfig) -> ResilienceResult<RateLimiter> {
        let limiter = self.build_rate_limiter(config)?;
        insert(&self.rate_limiters, limiter.name(), limiter.clone());
        log::info!("Registered rate limiter '{}'", limiter.name());
        Ok(limiter)
    }

    pub fn register_bulkhead(&self, config: BulkheadConfig) -> ResilienceResult<Bulkhead> {
        let bulkhead = self.build_bulkhead(config)?;
        insert(&self.bulkheads, bulkhead.name(), bulkhead.clone());
        log::info!("Registered bulkhead '{}'", bulkhead.name());
        Ok(bulkhead)
    }

    pub fn register_retry_policy(&self, config: RetryConfig) -> ResilienceResult<RetryPolicy> {
        let policy = self.build_retry_policy(config)?;
        insert(&self.retry_policies, &policy.config().name, policy.clone());
        log::info!("Registered retry policy '{}'", policy.config().name);
        Ok(policy)
    }

    pub fn register_timeout_manager(&self, config: TimeoutConfig) -> ResilienceResult<TimeoutManager> {
        let manager = self.build_timeout_manager(config)?;
        insert(&self.timeouts, manager.name(), manager.clone());
        log::info!("Registered timeout manager '{}'", manager.name());
        Ok(manager)
    }

    /// Validates `policy` and registers every guard it configures under the
    /// policy's name. Nothing is registered if any section is invalid.
    pub fn apply_policy(&self, policy: &ResiliencePolicy) -> ResilienceResult<()> {
        policy.validate()?;

        let named = |name: &mut String| *name = policy.name.clone();
        let breaker = policy
            .circuit_breaker
            .clone()
            .map(|mut c| {
                named(&mut c.name);
                self.build_circuit_breaker(c)
            })
            .transpose()?;
        let limiter = policy
            .rate_limit
            .clone()
            .map(|mut c| {
                named(&mut c.name);
                self.build_rate_limiter(c)
            })
            .transpose()?;
        let bulkhead = policy
            .bulkhead
            .clone()
            .map(|mut c| {
                named(&mut c.name);
                self.build_bulkhead(c)
            })
            .transpose()?;
        let retry = policy
            .retry
            .clone()
            .map(|mut c| {
                named(&mut c.name);
                self.build_retry_policy(c)
            })
            .transpose()?;
        let timeout = policy
            .timeout
            .clone()
            .map(|mut c| {
                named(&mut c.name);
                self.build_timeout_manager(c)
            })
            .transpose()?;

        let name = policy.name.as_str();
        if let Some(breaker) = breaker {
            insert(&self.circuit_breakers, name, breaker);
        }
        if let Some(limiter) = limiter {
            insert(&self.rate_limiters, name, limiter);
        }
        if let Some(bulkhead) = bulkhead {
            insert(&self.bulkheads, name, bulkhead);
        }
        if let Some(retry) = retry {
            insert(&self.retry_policies, name, retry);
        }
        if let Some(timeout) = timeout {
            insert(&self.timeouts, name, timeout);
        }

        log::info!(
            "Applied resilience policy '{}' (version {})",
            policy.name,
            policy.version
        );
        Ok(())
    }

    /// Removes every guard registered under `name`. Returns true if any was
    /// removed. Clones already handed out keep working.
    pub fn remove(&self, name: &str) -> bool {
        let removed = [
            remove_from(&self.circuit_breakers, name),
            remove_from(&self.rate_limiters, name),
            remove_from(&self.bulkheads, name),
            remove_from(&self.retry_policies, name),
            remove_from(&self.timeouts, name),
        ];
        removed.contains(&true)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            taken_at: Utc::now(),
            circuit_breakers: sorted_values(&self.circuit_breakers)
                .into_iter()
                .map(|(_, g)| g.status())
                .collect(),
            rate_limiters: sorted_values(&self.rate_limiters)
                .into_iter()
                .map(|(_, g)| g.status())
                .collect(),
            bulkheads: sorted_values(&self.bulkheads)
                .into_iter()
                .map(|(_, g)| g.status())
                .collect(),
            retry_policies: sorted_values(&self.retry_policies)
                .into_iter()
                .map(|(_, g)| g.config().clone())
                .collect(),
            timeouts: sorted_values(&self.timeouts)
                .into_iter()
                .map(|(_, g)| g.config().clone())
                .collect(),
        }
    }

    fn build_circuit_breaker(&self, config: CircuitBreakerConfig) -> ResilienceResult<CircuitBreaker> {
        Ok(CircuitBreaker::new(config)?.with_events(self.events.clone()))
    }

    fn build_rate_limiter(&self, config: RateLimiterConfig) -> ResilienceResult<RateLimiter> {
        Ok(RateLimiter::new(config)?.with_events(self.events.clone()))
    }

    fn build_bulkhead(&self, config: BulkheadConfig) -> ResilienceResult<Bulkhead> {
        Ok(Bulkhead::new(config)?.with_events(self.events.clone()))
    }

    fn build_retry_policy(&self, config: RetryConfig) -> ResilienceResult<RetryPolicy> {
        Ok(RetryPolicy::new(config)?.with_events(self.events.clone()))
    }

    fn build_timeout_manager(&self, config: TimeoutConfig) -> ResilienceResult<TimeoutManager> {
        Ok(TimeoutManager::new(config)?.with_events(self.events.clone()))
    }
}

fn remove_from<G>(guards: &Guards<G>, name: &str) -> bool {
    guards
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(name)
        .is_some()
}
