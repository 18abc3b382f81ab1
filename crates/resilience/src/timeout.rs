// crates/resilience/src/timeout.rs
//! Timeout handling utilities

use crate::context::CallContext;
use crate::error::{ResilienceError, ResilienceResult};
use crate::event::{Event, EventSink, EventType};
use crate::validation::{PolicyConfig, Validator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub name: String,
    /// Used for operations without their own entry
    #[serde(rename = "default", with = "crate::serde_duration")]
    pub default_timeout: Duration,
    /// Upper bound applied to every lookup
    #[serde(rename = "max", with = "crate::serde_duration")]
    pub max_timeout: Duration,
    #[serde(with = "crate::serde_duration::map")]
    pub per_operation: HashMap<String, Duration>,
}

impl TimeoutConfig {
    pub fn new(default_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            default_timeout,
            max_timeout,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>, timeout: Duration) -> Self {
        self.per_operation.insert(operation.into(), timeout);
        self
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(60),
            per_operation: HashMap::new(),
        }
    }
}

impl PolicyConfig for TimeoutConfig {
    fn policy_name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> ResilienceResult<()> {
        let policy = "timeout";
        Validator::not_empty(&self.name, policy, "name")?;
        Validator::positive_duration(self.default_timeout, policy, "default_timeout")?;
        Validator::positive_duration(self.max_timeout, policy, "max_timeout")?;
        Validator::at_least(self.max_timeout, self.default_timeout, policy, "max_timeout")?;
        for (operation, timeout) in &self.per_operation {
            Validator::positive_duration(*timeout, policy, &format!("per_operation.{operation}"))?;
        }
        Ok(())
    }
}

/// Per-operation deadlines
#[derive(Debug, Clone)]
pub struct TimeoutManager {
    config: Arc<TimeoutConfig>,
    overrides: Arc<RwLock<HashMap<String, Duration>>>,
    events: EventSink,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            overrides: Arc::new(RwLock::new(config.per_operation.clone())),
            config: Arc::new(config),
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

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Timeout for `operation`, capped at the configured maximum
    pub fn get_timeout(&self, operation: &str) -> Duration {
        self.overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .copied()
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout)
    }

    /// Sets or replaces the timeout for one operation
    pub fn set_timeout(&self, operation: impl Into<String>, timeout: Duration) -> ResilienceResult<()> {
        let operation = operation.into();
        Validator::positive_duration(timeout, "timeout", &format!("per_operation.{operation}"))?;
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation, timeout);
        Ok(())
    }

    /// Child of `ctx` whose deadline is at most `get_timeout(operation)` away
    pub fn context_for(&self, ctx: &CallContext, operation: &str) -> CallContext {
        ctx.child().with_timeout(self.get_timeout(operation))
    }

    /// Runs `f` on the runtime and waits for it at most
    /// `get_timeout(operation)`.
    ///
    /// On expiry the operation's context is cancelled and `Timeout` is
    /// returned immediately; the task itself is left to observe the
    /// cancellation and finish on its own.
    pub async fn execute<F, Fut, T, E>(
        &self,
        ctx: &CallContext,
        operation: &str,
        f: F,
    ) -> ResilienceResult<T>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<ResilienceError> + Send + 'static,
    {
        if let Err(reason) = ctx.check() {
            return Err(ctx.annotate(ResilienceError::cancelled(self.name(), reason)));
        }

        let timeout = self.get_timeout(operation);
        let child = ctx.child().with_timeout(timeout);
        let mut handle = tokio::spawn(f(child.clone()));
        // Also fires when the caller drops this future mid-wait
        let _cancel_child = child.token().clone().drop_guard();

        tokio::select! {
            biased;
            reason = ctx.done() => {
                child.cancel();
                Err(ctx.annotate(ResilienceError::cancelled(self.name(), reason)))
            }
            joined = &mut handle => match joined {
                Ok(result) => result.map_err(Into::into),
                Err(join_error) => {
                    log::warn!("Operation '{}' failed to complete: {}", operation, join_error);
                    Err(ResilienceError::operation(join_error))
                }
            },
            _ = tokio::time::sleep(timeout) => {
                child.cancel();
                Err(self.expired(ctx, operation, timeout))
            }
        }
    }

    fn expired(&self, ctx: &CallContext, operation: &str, timeout: Duration) -> ResilienceError {
        log::debug!(
            "Operation '{}' on '{}' timed out after {:?}",
            operation,
            self.config.name,
            timeout
        );
        self.events.emit(
            Event::builder(EventType::Timeout, self.config.name.clone())
                .correlation_id(ctx.correlation_id())
                .metadata("operation", operation)
                .metadata("timeout_ms", timeout.as_millis() as u64)
                .build(),
        );
        ctx.annotate(ResilienceError::timeout(self.config.name.clone(), operation, timeout))
    }
}

/// Bounds `future` by `timeout` in place, dropping it on expiry.
/// Unlike [`TimeoutManager::execute`] the future may borrow from the caller.
pub async fn with_timeout<Fut, T, E>(
    ctx: &CallContext,
    timeout: Duration,
    future: Fut,
) -> ResilienceResult<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<ResilienceError>,
{
    if let Err(reason) = ctx.check() {
        return Err(ctx.annotate(ResilienceError::cancelled("timeout", reason)));
    }

    tokio::select! {
        biased;
        reason = ctx.done() => Err(ctx.annotate(ResilienceError::cancelled("timeout", reason))),
        result = future => result.map_err(Into::into),
        _ = tokio::time::sleep(timeout) => {
            Err(ctx.annotate(ResilienceError::timeout("timeout", "inline", timeout)))
        }
    }
}
