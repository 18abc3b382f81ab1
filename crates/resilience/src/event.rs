// crates/resilience/src/event.rs
//! Events emitted by the guards on state changes and rejections
//!
//! Guards hold an [`EventSink`], which may be empty. Emitting through an
//! empty sink does nothing, and a failing emitter never fails the guarded
//! call: the error is logged and dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// Kind of event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,
    RateLimited,
    Timeout,
    BulkheadFull,
    RetryAttempt,
    RetryExhausted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CircuitOpened => "circuit_opened",
            EventType::CircuitHalfOpened => "circuit_half_opened",
            EventType::CircuitClosed => "circuit_closed",
            EventType::RateLimited => "rate_limited",
            EventType::Timeout => "timeout",
            EventType::BulkheadFull => "bulkhead_full",
            EventType::RetryAttempt => "retry_attempt",
            EventType::RetryExhausted => "retry_exhausted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable observability event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Name of the guard that emitted the event
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn builder(event_type: EventType, source: impl Into<String>) -> EventBuilder {
        EventBuilder {
            event_type,
            source: source.into(),
            correlation_id: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Builder for [`Event`]; the id and timestamp are filled in by `build`
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: EventType,
    source: String,
    correlation_id: Option<String>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl EventBuilder {
    pub fn correlation_id(mut self, correlation_id: Option<&str>) -> Self {
        self.correlation_id = correlation_id.map(str::to_owned);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Event {
        Event {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            source: self.source,
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            metadata: self.metadata,
        }
    }
}

/// Failure reported by an [`Emitter`]
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("event sink unavailable: {0}")]
    Unavailable(String),

    #[error("event rejected: {0}")]
    Rejected(String),
}

/// Observability sink supplied by the owning service
pub trait Emitter: Send + Sync {
    fn emit(&self, event: Event) -> Result<(), EmitError>;
}

/// Optional shared emitter
#[derive(Clone, Default)]
pub struct EventSink {
    emitter: Option<Arc<dyn Emitter>>,
}

impl EventSink {
    /// A sink that drops every event
    pub fn none() -> Self {
        Self { emitter: None }
    }

    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self {
            emitter: Some(emitter),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.emitter.is_some()
    }

    pub fn emit(&self, event: Event) {
        let Some(emitter) = &self.emitter else {
            return;
        };
        let event_type = event.event_type;
        if let Err(e) = emitter.emit(event) {
            log::warn!("Failed to emit {} event: {}", event_type, e);
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl<E: Emitter + 'static> From<Arc<E>> for EventSink {
    fn from(emitter: Arc<E>) -> Self {
        Self::new(emitter)
    }
}

/// Emitter that writes every event to the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmitter;

impl Emitter for LogEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitError> {
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| EmitError::Rejected(e.to_string()))?;
        log::info!(
            "resilience event {} source={} correlation_id={} metadata={}",
            event.event_type,
            event.source,
            event.correlation_id.as_deref().unwrap_or("-"),
            metadata
        );
        Ok(())
    }
}

/// Emitter that keeps events in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct CollectingEmitter {
    events: Mutex<Vec<Event>>,
}

impl CollectingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events_of(&self, event_type: EventType) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Emitter for CollectingEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}
