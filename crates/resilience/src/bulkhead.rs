// crates/resilience/src/bulkhead.rs
//! Concurrency bulkhead
//!
//! At most `max_concurrent` calls run at once. Up to `queue_size` further
//! callers wait for a slot in arrival order; anyone beyond that is rejected
//! immediately with `BulkheadFull`.

use crate::context::CallContext;
use crate::error::{ResilienceError, ResilienceResult};
use crate::event::{Event, EventSink, EventType};
use crate::validation::{PolicyConfig, Validator};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Partition name
    pub name: String,
    pub max_concurrent: usize,
    /// Waiters allowed beyond `max_concurrent`; zero disables queueing
    pub queue_size: usize,
    #[serde(with = "crate::serde_duration")]
    pub max_wait: Duration,
}

impl BulkheadConfig {
    pub fn new(name: impl Into<String>, max_concurrent: usize, queue_size: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            queue_size,
            ..Self::default()
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent: 10,
            queue_size: 100,
            max_wait: Duration::from_secs(1),
        }
    }
}

impl PolicyConfig for BulkheadConfig {
    fn policy_name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> ResilienceResult<()> {
        let policy = "bulkhead";
        Validator::not_empty(&self.name, policy, "name")?;
        Validator::positive(self.max_concurrent, policy, "max_concurrent")?;
        Validator::at_most(self.max_concurrent, Semaphore::MAX_PERMITS, policy, "max_concurrent")?;
        Validator::positive_duration(self.max_wait, policy, "max_wait")?;
        Ok(())
    }
}

/// Point-in-time bulkhead metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadStatus {
    pub name: String,
    pub active: usize,
    pub queued: usize,
    pub available: usize,
    pub rejected: u64,
    pub completed: u64,
    pub config: BulkheadConfig,
}

#[derive(Debug)]
struct Shared {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    active: AtomicUsize,
    rejected: AtomicU64,
    completed: AtomicU64,
}

/// A held bulkhead slot. Dropping it frees the slot and wakes the oldest
/// waiter.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    shared: Arc<Shared>,
}

impl BulkheadPermit {
    /// Releases the slot now
    pub fn release(self) {}
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
        self.shared.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Leaves the wait queue however the wait ends
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Semaphore-backed concurrency limiter
#[derive(Debug, Clone)]
pub struct Bulkhead {
    shared: Arc<Shared>,
    events: EventSink,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                waiting: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                rejected: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
            events: EventSink::none(),
        })
    }

    /// Routes rejection events to `events`
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.shared.config
    }

    /// Acquires a slot, waiting at most the configured `max_wait`
    pub async fn acquire(&self, ctx: &CallContext) -> ResilienceResult<BulkheadPermit> {
        self.acquire_with_wait(ctx, self.shared.config.max_wait)
            .await
    }

    /// Acquires a slot, waiting at most `max_wait` in the FIFO queue
    pub async fn acquire_with_wait(
        &self,
        ctx: &CallContext,
        max_wait: Duration,
    ) -> ResilienceResult<BulkheadPermit> {
        let shared = &self.shared;
        if let Err(reason) = ctx.check() {
            return Err(ctx.annotate(ResilienceError::cancelled(self.name(), reason)));
        }

        if let Ok(permit) = Arc::clone(&shared.semaphore).try_acquire_owned() {
            return Ok(self.admit(permit));
        }

        let queue_size = shared.config.queue_size;
        let reserved = shared
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |waiting| {
                (waiting < queue_size).then_some(waiting + 1)
            })
            .is_ok();
        if !reserved {
            return Err(self.reject(ctx));
        }

        let _slot = QueueSlot(&shared.waiting);
        let acquire = Arc::clone(&shared.semaphore).acquire_owned();

        tokio::select! {
            biased;
            reason = ctx.done() => {
                log::debug!("Bulkhead '{}' wait cancelled: {}", self.name(), reason);
                Err(ctx.annotate(ResilienceError::cancelled(self.name(), reason)))
            }
            permit = acquire => match permit {
                Ok(permit) => Ok(self.admit(permit)),
                Err(_) => Err(self.reject(ctx)),
            },
            _ = tokio::time::sleep(max_wait) => Err(self.reject(ctx)),
        }
    }

    /// Runs `operation` inside the bulkhead, releasing the slot afterwards
    pub async fn execute<F, Fut, T, E>(&self, ctx: &CallContext, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let permit = self.acquire(ctx).await?;
        let result = operation(ctx.clone()).await.map_err(Into::into);
        permit.release();
        result
    }

    pub fn status(&self) -> BulkheadStatus {
        let shared = &self.shared;
        BulkheadStatus {
            name: shared.config.name.clone(),
            active: shared.active.load(Ordering::SeqCst),
            queued: shared.waiting.load(Ordering::SeqCst),
            available: shared.semaphore.available_permits(),
            rejected: shared.rejected.load(Ordering::Relaxed),
            completed: shared.completed.load(Ordering::Relaxed),
            config: shared.config.clone(),
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        BulkheadPermit {
            _permit: permit,
            shared: Arc::clone(&self.shared),
        }
    }

    fn reject(&self, ctx: &CallContext) -> ResilienceError {
        let shared = &self.shared;
        shared.rejected.fetch_add(1, Ordering::Relaxed);
        let active = shared.active.load(Ordering::SeqCst);
        let queued = shared.waiting.load(Ordering::SeqCst);
        log::debug!(
            "Bulkhead '{}' full (active: {}, queued: {})",
            shared.config.name,
            active,
            queued
        );
        self.events.emit(
            Event::builder(EventType::BulkheadFull, shared.config.name.clone())
                .correlation_id(ctx.correlation_id())
                .metadata("active", active)
                .metadata("queued", queued)
                .metadata("max_concurrent", shared.config.max_concurrent)
                .metadata("queue_size", shared.config.queue_size)
                .build(),
        );
        ctx.annotate(ResilienceError::bulkhead_full(
            shared.config.name.clone(),
            shared.config.name.clone(),
            shared.config.max_concurrent,
            shared.config.queue_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{is_bulkhead_full, CancelReason};
    use crate::event::CollectingEmitter;
    use std::sync::Mutex;

    fn bulkhead(max_concurrent: usize, queue_size: usize) -> Bulkhead {
        Bulkhead::new(BulkheadConfig::new("test", max_concurrent, queue_size)).expect("valid config")
    }

    async fn wait_until_queued(bulkhead: &Bulkhead, queued: usize) {
        while bulkhead.status().queued < queued {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(BulkheadConfig::default().validate().is_ok());
        assert!(BulkheadConfig::new("zero-queue", 1, 0).validate().is_ok());

        match Bulkhead::new(BulkheadConfig::new("x", 0, 1)) {
            Err(ResilienceError::InvalidPolicy { field, .. }) => assert_eq!(field, "max_concurrent"),
            other => panic!("expected InvalidPolicy, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_concurrency_rejected() {
        match Bulkhead::new(BulkheadConfig::new("huge", usize::MAX, 0)) {
            Err(ResilienceError::InvalidPolicy { field, .. }) => assert_eq!(field, "max_concurrent"),
            other => panic!("expected InvalidPolicy, got {other:?}"),
        }
        assert!(BulkheadConfig::new("max", Semaphore::MAX_PERMITS, 0)
            .validate()
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_then_reject() {
        let bulkhead = bulkhead(2, 1);
        let ctx = CallContext::new();

        let first = bulkhead.acquire(&ctx).await.expect("first slot");
        let _second = bulkhead.acquire(&ctx).await.expect("second slot");
        assert_eq!(bulkhead.status().active, 2);

        let queued = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire(&CallContext::new()).await.map(|_| ()) })
        };
        wait_until_queued(&bulkhead, 1).await;

        let start = tokio::time::Instant::now();
        let err = bulkhead.acquire(&ctx).await.unwrap_err();
        assert!(is_bulkhead_full(&err));
        assert_eq!(start.elapsed(), Duration::ZERO);

        first.release();
        assert!(queued.await.expect("waiter task").is_ok());

        let status = bulkhead.status();
        assert_eq!(status.queued, 0);
        assert_eq!(status.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_queue_rejects_immediately() {
        let bulkhead = bulkhead(1, 0);
        let _held = bulkhead.acquire(&CallContext::new()).await.expect("slot");

        let start = tokio::time::Instant::now();
        assert!(bulkhead.acquire(&CallContext::new()).await.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_expiry_returns_full() {
        let collector = Arc::new(CollectingEmitter::new());
        let bulkhead = bulkhead(1, 4).with_events(EventSink::from(collector.clone()));
        let _held = bulkhead.acquire(&CallContext::new()).await.expect("slot");

        let result = bulkhead
            .acquire_with_wait(&CallContext::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ResilienceError::BulkheadFull { .. })));
        assert_eq!(bulkhead.status().queued, 0);
        assert_eq!(collector.events_of(EventType::BulkheadFull).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_unblocks_waiter() {
        let bulkhead = bulkhead(1, 4);
        let _held = bulkhead.acquire(&CallContext::new()).await.expect("slot");

        let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
        match bulkhead.acquire(&ctx).await {
            Err(ResilienceError::Cancelled { reason, .. }) => {
                assert_eq!(reason, CancelReason::DeadlineExceeded)
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(bulkhead.status().queued, 0);
        assert_eq!(bulkhead.status().rejected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_admitted_in_arrival_order() {
        let bulkhead = bulkhead(1, 3);
        let held = bulkhead.acquire(&CallContext::new()).await.expect("slot");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for i in 0..3 {
            let bulkhead_clone = bulkhead.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let permit = bulkhead_clone.acquire(&CallContext::new()).await?;
                order.lock().expect("order lock").push(i);
                permit.release();
                Ok::<_, ResilienceError>(())
            }));
            wait_until_queued(&bulkhead, i + 1).await;
        }

        held.release();
        for waiter in waiters {
            assert!(waiter.await.expect("waiter task").is_ok());
        }
        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_execute_releases_on_error() {
        let bulkhead = bulkhead(1, 0);

        let result = bulkhead
            .execute(&CallContext::new(), |_| async {
                Err::<(), _>(std::io::Error::other("boom"))
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::Operation(_))));

        let value = bulkhead
            .execute(&CallContext::new(), |_| async { Ok::<_, ResilienceError>(5) })
            .await;
        assert_eq!(value.ok(), Some(5));

        let status = bulkhead.status();
        assert_eq!(status.active, 0);
        assert_eq!(status.available, 1);
        assert_eq!(status.completed, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_limit() {
        let bulkhead = Bulkhead::new(
            BulkheadConfig::new("db", 3, 64).with_max_wait(Duration::from_secs(5)),
        )
        .expect("valid config");
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let bulkhead = bulkhead.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                bulkhead
                    .execute(&CallContext::new(), |_| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ResilienceError>(())
                    })
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.expect("task").is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(bulkhead.status().completed, 24);
    }
}
