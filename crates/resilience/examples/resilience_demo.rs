// crates/resilience/examples/resilience_demo.rs
//! Demonstration of resilience patterns
//!
//! Run with `RUST_LOG=debug` to see guard events.

use platform_resilience::{
    error_chain, Bulkhead, CallContext, CircuitBreaker, EventSink, GuardRegistry, LogEmitter,
    RateLimiter, ResilienceError, ResiliencePolicy, TimeoutManager,
};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLICY: &str = r#"
name = "policy-store"
version = 2

[circuit_breaker]
failure_threshold = 3
success_threshold = 1
timeout = 100

[retry]
max_attempts = 3
base_delay = 50
max_delay = 400
multiplier = 2.0
jitter = 0.1

[rate_limit]
algorithm = "token_bucket"
rate = 5
window = 1000
burst_size = 5

[bulkhead]
max_concurrent = 2
queue_size = 1

[timeout]
default = 100
max = 1000

[timeout.per_operation]
evaluate = 50
"#;

#[tokio::main]
async fn main() -> Result<(), ResilienceError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("Resilience Patterns Demo");
    println!("========================\n");

    let registry = GuardRegistry::with_events(EventSink::from(Arc::new(LogEmitter)));
    let policy = ResiliencePolicy::from_toml_str(POLICY)?;
    registry.apply_policy(&policy)?;
    println!("Loaded policy '{}' (version {})\n", policy.name, policy.version);

    demo_retry(&registry).await?;
    println!();
    demo_circuit_breaker(&registry.circuit_breaker("policy-store")?).await;
    println!();
    demo_rate_limiter(&registry.rate_limiter("policy-store")?);
    println!();
    demo_bulkhead(&registry.bulkhead("policy-store")?).await;
    println!();
    demo_timeout(&registry.timeout_manager("policy-store")?).await;
    println!();

    let snapshot = registry.snapshot();
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("Registry snapshot:\n{}", json),
        Err(e) => println!("Snapshot failed to serialize: {}", e),
    }
    Ok(())
}

async fn demo_retry(registry: &GuardRegistry) -> Result<(), ResilienceError> {
    println!("1. Retry Pattern");
    println!("----------------");

    let retry = registry.retry_policy("policy-store")?;
    let attempts = AtomicU32::new(0);
    let ctx = CallContext::new().with_correlation_id("demo-retry");

    let result = retry
        .execute(&ctx, |_| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            println!("  Attempt {}", attempt);
            async move {
                if attempt < 3 {
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "simulated reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    match result {
        Ok(value) => println!("✓ Success after retries: {}", value),
        Err(e) => println!("✗ Failed: {}", e),
    }
    Ok(())
}

async fn demo_circuit_breaker(breaker: &CircuitBreaker) {
    println!("2. Circuit Breaker Pattern");
    println!("--------------------------");

    let ctx = CallContext::new();
    for i in 1..=5 {
        let result = breaker
            .execute(&ctx, |_| async move {
                if i <= 3 {
                    Err(io::Error::other("service unavailable"))
                } else {
                    Ok(i)
                }
            })
            .await;

        match result {
            Ok(_) => println!("  Request {}: ✓ Success", i),
            Err(e) => println!("  Request {}: ✗ {}", i, e),
        }
    }
    println!("  Circuit state: {}", breaker.state());

    tokio::time::sleep(Duration::from_millis(150)).await;
    println!("  Waited for timeout...");

    let result = breaker
        .execute(&ctx, |_| async { Ok::<_, ResilienceError>("probe") })
        .await;
    match result {
        Ok(_) => println!("  Probe: ✓ Success"),
        Err(e) => println!("  Probe: ✗ {}", e),
    }
    println!("  Circuit state: {}", breaker.state());
}

fn demo_rate_limiter(limiter: &RateLimiter) {
    println!("3. Rate Limiter Pattern");
    println!("-----------------------");

    for i in 1..=7 {
        let decision = limiter.allow();
        if decision.allowed {
            println!("  Request {}: ✓ Allowed ({} left)", i, decision.remaining);
        } else {
            println!(
                "  Request {}: ✗ Rate limited, retry after {:?}",
                i, decision.retry_after
            );
        }
    }

    for (name, value) in limiter.headers().to_pairs() {
        println!("  {}: {}", name, value);
    }
}

async fn demo_bulkhead(bulkhead: &Bulkhead) {
    println!("4. Bulkhead Pattern");
    println!("-------------------");

    let tasks: Vec<_> = (1..=4)
        .map(|i| {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                let result = bulkhead
                    .execute(&CallContext::new(), |_| async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ResilienceError>(i)
                    })
                    .await;
                (i, result)
            })
        })
        .collect();

    for task in tasks {
        match task.await {
            Ok((i, Ok(_))) => println!("  Call {}: ✓ Completed", i),
            Ok((i, Err(e))) => println!("  Call {}: ✗ {}", i, e),
            Err(e) => println!("  Task failed: {}", e),
        }
    }

    let status = bulkhead.status();
    println!(
        "  Completed: {}, rejected: {}",
        status.completed, status.rejected
    );
}

async fn demo_timeout(manager: &TimeoutManager) {
    println!("5. Timeout Pattern");
    println!("------------------");

    let ctx = CallContext::new();
    let fast = manager
        .execute(&ctx, "lookup", |_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, ResilienceError>("cached")
        })
        .await;
    match fast {
        Ok(value) => println!("  Fast operation: ✓ {}", value),
        Err(e) => println!("  Fast operation: ✗ {}", e),
    }

    let slow = manager
        .execute(&ctx, "evaluate", |_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ResilienceError>("evaluated")
        })
        .await;
    match slow {
        Ok(value) => println!("  Slow operation: ✓ {}", value),
        Err(e) => {
            println!("  Slow operation: ✗ {}", e);
            for (depth, cause) in error_chain(&e).enumerate().skip(1) {
                println!("    {}cause: {}", "  ".repeat(depth), cause);
            }
        }
    }
}
