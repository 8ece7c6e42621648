//! Retrying store calls with exponential backoff
//!
//! Transient storage failures are retried up to the policy's attempt budget;
//! anything else fails on the first attempt.

use recommdo_core::error::CoreError;
use recommdo_core::retry::{retry_with_backoff, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails twice with a transient error, then succeeds
async fn flaky_shard_write(attempt_counter: Arc<AtomicU32>) -> Result<u64, CoreError> {
    let attempts = attempt_counter.fetch_add(1, Ordering::SeqCst);

    if attempts < 2 {
        Err(CoreError::Storage(format!(
            "connection reset on attempt {}",
            attempts + 1
        )))
    } else {
        Ok(5_000)
    }
}

/// Always fails with an error that retrying cannot fix
async fn missing_project() -> Result<u64, CoreError> {
    Err(CoreError::not_found("project", "3f1c"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let policy = RetryPolicy::new(3, Duration::from_millis(50), Duration::from_millis(500));

    println!("1. Transient failures are retried:");
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let result = retry_with_backoff(
        || flaky_shard_write(counter_clone.clone()),
        &policy,
        CoreError::is_transient,
    )
    .await;

    match result {
        Ok(rows) => println!("   ✓ {} rows written", rows),
        Err(e) => println!("   ✗ Failed: {}", e),
    }
    println!("   Total attempts: {}\n", counter.load(Ordering::SeqCst));

    println!("2. Permanent failures are not:");
    let counter = Arc::new(AtomicU32::new(0));

    let result = retry_with_backoff(
        || {
            counter.fetch_add(1, Ordering::SeqCst);
            missing_project()
        },
        &policy,
        CoreError::is_transient,
    )
    .await;

    match result {
        Ok(rows) => println!("   ✓ {} rows written", rows),
        Err(e) => println!("   ✗ Failed immediately: {}", e),
    }
    println!(
        "   Total attempts: {} (should be 1)\n",
        counter.load(Ordering::SeqCst)
    );

    Ok(())
}
