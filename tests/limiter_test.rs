//! Token bucket governor tests
//!
//! Run with: cargo test --test limiter_test

use slsk::{Governor, TokenBucket, Unlimited};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// GRANTS
// =============================================================================

#[tokio::test]
async fn test_grant_never_exceeds_request_or_budget() {
    let bucket = TokenBucket::new(1000, Duration::from_millis(100));
    let cancel = CancellationToken::new();

    assert_eq!(bucket.grant(100, &cancel).await.unwrap(), 100);
    assert_eq!(bucket.grant(2000, &cancel).await.unwrap(), 900);
    assert_eq!(bucket.available(), 0);
}

#[tokio::test]
async fn test_drained_bucket_blocks_until_interval() {
    let bucket = TokenBucket::new(512, Duration::from_millis(50));
    let cancel = CancellationToken::new();
    bucket.grant(512, &cancel).await.unwrap();

    let start = Instant::now();
    let granted = bucket.grant(64, &cancel).await.unwrap();
    assert_eq!(granted, 64);
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[tokio::test]
async fn test_many_waiters_all_progress() {
    let bucket = TokenBucket::new(100, Duration::from_millis(20));
    let cancel = CancellationToken::new();
    bucket.grant(100, &cancel).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let bucket = bucket.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            bucket.grant(50, &cancel).await.unwrap()
        }));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    // every waiter got something, nothing was granted twice
    assert!(total >= 10);
    assert!(total <= 500);
}

// =============================================================================
// RECONFIGURATION AND CANCELLATION
// =============================================================================

#[tokio::test]
async fn test_set_count_applies_on_next_tick() {
    let bucket = TokenBucket::new(10, Duration::from_millis(30));
    let cancel = CancellationToken::new();
    bucket.grant(10, &cancel).await.unwrap();

    bucket.set_count(1000);
    assert_eq!(bucket.available(), 0);
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(bucket.available(), 1000);
}

#[tokio::test]
async fn test_cancel_releases_blocked_granter() {
    let bucket = TokenBucket::new(1, Duration::from_secs(3600));
    let cancel = CancellationToken::new();
    bucket.grant(1, &cancel).await.unwrap();

    let c = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        c.cancel();
    });
    assert!(bucket.grant(1, &cancel).await.is_err());
}

#[tokio::test]
async fn test_unlimited_governor_grants_everything() {
    let cancel = CancellationToken::new();
    assert_eq!(
        Unlimited.grant(usize::MAX / 4, &cancel).await.unwrap(),
        usize::MAX / 4
    );
}
