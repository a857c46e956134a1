//! Waiter correlation tests
//!
//! Run with: cargo test --test waiter_test

use slsk::{Error, WaitKey, Waiter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn waiter() -> Waiter {
    Waiter::new(Duration::from_secs(5))
}

// =============================================================================
// COMPLETION ORDER
// =============================================================================

#[tokio::test]
async fn test_fifo_across_tasks() {
    let waiter = waiter();
    let key = WaitKey::named("search").with(1234);

    // registration is synchronous, so ordering is deterministic
    let first = waiter.wait::<String>(key.clone(), None, None);
    let second = waiter.wait::<String>(key.clone(), None, None);
    let third = waiter.wait::<String>(key.clone(), None, None);

    waiter.complete(&key, "a".to_string());
    waiter.complete(&key, "b".to_string());
    waiter.complete(&key, "c".to_string());

    assert_eq!(first.await.unwrap(), "a");
    assert_eq!(second.await.unwrap(), "b");
    assert_eq!(third.await.unwrap(), "c");
}

#[tokio::test]
async fn test_distinct_keys_do_not_interfere() {
    let waiter = waiter();
    let wait_a = waiter.wait::<u32>(WaitKey::named("x").with("a"), None, None);
    let wait_b = waiter.wait::<u32>(WaitKey::named("x").with("b"), None, None);

    waiter.complete(&WaitKey::named("x").with("b"), 2u32);
    waiter.complete(&WaitKey::named("x").with("a"), 1u32);

    assert_eq!(wait_a.await.unwrap(), 1);
    assert_eq!(wait_b.await.unwrap(), 2);
}

// =============================================================================
// TIMEOUT AND CANCELLATION
// =============================================================================

#[tokio::test]
async fn test_timeout_is_terminal_for_that_wait_only() {
    let waiter = waiter();
    let key = WaitKey::named("k");

    let doomed = waiter.wait::<u32>(key.clone(), Some(Duration::from_millis(10)), None);
    assert!(matches!(doomed.await, Err(Error::Timeout(_))));

    // the key is reusable afterwards
    let ok = waiter.wait::<u32>(key.clone(), None, None);
    waiter.complete(&key, 5u32);
    assert_eq!(ok.await.unwrap(), 5);
}

#[tokio::test]
async fn test_cancelled_wait_leaves_queue_for_next_registrant() {
    let waiter = waiter();
    let key = WaitKey::named("k");
    let cancel = CancellationToken::new();

    let cancelled = waiter.wait::<u32>(key.clone(), None, Some(cancel.clone()));
    let survivor = waiter.wait::<u32>(key.clone(), None, None);

    cancel.cancel();
    assert!(matches!(cancelled.await, Err(Error::Cancelled)));

    // the cancelled head dequeued itself; the completion reaches the survivor
    waiter.complete(&key, 9u32);
    assert_eq!(survivor.await.unwrap(), 9);
}

#[tokio::test]
async fn test_cancel_all_fails_everything() {
    let waiter = waiter();
    let mut waits = Vec::new();
    for i in 0..8 {
        waits.push(waiter.wait::<u32>(WaitKey::named("bulk").with(i), None, None));
    }
    waiter.cancel_all();
    for wait in waits {
        assert!(matches!(wait.await, Err(Error::Cancelled)));
    }
    assert_eq!(waiter.pending(), 0);
}

// =============================================================================
// EDGE CASES
// =============================================================================

#[tokio::test]
async fn test_unmatched_completion_is_silent() {
    let waiter = waiter();
    assert!(!waiter.complete(&WaitKey::named("nobody"), 1u32));
    assert!(!waiter.throw(&WaitKey::named("nobody"), Error::ConnectionClosed));
}

#[tokio::test]
async fn test_wrong_payload_type_is_an_error() {
    let waiter = waiter();
    let key = WaitKey::named("typed");
    let wait = waiter.wait::<String>(key.clone(), None, None);
    waiter.complete(&key, 42u32);
    assert!(matches!(wait.await, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn test_thrown_error_reaches_waiter() {
    let waiter = waiter();
    let key = WaitKey::named("err");
    let wait = waiter.wait::<u32>(key.clone(), None, None);
    waiter.throw(&key, Error::UserOffline("ghost".into()));
    match wait.await {
        Err(Error::UserOffline(name)) => assert_eq!(name, "ghost"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// Hammer one key with short-lived waits while the monitor garbage-collects
/// empty queues; a lost registration would surface as a missed completion.
#[tokio::test]
async fn test_cleanup_never_loses_concurrent_enqueues() {
    let waiter = Arc::new(waiter());
    let key = WaitKey::named("churn");

    for round in 0..200u32 {
        let wait = waiter.wait::<u32>(key.clone(), Some(Duration::from_secs(2)), None);
        assert!(waiter.complete(&key, round));
        assert_eq!(wait.await.unwrap(), round);
        if round % 50 == 0 {
            // give the monitor a chance to run its sweep
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
    }
}
