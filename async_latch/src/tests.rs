// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::AsyncLatch;

#[tokio::test]
async fn trigger_releases_waiters() {
    let latch = AsyncLatch::new();
    assert!(!latch.poll_triggered());

    let latch2 = latch.clone();
    let waiter = tokio::spawn(async move { latch2.triggered().await });

    // The waiter should not complete before the latch is triggered.
    sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    latch.trigger();
    timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(latch.poll_triggered());
}

#[tokio::test]
async fn waiting_after_trigger_returns_immediately() {
    let latch = AsyncLatch::new();
    latch.trigger();
    // A second trigger is a noop.
    latch.trigger();
    timeout(Duration::from_secs(5), latch.triggered())
        .await
        .unwrap();
}
