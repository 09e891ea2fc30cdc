// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

///
/// An AsyncLatch is a condition that can be triggered once to release any tasks that are waiting
/// for it.
///
/// Triggering is sticky: once triggered, the latch stays triggered, and later waiters return
/// immediately. There is no way to reset the condition.
///
#[derive(Clone)]
pub struct AsyncLatch {
    sender: Arc<Mutex<Option<watch::Sender<()>>>>,
    receiver: watch::Receiver<()>,
}

impl AsyncLatch {
    pub fn new() -> AsyncLatch {
        let (sender, receiver) = watch::channel(());
        AsyncLatch {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    ///
    /// Mark this latch triggered, releasing all tasks that are waiting for it to trigger.
    ///
    /// All calls to trigger after the first one are noops.
    ///
    pub fn trigger(&self) {
        // Triggering the latch drops the Sender, which causes all waiting Receivers to resolve.
        self.sender.lock().take();
    }

    ///
    /// Wait for another task to trigger this latch.
    ///
    pub async fn triggered(&self) {
        // Wait for our clone of the receiver to observe the Sender being dropped.
        let mut receiver = self.receiver.clone();
        while receiver.changed().await.is_ok() {}
    }

    ///
    /// Return true if the latch has been triggered.
    ///
    pub fn poll_triggered(&self) -> bool {
        self.sender.lock().is_none()
    }
}

#[cfg(test)]
mod tests;
