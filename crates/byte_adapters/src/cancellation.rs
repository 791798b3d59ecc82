// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A cooperative cancellation signal shared between an adapter, its background work and
/// the caller.
///
/// Every blocking or asynchronous wait performed by the adapters races against this signal.
/// Once cancelled, the signal stays cancelled and pending waits complete with an error that
/// [`Error::is_cancellation()`][crate::Error::is_cancellation] recognizes.
///
/// Clones share the same underlying state.
///
/// # Example
///
/// ```
/// use byte_adapters::Cancellation;
///
/// let cancellation = Cancellation::new();
/// let observer = cancellation.clone();
///
/// cancellation.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// Creates a signal that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes every pending wait.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            // A `Notified` future observes `notify_waiters()` from the moment it is created,
            // so the flag check below cannot miss a concurrent `cancel()`.
            let notified = self.inner.notify.notified();

            if self.is_cancelled() {
                return;
            }

            notified.await;
        }
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation").field("cancelled", &self.is_cancelled()).finish()
    }
}
