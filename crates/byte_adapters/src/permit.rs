// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;

use tokio::sync::Semaphore;

use crate::{Cancellation, Error, ErrorKind};

/// A binary gate that one party releases and another party acquires.
///
/// Acquiring consumes the permit; it does not come back on its own. Whoever holds the
/// logical right to the guarded resource calls [`release()`][Self::release] to hand it over.
/// Waits race against a [`Cancellation`].
///
/// Safe to wait on from both async code and plain threads. Blocking waits drive the async
/// wait on the calling thread.
#[derive(Debug)]
pub(crate) struct Permit {
    semaphore: Semaphore,
}

impl Permit {
    pub(crate) fn new(available: bool) -> Self {
        Self {
            semaphore: Semaphore::new(usize::from(available)),
        }
    }

    pub(crate) async fn acquire(&self, cancellation: &Cancellation) -> io::Result<()> {
        tokio::select! {
            biased;

            () = cancellation.cancelled() => Err(Error::cancelled()),
            permit = self.semaphore.acquire() => {
                permit
                    .map_err(|e| io::Error::from(Error::caused_by(ErrorKind::WorkerFailed, e)))?
                    .forget();
                Ok(())
            }
        }
    }

    pub(crate) fn acquire_blocking(&self, cancellation: &Cancellation) -> io::Result<()> {
        futures::executor::block_on(self.acquire(cancellation))
    }

    pub(crate) fn release(&self) {
        self.semaphore.add_permits(1);
    }

    #[cfg(test)]
    pub(crate) fn is_available(&self) -> bool {
        self.semaphore.available_permits() > 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use testing_aids::execute_or_terminate_process;

    use super::*;

    #[test]
    fn initially_available_permit_is_acquired_once() {
        let permit = Permit::new(true);
        let cancellation = Cancellation::new();

        permit.acquire_blocking(&cancellation).unwrap();

        assert!(!permit.is_available());
    }

    #[test]
    fn release_hands_permit_to_waiting_thread() {
        execute_or_terminate_process(|| {
            let permit = Arc::new(Permit::new(false));
            let cancellation = Cancellation::new();

            let waiter = {
                let permit = Arc::clone(&permit);
                let cancellation = cancellation.clone();
                thread::spawn(move || permit.acquire_blocking(&cancellation))
            };

            permit.release();

            waiter.join().unwrap().unwrap();
            assert!(!permit.is_available());
        });
    }

    #[test]
    fn cancellation_unblocks_waiter() {
        execute_or_terminate_process(|| {
            let permit = Arc::new(Permit::new(false));
            let cancellation = Cancellation::new();

            let waiter = {
                let permit = Arc::clone(&permit);
                let cancellation = cancellation.clone();
                thread::spawn(move || permit.acquire_blocking(&cancellation))
            };

            cancellation.cancel();

            let error = waiter.join().unwrap().unwrap_err();
            assert!(Error::is_cancellation(&error));
        });
    }

    #[test]
    fn cancellation_wins_over_available_permit() {
        let permit = Permit::new(true);
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let error = permit.acquire_blocking(&cancellation).unwrap_err();

        assert!(Error::is_cancellation(&error));
        assert!(permit.is_available());
    }
}
