// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::io::AsyncRead;
use tokio::task::JoinHandle;
use tracing::{Level, event};

use crate::read_ahead::DEFAULT_CAPACITY;
use crate::slot::{Drained, SlotBuffer};
use crate::{Cancellation, Error};

/// Asynchronous flavor of [`ReadAhead`][crate::ReadAhead].
///
/// Prefetching runs as a Tokio task instead of a dedicated thread, reading from an
/// [`AsyncRead`] source. The buffering, ordering and backpressure guarantees are identical.
///
/// Dropping the reader requests cancellation but cannot wait for the task; the task exits at
/// its next suspension point and releases the source then. Use [`close()`][Self::close] to wait
/// for the task and observe its failures.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use byte_adapters::AsyncReadAhead;
///
/// let source: &'static [u8] = b"prefetched";
/// let mut reader = AsyncReadAhead::builder().capacity(4).build(source).unwrap();
///
/// let mut buf = [0_u8; 16];
/// let mut text = Vec::new();
///
/// loop {
///     let count = reader.read(&mut buf).await.unwrap();
///     if count == 0 {
///         break;
///     }
///     text.extend_from_slice(&buf[..count]);
/// }
///
/// assert_eq!(text, b"prefetched");
/// reader.close().await.unwrap();
/// # }
/// ```
pub struct AsyncReadAhead {
    slots: Arc<[SlotBuffer; 2]>,
    active: usize,
    position: u64,
    cancellation: Cancellation,
    worker: Option<JoinHandle<io::Result<()>>>,
}

impl AsyncReadAhead {
    /// Always `true`.
    pub const CAN_READ: bool = true;

    /// Always `false`.
    pub const CAN_WRITE: bool = false;

    /// Always `false`.
    pub const CAN_SEEK: bool = false;

    /// Starts building a new `AsyncReadAhead`.
    #[must_use]
    pub fn builder() -> AsyncReadAheadBuilder {
        AsyncReadAheadBuilder {
            capacity: DEFAULT_CAPACITY,
            cancellation: None,
        }
    }

    /// Creates an `AsyncReadAhead` with the default configuration and starts prefetching.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn new<R>(source: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::spawn(source, DEFAULT_CAPACITY, Cancellation::new())
    }

    fn spawn<R>(source: R, capacity: usize, cancellation: Cancellation) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let slots = Arc::new([SlotBuffer::new(capacity), SlotBuffer::new(capacity)]);

        let worker = {
            let slots = Arc::clone(&slots);
            let cancellation = cancellation.clone();
            tokio::spawn(async move { run_worker(source, &slots, &cancellation).await })
        };

        Self {
            slots,
            active: 0,
            position: 0,
            cancellation,
            worker: Some(worker),
        }
    }

    /// Reads up to `buf.len()` bytes, waiting for the background task if no prefetched bytes
    /// are available. Returns 0 once the source is exhausted, and on every later call.
    ///
    /// # Errors
    ///
    /// Returns the source's failure once it is reached in the byte stream, a
    /// [`BrokenPipe`][io::ErrorKind::BrokenPipe] error on every read after that, and a
    /// cancellation error if cancellation is requested while waiting.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        for _ in 0..2 {
            match self.slots[self.active].drain(buf, &self.cancellation).await? {
                Drained::Bytes(count) => {
                    self.position += count as u64;
                    return Ok(count);
                }
                Drained::EndOfSource => return Ok(0),
                Drained::Exhausted => self.active ^= 1,
            }
        }

        Ok(0)
    }

    /// The number of bytes delivered to the consumer so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The capacity of each of the two buffers.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots[0].capacity()
    }

    /// The cancellation signal shared with the background task.
    #[must_use]
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Stops the background task, waits for it to exit and releases the source.
    ///
    /// # Errors
    ///
    /// Returns the failure that ended the task, unless it was only the result of this
    /// cancellation.
    pub async fn close(mut self) -> io::Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.cancellation.cancel();

        match worker.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if Error::is_cancellation(&e) => {
                event!(Level::TRACE, message = "read-ahead task stopped by cancellation");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(io::Error::from(Error::caused_by(crate::ErrorKind::WorkerFailed, e))),
        }
    }
}

impl Drop for AsyncReadAhead {
    fn drop(&mut self) {
        if self.worker.take().is_some() {
            self.cancellation.cancel();
        }
    }
}

impl fmt::Debug for AsyncReadAhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncReadAhead")
            .field("capacity", &self.capacity())
            .field("active", &self.active)
            .field("position", &self.position)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

/// Creates an instance of [`AsyncReadAhead`].
///
/// Access through [`AsyncReadAhead::builder()`][AsyncReadAhead::builder].
#[derive(Debug)]
pub struct AsyncReadAheadBuilder {
    capacity: usize,
    cancellation: Option<Cancellation>,
}

impl AsyncReadAheadBuilder {
    /// The capacity of each of the two buffers, in bytes. Must be positive.
    ///
    /// Optional. Defaults to [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// The cancellation signal to use. The reader cancels it when it shuts down.
    ///
    /// Optional. Defaults to a signal owned by the reader.
    #[must_use]
    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Builds the `AsyncReadAhead` and starts prefetching from `source`.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] if the capacity is zero.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    pub fn build<R>(self, source: R) -> io::Result<AsyncReadAhead>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if self.capacity == 0 {
            return Err(Error::invalid_argument("read-ahead capacity must be positive"));
        }

        Ok(AsyncReadAhead::spawn(source, self.capacity, self.cancellation.unwrap_or_default()))
    }
}

async fn run_worker<R>(mut source: R, slots: &[SlotBuffer; 2], cancellation: &Cancellation) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    event!(Level::DEBUG, message = "read-ahead task started", capacity = slots[0].capacity());

    let mut index = 0;

    loop {
        let slot = &slots[index];

        let outcome = AssertUnwindSafe(slot.fill(&mut source, cancellation))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::worker_failed()));

        match outcome {
            Ok(()) if slot.is_end_of_source() => {
                event!(Level::DEBUG, message = "read-ahead source exhausted");
                return Ok(());
            }
            Ok(()) => index ^= 1,
            Err(e) if Error::is_cancellation(&e) => return Err(e),
            Err(e) => {
                event!(Level::WARN, message = "read-ahead source failed", error = %e);

                let report = io::Error::new(e.kind(), e.to_string());
                slot.fail(e);
                return Err(report);
            }
        }
    }
}
