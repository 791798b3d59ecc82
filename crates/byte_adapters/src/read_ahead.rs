// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{Level, event};

use crate::slot::{Drained, SlotBuffer};
use crate::{Cancellation, Error};

/// Default capacity of each of the two read-ahead buffers, in bytes.
pub const DEFAULT_CAPACITY: usize = 81_920;

const DEFAULT_THREAD_NAME: &str = "byte-adapters-read-ahead";

/// A forward-only reader that prefetches from a slow or blocking source on a background thread.
///
/// The reader owns two buffers of equal capacity. A dedicated worker thread fills them
/// alternately, first buffer then second, while the consumer drains them in the same order.
/// The worker blocks as soon as it is one whole buffer ahead of the consumer, so memory use is
/// bounded to twice the configured capacity regardless of how slowly the consumer reads.
///
/// Bytes are delivered in source order with no duplication and no gaps. A failure of the source
/// is delivered to the consumer once, after the contents of every buffer that was completely
/// filled before it, and the reader is unusable afterwards. Bytes of the buffer that was being
/// filled when the source failed are discarded.
///
/// The reader is readable but not writable or seekable. [`Seek`] is implemented only to report
/// the number of bytes delivered so far via `stream_position()`; every other seek fails with
/// [`io::ErrorKind::Unsupported`].
///
/// # Shutdown
///
/// Dropping the reader cancels the worker and waits for it to exit, which also releases the
/// source. A worker that is inside a blocking read of the source exits once that read returns.
/// Use [`close()`][Self::close] to observe failures of the worker that the consumer did not
/// already see.
///
/// # Example
///
/// ```
/// use std::io::Read;
///
/// use byte_adapters::ReadAhead;
///
/// let source: &'static [u8] = b"hello from a slow device";
/// let mut reader = ReadAhead::builder().capacity(4).build(source).unwrap();
///
/// let mut text = String::new();
/// reader.read_to_string(&mut text).unwrap();
///
/// assert_eq!(text, "hello from a slow device");
/// ```
pub struct ReadAhead {
    slots: Arc<[SlotBuffer; 2]>,
    active: usize,
    position: u64,
    cancellation: Cancellation,
    worker: Option<JoinHandle<io::Result<()>>>,
}

impl ReadAhead {
    /// Always `true`.
    pub const CAN_READ: bool = true;

    /// Always `false`.
    pub const CAN_WRITE: bool = false;

    /// Always `false`.
    pub const CAN_SEEK: bool = false;

    /// Starts building a new `ReadAhead`.
    #[must_use]
    pub fn builder() -> ReadAheadBuilder {
        ReadAheadBuilder {
            capacity: DEFAULT_CAPACITY,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            cancellation: None,
        }
    }

    /// Creates a `ReadAhead` with the default configuration and starts prefetching from `source`.
    ///
    /// # Errors
    ///
    /// Fails if the worker thread cannot be started.
    pub fn new<R>(source: R) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        Self::builder().build(source)
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

    /// The cancellation signal shared with the worker.
    ///
    /// Cancelling it makes pending and future reads fail and stops prefetching.
    #[must_use]
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Stops the worker, waits for it to exit and releases the source.
    ///
    /// # Errors
    ///
    /// Returns the failure that ended the worker, unless it was only the result of this
    /// cancellation. A panic in the source surfaces as [`ErrorKind::WorkerFailed`][crate::ErrorKind::WorkerFailed].
    pub fn close(mut self) -> io::Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.cancellation.cancel();

        match worker.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if Error::is_cancellation(&e) => {
                event!(Level::TRACE, message = "read-ahead worker stopped by cancellation");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::worker_failed()),
        }
    }
}

impl Read for ReadAhead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // The active buffer is retried against the other one at most once: a drained buffer
        // that is not at end-of-source means the next bytes are in the other buffer.
        for _ in 0..2 {
            match self.slots[self.active].drain_blocking(buf, &self.cancellation)? {
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
}

impl Seek for ReadAhead {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.position),
            _ => Err(Error::unsupported("read-ahead reader is forward-only")),
        }
    }
}

impl Drop for ReadAhead {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            event!(Level::DEBUG, message = "read-ahead worker ended with failure", error = %e);
        }
    }
}

impl fmt::Debug for ReadAhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadAhead")
            .field("capacity", &self.capacity())
            .field("active", &self.active)
            .field("position", &self.position)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

/// Creates an instance of [`ReadAhead`].
///
/// Access through [`ReadAhead::builder()`][ReadAhead::builder].
#[derive(Debug)]
pub struct ReadAheadBuilder {
    capacity: usize,
    thread_name: String,
    cancellation: Option<Cancellation>,
}

impl ReadAheadBuilder {
    /// The capacity of each of the two buffers, in bytes. Must be positive.
    ///
    /// Optional. Defaults to [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// The name of the worker thread.
    ///
    /// Optional.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
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

    /// Builds the `ReadAhead` and starts prefetching from `source`.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] if the capacity is zero, before the source is
    /// touched. Fails if the worker thread cannot be started.
    pub fn build<R>(self, source: R) -> io::Result<ReadAhead>
    where
        R: Read + Send + 'static,
    {
        if self.capacity == 0 {
            return Err(Error::invalid_argument("read-ahead capacity must be positive"));
        }

        let slots = Arc::new([SlotBuffer::new(self.capacity), SlotBuffer::new(self.capacity)]);
        let cancellation = self.cancellation.unwrap_or_default();

        let worker = {
            let slots = Arc::clone(&slots);
            let cancellation = cancellation.clone();

            thread::Builder::new()
                .name(self.thread_name)
                .spawn(move || run_worker(source, &slots, &cancellation))?
        };

        Ok(ReadAhead {
            slots,
            active: 0,
            position: 0,
            cancellation,
            worker: Some(worker),
        })
    }
}

/// Keeps both buffers full, first then second, until the source is exhausted or fails, or
/// cancellation is requested. Owns the source, which is dropped when the loop ends.
fn run_worker<R: Read>(mut source: R, slots: &[SlotBuffer; 2], cancellation: &Cancellation) -> io::Result<()> {
    event!(Level::DEBUG, message = "read-ahead worker started", capacity = slots[0].capacity());

    let mut index = 0;

    loop {
        let slot = &slots[index];

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| slot.fill_blocking(&mut source, cancellation)))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        let source: &'static [u8] = b"abc";

        let error = ReadAhead::builder().capacity(0).build(source).unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn capability_flags() {
        assert!(ReadAhead::CAN_READ);
        assert!(!ReadAhead::CAN_WRITE);
        assert!(!ReadAhead::CAN_SEEK);
    }

    #[test]
    fn seek_only_reports_position() {
        testing_aids::execute_or_terminate_process(|| {
            let source: &'static [u8] = b"0123456789";
            let mut reader = ReadAhead::builder().capacity(3).build(source).unwrap();

            let mut buf = [0_u8; 4];
            reader.read_exact(&mut buf).unwrap();

            assert_eq!(reader.stream_position().unwrap(), 4);
            assert_eq!(reader.position(), 4);

            let error = reader.seek(SeekFrom::Start(0)).unwrap_err();
            assert_eq!(error.kind(), io::ErrorKind::Unsupported);

            let error = reader.seek(SeekFrom::Current(1)).unwrap_err();
            assert_eq!(error.kind(), io::ErrorKind::Unsupported);
        });
    }

    #[test]
    fn empty_destination_reads_nothing() {
        testing_aids::execute_or_terminate_process(|| {
            let source: &'static [u8] = b"abc";
            let mut reader = ReadAhead::new(source).unwrap();

            assert_eq!(reader.read(&mut []).unwrap(), 0);
            assert_eq!(reader.position(), 0);

            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).unwrap();
            assert_eq!(rest, b"abc");
        });
    }

    #[test]
    fn close_twice_is_harmless() {
        testing_aids::execute_or_terminate_process(|| {
            let source: &'static [u8] = b"abc";
            let mut reader = ReadAhead::builder().capacity(1).build(source).unwrap();

            reader.shutdown().unwrap();
            reader.shutdown().unwrap();
            reader.close().unwrap();
        });
    }
}
