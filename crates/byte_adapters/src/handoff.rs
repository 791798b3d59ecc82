// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::permit::Permit;
use crate::{Cancellation, Error};

/// An in-memory byte sink whose writes are gated by a handoff lock.
///
/// The sink is the output of a push-based transform driven by an
/// [`Inverter`][crate::Inverter] or [`AsyncInverter`][crate::AsyncInverter]. The inverter holds
/// the lock except while it is the transform's turn to produce output. Every write waits for
/// the lock, appends to the sink and gives the lock back when done, whether or not it succeeded.
///
/// Reading, seeking and length queries do not take the lock. They are meant for the inverter,
/// which only performs them while it holds the lock itself.
///
/// # Deferred writes
///
/// A transform that finishes its writes later, e.g. on another thread, must take the lock
/// before its write call returns and carry the [`HandoffGuard`] to the place where the write
/// completes. Dropping the guard gives the lock back and lets the inverter continue. A
/// transform must not take the lock a second time while it still holds a guard; doing so
/// deadlocks.
///
/// # Example
///
/// ```
/// use std::io::Write;
/// use std::thread;
///
/// use byte_adapters::HandoffSink;
///
/// fn deferred_write(sink: &HandoffSink, data: Vec<u8>) -> std::io::Result<thread::JoinHandle<()>> {
///     let mut guard = sink.lock()?;
///
///     Ok(thread::spawn(move || {
///         guard.write_all(&data).unwrap();
///         // The lock is given back when the guard is dropped.
///     }))
/// }
/// ```
#[derive(Clone)]
pub struct HandoffSink {
    shared: Arc<Shared>,
}

struct Shared {
    buffer: Mutex<Buffer>,
    turn: Permit,
    cancellation: Cancellation,
}

#[derive(Debug, Default)]
struct Buffer {
    bytes: Vec<u8>,
    position: usize,
}

impl HandoffSink {
    /// Creates a sink whose lock is held by the caller.
    pub(crate) fn new(cancellation: Cancellation) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(Buffer::default()),
                turn: Permit::new(false),
                cancellation,
            }),
        }
    }

    /// Takes the lock, waiting until it is the producer's turn.
    ///
    /// # Errors
    ///
    /// Fails if cancellation is requested while waiting.
    pub fn lock(&self) -> io::Result<HandoffGuard> {
        self.shared.turn.acquire_blocking(&self.shared.cancellation)?;
        Ok(self.guard())
    }

    /// Asynchronous flavor of [`lock()`][Self::lock].
    ///
    /// # Errors
    ///
    /// Fails if cancellation is requested while waiting.
    pub async fn lock_async(&self) -> io::Result<HandoffGuard> {
        self.shared.turn.acquire(&self.shared.cancellation).await?;
        Ok(self.guard())
    }

    /// Appends `data` once it is the producer's turn, then gives the lock back.
    ///
    /// # Errors
    ///
    /// Fails if cancellation is requested while waiting.
    pub async fn write_async(&self, data: &[u8]) -> io::Result<()> {
        self.lock_async().await?.append(data);
        Ok(())
    }

    /// The number of bytes in the sink, read or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.buffer.lock().bytes.len()
    }

    /// Whether the sink holds no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The read cursor.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.shared.buffer.lock().position as u64
    }

    /// Moves the read cursor. Positions past the end read nothing.
    pub fn set_position(&self, position: u64) {
        self.shared.buffer.lock().position = usize::try_from(position).unwrap_or(usize::MAX);
    }

    /// The number of bytes between the read cursor and the end of the sink.
    #[must_use]
    pub fn unread(&self) -> usize {
        let buffer = self.shared.buffer.lock();
        buffer.bytes.len().saturating_sub(buffer.position)
    }

    /// Copies unread bytes into `destination` and advances the read cursor.
    pub(crate) fn read_unlocked(&self, destination: &mut [u8]) -> usize {
        let mut buffer = self.shared.buffer.lock();
        let start = buffer.position.min(buffer.bytes.len());
        let count = (buffer.bytes.len() - start).min(destination.len());

        destination[..count].copy_from_slice(&buffer.bytes[start..start + count]);
        buffer.position = start + count;

        count
    }

    /// Hands the lock to the producer.
    pub(crate) fn grant(&self) {
        self.shared.turn.release();
    }

    /// Takes the lock back, waiting for any write in progress to finish.
    pub(crate) fn reclaim_blocking(&self, cancellation: &Cancellation) -> io::Result<()> {
        self.shared.turn.acquire_blocking(cancellation)
    }

    /// Asynchronous flavor of [`Self::reclaim_blocking()`].
    pub(crate) async fn reclaim(&self, cancellation: &Cancellation) -> io::Result<()> {
        self.shared.turn.acquire(cancellation).await
    }

    /// Discards all bytes and moves the read cursor to the start.
    pub(crate) fn reset(&self) {
        let mut buffer = self.shared.buffer.lock();
        buffer.bytes.clear();
        buffer.position = 0;
    }

    /// Moves the read cursor to the start.
    pub(crate) fn rewind(&self) {
        self.shared.buffer.lock().position = 0;
    }

    fn guard(&self) -> HandoffGuard {
        HandoffGuard {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Write for HandoffSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.append(buf);
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.lock()?.append(buf);
        Ok(())
    }

    #[cfg_attr(test, mutants::skip)] // Nothing to flush.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for HandoffSink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_unlocked(buf))
    }
}

impl Seek for HandoffSink {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut buffer = self.shared.buffer.lock();

        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => (buffer.bytes.len() as u64).checked_add_signed(delta),
            SeekFrom::Current(delta) => (buffer.position as u64).checked_add_signed(delta),
        };

        let target = target.ok_or_else(|| Error::invalid_argument("seek before the start of the sink"))?;
        buffer.position = usize::try_from(target).unwrap_or(usize::MAX);

        Ok(target)
    }
}

impl fmt::Debug for HandoffSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.shared.buffer.lock();

        f.debug_struct("HandoffSink")
            .field("len", &buffer.bytes.len())
            .field("position", &buffer.position)
            .finish_non_exhaustive()
    }
}

/// Proof that the holder may write to a [`HandoffSink`].
///
/// Writes through the guard append to the sink. The lock is given back when the guard is
/// dropped. The guard is `Send` and `'static`, so it can travel to wherever a deferred write
/// completes.
pub struct HandoffGuard {
    shared: Arc<Shared>,
}

impl HandoffGuard {
    /// Appends `data` to the sink.
    pub fn append(&mut self, data: &[u8]) {
        self.shared.buffer.lock().bytes.extend_from_slice(data);
    }
}

impl Write for HandoffGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    #[cfg_attr(test, mutants::skip)] // Nothing to flush.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for HandoffGuard {
    fn drop(&mut self) {
        self.shared.turn.release();
    }
}

impl fmt::Debug for HandoffGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use testing_aids::{async_test, execute_or_terminate_process};

    use super::*;

    #[test]
    fn writes_wait_for_grant() {
        execute_or_terminate_process(|| {
            let sink = HandoffSink::new(Cancellation::new());
            let cancellation = Cancellation::new();

            let writer = {
                let mut sink = sink.clone();
                thread::spawn(move || sink.write_all(b"payload"))
            };

            thread::sleep(Duration::from_millis(20));
            assert!(sink.is_empty());

            sink.grant();
            writer.join().unwrap().unwrap();
            sink.reclaim_blocking(&cancellation).unwrap();

            assert_eq!(sink.len(), 7);
        });
    }

    #[test]
    fn reclaim_waits_for_deferred_guard() {
        execute_or_terminate_process(|| {
            let sink = HandoffSink::new(Cancellation::new());
            let cancellation = Cancellation::new();
            sink.grant();

            let mut guard = sink.lock().unwrap();
            let finisher = thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                guard.write_all(b"late").unwrap();
            });

            sink.reclaim_blocking(&cancellation).unwrap();

            // The reclaim could only succeed after the guard was dropped.
            assert_eq!(sink.len(), 4);
            finisher.join().unwrap();
        });
    }

    #[test]
    fn failed_lock_leaves_sink_untouched() {
        let cancellation = Cancellation::new();
        let mut sink = HandoffSink::new(cancellation.clone());
        cancellation.cancel();

        let error = sink.write_all(b"never").unwrap_err();

        assert!(Error::is_cancellation(&error));
        assert!(sink.is_empty());
    }

    #[test]
    fn read_and_seek_ignore_the_lock() {
        let mut sink = HandoffSink::new(Cancellation::new());
        sink.grant();
        sink.write_all(b"0123456789").unwrap();

        let mut buf = [0_u8; 4];
        assert_eq!(sink.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(sink.unread(), 6);

        assert_eq!(sink.seek(SeekFrom::End(-2)).unwrap(), 8);
        assert_eq!(sink.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");

        sink.set_position(1);
        assert_eq!(sink.position(), 1);

        let error = sink.seek(SeekFrom::Current(-5)).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn reset_and_rewind() {
        let mut sink = HandoffSink::new(Cancellation::new());
        sink.grant();
        sink.write_all(b"abc").unwrap();

        let mut buf = [0_u8; 3];
        assert_eq!(sink.read(&mut buf).unwrap(), 3);
        assert_eq!(sink.unread(), 0);

        sink.rewind();
        assert_eq!(sink.unread(), 3);

        sink.reset();
        assert!(sink.is_empty());
        assert_eq!(sink.position(), 0);
    }

    #[test]
    fn async_write_appends() {
        async_test(async || {
            let sink = HandoffSink::new(Cancellation::new());
            sink.grant();

            sink.write_async(b"ab").await.unwrap();
            sink.write_async(b"cd").await.unwrap();

            let mut buf = [0_u8; 4];
            assert_eq!(sink.read_unlocked(&mut buf), 4);
            assert_eq!(&buf, b"abcd");
        });
    }
}
