// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io::{self, Read};

use tracing::{Level, event};

use crate::{Cancellation, Error, HandoffSink, Transform};

/// Default size of the chunk read from upstream and pushed into the transform, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 81_920;

/// Turns a push-based transform into a pull-based reader.
///
/// Many processors, compressors in particular, are naturally written as "write bytes in, output
/// appears in a sink". The inverter drives such a [`Transform`] from a pull-based upstream
/// source and serves the transform's output through [`Read`]:
///
/// 1. While no output is buffered and upstream is not exhausted, read one chunk from upstream,
///    hand the sink's lock to the transform, push the chunk in and take the lock back. Taking
///    the lock back waits until the transform has finished writing the chunk's output, so the
///    inverter never runs ahead of the transform and never observes half-written output.
/// 2. When upstream is exhausted, flush and finalize the transform, exactly once.
/// 3. Serve buffered output. Return 0 only when upstream is exhausted and all output is served.
///
/// No background work is spawned; everything happens inside [`read()`][Read::read]. At most one
/// chunk of input and the output it produced are buffered at any time.
///
/// Errors from upstream or from the transform are propagated unchanged and are not retried.
/// An upstream error leaves the inverter as it was, so the next read asks upstream again. Once
/// the transform has failed, or the wait for it was cancelled, every later read fails with
/// [`ErrorKind::Poisoned`][crate::ErrorKind::Poisoned].
///
/// # Example
///
/// ```
/// use std::io::{self, Read, Write};
///
/// use byte_adapters::{HandoffSink, Inverter, Transform};
///
/// /// Upper-cases ASCII text.
/// struct Shout(HandoffSink);
///
/// impl Write for Shout {
///     fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
///         self.0.write_all(&buf.to_ascii_uppercase())?;
///         Ok(buf.len())
///     }
///
///     fn flush(&mut self) -> io::Result<()> {
///         Ok(())
///     }
/// }
///
/// impl Transform for Shout {}
///
/// let upstream: &[u8] = b"quiet please";
/// let mut reader = Inverter::new(upstream, |sink| Ok(Shout(sink))).unwrap();
///
/// let mut text = String::new();
/// reader.read_to_string(&mut text).unwrap();
///
/// assert_eq!(text, "QUIET PLEASE");
/// ```
pub struct Inverter<R, T> {
    // Drop order matters: the transform goes first, then the sink, then upstream.
    transform: Option<T>,
    sink: HandoffSink,
    upstream: R,
    chunk: Box<[u8]>,
    upstream_done: bool,
    // Set while the transform holds the sink. Stays set if the turn never comes back.
    poisoned: bool,
    cancellation: Cancellation,
}

impl<R: Read, T: Transform> Inverter<R, T> {
    /// Always `true`.
    pub const CAN_READ: bool = true;

    /// Always `false`.
    pub const CAN_WRITE: bool = false;

    /// Always `false`.
    pub const CAN_SEEK: bool = false;

    /// Creates an inverter with the default chunk size.
    ///
    /// `factory` receives the sink the transform must write its output to.
    ///
    /// # Errors
    ///
    /// Returns the factory's error. The sink and `upstream` are released before returning.
    pub fn new<F>(upstream: R, factory: F) -> io::Result<Self>
    where
        F: FnOnce(HandoffSink) -> io::Result<T>,
    {
        InverterBuilder::new().build(upstream, factory)
    }

    /// Creates an inverter that reads upstream in chunks of `chunk_size` bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] if `chunk_size` is zero, before calling the
    /// factory. Otherwise returns the factory's error, if any.
    pub fn with_chunk_size<F>(upstream: R, chunk_size: usize, factory: F) -> io::Result<Self>
    where
        F: FnOnce(HandoffSink) -> io::Result<T>,
    {
        InverterBuilder::new().chunk_size(chunk_size).build(upstream, factory)
    }

    /// The cancellation signal that interrupts waits for the transform.
    #[must_use]
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Whether upstream is exhausted and the transform has been finalized.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.upstream_done
    }

    fn read_upstream(&mut self) -> io::Result<usize> {
        loop {
            match self.upstream.read(&mut self.chunk) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    fn push_chunk(&mut self, len: usize) -> io::Result<()> {
        let Some(transform) = self.transform.as_mut() else {
            return Ok(());
        };

        self.poisoned = true;
        self.sink.grant();
        transform.write_all(&self.chunk[..len])?;
        self.sink.reclaim_blocking(&self.cancellation)?;
        self.poisoned = false;

        Ok(())
    }

    fn finish_transform(&mut self) -> io::Result<()> {
        let Some(mut transform) = self.transform.take() else {
            self.upstream_done = true;
            return Ok(());
        };

        // One last uncontended turn for the transform. Flush, then finalize: some transforms
        // only emit trailing bytes when finalized.
        self.poisoned = true;
        self.sink.grant();
        transform.flush()?;
        transform.finish()?;
        self.sink.reclaim_blocking(&self.cancellation)?;
        self.poisoned = false;
        self.upstream_done = true;

        event!(Level::DEBUG, message = "transform finalized", output_len = self.sink.len());
        Ok(())
    }
}

impl<R: Read, T: Transform> Read for Inverter<R, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.poisoned {
            return Err(Error::poisoned());
        }

        while self.sink.unread() == 0 && !self.upstream_done {
            self.sink.reset();

            let len = self.read_upstream()?;

            if len == 0 {
                self.finish_transform()?;
            } else {
                self.push_chunk(len)?;
            }

            self.sink.rewind();
        }

        Ok(self.sink.read_unlocked(buf))
    }
}

impl<R, T> Drop for Inverter<R, T> {
    fn drop(&mut self) {
        // An unfinished transform may still write to the sink while it is dropped.
        if let Some(transform) = self.transform.take() {
            if !self.poisoned {
                self.sink.grant();
            }
            drop(transform);
        }
    }
}

impl<R, T> fmt::Debug for Inverter<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inverter")
            .field("sink", &self.sink)
            .field("chunk_size", &self.chunk.len())
            .field("upstream_done", &self.upstream_done)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

/// Creates an instance of [`Inverter`] or [`AsyncInverter`][crate::AsyncInverter].
///
/// # Example
///
/// ```
/// use std::io::Read;
///
/// use byte_adapters::{Cancellation, InverterBuilder};
///
/// let upstream: &[u8] = b"configured";
/// let mut reader = InverterBuilder::new()
///     .chunk_size(4)
///     .cancellation(Cancellation::new())
///     .build(upstream, Ok)
///     .unwrap();
///
/// let mut out = Vec::new();
/// reader.read_to_end(&mut out).unwrap();
/// assert_eq!(out, b"configured");
/// ```
#[derive(Debug)]
pub struct InverterBuilder {
    chunk_size: usize,
    cancellation: Option<Cancellation>,
}

impl InverterBuilder {
    /// Starts building with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancellation: None,
        }
    }

    /// The size of the chunks read from upstream, in bytes. Must be positive.
    ///
    /// Optional. Defaults to [`DEFAULT_CHUNK_SIZE`].
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// The cancellation signal that interrupts waits for the transform.
    ///
    /// Optional. Defaults to a signal owned by the inverter.
    #[must_use]
    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Builds an [`Inverter`] that drives the transform created by `factory`.
    ///
    /// The factory runs with the sink's lock available, so a transform may write a header
    /// while it is constructed.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] if the chunk size is zero. Returns the
    /// factory's error, after releasing the sink and `upstream`.
    pub fn build<R, T, F>(self, upstream: R, factory: F) -> io::Result<Inverter<R, T>>
    where
        R: Read,
        T: Transform,
        F: FnOnce(HandoffSink) -> io::Result<T>,
    {
        let (chunk, cancellation) = self.validate()?;

        let sink = HandoffSink::new(cancellation.clone());
        sink.grant();
        let transform = factory(sink.clone())?;
        sink.reclaim_blocking(&cancellation)?;

        Ok(Inverter {
            transform: Some(transform),
            sink,
            upstream,
            chunk,
            upstream_done: false,
            poisoned: false,
            cancellation,
        })
    }

    pub(crate) fn validate(self) -> io::Result<(Box<[u8]>, Cancellation)> {
        if self.chunk_size == 0 {
            return Err(Error::invalid_argument("inverter chunk size must be positive"));
        }

        Ok((vec![0; self.chunk_size].into_boxed_slice(), self.cancellation.unwrap_or_default()))
    }
}

impl Default for InverterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Repeats every input byte twice.
    struct Doubler(HandoffSink);

    impl Write for Doubler {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let doubled: Vec<u8> = buf.iter().flat_map(|b| [*b, *b]).collect();
            self.0.write_all(&doubled)?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transform for Doubler {}

    /// Passes bytes through and fails to flush.
    struct StuckFlush(HandoffSink);

    impl Write for StuckFlush {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write_all(buf)?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::StorageFull, "flush failed"))
        }
    }

    impl Transform for StuckFlush {}

    #[test]
    fn zero_chunk_size_is_rejected_before_factory_runs() {
        let upstream: &[u8] = b"abc";
        let mut factory_ran = false;

        let error = Inverter::with_chunk_size(upstream, 0, |sink| {
            factory_ran = true;
            Ok(sink)
        })
        .unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        assert!(!factory_ran);
    }

    #[test]
    fn identity_transform_passes_bytes_through() {
        let upstream: &[u8] = b"hello inverter";
        let mut reader = Inverter::with_chunk_size(upstream, 3, Ok).unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, b"hello inverter");
        assert!(reader.is_finished());
    }

    #[test]
    fn small_destination_drains_buffered_output_first() {
        let upstream: &[u8] = b"abcd";
        let mut reader = Inverter::with_chunk_size(upstream, 4, |sink| Ok(Doubler(sink))).unwrap();

        let mut buf = [0_u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"aab");
        assert!(!reader.is_finished());

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bccdd");
    }

    #[test]
    fn end_of_stream_is_sticky() {
        let upstream: &[u8] = b"";
        let mut reader = Inverter::new(upstream, |sink| Ok(Doubler(sink))).unwrap();

        let mut buf = [0_u8; 8];
        for _ in 0..3 {
            assert_eq!(reader.read(&mut buf).unwrap(), 0);
        }
    }

    #[test]
    fn factory_error_is_returned_unchanged() {
        let upstream: &[u8] = b"abc";

        let error = Inverter::<_, HandoffSink>::new(upstream, |_| Err(io::Error::new(io::ErrorKind::AlreadyExists, "nope"))).unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn upstream_error_is_returned_unchanged() {
        let mut reader = Inverter::new(crate::testing::FailingRead::new(0, io::ErrorKind::TimedOut), Ok).unwrap();

        let error = reader.read(&mut [0_u8; 4]).unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn reads_after_failed_finalization_keep_failing() {
        let upstream: &[u8] = b"abcd";
        let mut reader = Inverter::with_chunk_size(upstream, 4, |sink| Ok(StuckFlush(sink))).unwrap();

        let mut buf = [0_u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");

        let error = reader.read(&mut buf).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::StorageFull);
        assert!(!reader.is_finished());

        for _ in 0..2 {
            let error = reader.read(&mut buf).unwrap_err();
            assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
            assert_eq!(Error::from_io(&error).map(Error::kind), Some(crate::ErrorKind::Poisoned));
        }
    }

    #[test]
    fn upstream_error_leaves_inverter_usable() {
        let upstream = crate::testing::FailingRead::new(0, io::ErrorKind::TimedOut);
        let mut reader = Inverter::new(upstream, |sink| Ok(Doubler(sink))).unwrap();

        for _ in 0..2 {
            let error = reader.read(&mut [0_u8; 4]).unwrap_err();
            assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        }
    }

    #[test]
    fn capability_flags() {
        assert!(Inverter::<&[u8], HandoffSink>::CAN_READ);
        assert!(!Inverter::<&[u8], HandoffSink>::CAN_WRITE);
        assert!(!Inverter::<&[u8], HandoffSink>::CAN_SEEK);
    }
}
