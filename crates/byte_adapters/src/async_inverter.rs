// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io;

use futures::io::{AsyncRead, AsyncReadExt};
use tracing::{Level, event};

use crate::{AsyncTransform, Cancellation, Error, HandoffSink, InverterBuilder};

/// Asynchronous flavor of [`Inverter`][crate::Inverter].
///
/// Drives an [`AsyncTransform`] from an [`AsyncRead`] upstream source. The transform writes its
/// output to the [`HandoffSink`] with [`HandoffSink::write_async()`] or, when the output is
/// produced by another task, with a [`HandoffGuard`][crate::HandoffGuard] taken before
/// [`AsyncTransform::write()`] returns.
///
/// Waits for upstream and for the transform race against the inverter's [`Cancellation`].
///
/// Dropping a [`read()`][Self::read] future while it waits for upstream or for the sink's
/// lock at the start of a read leaves the inverter usable. Dropping it after a chunk was handed
/// to the transform, before the transform gave the lock back, loses that chunk's output: every
/// later read then fails with [`ErrorKind::Poisoned`][crate::ErrorKind::Poisoned]. The same
/// holds after the transform returned an error or the wait for it was cancelled. Upstream
/// errors leave the inverter usable.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use byte_adapters::{AsyncInverter, HandoffSink};
///
/// let upstream: &[u8] = b"pass-through";
/// let mut reader = AsyncInverter::<_, HandoffSink>::new(upstream, Ok).unwrap();
///
/// let mut buf = [0_u8; 64];
/// let count = reader.read(&mut buf).await.unwrap();
///
/// assert_eq!(&buf[..count], b"pass-through");
/// assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
/// # }
/// ```
pub struct AsyncInverter<R, T> {
    transform: Option<T>,
    sink: HandoffSink,
    upstream: R,
    chunk: Box<[u8]>,
    upstream_done: bool,
    owns_turn: bool,
    // Set while a chunk or the finalization is with the transform. Stays set if the read is
    // abandoned or fails before the turn comes back.
    poisoned: bool,
    cancellation: Cancellation,
}

impl<R, T> AsyncInverter<R, T>
where
    R: AsyncRead + Unpin,
    T: AsyncTransform,
{
    /// Always `true`.
    pub const CAN_READ: bool = true;

    /// Always `false`.
    pub const CAN_WRITE: bool = false;

    /// Always `false`.
    pub const CAN_SEEK: bool = false;

    /// Creates an inverter with the default chunk size.
    ///
    /// # Errors
    ///
    /// Returns the factory's error. The sink and `upstream` are released before returning.
    pub fn new<F>(upstream: R, factory: F) -> io::Result<Self>
    where
        F: FnOnce(HandoffSink) -> io::Result<T>,
    {
        InverterBuilder::new().build_async(upstream, factory)
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
        InverterBuilder::new().chunk_size(chunk_size).build_async(upstream, factory)
    }

    /// The cancellation signal that interrupts waits for upstream and for the transform.
    #[must_use]
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Whether upstream is exhausted and the transform has been finalized.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.upstream_done
    }

    /// Reads up to `buf.len()` bytes of transformed output. Returns 0 once upstream is
    /// exhausted and every byte of output was served, and on every later call.
    ///
    /// # Errors
    ///
    /// Returns errors from upstream and from the transform unchanged, and a cancellation error
    /// if cancellation is requested while waiting.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.poisoned {
            return Err(Error::poisoned());
        }

        self.take_turn().await?;

        while self.sink.unread() == 0 && !self.upstream_done {
            self.sink.reset();

            let len = self.read_upstream().await?;

            if len == 0 {
                self.finish_transform().await?;
            } else {
                self.push_chunk(len).await?;
            }

            self.sink.rewind();
        }

        Ok(self.sink.read_unlocked(buf))
    }

    async fn take_turn(&mut self) -> io::Result<()> {
        if !self.owns_turn {
            self.sink.reclaim(&self.cancellation).await?;
            self.owns_turn = true;
        }

        Ok(())
    }

    fn give_turn(&mut self) {
        self.sink.grant();
        self.owns_turn = false;
    }

    async fn read_upstream(&mut self) -> io::Result<usize> {
        loop {
            let result = tokio::select! {
                biased;

                () = self.cancellation.cancelled() => return Err(Error::cancelled()),
                result = self.upstream.read(&mut self.chunk) => result,
            };

            match result {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    async fn push_chunk(&mut self, len: usize) -> io::Result<()> {
        if self.transform.is_none() {
            return Ok(());
        }

        self.poisoned = true;
        self.give_turn();

        if let Some(transform) = self.transform.as_mut() {
            transform.write(&self.chunk[..len]).await?;
        }

        self.take_turn().await?;
        self.poisoned = false;

        Ok(())
    }

    async fn finish_transform(&mut self) -> io::Result<()> {
        let Some(mut transform) = self.transform.take() else {
            self.upstream_done = true;
            return Ok(());
        };

        self.poisoned = true;
        self.give_turn();
        transform.flush().await?;
        transform.finish().await?;
        self.take_turn().await?;
        self.poisoned = false;
        self.upstream_done = true;

        event!(Level::DEBUG, message = "async transform finalized", output_len = self.sink.len());
        Ok(())
    }
}

impl<R, T> Drop for AsyncInverter<R, T> {
    fn drop(&mut self) {
        // An unfinished transform may still write to the sink while it is dropped.
        if self.owns_turn && self.transform.is_some() {
            self.sink.grant();
        }
    }
}

impl<R, T> fmt::Debug for AsyncInverter<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncInverter")
            .field("sink", &self.sink)
            .field("chunk_size", &self.chunk.len())
            .field("upstream_done", &self.upstream_done)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl InverterBuilder {
    /// Builds an [`AsyncInverter`] that drives the transform created by `factory`.
    ///
    /// The factory runs with the sink's lock available. The inverter takes the lock back on
    /// its first read, so output written while the transform is constructed, e.g. a header,
    /// is served first.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] if the chunk size is zero. Returns the
    /// factory's error, after releasing the sink and `upstream`.
    pub fn build_async<R, T, F>(self, upstream: R, factory: F) -> io::Result<AsyncInverter<R, T>>
    where
        R: AsyncRead + Unpin,
        T: AsyncTransform,
        F: FnOnce(HandoffSink) -> io::Result<T>,
    {
        let (chunk, cancellation) = self.validate()?;

        let sink = HandoffSink::new(cancellation.clone());
        sink.grant();
        let transform = factory(sink.clone())?;

        Ok(AsyncInverter {
            transform: Some(transform),
            sink,
            upstream,
            chunk,
            upstream_done: false,
            owns_turn: false,
            poisoned: false,
            cancellation,
        })
    }
}
