// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, Read};
use std::num::NonZero;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use futures::io::AsyncRead;

use super::fill_content;

const DEFAULT_MAX_CHUNK: NonZero<usize> = NonZero::new(4096).expect("literal is non-zero");
const DEFAULT_SEED: u64 = 0x5eed_b17e;

/// A source of content bytes that returns pseudo-random short reads.
///
/// Each read returns between 1 and `max_chunk` bytes (fewer at the very end), with sizes drawn
/// from a seeded generator, so a run is reproducible. This is what a network socket or a pipe
/// looks like to its reader, and exercises every code path that assembles full buffers from
/// partial reads.
///
/// Implements both [`Read`] and [`AsyncRead`]. The blocking flavor can sleep before each read
/// to simulate a slow device. The asynchronous flavor suspends before roughly half of its reads
/// when [`JitterReadBuilder::suspend()`] is enabled.
///
/// # Example
///
/// ```
/// use std::io::Read;
///
/// use byte_adapters::testing::JitterRead;
///
/// let mut source = JitterRead::builder().len(1000).max_chunk(7).build();
///
/// let mut out = Vec::new();
/// source.read_to_end(&mut out).unwrap();
///
/// assert_eq!(out.len(), 1000);
/// assert_eq!(out[257], 1);
/// ```
#[derive(Debug)]
pub struct JitterRead {
    len: u64,
    offset: u64,
    max_chunk: NonZero<usize>,
    delay: Option<Duration>,
    suspend: bool,
    rng: fastrand::Rng,
}

impl JitterRead {
    /// Starts building a new `JitterRead`.
    #[must_use]
    pub fn builder() -> JitterReadBuilder {
        JitterReadBuilder {
            len: 0,
            max_chunk: DEFAULT_MAX_CHUNK,
            seed: DEFAULT_SEED,
            delay: None,
            suspend: false,
        }
    }

    /// Creates a source of `len` bytes with the default configuration.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::builder().len(len).build()
    }

    /// The number of bytes handed out so far.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_content(&mut self, buf: &mut [u8]) -> usize {
        let remaining = usize::try_from(self.len - self.offset).unwrap_or(usize::MAX);
        let limit = remaining.min(buf.len());

        if limit == 0 {
            return 0;
        }

        let count = self.rng.usize(1..=self.max_chunk.get()).min(limit);
        fill_content(self.offset, &mut buf[..count]);
        self.offset += count as u64;

        count
    }
}

impl Read for JitterRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        Ok(self.read_content(buf))
    }
}

impl AsyncRead for JitterRead {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.suspend && this.rng.bool() {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        Poll::Ready(Ok(this.read_content(buf)))
    }
}

/// Creates an instance of [`JitterRead`].
///
/// Access through [`JitterRead::builder()`][JitterRead::builder].
#[derive(Debug)]
pub struct JitterReadBuilder {
    len: usize,
    max_chunk: NonZero<usize>,
    seed: u64,
    delay: Option<Duration>,
    suspend: bool,
}

impl JitterReadBuilder {
    /// The total number of bytes the source yields before reporting exhaustion.
    ///
    /// Optional. Defaults to zero.
    #[must_use]
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// The largest number of bytes a single read returns. Zero is treated as one.
    ///
    /// Optional. Defaults to 4096.
    #[must_use]
    pub fn max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = NonZero::new(max_chunk).unwrap_or(NonZero::<usize>::MIN);
        self
    }

    /// The seed of the generator that picks read sizes.
    ///
    /// Optional. Defaults to a fixed seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sleeps for `delay` before every blocking read.
    ///
    /// Optional. Defaults to no delay.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Whether asynchronous reads sometimes suspend before completing.
    ///
    /// Optional. Defaults to `false`.
    #[must_use]
    pub fn suspend(mut self, suspend: bool) -> Self {
        self.suspend = suspend;
        self
    }

    /// Builds the `JitterRead` with the provided configuration.
    #[must_use]
    pub fn build(self) -> JitterRead {
        JitterRead {
            len: self.len as u64,
            offset: 0,
            max_chunk: self.max_chunk,
            delay: self.delay,
            suspend: self.suspend,
            rng: fastrand::Rng::with_seed(self.seed),
        }
    }
}
