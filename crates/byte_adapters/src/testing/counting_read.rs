// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, Read};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::io::AsyncRead;

/// Wraps a source and counts the bytes read from it, observable from other threads.
///
/// Useful to verify how far ahead of its consumer a prefetching reader has read.
#[derive(Debug)]
pub struct CountingRead<R> {
    inner: R,
    counter: ReadCounter,
}

impl<R> CountingRead<R> {
    /// Wraps `inner`. The returned counter observes every byte read through the wrapper.
    #[must_use]
    pub fn new(inner: R) -> (Self, ReadCounter) {
        let counter = ReadCounter::default();

        (
            Self {
                inner,
                counter: counter.clone(),
            },
            counter,
        )
    }

    /// Unwraps the source.
    #[must_use]
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.counter.add(count);
        Ok(count)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingRead<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(count)) = poll {
            this.counter.add(count);
        }

        poll
    }
}

/// Observes the number of bytes read through a [`CountingRead`].
#[derive(Clone, Debug, Default)]
pub struct ReadCounter {
    total: Arc<AtomicU64>,
}

impl ReadCounter {
    /// The number of bytes read so far.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    fn add(&self, count: usize) {
        self.total.fetch_add(count as u64, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_bytes_read() {
        let (mut source, counter) = CountingRead::new(&b"0123456789"[..]);

        let mut buf = [0_u8; 4];
        source.read_exact(&mut buf).unwrap();
        assert_eq!(counter.get(), 4);

        let mut rest = Vec::new();
        source.read_to_end(&mut rest).unwrap();
        assert_eq!(counter.get(), 10);

        assert!(source.into_inner().is_empty());
    }
}
