// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::io::AsyncRead;

use super::fill_content;

/// A source that yields a fixed number of content bytes and then fails on every read.
///
/// Implements both [`Read`] and [`AsyncRead`]; the asynchronous flavor never suspends.
#[derive(Debug)]
pub struct FailingRead {
    healthy_len: u64,
    offset: u64,
    kind: io::ErrorKind,
}

impl FailingRead {
    /// Creates a source that yields `healthy_len` bytes and then fails with `kind`.
    #[must_use]
    pub fn new(healthy_len: usize, kind: io::ErrorKind) -> Self {
        Self {
            healthy_len: healthy_len as u64,
            offset: 0,
            kind,
        }
    }

    /// The error kind every read fails with once the healthy bytes are used up.
    #[must_use]
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    fn read_content(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.healthy_len - self.offset;

        if remaining == 0 {
            return Err(io::Error::new(self.kind, "injected failure"));
        }

        let count = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
        fill_content(self.offset, &mut buf[..count]);
        self.offset += count as u64;

        Ok(count)
    }
}

impl Read for FailingRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_content(buf)
    }
}

impl AsyncRead for FailingRead {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(self.get_mut().read_content(buf))
    }
}
