// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::io::AsyncRead;

/// An [`AsyncRead`] whose reads never complete.
///
/// Intended for tests that need a source that stalls forever, e.g. to exercise cancellation.
#[derive(Debug, Default)]
pub struct PendingRead;

impl PendingRead {
    /// Creates a new `PendingRead`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AsyncRead for PendingRead {
    #[cfg_attr(test, mutants::skip)] // This does nothing, pointless to mutate.
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut [u8]) -> Poll<io::Result<usize>> {
        Poll::Pending
    }
}
