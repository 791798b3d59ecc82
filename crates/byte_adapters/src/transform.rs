// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, Write};

use crate::HandoffSink;

/// A push-based byte processor driven by an [`Inverter`][crate::Inverter].
///
/// Bytes are pushed in through [`Write`] and the processed output is written to the
/// [`HandoffSink`] the transform was constructed with. A typical transform is a compressor
/// wrapping the sink.
///
/// Some transforms only emit their trailing bytes when finalized, not when flushed. The
/// inverter therefore flushes and then calls [`finish()`][Self::finish] exactly once, after the
/// upstream source is exhausted.
pub trait Transform: Write {
    /// Finalizes the transform, writing any trailing output, and releases it.
    ///
    /// The default implementation only drops the transform.
    ///
    /// # Errors
    ///
    /// Returns any error raised while writing the trailing output.
    fn finish(self) -> io::Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// The identity transform: bytes written to the sink are served unchanged.
impl Transform for HandoffSink {}

/// Asynchronous flavor of [`Transform`], driven by an [`AsyncInverter`][crate::AsyncInverter].
///
/// Output is written to the [`HandoffSink`] via [`HandoffSink::write_async()`] or a
/// [`HandoffGuard`][crate::HandoffGuard] obtained from [`HandoffSink::lock_async()`].
///
/// # Thread safety
///
/// This trait requires `Send` from any returned futures.
#[trait_variant::make(Send)]
pub trait AsyncTransform {
    /// Pushes `data` into the transform.
    ///
    /// The call may return before the resulting output is in the sink, as long as the transform
    /// took the sink's lock before returning and keeps it until the output is complete.
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Pushes any buffered output to the sink.
    async fn flush(&mut self) -> io::Result<()>;

    /// Finalizes the transform, writing any trailing output, and releases it.
    async fn finish(self) -> io::Result<()>;
}

impl AsyncTransform for HandoffSink {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_async(data).await
    }

    #[cfg_attr(test, mutants::skip)] // Nothing to flush.
    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    #[cfg_attr(test, mutants::skip)] // Nothing to finalize.
    async fn finish(self) -> io::Result<()> {
        Ok(())
    }
}
