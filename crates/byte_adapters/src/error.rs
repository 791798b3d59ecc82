// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io;

/// An error signaled by the adapters themselves.
///
/// Errors that originate in the wrapped upstream source or in a caller-supplied transform are
/// propagated unchanged as [`io::Error`]. This type covers the conditions the adapters detect
/// on their own. It travels inside an [`io::Error`] (see the `From` conversion) because every
/// adapter speaks the standard I/O vocabulary, and can be recovered with [`Error::from_io()`].
#[ohno::error]
#[display("byte adapter failure: {kind}")]
pub struct Error {
    kind: ErrorKind,
}

/// The category of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A construction-time argument was out of range, e.g. a zero buffer size.
    InvalidArgument,

    /// The operation is not available on a forward-only, read-only adapter.
    Unsupported,

    /// A blocking wait was interrupted because cancellation was requested.
    Cancelled,

    /// The background worker failed earlier and the adapter can no longer be used.
    WorkerFailed,

    /// The transform failed, or was abandoned while it held the sink, and the adapter can no
    /// longer be used.
    Poisoned,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::InvalidArgument => "invalid argument",
            Self::Unsupported => "unsupported operation",
            Self::Cancelled => "operation cancelled",
            Self::WorkerFailed => "background worker failed",
            Self::Poisoned => "adapter unusable after an earlier failure",
        };

        f.write_str(text)
    }
}

impl Error {
    /// The category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the adapter error carried by an [`io::Error`], if there is one.
    #[must_use]
    pub fn from_io(error: &io::Error) -> Option<&Self> {
        error.get_ref().and_then(|inner| inner.downcast_ref::<Self>())
    }

    /// Whether the [`io::Error`] is purely an artifact of cancellation.
    #[must_use]
    pub fn is_cancellation(error: &io::Error) -> bool {
        Self::from_io(error).is_some_and(|e| e.kind == ErrorKind::Cancelled)
    }

    pub(crate) fn cancelled() -> io::Error {
        Self::new(ErrorKind::Cancelled).into()
    }

    pub(crate) fn worker_failed() -> io::Error {
        Self::new(ErrorKind::WorkerFailed).into()
    }

    pub(crate) fn poisoned() -> io::Error {
        Self::new(ErrorKind::Poisoned).into()
    }

    pub(crate) fn invalid_argument(message: &'static str) -> io::Error {
        Self::caused_by(ErrorKind::InvalidArgument, message).into()
    }

    pub(crate) fn unsupported(message: &'static str) -> io::Error {
        Self::caused_by(ErrorKind::Unsupported, message).into()
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        // Never `Interrupted` for cancellation, std helpers such as `read_to_end()` retry on it.
        let kind = match error.kind {
            ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::Cancelled => io::ErrorKind::Other,
            ErrorKind::WorkerFailed | ErrorKind::Poisoned => io::ErrorKind::BrokenPipe,
        };

        Self::new(kind, error)
    }
}

/// A `Result` that may contain an [`Error`] from this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_recognized_through_io_error() {
        let error = Error::cancelled();

        assert_eq!(error.kind(), io::ErrorKind::Other);
        assert!(Error::is_cancellation(&error));
    }

    #[test]
    fn foreign_io_error_is_not_cancellation() {
        let error = io::Error::other("disk on fire");

        assert!(!Error::is_cancellation(&error));
        assert!(Error::from_io(&error).is_none());
    }

    #[test]
    fn kinds_map_to_io_kinds() {
        assert_eq!(Error::invalid_argument("zero").kind(), io::ErrorKind::InvalidInput);
        assert_eq!(Error::unsupported("seek").kind(), io::ErrorKind::Unsupported);
        assert_eq!(Error::worker_failed().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(Error::poisoned().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn poisoned_is_distinguishable_from_worker_failure() {
        let error = Error::poisoned();

        assert_eq!(Error::from_io(&error).map(Error::kind), Some(ErrorKind::Poisoned));
        assert!(!Error::is_cancellation(&error));
    }

    #[test]
    fn display_contains_kind_and_cause() {
        let error = Error::caused_by(ErrorKind::InvalidArgument, "capacity must be positive");
        let display = error.to_string();

        assert!(display.contains("invalid argument"), "unexpected message: {display}");
        assert!(display.contains("capacity must be positive"), "unexpected message: {display}");
    }

    #[test]
    fn kind_survives_round_trip() {
        let error = Error::unsupported("seek");
        let inner = Error::from_io(&error).unwrap();

        assert_eq!(inner.kind(), ErrorKind::Unsupported);
    }
}
