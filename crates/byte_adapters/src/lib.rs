// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Byte-stream adapters that decouple producers from consumers.
//!
//! * [`ReadAhead`] and [`AsyncReadAhead`] prefetch from a slow or blocking source into two
//!   alternating fixed-size buffers, so that the consumer rarely waits and the producer never
//!   runs more than one buffer ahead.
//! * [`Inverter`] and [`AsyncInverter`] turn a push-based [`Transform`] (bytes are written in,
//!   output appears in a [`HandoffSink`]) into a pull-based reader, without spawning anything.
//!
//! Every blocking or asynchronous wait performed by the adapters observes a [`Cancellation`]
//! signal. Errors from wrapped sources and transforms are propagated unchanged; conditions the
//! adapters detect themselves are reported as [`Error`] inside an [`std::io::Error`].
//!
//! The `test-util` feature enables byte sources with controllable pacing and failure behavior
//! for testing code built on these adapters. These are in the `testing` module.

mod async_inverter;
mod async_read_ahead;
mod cancellation;
mod error;
mod handoff;
mod inverter;
mod permit;
mod read_ahead;
mod slot;
mod transform;

pub use async_inverter::AsyncInverter;
pub use async_read_ahead::{AsyncReadAhead, AsyncReadAheadBuilder};
pub use cancellation::Cancellation;
pub use error::{Error, ErrorKind, Result};
pub use handoff::{HandoffGuard, HandoffSink};
pub use inverter::{DEFAULT_CHUNK_SIZE, Inverter, InverterBuilder};
pub use read_ahead::{DEFAULT_CAPACITY, ReadAhead, ReadAheadBuilder};
pub use transform::{AsyncTransform, Transform};

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
