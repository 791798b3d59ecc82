// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Byte sources for testing code built on `byte_adapters`.
//!
//! Every source produces the same deterministic content: the byte at offset `n` is `n % 256`.
//! They differ in pacing and failure behavior.

mod counting_read;
mod failing_read;
mod jitter_read;
mod pending_read;

pub use counting_read::*;
pub use failing_read::*;
pub use jitter_read::*;
pub use pending_read::*;

/// The content byte every testing source produces at `offset`.
#[must_use]
pub fn content_byte(offset: u64) -> u8 {
    offset.to_le_bytes()[0]
}

fn fill_content(offset: u64, into: &mut [u8]) {
    for (index, byte) in into.iter_mut().enumerate() {
        *byte = content_byte(offset + index as u64);
    }
}
