// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::io::{AsyncRead, AsyncReadExt};
use parking_lot::Mutex;
use tracing::{Level, event};

use crate::permit::Permit;
use crate::{Cancellation, Error};

/// A fixed-capacity byte buffer with a two-phase gate.
///
/// The buffer must be completely filled (or the source exhausted) before it can be read, and
/// completely drained before it can be filled again. One party fills, another drains; the
/// gate makes sure the two never touch the contents at the same time:
///
/// * The write permit starts out available. `fill` takes it and hands the read permit over
///   when the buffer holds data.
/// * The first `drain` after a fill takes the read permit. The `drain` call that finds the
///   buffer empty hands the write permit back and reports [`Drained::Exhausted`].
///
/// Once a fill observes the end of the source, the buffer keeps its end-of-source flag and
/// its read access forever, so repeated drains keep reporting [`Drained::EndOfSource`]
/// without waiting.
#[derive(Debug)]
pub(crate) struct SlotBuffer {
    state: Mutex<SlotState>,
    capacity: usize,
    read_permit: Permit,
    write_permit: Permit,
    end_of_source: AtomicBool,
}

/// Outcome of a drain.
///
/// Decided while the drainer still holds read access, so it cannot be invalidated by a fill
/// that starts right after the buffer is handed back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Drained {
    /// This many bytes were copied out.
    Bytes(usize),

    /// The buffer is empty and went back to the filler. The next bytes are in the other buffer.
    Exhausted,

    /// The buffer is empty and the source is exhausted.
    EndOfSource,
}

#[derive(Debug)]
struct SlotState {
    // Taken out by the filler for the duration of a fill, so no lock is held across source reads.
    storage: Vec<u8>,
    len: usize,
    cursor: usize,
    // Only touched by the draining party.
    reading: bool,
    failure: Option<io::Error>,
    poisoned: bool,
}

impl SlotBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "validated by the owning adapter");

        Self {
            state: Mutex::new(SlotState {
                storage: vec![0; capacity],
                len: 0,
                cursor: 0,
                reading: false,
                failure: None,
                poisoned: false,
            }),
            capacity,
            read_permit: Permit::new(false),
            write_permit: Permit::new(true),
            end_of_source: AtomicBool::new(false),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_end_of_source(&self) -> bool {
        self.end_of_source.load(Ordering::Acquire)
    }

    /// Fills the buffer from a blocking source.
    ///
    /// On error the write permit stays with the caller and the buffer contents are undefined.
    /// The caller either gives up on the pipeline or publishes the failure via [`Self::fail()`].
    pub(crate) fn fill_blocking<R>(&self, source: &mut R, cancellation: &Cancellation) -> io::Result<()>
    where
        R: io::Read + ?Sized,
    {
        self.write_permit.acquire_blocking(cancellation)?;

        let mut storage = self.take_storage();
        let outcome = read_until_full_blocking(source, &mut storage, cancellation);
        self.complete_fill(storage, outcome)
    }

    /// Fills the buffer from an asynchronous source.
    ///
    /// Error handling is the same as for [`Self::fill_blocking()`].
    pub(crate) async fn fill<R>(&self, source: &mut R, cancellation: &Cancellation) -> io::Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_permit.acquire(cancellation).await?;

        let mut storage = self.take_storage();
        let outcome = read_until_full(source, &mut storage, cancellation).await;
        self.complete_fill(storage, outcome)
    }

    /// Publishes a fill failure to the draining party.
    ///
    /// Must only be called by the party that holds the write permit, after a failed fill.
    pub(crate) fn fail(&self, error: io::Error) {
        {
            let mut state = self.state.lock();
            state.failure = Some(error);
            state.len = 0;
            state.cursor = 0;
        }

        self.read_permit.release();
    }

    /// Copies buffered bytes into `destination`, waiting for a fill to complete if necessary.
    pub(crate) fn drain_blocking(&self, destination: &mut [u8], cancellation: &Cancellation) -> io::Result<Drained> {
        if destination.is_empty() {
            return Ok(Drained::Bytes(0));
        }

        if !self.is_reading() {
            self.read_permit.acquire_blocking(cancellation)?;
            self.state.lock().reading = true;
        }

        self.copy_out(destination)
    }

    /// Asynchronous flavor of [`Self::drain_blocking()`].
    pub(crate) async fn drain(&self, destination: &mut [u8], cancellation: &Cancellation) -> io::Result<Drained> {
        if destination.is_empty() {
            return Ok(Drained::Bytes(0));
        }

        if !self.is_reading() {
            self.read_permit.acquire(cancellation).await?;
            self.state.lock().reading = true;
        }

        self.copy_out(destination)
    }

    fn is_reading(&self) -> bool {
        self.state.lock().reading
    }

    fn take_storage(&self) -> Vec<u8> {
        mem::take(&mut self.state.lock().storage)
    }

    fn complete_fill(&self, storage: Vec<u8>, outcome: io::Result<(usize, bool)>) -> io::Result<()> {
        let mut state = self.state.lock();
        state.storage = storage;

        let (len, end_of_source) = outcome?;

        state.len = len;
        state.cursor = 0;
        drop(state);

        if end_of_source {
            self.end_of_source.store(true, Ordering::Release);
        }

        event!(Level::TRACE, message = "slot filled", len, end_of_source);

        self.read_permit.release();
        Ok(())
    }

    fn copy_out(&self, destination: &mut [u8]) -> io::Result<Drained> {
        let mut state = self.state.lock();

        if let Some(failure) = state.failure.take() {
            state.poisoned = true;
            return Err(failure);
        }

        if state.poisoned {
            return Err(Error::worker_failed());
        }

        let available = state.len - state.cursor;

        if available == 0 {
            // The flag must be read before the write permit goes back: the filler may reach
            // the end of the source on its very next fill.
            if self.is_end_of_source() {
                return Ok(Drained::EndOfSource);
            }

            state.reading = false;
            drop(state);
            self.write_permit.release();

            return Ok(Drained::Exhausted);
        }

        let count = available.min(destination.len());
        let start = state.cursor;
        destination[..count].copy_from_slice(&state.storage[start..start + count]);
        state.cursor += count;

        Ok(Drained::Bytes(count))
    }
}

/// Reads until `storage` is full or the source reports exhaustion.
///
/// Returns the number of bytes obtained and whether the source is exhausted.
fn read_until_full_blocking<R>(source: &mut R, storage: &mut [u8], cancellation: &Cancellation) -> io::Result<(usize, bool)>
where
    R: io::Read + ?Sized,
{
    let mut filled = 0;

    while filled < storage.len() {
        if cancellation.is_cancelled() {
            return Err(Error::cancelled());
        }

        match source.read(&mut storage[filled..]) {
            Ok(0) => return Ok((filled, true)),
            Ok(count) => filled += count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok((filled, false))
}

async fn read_until_full<R>(source: &mut R, storage: &mut [u8], cancellation: &Cancellation) -> io::Result<(usize, bool)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;

    while filled < storage.len() {
        let result = tokio::select! {
            biased;

            () = cancellation.cancelled() => return Err(Error::cancelled()),
            result = source.read(&mut storage[filled..]) => result,
        };

        match result {
            Ok(0) => return Ok((filled, true)),
            Ok(count) => filled += count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok((filled, false))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use testing_aids::{async_test, execute_or_terminate_process};

    use super::*;
    use crate::testing::FailingRead;

    #[test]
    fn fill_then_drain_in_pieces() {
        let slot = SlotBuffer::new(8);
        let cancellation = Cancellation::new();
        let mut source: &[u8] = b"abcdefghij";

        slot.fill_blocking(&mut source, &cancellation).unwrap();
        assert!(!slot.is_end_of_source());

        let mut out = [0_u8; 5];
        assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::Bytes(5));
        assert_eq!(&out, b"abcde");

        assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::Bytes(3));
        assert_eq!(&out[..3], b"fgh");

        // Observing the empty buffer hands the write permit back.
        assert!(!slot.write_permit.is_available());
        assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::Exhausted);
        assert!(slot.write_permit.is_available());

        slot.fill_blocking(&mut source, &cancellation).unwrap();
        assert!(slot.is_end_of_source());

        assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::Bytes(2));
        assert_eq!(&out[..2], b"ij");
    }

    #[test]
    fn end_of_source_drain_is_idempotent() {
        let slot = SlotBuffer::new(4);
        let cancellation = Cancellation::new();
        let mut source: &[u8] = b"";

        slot.fill_blocking(&mut source, &cancellation).unwrap();
        assert!(slot.is_end_of_source());

        let mut out = [0_u8; 4];
        for _ in 0..3 {
            assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::EndOfSource);
        }

        assert!(!slot.write_permit.is_available());
    }

    #[test]
    fn zero_length_destination_does_not_touch_permits() {
        let slot = SlotBuffer::new(4);
        let cancellation = Cancellation::new();

        // Nothing was filled, so touching the read permit would block forever.
        assert_eq!(slot.drain_blocking(&mut [], &cancellation).unwrap(), Drained::Bytes(0));
        assert!(!slot.is_reading());
    }

    #[test]
    fn drain_waits_for_fill() {
        execute_or_terminate_process(|| {
            let slot = Arc::new(SlotBuffer::new(3));
            let cancellation = Cancellation::new();

            let reader = {
                let slot = Arc::clone(&slot);
                let cancellation = cancellation.clone();
                thread::spawn(move || {
                    let mut out = [0_u8; 3];
                    let Drained::Bytes(count) = slot.drain_blocking(&mut out, &cancellation).unwrap() else {
                        panic!("expected bytes");
                    };
                    out[..count].to_vec()
                })
            };

            let mut source: &[u8] = b"xyz";
            slot.fill_blocking(&mut source, &cancellation).unwrap();

            assert_eq!(reader.join().unwrap(), b"xyz");
        });
    }

    #[test]
    fn second_fill_waits_for_drain() {
        execute_or_terminate_process(|| {
            let slot = Arc::new(SlotBuffer::new(2));
            let cancellation = Cancellation::new();
            let mut first: &[u8] = b"ab";
            slot.fill_blocking(&mut first, &cancellation).unwrap();

            let filler = {
                let slot = Arc::clone(&slot);
                let cancellation = cancellation.clone();
                thread::spawn(move || {
                    let mut second: &[u8] = b"cd";
                    slot.fill_blocking(&mut second, &cancellation)
                })
            };

            let mut out = [0_u8; 2];
            assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::Bytes(2));
            assert_eq!(&out, b"ab");
            assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::Exhausted);

            filler.join().unwrap().unwrap();

            assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::Bytes(2));
            assert_eq!(&out, b"cd");
        });
    }

    #[test]
    fn cancellation_unblocks_pending_fill() {
        execute_or_terminate_process(|| {
            let slot = Arc::new(SlotBuffer::new(2));
            let cancellation = Cancellation::new();
            let mut first: &[u8] = b"ab";
            slot.fill_blocking(&mut first, &cancellation).unwrap();

            let filler = {
                let slot = Arc::clone(&slot);
                let cancellation = cancellation.clone();
                thread::spawn(move || {
                    let mut second: &[u8] = b"cd";
                    slot.fill_blocking(&mut second, &cancellation)
                })
            };

            cancellation.cancel();

            let error = filler.join().unwrap().unwrap_err();
            assert!(Error::is_cancellation(&error));
        });
    }

    #[test]
    fn fill_error_propagates_and_can_be_published() {
        let slot = SlotBuffer::new(8);
        let cancellation = Cancellation::new();
        let mut source = FailingRead::new(3, io::ErrorKind::ConnectionReset);

        let error = slot.fill_blocking(&mut source, &cancellation).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);

        slot.fail(error);

        let mut out = [0_u8; 8];
        let error = slot.drain_blocking(&mut out, &cancellation).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);

        let error = slot.drain_blocking(&mut out, &cancellation).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn async_fill_and_drain() {
        async_test(async || {
            let slot = SlotBuffer::new(4);
            let cancellation = Cancellation::new();
            let mut source: &[u8] = b"1234";

            slot.fill(&mut source, &cancellation).await.unwrap();
            assert!(!slot.is_end_of_source());

            let mut out = [0_u8; 4];
            assert_eq!(slot.drain(&mut out, &cancellation).await.unwrap(), Drained::Bytes(4));
            assert_eq!(&out, b"1234");
            assert_eq!(slot.drain(&mut out, &cancellation).await.unwrap(), Drained::Exhausted);

            slot.fill(&mut source, &cancellation).await.unwrap();
            assert!(slot.is_end_of_source());
            assert_eq!(slot.drain(&mut out, &cancellation).await.unwrap(), Drained::EndOfSource);
        });
    }

    #[test]
    fn exhaustion_is_reported_even_if_refill_reaches_end_of_source() {
        let slot = SlotBuffer::new(2);
        let cancellation = Cancellation::new();
        let mut source: &[u8] = b"ab";

        slot.fill_blocking(&mut source, &cancellation).unwrap();

        let mut out = [0_u8; 4];
        assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::Bytes(2));
        let outcome = slot.drain_blocking(&mut out, &cancellation).unwrap();

        // The filler takes the buffer back right away and finds the source exhausted.
        slot.fill_blocking(&mut source, &cancellation).unwrap();
        assert!(slot.is_end_of_source());

        // The outcome still says the next bytes are elsewhere, not that the stream ended.
        assert_eq!(outcome, Drained::Exhausted);
        assert_eq!(slot.drain_blocking(&mut out, &cancellation).unwrap(), Drained::EndOfSource);
    }
}
