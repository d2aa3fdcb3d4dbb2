//! Event stream abstraction.
//!
//! The engine consumes an append-only, sequence-numbered event log through
//! the [`EventStream`] contract. The first event of a stream has sequence 1;
//! sequence 0 means "before the beginning". Drivers buffer fetched events
//! locally and hand them to the wrapper one at a time via
//! [`try_next`](EventStream::try_next), which distinguishes "local buffer
//! empty" from "no more events anywhere" through the fetch handshake.
//!
//! A reference in-memory driver lives in [`inmemory`].

use std::future::Future;

pub use nonempty::NonEmpty;

use crate::cancel::CancelToken;

/// Append-only event log with background prefetch and optimistic writes.
pub trait EventStream {
    /// Domain event type carried by the stream.
    type Event: Send + Sync + 'static;

    /// Driver-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opaque in-flight fetch result, produced by
    /// [`start_fetch`](Self::start_fetch) and consumed by
    /// [`finish_fetch`](Self::finish_fetch).
    type Fetch: Send + 'static;

    /// Sequence of the last locally consumed slot.
    fn sequence(&self) -> u64;

    /// Pop the next locally buffered event, advancing
    /// [`sequence`](Self::sequence) by one.
    ///
    /// Returns `Ok(None)` when the local buffer is empty. An `Err` means the
    /// slot was consumed (the sequence has still advanced) but its payload
    /// could not be decoded; callers quarantine the slot and continue.
    fn try_next(&mut self) -> Result<Option<Self::Event>, Self::Error>;

    /// Begin fetching the next batch from the backing store.
    ///
    /// The returned future is `'static` so the caller can run it in the
    /// background while draining the local buffer. Integrating the result via
    /// [`finish_fetch`](Self::finish_fetch) is a separate, synchronous step.
    fn start_fetch(
        &self,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<Self::Fetch, Self::Error>> + Send + 'static;

    /// Integrate a completed fetch into the local buffer.
    ///
    /// Returns `true` iff more events may still be available upstream.
    fn finish_fetch(&mut self, fetch: Self::Fetch) -> bool;

    /// Fast-forward the local view past `sequence - 1` without delivering
    /// those events; returns the highest sequence the store is aware of.
    ///
    /// Used after a snapshot load to skip the already-covered prefix.
    fn discard_up_to(
        &mut self,
        sequence: u64,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send;

    /// Optimistic append.
    ///
    /// `Ok(Some(end_sequence))` on success, with the written events also
    /// landing in the local buffer so the following local catch-up delivers
    /// them. `Ok(None)` when the store has grown past this stream's known
    /// tail; the caller catches up and retries.
    fn write(
        &mut self,
        events: &NonEmpty<Self::Event>,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send;

    /// Clear local state and sequence, forcing a fresh fetch from the
    /// beginning of the stream.
    fn reset(&mut self);
}

pub mod inmemory;
