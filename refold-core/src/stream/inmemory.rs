//! In-memory event stream implementation for testing and examples.
//!
//! [`Log`] is the shared append-only store; cloning it shares the same
//! entries, so several [`Stream`] handles (one per wrapper) can race their
//! optimistic writes against each other the way independent processes would
//! against a remote store. Payloads are stored as [`serde_json::Value`],
//! which keeps decoding (and decode *failures*) on the read path.

use std::{
    collections::VecDeque,
    marker::PhantomData,
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{cancel::CancelToken, stream::EventStream};

const DEFAULT_FETCH_BATCH: usize = 256;

/// Error type for the in-memory stream.
#[derive(Debug, Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
}

type SharedEntries = Arc<RwLock<Vec<serde_json::Value>>>;

/// Shared in-memory event log. Sequence `n` lives at index `n - 1`.
#[derive(Clone, Debug, Default)]
pub struct Log {
    entries: SharedEntries,
}

impl Log {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stream handle with the default fetch batch size.
    #[must_use]
    pub fn stream<E>(&self) -> Stream<E> {
        self.stream_with_batch_size(DEFAULT_FETCH_BATCH)
    }

    /// Open a stream handle fetching at most `batch` events per round trip.
    ///
    /// Small batches force multiple fetch/drain rounds during catch-up, which
    /// is useful in tests.
    ///
    /// # Panics
    ///
    /// Panics if `batch` is zero.
    #[must_use]
    pub fn stream_with_batch_size<E>(&self, batch: usize) -> Stream<E> {
        assert!(batch > 0, "fetch batch size must be at least 1");
        Stream {
            entries: Arc::clone(&self.entries),
            sequence: 0,
            buffer: VecDeque::new(),
            fetch_batch: batch,
            _marker: PhantomData,
        }
    }

    /// Append a raw payload, bypassing serialization.
    ///
    /// This is the lowest-level injection point, intended for tests that need
    /// malformed payloads to exercise quarantine handling.
    pub fn push_raw(&self, value: serde_json::Value) {
        self.entries
            .write()
            .expect("in-memory log lock poisoned")
            .push(value);
    }

    /// Number of events in the log (equals the highest sequence).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("in-memory log lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One wrapper's view of a [`Log`]: a local sequence plus a buffer of fetched
/// but undelivered payloads.
#[derive(Debug)]
pub struct Stream<E> {
    entries: SharedEntries,
    sequence: u64,
    buffer: VecDeque<serde_json::Value>,
    fetch_batch: usize,
    _marker: PhantomData<fn() -> E>,
}

/// A completed fetch, pending integration.
#[derive(Debug)]
pub struct Fetch {
    events: Vec<serde_json::Value>,
    more: bool,
}

impl<E> Stream<E> {
    /// Sequence of the tail as far as this handle knows: consumed slots plus
    /// buffered, undelivered ones.
    fn known_tail(&self) -> u64 {
        self.sequence + self.buffer.len() as u64
    }
}

impl<E> EventStream for Stream<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Error = Error;
    type Event = E;
    type Fetch = Fetch;

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn try_next(&mut self) -> Result<Option<E>, Error> {
        let Some(value) = self.buffer.pop_front() else {
            return Ok(None);
        };
        // The slot is consumed even when the payload turns out unreadable.
        self.sequence += 1;
        serde_json::from_value(value)
            .map(Some)
            .map_err(Error::Deserialization)
    }

    fn start_fetch(
        &self,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<Fetch, Error>> + Send + 'static {
        let entries = Arc::clone(&self.entries);
        let from = self.known_tail();
        let batch = self.fetch_batch;
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return Ok(Fetch {
                    events: Vec::new(),
                    more: false,
                });
            }
            let entries = entries.read().expect("in-memory log lock poisoned");
            let start = usize::try_from(from)
                .unwrap_or(usize::MAX)
                .min(entries.len());
            let end = start.saturating_add(batch).min(entries.len());
            let events = entries[start..end].to_vec();
            let more = end < entries.len();
            tracing::trace!(fetched = events.len(), more, "fetched batch from log");
            Ok(Fetch { events, more })
        }
    }

    fn finish_fetch(&mut self, fetch: Fetch) -> bool {
        self.buffer.extend(fetch.events);
        fetch.more
    }

    fn discard_up_to(
        &mut self,
        sequence: u64,
        _cancel: &CancelToken,
    ) -> impl Future<Output = Result<u64, Error>> + Send {
        async move {
            let max_known = self.entries.read().expect("in-memory log lock poisoned").len() as u64;
            self.sequence = sequence.saturating_sub(1).min(max_known);
            self.buffer.clear();
            tracing::debug!(sequence = self.sequence, max_known, "discarded stream prefix");
            Ok(max_known)
        }
    }

    fn write(
        &mut self,
        events: &NonEmpty<E>,
        _cancel: &CancelToken,
    ) -> impl Future<Output = Result<Option<u64>, Error>> + Send {
        async move {
            // Serialize before taking the lock so a bad event cannot leave a
            // partial batch behind.
            let mut staged = Vec::with_capacity(events.len());
            for event in events.iter() {
                staged.push(serde_json::to_value(event).map_err(Error::Serialization)?);
            }

            let mut entries = self.entries.write().expect("in-memory log lock poisoned");
            if entries.len() as u64 != self.known_tail() {
                tracing::debug!(
                    known_tail = self.known_tail(),
                    store_tail = entries.len(),
                    "write conflict: store has grown past this stream's tail"
                );
                return Ok(None);
            }

            self.buffer.extend(staged.iter().cloned());
            entries.extend(staged);
            let end_sequence = entries.len() as u64;
            drop(entries);
            tracing::debug!(
                appended = events.len(),
                end_sequence,
                "events appended to log"
            );
            Ok(Some(end_sequence))
        }
    }

    fn reset(&mut self) {
        self.sequence = 0;
        self.buffer.clear();
    }
}
