//! The stream wrapper: a single-threaded coordinator binding an event
//! stream, a reified projection group, and a projection snapshot cache into a
//! consistent read/write engine.
//!
//! The wrapper assumes exclusive use of its collaborators; upper layers
//! serialize entry into its operations (mutex, actor, or task queue). Between
//! suspension points its state is internally consistent, the published
//! projection state is always safe to read concurrently, and
//! [`wait_for_state`](StreamWrapper::wait_for_state) waiters may be awaited
//! from any task.
//!
//! # Catch-up
//!
//! [`catch_up`](StreamWrapper::catch_up) overlaps I/O and CPU: each round
//! starts a background fetch, drains the locally buffered events into the
//! projection group while the fetch is in flight, then integrates the batch
//! and repeats until the stream reports no more events upstream. The fetch
//! adds at most one batch before being consumed, so buffering stays bounded.
//!
//! # Appends
//!
//! [`append_events`](StreamWrapper::append_events) and
//! [`transaction`](StreamWrapper::transaction) write optimistically: on
//! conflict the wrapper catches up and re-runs the caller's builder against
//! the refreshed state, so every retry observes the events that caused the
//! conflict.

use std::sync::Arc;

use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    cache::ProjectionCache,
    cancel::{CancelToken, Cancelled},
    group::ReifiedGroup,
    notify::{RefreshNotifier, StateWaiter},
    projection::{ApplyError, Projection},
    quarantine::{Quarantine, SkipReason},
    stream::EventStream,
};

/// Engine-level failure of an initialize/catch-up/write cycle.
#[derive(Debug, Error)]
pub enum EngineError<StreamError>
where
    StreamError: std::error::Error + 'static,
{
    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// The stream driver failed in a non-retriable way.
    #[error("event stream error: {0}")]
    Stream(#[source] StreamError),
    /// A snapshot written during catch-up did not round-trip; the run must
    /// not continue on state that cannot be reproduced from the cache.
    #[error("snapshot round-trip mismatch: reloaded sequence {reloaded}, stream at {stream}")]
    SnapshotRoundTrip { reloaded: u64, stream: u64 },
    /// The background fetch task panicked.
    #[error("background fetch task failed")]
    TaskPanicked,
}

impl<StreamError> From<Cancelled> for EngineError<StreamError>
where
    StreamError: std::error::Error + 'static,
{
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Error returned by [`StreamWrapper::append_events`].
#[derive(Debug, Error)]
pub enum AppendError<BuilderError, StreamError>
where
    StreamError: std::error::Error + 'static,
{
    /// The caller's builder rejected the current state. Propagated unchanged
    /// and never logged; the caller produced it.
    #[error("builder rejected the current state: {0}")]
    Builder(BuilderError),
    /// The built events do not apply cleanly on top of the current state.
    #[error("pre-flight validation failed: {0}")]
    Preflight(#[source] ApplyError),
    #[error(transparent)]
    Engine(EngineError<StreamError>),
}

/// Error returned by [`StreamWrapper::transaction`].
#[derive(Debug, Error)]
pub enum TransactionError<BuilderError, StreamError>
where
    StreamError: std::error::Error + 'static,
{
    /// The caller's builder aborted the transaction. Propagated unchanged and
    /// never logged.
    #[error("transaction aborted by builder: {0}")]
    Builder(BuilderError),
    #[error(transparent)]
    Engine(EngineError<StreamError>),
}

/// Result of a successful append or transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppendResult<T> {
    /// Number of events written. Zero when the builder produced none.
    pub appended: usize,
    /// Sequence of the last written event; zero when nothing was written.
    pub last_sequence: u64,
    /// The builder's own output, returned verbatim.
    pub output: T,
}

/// Trial scratchpad for [`StreamWrapper::transaction`].
///
/// Carries a structural clone of the projection group plus the staged event
/// list. [`add`](Self::add) applies each event to the clone immediately, so
/// the builder always observes the post-event state.
pub struct StreamTransaction<R: Projection> {
    group: ReifiedGroup<R>,
    staged: Vec<R::Event>,
}

impl<R: Projection> StreamTransaction<R> {
    fn new(group: ReifiedGroup<R>) -> Self {
        Self {
            group,
            staged: Vec::new(),
        }
    }

    /// Current state of the transaction's trial group.
    #[must_use]
    pub fn state(&self) -> Arc<R::State> {
        self.group.state()
    }

    /// Sequence the trial group has reached, including staged events.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.group.sequence()
    }

    /// Events staged so far.
    #[must_use]
    pub fn staged(&self) -> &[R::Event] {
        &self.staged
    }

    /// Stage an event, applying it to the trial group immediately.
    ///
    /// If any projection rejects the event, nothing is staged and the trial
    /// group is left exactly as it was; the builder typically aborts by
    /// propagating the error.
    pub fn add(&mut self, event: R::Event) -> Result<(), ApplyError> {
        let sequence = self.group.sequence() + 1;
        self.group.apply_checked(sequence, &event)?;
        self.staged.push(event);
        Ok(())
    }

    fn into_staged(self) -> Vec<R::Event> {
        self.staged
    }
}

/// Single-threaded coordinator binding stream, projections, and cache.
pub struct StreamWrapper<St, R, C>
where
    St: EventStream<Event = R::Event>,
    R: Projection,
    C: ProjectionCache,
{
    stream: St,
    group: ReifiedGroup<R>,
    cache: C,
    quarantine: Quarantine<R::Event>,
    notifier: RefreshNotifier,
    events_between_cache_saves: u64,
    applied_since_cache_load: u64,
}

impl<St, R, C> StreamWrapper<St, R, C>
where
    St: EventStream<Event = R::Event>,
    R: Projection,
    C: ProjectionCache,
{
    /// Bind a stream, a projection group, and a cache into a wrapper.
    ///
    /// The snapshot cadence defaults to "never" (`u64::MAX` events between
    /// cache saves); opt in via
    /// [`with_events_between_cache_saves`](Self::with_events_between_cache_saves).
    pub fn new(stream: St, group: ReifiedGroup<R>, cache: C) -> Self {
        Self {
            stream,
            group,
            cache,
            quarantine: Quarantine::new(),
            notifier: RefreshNotifier::new(),
            events_between_cache_saves: u64::MAX,
            applied_since_cache_load: 0,
        }
    }

    /// Save (and round-trip-verify) projection snapshots every `threshold`
    /// applied events during catch-up.
    ///
    /// The counter resets whenever catch-up completes, so in practice the
    /// cadence only fires during the initial bulk catch-up of a cold stream.
    #[must_use]
    pub fn with_events_between_cache_saves(mut self, threshold: u64) -> Self {
        self.events_between_cache_saves = threshold;
        self
    }

    /// Configured snapshot cadence.
    #[must_use]
    pub fn events_between_cache_saves(&self) -> u64 {
        self.events_between_cache_saves
    }

    /// Immutable snapshot of the current application state.
    ///
    /// Safe to hand to readers on other threads; the wrapper only replaces
    /// states, never mutates them.
    #[must_use]
    pub fn current(&self) -> Arc<R::State> {
        self.group.state()
    }

    /// Sequence of the last stream slot consumed locally.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.stream.sequence()
    }

    /// Whether the state may have diverged from a faithful replay because at
    /// least one event was skipped or partially applied.
    #[must_use]
    pub fn possibly_inconsistent(&self) -> bool {
        self.group.possibly_inconsistent()
    }

    /// Events skipped so far, with their sequences and errors.
    #[must_use]
    pub fn quarantine(&self) -> &Quarantine<R::Event> {
        &self.quarantine
    }

    /// Obtain a waiter released the next time state catches up with the
    /// stream tail.
    pub fn wait_for_state(&mut self) -> StateWaiter {
        self.notifier.wait_for_state()
    }

    /// Whether a refresh latch is currently pending.
    #[must_use]
    pub fn waiting_for_state(&self) -> bool {
        self.notifier.waiting()
    }

    /// Load the snapshot (if any), fast-forward the stream past the covered
    /// prefix, and catch up with the tail.
    ///
    /// A cache that is ahead of the store (possible when a development store
    /// was wiped) is discarded: both the stream and the group reset and the
    /// whole history is replayed.
    #[tracing::instrument(skip_all)]
    pub async fn initialize(&mut self, cancel: &CancelToken) -> Result<(), EngineError<St::Error>> {
        let loaded = self.group.try_load(&self.cache, cancel).await?;
        if loaded {
            self.applied_since_cache_load = 0;
            tracing::info!(sequence = self.group.sequence(), "projection snapshot loaded");
        } else {
            self.stream.reset();
            self.group.reset();
        }

        let result = tokio::select! {
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.stream.discard_up_to(self.group.sequence() + 1, cancel) => result,
        };
        let max_known = result.map_err(|error| {
            tracing::error!(%error, "failed to fast-forward the stream");
            EngineError::Stream(error)
        })?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        if max_known < self.group.sequence() {
            tracing::warn!(
                snapshot_sequence = self.group.sequence(),
                store_sequence = max_known,
                "snapshot is ahead of the store; discarding it and replaying from scratch"
            );
            self.stream.reset();
            self.group.reset();
        }

        self.catch_up(cancel).await
    }

    /// Bring the projection group up to the stream's remote tail.
    ///
    /// Fires the refresh notifier on completion. Running this twice with no
    /// new events in between is observably a no-op.
    #[tracing::instrument(skip_all)]
    pub async fn catch_up(&mut self, cancel: &CancelToken) -> Result<(), EngineError<St::Error>> {
        loop {
            let mut fetch = tokio::spawn(self.stream.start_fetch(cancel));
            self.run_local_catch_up(cancel).await?;

            let joined = tokio::select! {
                () = cancel.cancelled() => {
                    fetch.abort();
                    return Err(EngineError::Cancelled);
                }
                joined = &mut fetch => joined,
            };
            let batch = joined
                .map_err(|_| EngineError::TaskPanicked)?
                .map_err(|error| {
                    tracing::error!(%error, "background fetch failed");
                    EngineError::Stream(error)
                })?;

            if !self.stream.finish_fetch(batch) {
                // The final batch was just integrated; drain it before
                // reporting the group caught up.
                self.run_local_catch_up(cancel).await?;
                break;
            }
        }

        self.applied_since_cache_load = 0;
        tracing::debug!(sequence = self.stream.sequence(), "caught up with stream tail");
        self.notifier.notify_refresh();
        Ok(())
    }

    /// Build events against the current state and append them optimistically.
    ///
    /// The builder receives the current state and returns the events to
    /// append plus an arbitrary output passed back to the caller. On write
    /// conflict the wrapper catches up and re-runs the builder, so the second
    /// attempt observes the winning writer's events. Builder errors propagate
    /// unchanged and are never logged.
    #[tracing::instrument(skip_all)]
    pub async fn append_events<F, T, B>(
        &mut self,
        mut builder: F,
        cancel: &CancelToken,
    ) -> Result<AppendResult<T>, AppendError<B, St::Error>>
    where
        F: FnMut(&R::State) -> Result<(Vec<R::Event>, T), B>,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(AppendError::Engine(EngineError::Cancelled));
            }

            let state = self.group.state();
            let (events, output) = builder(state.as_ref()).map_err(AppendError::Builder)?;
            let Some(events) = NonEmpty::from_vec(events) else {
                return Ok(AppendResult {
                    appended: 0,
                    last_sequence: 0,
                    output,
                });
            };

            // Dry-run on a clone so an invalid batch surfaces here instead of
            // corrupting the group after a successful write.
            self.group
                .try_apply(self.stream.sequence(), &events)
                .map_err(|error| {
                    tracing::error!(%error, "pre-flight validation of built events failed");
                    AppendError::Preflight(error)
                })?;

            match self
                .write_events(&events, cancel)
                .await
                .map_err(AppendError::Engine)?
            {
                Some(last_sequence) => {
                    self.finish_write();
                    return Ok(AppendResult {
                        appended: events.len(),
                        last_sequence,
                        output,
                    });
                }
                None => {
                    tracing::debug!("append conflicted with another writer; rebasing");
                    self.catch_up(cancel).await.map_err(AppendError::Engine)?;
                }
            }
        }
    }

    /// Run a builder against a transactional clone of the projection group
    /// and append the staged events optimistically.
    ///
    /// Unlike [`append_events`](Self::append_events), each
    /// [`StreamTransaction::add`] is validated as it happens, so no separate
    /// pre-flight pass is needed. An empty transaction (abort or no-op)
    /// returns `(0, 0, output)` without touching the stream.
    #[tracing::instrument(skip_all)]
    pub async fn transaction<F, T, B>(
        &mut self,
        mut builder: F,
        cancel: &CancelToken,
    ) -> Result<AppendResult<T>, TransactionError<B, St::Error>>
    where
        F: FnMut(&mut StreamTransaction<R>) -> Result<T, B>,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(TransactionError::Engine(EngineError::Cancelled));
            }

            let mut tx = StreamTransaction::new(self.group.clone());
            let output = builder(&mut tx).map_err(TransactionError::Builder)?;
            let Some(events) = NonEmpty::from_vec(tx.into_staged()) else {
                return Ok(AppendResult {
                    appended: 0,
                    last_sequence: 0,
                    output,
                });
            };

            match self
                .write_events(&events, cancel)
                .await
                .map_err(TransactionError::Engine)?
            {
                Some(last_sequence) => {
                    self.finish_write();
                    return Ok(AppendResult {
                        appended: events.len(),
                        last_sequence,
                        output,
                    });
                }
                None => {
                    tracing::debug!("transaction conflicted with another writer; rebasing");
                    self.catch_up(cancel)
                        .await
                        .map_err(TransactionError::Engine)?;
                }
            }
        }
    }

    /// Serialize the current projection states to the cache.
    ///
    /// Advisory: returns `Ok(false)` on cache failure, which is never fatal.
    pub async fn try_save(&self, cancel: &CancelToken) -> Result<bool, Cancelled> {
        self.group.try_save(&self.cache, cancel).await
    }

    /// Rewind stream and projections to sequence 0 and initial state.
    ///
    /// The quarantine is retained: it is the durable record of skipped
    /// events, independent of replay position.
    pub fn reset(&mut self) {
        self.stream.reset();
        self.group.reset();
        self.applied_since_cache_load = 0;
    }

    /// Drain the local buffer, then run the save/load cycle if the cadence
    /// threshold was crossed.
    async fn run_local_catch_up(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<(), EngineError<St::Error>> {
        let applied = self.drain_local();
        self.applied_since_cache_load += applied;
        if self.applied_since_cache_load >= self.events_between_cache_saves {
            self.save_load_cycle(cancel).await?;
            self.applied_since_cache_load = 0;
        }
        Ok(())
    }

    /// Deliver every locally buffered event to the group; returns the number
    /// applied. Undecodable slots and rejected events are quarantined.
    fn drain_local(&mut self) -> u64 {
        let mut applied = 0;
        loop {
            match self.stream.try_next() {
                Ok(None) => break,
                Ok(Some(event)) => {
                    let sequence = self.stream.sequence();
                    if sequence <= self.group.sequence() {
                        // Already covered by the snapshot.
                        continue;
                    }
                    match self.group.apply(sequence, &event) {
                        Ok(()) => applied += 1,
                        Err(error) => {
                            tracing::warn!(sequence, %error, "event quarantined: apply failed");
                            self.quarantine
                                .record(sequence, Some(event), SkipReason::Apply(error));
                        }
                    }
                }
                Err(error) => {
                    let sequence = self.stream.sequence();
                    if sequence <= self.group.sequence() {
                        continue;
                    }
                    tracing::warn!(sequence, %error, "event quarantined: undecodable payload");
                    self.group.skip(sequence);
                    self.quarantine
                        .record(sequence, None, SkipReason::Decode(Box::new(error)));
                }
            }
        }
        applied
    }

    /// Save snapshots, then prove they round-trip by reloading them.
    ///
    /// A snapshot that does not reproduce the stream position would silently
    /// corrupt every later cold start, so a mismatch here is fatal.
    async fn save_load_cycle(&mut self, cancel: &CancelToken) -> Result<(), EngineError<St::Error>> {
        tracing::debug!(
            applied = self.applied_since_cache_load,
            "snapshot cadence reached"
        );
        let saved = self.group.try_save(&self.cache, cancel).await?;
        if !saved {
            tracing::warn!("snapshot save failed; continuing without a cache cycle");
            return Ok(());
        }

        let was_inconsistent = self.group.possibly_inconsistent();
        self.group.reset();
        let loaded = self.group.try_load(&self.cache, cancel).await?;
        if was_inconsistent {
            self.group.set_possibly_inconsistent();
        }
        if !loaded || self.group.sequence() != self.stream.sequence() {
            return Err(EngineError::SnapshotRoundTrip {
                reloaded: self.group.sequence(),
                stream: self.stream.sequence(),
            });
        }
        Ok(())
    }

    async fn write_events(
        &mut self,
        events: &NonEmpty<R::Event>,
        cancel: &CancelToken,
    ) -> Result<Option<u64>, EngineError<St::Error>> {
        let result = tokio::select! {
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.stream.write(events, cancel) => result,
        };
        result.map_err(|error| {
            tracing::error!(%error, "optimistic append failed");
            EngineError::Stream(error)
        })
    }

    /// After a successful write: deliver the just-written events to the
    /// group and fire the refresh notifier.
    fn finish_write(&mut self) {
        let _ = self.drain_local();
        self.applied_since_cache_load = 0;
        self.notifier.notify_refresh();
    }
}
