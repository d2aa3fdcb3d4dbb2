//! Reified projection group.
//!
//! A [`ReifiedGroup`] binds one *root* projection (whose state is the value
//! exposed to readers) and any number of additional member projections
//! sharing the same event type but differing in state type. The group tracks
//! a single logical sequence: the sequence of the last event delivered to
//! every projection.
//!
//! States are published behind `Arc`, so readers hold immutable snapshots
//! that stay valid while the group advances, and [`ReifiedGroup::clone`] is a
//! cheap structural clone suitable for transaction scratchpads.

use std::sync::Arc;

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

use crate::{
    cache::ProjectionCache,
    cancel::{CancelToken, Cancelled},
    projection::{ApplyError, Projection, SnapshotError, is_valid_name},
};

/// Wire format for one projection's cached snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    full_name: String,
    sequence: u64,
    state: serde_json::Value,
}

/// Object-safe view of one reified projection inside a group.
trait SlotDyn<E>: Send + Sync {
    fn full_name(&self) -> &str;
    fn apply(&mut self, sequence: u64, event: &E) -> Result<(), ApplyError>;
    fn reset(&mut self);
    fn boxed_clone(&self) -> Box<dyn SlotDyn<E>>;
    fn encode(&self, sequence: u64) -> Result<Vec<u8>, SnapshotError>;
    fn restore(&mut self, bytes: &[u8]) -> Result<u64, SnapshotError>;
}

/// A projection plus its current state.
struct Slot<P: Projection> {
    projection: Arc<P>,
    full_name: String,
    state: Arc<P::State>,
}

impl<P: Projection> Slot<P> {
    fn new(projection: P) -> Self {
        assert!(
            is_valid_name(projection.name()),
            "projection name `{}` must match [A-Za-z0-9-]+",
            projection.name()
        );
        let full_name = projection.full_name();
        let state = Arc::new(projection.initial());
        Self {
            projection: Arc::new(projection),
            full_name,
            state,
        }
    }
}

impl<P: Projection> Clone for Slot<P> {
    fn clone(&self) -> Self {
        Self {
            projection: Arc::clone(&self.projection),
            full_name: self.full_name.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<P: Projection> SlotDyn<P::Event> for Slot<P> {
    fn full_name(&self) -> &str {
        &self.full_name
    }

    fn apply(&mut self, sequence: u64, event: &P::Event) -> Result<(), ApplyError> {
        match self.projection.apply(sequence, event, &self.state) {
            Ok(next) => {
                self.state = Arc::new(next);
                Ok(())
            }
            Err(source) => Err(ApplyError::new(&self.full_name, sequence, source)),
        }
    }

    fn reset(&mut self) {
        self.state = Arc::new(self.projection.initial());
    }

    fn boxed_clone(&self) -> Box<dyn SlotDyn<P::Event>> {
        Box::new(self.clone())
    }

    fn encode(&self, sequence: u64) -> Result<Vec<u8>, SnapshotError> {
        let state = self.projection.encode_state(&self.state)?;
        let envelope = SnapshotEnvelope {
            full_name: self.full_name.clone(),
            sequence,
            state,
        };
        serde_json::to_vec(&envelope).map_err(SnapshotError::serialization)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<u64, SnapshotError> {
        let envelope: SnapshotEnvelope =
            serde_json::from_slice(bytes).map_err(SnapshotError::deserialization)?;
        if envelope.full_name != self.full_name {
            return Err(SnapshotError::NameMismatch {
                expected: self.full_name.clone(),
                found: envelope.full_name,
            });
        }
        self.state = Arc::new(self.projection.decode_state(envelope.state)?);
        Ok(envelope.sequence)
    }
}

/// A group of projections reifying state from one event stream.
///
/// `R` is the root projection; [`state`](Self::state) exposes its current
/// value. Additional projections over the same event type join via
/// [`with_member`](Self::with_member).
pub struct ReifiedGroup<R: Projection> {
    root: Slot<R>,
    members: Vec<Box<dyn SlotDyn<R::Event>>>,
    sequence: u64,
    possibly_inconsistent: bool,
}

impl<R: Projection> ReifiedGroup<R> {
    /// Create a group around a root projection, at sequence 0 and initial
    /// state.
    ///
    /// # Panics
    ///
    /// Panics if the projection's name violates `[A-Za-z0-9-]+`.
    #[must_use]
    pub fn new(root: R) -> Self {
        Self {
            root: Slot::new(root),
            members: Vec::new(),
            sequence: 0,
            possibly_inconsistent: false,
        }
    }

    /// Add a member projection sharing the root's event type.
    ///
    /// # Panics
    ///
    /// Panics if the projection's name violates `[A-Za-z0-9-]+` or collides
    /// with another member's full name (snapshots are keyed by full name, so
    /// duplicates would silently overwrite each other).
    #[must_use]
    pub fn with_member<P>(mut self, projection: P) -> Self
    where
        P: Projection<Event = R::Event>,
    {
        let slot = Slot::new(projection);
        assert!(
            self.slots().all(|existing| existing.full_name() != slot.full_name()),
            "duplicate projection full name `{}` in group",
            slot.full_name()
        );
        self.members.push(Box::new(slot));
        self
    }

    /// Snapshot of the root projection's current state.
    ///
    /// The returned value is immutable and stays valid while the group
    /// advances; the group only ever replaces states, never mutates them.
    #[must_use]
    pub fn state(&self) -> Arc<R::State> {
        Arc::clone(&self.root.state)
    }

    /// Sequence of the last event delivered to every projection.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether at least one event was skipped or partially applied since the
    /// last reset.
    #[must_use]
    pub fn possibly_inconsistent(&self) -> bool {
        self.possibly_inconsistent
    }

    /// Mark the group possibly inconsistent. Sticky until [`reset`](Self::reset).
    pub fn set_possibly_inconsistent(&mut self) {
        self.possibly_inconsistent = true;
    }

    /// Deliver one event to every projection and advance the sequence.
    ///
    /// The sequence advances even when a projection fails: the event counts
    /// as consumed, the failing projection keeps its pre-event state, the
    /// group is flagged possibly inconsistent, and the first failure is
    /// returned for the caller to quarantine. `sequence` must be greater than
    /// [`sequence()`](Self::sequence); gaps are allowed.
    pub fn apply(&mut self, sequence: u64, event: &R::Event) -> Result<(), ApplyError> {
        debug_assert!(
            sequence > self.sequence,
            "events must be applied in ascending sequence order"
        );
        let mut first_error: Option<ApplyError> = None;
        for slot in self.slots_mut() {
            if let Err(error) = slot.apply(sequence, event) {
                if first_error.is_none() {
                    first_error = Some(error);
                } else {
                    tracing::debug!(
                        projection = error.projection(),
                        sequence,
                        %error,
                        "further projection failure on an already-quarantined event"
                    );
                }
            }
        }
        self.sequence = sequence;
        if let Some(error) = first_error {
            self.possibly_inconsistent = true;
            return Err(error);
        }
        Ok(())
    }

    /// Consume a slot without delivering it, flagging the group.
    ///
    /// Used when the stream consumed a slot whose payload could not be
    /// decoded, so the group's sequence keeps tracking the stream's.
    pub fn skip(&mut self, sequence: u64) {
        debug_assert!(
            sequence > self.sequence,
            "skips must move the sequence forward"
        );
        self.sequence = sequence;
        self.possibly_inconsistent = true;
    }

    /// Dry-run `events` against a clone, applying at `base_sequence + 1..`.
    ///
    /// Fails fast on the first rejection and leaves the group untouched.
    /// `base_sequence` must be at least [`sequence()`](Self::sequence).
    pub fn try_apply(
        &self,
        base_sequence: u64,
        events: &NonEmpty<R::Event>,
    ) -> Result<(), ApplyError> {
        let mut probe = self.clone();
        let mut next = base_sequence;
        for event in events.iter() {
            next += 1;
            probe.apply(next, event)?;
        }
        Ok(())
    }

    /// All-or-nothing apply: the group advances only if every projection
    /// accepts the event.
    pub(crate) fn apply_checked(
        &mut self,
        sequence: u64,
        event: &R::Event,
    ) -> Result<(), ApplyError> {
        let mut probe = self.clone();
        probe.apply(sequence, event)?;
        *self = probe;
        Ok(())
    }

    /// Return to sequence 0 and initial state, clearing the
    /// possibly-inconsistent flag.
    pub fn reset(&mut self) {
        self.root.reset();
        for member in &mut self.members {
            member.reset();
        }
        self.sequence = 0;
        self.possibly_inconsistent = false;
    }

    /// Attempt to rehydrate every projection from the cache.
    ///
    /// Returns `Ok(true)` when every projection restored a snapshot and all
    /// snapshots agree on their sequence; [`sequence()`](Self::sequence) then
    /// equals the snapshot sequence. Any miss, rejected envelope, or
    /// disagreement is non-fatal: the group is left reset to initial state
    /// and `Ok(false)` is returned.
    pub async fn try_load<C>(&mut self, cache: &C, cancel: &CancelToken) -> Result<bool, Cancelled>
    where
        C: ProjectionCache,
    {
        let mut sequences = Vec::new();
        let mut failed = false;
        let mut cancelled = false;

        for slot in self.slots_mut() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let read = tokio::select! {
                () = cancel.cancelled() => None,
                result = cache.read(slot.full_name()) => Some(result),
            };
            let Some(result) = read else {
                cancelled = true;
                break;
            };
            let bytes = match result {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    tracing::debug!(projection = slot.full_name(), "no snapshot in cache");
                    failed = true;
                    break;
                }
                Err(error) => {
                    tracing::warn!(projection = slot.full_name(), %error, "snapshot read failed");
                    failed = true;
                    break;
                }
            };
            match slot.restore(&bytes) {
                Ok(sequence) => sequences.push(sequence),
                Err(error) => {
                    tracing::warn!(projection = slot.full_name(), %error, "snapshot rejected");
                    failed = true;
                    break;
                }
            }
        }

        if cancelled {
            self.reset();
            return Err(Cancelled);
        }
        if failed {
            self.reset();
            return Ok(false);
        }
        if sequences.windows(2).any(|pair| pair[0] != pair[1]) {
            tracing::warn!(?sequences, "snapshot sequences disagree across projections");
            self.reset();
            return Ok(false);
        }
        let Some(&sequence) = sequences.first() else {
            self.reset();
            return Ok(false);
        };

        self.sequence = sequence;
        self.possibly_inconsistent = false;
        tracing::debug!(sequence, "projection snapshots loaded");
        Ok(true)
    }

    /// Serialize every projection's current state to the cache.
    ///
    /// Operates on the published immutable states, so the group may keep
    /// advancing while the writes are in flight. Failures are logged and
    /// reported as `Ok(false)`; they are never fatal.
    pub async fn try_save<C>(&self, cache: &C, cancel: &CancelToken) -> Result<bool, Cancelled>
    where
        C: ProjectionCache,
    {
        for slot in self.slots() {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let bytes = match slot.encode(self.sequence) {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!(projection = slot.full_name(), %error, "snapshot encode failed");
                    return Ok(false);
                }
            };
            let write = tokio::select! {
                () = cancel.cancelled() => None,
                result = cache.write(slot.full_name(), &bytes) => Some(result),
            };
            match write {
                None => return Err(Cancelled),
                Some(Err(error)) => {
                    tracing::warn!(projection = slot.full_name(), %error, "snapshot write failed");
                    return Ok(false);
                }
                Some(Ok(())) => {}
            }
        }
        tracing::debug!(sequence = self.sequence, "projection snapshots saved");
        Ok(true)
    }

    fn slots(&self) -> impl Iterator<Item = &dyn SlotDyn<R::Event>> {
        std::iter::once(&self.root as &dyn SlotDyn<R::Event>)
            .chain(self.members.iter().map(|slot| slot.as_ref()))
    }

    fn slots_mut(&mut self) -> impl Iterator<Item = &mut (dyn SlotDyn<R::Event> + '_)> + '_ {
        std::iter::once(&mut self.root as &mut (dyn SlotDyn<R::Event> + '_))
            .chain(
                self.members
                    .iter_mut()
                    .map(|slot| slot.as_mut() as &mut (dyn SlotDyn<R::Event> + '_)),
            )
    }
}

impl<R: Projection> Clone for ReifiedGroup<R> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            members: self.members.iter().map(|slot| slot.boxed_clone()).collect(),
            sequence: self.sequence,
            possibly_inconsistent: self.possibly_inconsistent,
        }
    }
}
