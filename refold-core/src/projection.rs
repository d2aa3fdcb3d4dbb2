//! Projection capability trait.
//!
//! A projection is a deterministic fold of sequence-numbered events into a
//! state value. Projections are pure: [`Projection::apply`] receives the
//! previous state by reference and returns a new one, which lets the group
//! publish every state as an immutable snapshot and lets transactions run
//! against cheap structural clones.
//!
//! Snapshot persistence goes through [`Projection::encode_state`] /
//! [`Projection::decode_state`]; state travels as a [`serde_json::Value`] so
//! the group can wrap it in a versioned envelope without knowing the concrete
//! type.

use std::error::Error as StdError;

use thiserror::Error;

/// A deterministic fold of events into a state value.
///
/// Projections must tolerate replay and gaps: the engine guarantees strictly
/// ascending sequences but not that every event of the stream reaches every
/// projection (undecodable or failing events are quarantined and skipped).
pub trait Projection: Send + Sync + 'static {
    /// Domain event type folded by this projection.
    type Event;

    /// Materialized state type.
    type State: Send + Sync + 'static;

    /// Error produced when an event cannot be applied to the current state.
    type Error: StdError + Send + Sync + 'static;

    /// Stable identifier for this projection.
    ///
    /// Must be non-empty and match `[A-Za-z0-9-]+`; checked when the
    /// projection enters a group.
    fn name(&self) -> &'static str;

    /// Cache-busting version tag.
    ///
    /// Bump this whenever the fold or the state layout changes: snapshots are
    /// keyed by [`full_name`](Self::full_name), so older caches simply stop
    /// matching instead of being silently applied.
    fn version(&self) -> u32;

    /// Snapshot identity: `{name}-{version}`.
    fn full_name(&self) -> String {
        format!("{}-{}", self.name(), self.version())
    }

    /// The state before any event has been applied.
    fn initial(&self) -> Self::State;

    /// Fold one event into the state.
    ///
    /// Pure and deterministic. On error the engine keeps the previous state
    /// for this projection, records the event in the quarantine, and flags
    /// the group possibly inconsistent; subsequent applies continue from the
    /// unchanged state.
    fn apply(
        &self,
        sequence: u64,
        event: &Self::Event,
        state: &Self::State,
    ) -> Result<Self::State, Self::Error>;

    /// Serialize the state for snapshotting.
    fn encode_state(&self, state: &Self::State) -> Result<serde_json::Value, SnapshotError>;

    /// Deserialize a snapshotted state.
    fn decode_state(&self, value: serde_json::Value) -> Result<Self::State, SnapshotError>;
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-')
}

/// Error raised when a projection rejects an event.
#[derive(Debug, Error)]
#[error("projection `{projection}` rejected event {sequence}: {source}")]
pub struct ApplyError {
    projection: String,
    sequence: u64,
    #[source]
    source: Box<dyn StdError + Send + Sync>,
}

impl ApplyError {
    pub(crate) fn new(
        projection: &str,
        sequence: u64,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            projection: projection.to_string(),
            sequence,
            source: Box::new(source),
        }
    }

    /// Full name of the projection that rejected the event.
    #[must_use]
    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// Sequence of the rejected event.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Error type for snapshot encode/decode failures.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("serialization error: {0}")]
    Serialization(#[source] Box<dyn StdError + Send + Sync>),
    #[error("deserialization error: {0}")]
    Deserialization(#[source] Box<dyn StdError + Send + Sync>),
    /// The cached envelope belongs to a different projection or version.
    #[error("snapshot `{found}` does not belong to projection `{expected}`")]
    NameMismatch { expected: String, found: String },
}

impl SnapshotError {
    pub fn serialization(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Serialization(Box::new(err))
    }

    pub fn deserialization(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Deserialization(Box::new(err))
    }
}
