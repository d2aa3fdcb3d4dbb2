//! Record of skipped events.
//!
//! Events that fail to deserialize or that a projection refuses to apply are
//! not allowed to halt the stream: the wrapper skips them, flags the state
//! possibly inconsistent, and appends an entry here. The quarantine is the
//! durable operator-facing record of every such skip; it grows without bound
//! and survives [`StreamWrapper::reset`](crate::wrapper::StreamWrapper::reset).

use thiserror::Error;

use crate::projection::ApplyError;

/// Why an event was skipped.
#[derive(Debug, Error)]
pub enum SkipReason {
    /// The stream consumed the slot but could not decode its payload.
    #[error("failed to decode event: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A projection rejected the decoded event.
    #[error(transparent)]
    Apply(ApplyError),
}

/// A single skipped event.
#[derive(Debug)]
pub struct QuarantinedEvent<E> {
    /// Sequence of the skipped slot.
    pub sequence: u64,
    /// The decoded event, when decoding succeeded.
    pub event: Option<E>,
    pub reason: SkipReason,
}

/// Append-only list of skipped events, for operator inspection.
#[derive(Debug)]
pub struct Quarantine<E> {
    entries: Vec<QuarantinedEvent<E>>,
}

impl<E> Quarantine<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, sequence: u64, event: Option<E>, reason: SkipReason) {
        self.entries.push(QuarantinedEvent {
            sequence,
            event,
            reason,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[QuarantinedEvent<E>] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> Default for Quarantine<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let quarantine: Quarantine<String> = Quarantine::new();
        assert!(quarantine.is_empty());
        assert_eq!(quarantine.len(), 0);
    }

    #[test]
    fn records_preserve_order_and_payload() {
        let mut quarantine = Quarantine::new();
        quarantine.record(
            3,
            None,
            SkipReason::Decode(Box::new(std::io::Error::other("garbage"))),
        );
        quarantine.record(
            7,
            Some("event".to_string()),
            SkipReason::Decode(Box::new(std::io::Error::other("more garbage"))),
        );

        let entries = quarantine.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 3);
        assert!(entries[0].event.is_none());
        assert_eq!(entries[1].sequence, 7);
        assert_eq!(entries[1].event.as_deref(), Some("event"));
    }

    #[test]
    fn skip_reason_decode_displays_source() {
        let reason = SkipReason::Decode(Box::new(std::io::Error::other("unreadable")));
        assert!(reason.to_string().contains("failed to decode"));
    }
}
