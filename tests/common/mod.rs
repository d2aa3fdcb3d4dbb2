//! Shared test domain: a small ledger folded into a running balance.

#![allow(dead_code)]

use refold::{
    Projection, ReifiedGroup, SnapshotError, StreamWrapper,
    cache::{NoCache, ProjectionCache},
    stream::inmemory::{Log, Stream},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Deposited { amount: i64 },
    Withdrew { amount: i64 },
}

pub fn deposit(amount: i64) -> LedgerEvent {
    LedgerEvent::Deposited { amount }
}

pub fn withdraw(amount: i64) -> LedgerEvent {
    LedgerEvent::Withdrew { amount }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub total: i64,
    /// Sequence of the first event ever folded into this state lineage.
    pub first_applied: Option<u64>,
    /// Number of events folded into this state lineage.
    pub applied: u64,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("cannot withdraw {requested}: only {available} available")]
    Overdrawn { requested: i64, available: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct BalanceProjection {
    version: u32,
}

impl BalanceProjection {
    pub fn new() -> Self {
        Self { version: 1 }
    }

    /// Same fold, different version tag; used to exercise cache busting.
    pub fn versioned(version: u32) -> Self {
        Self { version }
    }
}

impl Default for BalanceProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for BalanceProjection {
    type Error = LedgerError;
    type Event = LedgerEvent;
    type State = Balance;

    fn name(&self) -> &'static str {
        "balance"
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn initial(&self) -> Balance {
        Balance::default()
    }

    fn apply(&self, sequence: u64, event: &LedgerEvent, state: &Balance) -> Result<Balance, LedgerError> {
        let mut next = state.clone();
        match *event {
            LedgerEvent::Deposited { amount } => next.total += amount,
            LedgerEvent::Withdrew { amount } => {
                if amount > state.total {
                    return Err(LedgerError::Overdrawn {
                        requested: amount,
                        available: state.total,
                    });
                }
                next.total -= amount;
            }
        }
        next.first_applied.get_or_insert(sequence);
        next.applied += 1;
        Ok(next)
    }

    fn encode_state(&self, state: &Balance) -> Result<serde_json::Value, SnapshotError> {
        serde_json::to_value(state).map_err(SnapshotError::serialization)
    }

    fn decode_state(&self, value: serde_json::Value) -> Result<Balance, SnapshotError> {
        serde_json::from_value(value).map_err(SnapshotError::deserialization)
    }
}

pub type LedgerWrapper<C> = StreamWrapper<Stream<LedgerEvent>, BalanceProjection, C>;

pub fn wrapper(log: &Log) -> LedgerWrapper<NoCache> {
    wrapper_with_cache(log, NoCache)
}

pub fn wrapper_with_cache<C: ProjectionCache>(log: &Log, cache: C) -> LedgerWrapper<C> {
    StreamWrapper::new(
        log.stream(),
        ReifiedGroup::new(BalanceProjection::new()),
        cache,
    )
}

pub fn raw(event: &LedgerEvent) -> serde_json::Value {
    serde_json::to_value(event).expect("test event serializes")
}
