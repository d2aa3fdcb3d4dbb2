#![doc = include_str!("../README.md")]

pub use refold_core::{
    cancel::{CancelToken, Cancelled},
    group::ReifiedGroup,
    notify::{RefreshNotifier, StateWaiter},
    projection::{ApplyError, Projection, SnapshotError},
    quarantine::{Quarantine, QuarantinedEvent, SkipReason},
    wrapper::{
        AppendError, AppendResult, EngineError, StreamTransaction, StreamWrapper, TransactionError,
    },
};

pub mod cache {
    pub use refold_core::cache::{NoCache, ProjectionCache, inmemory};
}

pub mod stream {
    pub use refold_core::stream::{EventStream, NonEmpty, inmemory};
}
