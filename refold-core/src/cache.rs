//! Projection snapshot cache abstraction.
//!
//! The cache stores one opaque byte blob per projection
//! [`full_name`](crate::projection::Projection::full_name). Because the key
//! embeds the projection version, caches shared across wrappers (or across
//! deployments) cannot crosstalk: a bumped version simply misses. Writes must
//! be idempotent under concurrent writers; last-writer-wins is acceptable.
//!
//! Two implementations ship with the crate: [`NoCache`] (always misses,
//! discards writes) and [`inmemory::Cache`].

use std::{convert::Infallible, future::Future};

pub mod inmemory;

/// Byte-oriented snapshot storage keyed by projection full name.
pub trait ProjectionCache: Send + Sync {
    /// Cache-specific error type.
    ///
    /// Cache failures are never fatal to the engine; they are logged and the
    /// run continues without the snapshot.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Read the snapshot stored under `full_name`, if any.
    fn read(
        &self,
        full_name: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Store `bytes` under `full_name`, replacing any previous snapshot.
    fn write(
        &self,
        full_name: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// No-op cache: every read misses, every write is discarded.
///
/// Use this to run a wrapper without snapshotting; cold starts replay the
/// stream from the beginning.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl ProjectionCache for NoCache {
    type Error = Infallible;

    async fn read(&self, _full_name: &str) -> Result<Option<Vec<u8>>, Infallible> {
        Ok(None)
    }

    async fn write(&self, _full_name: &str, _bytes: &[u8]) -> Result<(), Infallible> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_cache_always_misses() {
        let cache = NoCache;
        cache.write("balance-1", b"snapshot").await.unwrap();
        assert!(cache.read("balance-1").await.unwrap().is_none());
    }
}
