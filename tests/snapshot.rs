//! Integration tests for snapshot loading, the save/load cadence, and cache
//! failure handling.

use std::convert::Infallible;

use refold::{
    CancelToken, EngineError, ReifiedGroup, StreamWrapper,
    cache::{ProjectionCache, inmemory::Cache},
    stream::inmemory::Log,
};

mod common;

use common::{Balance, BalanceProjection, LedgerEvent, deposit};

/// Accepts every write and remembers none of them.
struct LossyCache;

impl ProjectionCache for LossyCache {
    type Error = Infallible;

    async fn read(&self, _full_name: &str) -> Result<Option<Vec<u8>>, Infallible> {
        Ok(None)
    }

    async fn write(&self, _full_name: &str, _bytes: &[u8]) -> Result<(), Infallible> {
        Ok(())
    }
}

#[tokio::test]
async fn snapshot_resumes_a_fresh_wrapper_at_the_saved_sequence() {
    let log = Log::new();
    let cache = Cache::new();
    let cancel = CancelToken::new();

    let mut warm = common::wrapper_with_cache(&log, cache.clone());
    warm.initialize(&cancel).await.unwrap();
    warm.append_events(
        |_: &Balance| Ok::<_, Infallible>((vec![deposit(10), deposit(20)], ())),
        &cancel,
    )
    .await
    .unwrap();
    assert!(warm.try_save(&cancel).await.unwrap());
    assert!(cache.contains("balance-1"));

    let mut cold = common::wrapper_with_cache(&log, cache.clone());
    cold.initialize(&cancel).await.unwrap();
    assert_eq!(cold.sequence(), 2);
    assert_eq!(cold.current().total, 30);

    // The restored wrapper keeps working: appends continue the sequence.
    let result = cold
        .append_events(
            |_: &Balance| Ok::<_, Infallible>((vec![deposit(5)], ())),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(result.last_sequence, 3);
    assert_eq!(cold.current().total, 35);
}

#[tokio::test]
async fn initialize_never_replays_the_snapshot_covered_prefix() {
    let cancel = CancelToken::new();
    let cache = Cache::new();

    // Build a snapshot at sequence 3 from a clean source log.
    let source = Log::new();
    let mut warm = common::wrapper_with_cache(&source, cache.clone());
    warm.initialize(&cancel).await.unwrap();
    warm.append_events(
        |_: &Balance| Ok::<_, Infallible>((vec![deposit(10), deposit(10), deposit(10)], ())),
        &cancel,
    )
    .await
    .unwrap();
    assert!(warm.try_save(&cancel).await.unwrap());

    // A store whose covered prefix is garbage: if the wrapper replayed it,
    // the quarantine would fill up.
    let target = Log::new();
    for _ in 0..3 {
        target.push_raw(serde_json::json!("garbage"));
    }
    target.push_raw(common::raw(&deposit(4)));
    target.push_raw(common::raw(&deposit(5)));

    let mut cold = common::wrapper_with_cache(&target, cache.clone());
    cold.initialize(&cancel).await.unwrap();

    assert_eq!(cold.sequence(), 5);
    assert_eq!(cold.current().total, 39);
    assert!(cold.quarantine().is_empty());
    assert!(!cold.possibly_inconsistent());
}

#[tokio::test]
async fn cache_ahead_of_store_resets_and_replays_everything() {
    let cancel = CancelToken::new();
    let cache = Cache::new();

    // Snapshot at sequence 4...
    let source = Log::new();
    let mut warm = common::wrapper_with_cache(&source, cache.clone());
    warm.initialize(&cancel).await.unwrap();
    warm.append_events(
        |_: &Balance| {
            Ok::<_, Infallible>((vec![deposit(10), deposit(10), deposit(10), deposit(10)], ()))
        },
        &cancel,
    )
    .await
    .unwrap();
    assert!(warm.try_save(&cancel).await.unwrap());

    // ...but the store only has 2 events (wiped and partially rebuilt).
    let target = Log::new();
    target.push_raw(common::raw(&deposit(7)));
    target.push_raw(common::raw(&deposit(7)));

    let mut cold = common::wrapper_with_cache(&target, cache.clone());
    cold.initialize(&cancel).await.unwrap();

    assert_eq!(cold.sequence(), 2);
    assert_eq!(cold.current().total, 14);
    // Full replay from scratch, not a resumed snapshot.
    assert_eq!(cold.current().first_applied, Some(1));
    assert_eq!(cold.current().applied, 2);
    assert!(!cold.possibly_inconsistent());
}

#[tokio::test]
async fn version_bump_ignores_the_stale_snapshot() {
    let cancel = CancelToken::new();
    let cache = Cache::new();

    let source = Log::new();
    let mut warm = common::wrapper_with_cache(&source, cache.clone());
    warm.initialize(&cancel).await.unwrap();
    warm.append_events(
        |_: &Balance| Ok::<_, Infallible>((vec![deposit(10), deposit(10)], ())),
        &cancel,
    )
    .await
    .unwrap();
    assert!(warm.try_save(&cancel).await.unwrap());

    // Same store, garbage in the covered prefix.
    let target = Log::new();
    target.push_raw(serde_json::json!("garbage"));
    target.push_raw(serde_json::json!("garbage"));

    // The v1 snapshot shields a v1 wrapper from the garbage...
    let mut same_version = common::wrapper_with_cache(&target, cache.clone());
    same_version.initialize(&cancel).await.unwrap();
    assert!(same_version.quarantine().is_empty());

    // ...but a v2 wrapper must not trust it and replays from scratch.
    let mut upgraded = StreamWrapper::new(
        target.stream::<LedgerEvent>(),
        ReifiedGroup::new(BalanceProjection::versioned(2)),
        cache.clone(),
    );
    upgraded.initialize(&cancel).await.unwrap();
    assert_eq!(upgraded.quarantine().len(), 2);
    assert!(upgraded.possibly_inconsistent());
    assert_eq!(upgraded.sequence(), 2);
}

#[tokio::test]
async fn cadence_saves_and_reloads_during_bulk_catch_up() {
    let log = Log::new();
    for _ in 0..25 {
        log.push_raw(common::raw(&deposit(1)));
    }
    let cache = Cache::new();

    let mut wrapper = StreamWrapper::new(
        log.stream_with_batch_size::<LedgerEvent>(10),
        ReifiedGroup::new(BalanceProjection::new()),
        cache.clone(),
    )
    .with_events_between_cache_saves(10);
    let cancel = CancelToken::new();

    wrapper.initialize(&cancel).await.unwrap();

    assert_eq!(wrapper.sequence(), 25);
    assert_eq!(wrapper.current().total, 25);
    assert!(cache.contains("balance-1"));

    // The current state is the reloaded snapshot plus the tail of the
    // stream; the fold saw each event exactly once.
    assert_eq!(wrapper.current().applied, 25);
}

#[tokio::test]
async fn snapshot_that_does_not_round_trip_is_fatal() {
    let log = Log::new();
    for _ in 0..10 {
        log.push_raw(common::raw(&deposit(1)));
    }

    let mut wrapper = StreamWrapper::new(
        log.stream::<LedgerEvent>(),
        ReifiedGroup::new(BalanceProjection::new()),
        LossyCache,
    )
    .with_events_between_cache_saves(5);
    let cancel = CancelToken::new();

    let error = wrapper.initialize(&cancel).await.unwrap_err();
    assert!(matches!(error, EngineError::SnapshotRoundTrip { .. }));
}

#[tokio::test]
async fn try_save_reports_advisory_failure_as_false() {
    /// Read side works, write side always fails.
    struct ReadOnlyCache;

    #[derive(Debug, thiserror::Error)]
    #[error("cache is read-only")]
    struct ReadOnly;

    impl ProjectionCache for ReadOnlyCache {
        type Error = ReadOnly;

        async fn read(&self, _full_name: &str) -> Result<Option<Vec<u8>>, ReadOnly> {
            Ok(None)
        }

        async fn write(&self, _full_name: &str, _bytes: &[u8]) -> Result<(), ReadOnly> {
            Err(ReadOnly)
        }
    }

    let log = Log::new();
    let mut wrapper = common::wrapper_with_cache(&log, ReadOnlyCache);
    let cancel = CancelToken::new();
    wrapper.initialize(&cancel).await.unwrap();
    wrapper
        .append_events(
            |_: &Balance| Ok::<_, Infallible>((vec![deposit(1)], ())),
            &cancel,
        )
        .await
        .unwrap();

    // Advisory: the failure is reported, never fatal.
    assert!(!wrapper.try_save(&cancel).await.unwrap());
    assert_eq!(wrapper.current().total, 1);
}
