use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::adapters::{MockDestinationAdapter, MockSourceAdapter};
use crate::clock::ManualClock;
use crate::pipeline::{PipelineContext, PipelineSettings, RetryPolicy};
use crate::staging::Staging;
use crate::store::Store;

pub struct TestStore {
    pub store: Arc<Store>,
    pub clock: Arc<ManualClock>,
    _dir: TempDir,
}

/// A migrated store in a temp-dir SQLite file, so pooled connections share
/// one database. The clock starts at 2026-01-01 and only moves on `advance`.
pub async fn test_store() -> TestStore {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    ));
    let store = Store::open_with_clock(&dir.path().join("test.sqlite"), clock.clone())
        .await
        .unwrap();

    TestStore {
        store: Arc::new(store),
        clock,
        _dir: dir,
    }
}

pub fn test_settings() -> PipelineSettings {
    let retry = RetryPolicy {
        limit: 5,
        backoff_base: Duration::from_secs(30),
        backoff_max: Duration::from_secs(600),
    };
    PipelineSettings {
        collection: "Migrated".into(),
        fetch_workers: 2,
        delivery_workers: 2,
        fetch_batch_size: 4,
        delivery_batch_size: 4,
        finalize_batch_size: 8,
        fetch_lease: Duration::from_secs(600),
        delivery_lease: Duration::from_secs(600),
        finalize_lease: Duration::from_secs(60),
        fetch_retry: retry,
        delivery_retry: retry,
        finalize_release_attempts: 3,
        discovery_interval: Duration::from_secs(900),
        sweep_interval: Duration::from_secs(60),
        until_complete: false,
    }
}

pub struct TestPipeline {
    pub ctx: Arc<PipelineContext>,
    pub clock: Arc<ManualClock>,
    _store: TestStore,
    _staging: TempDir,
}

pub async fn test_pipeline(
    source: MockSourceAdapter,
    destination: MockDestinationAdapter,
    configure: impl FnOnce(&mut PipelineSettings),
) -> TestPipeline {
    let store = test_store().await;
    let staging_dir = tempfile::tempdir().unwrap();
    let staging = Staging::new(staging_dir.path()).unwrap();

    let mut settings = test_settings();
    configure(&mut settings);

    let ctx = PipelineContext::new(
        store.store.clone(),
        staging,
        Arc::new(source),
        Arc::new(destination),
        settings,
    );

    TestPipeline {
        ctx: Arc::new(ctx),
        clock: store.clock.clone(),
        _store: store,
        _staging: staging_dir,
    }
}
