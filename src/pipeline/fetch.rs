//! Fetch pool: `DISCOVERED → FETCHING → FETCHED | FETCH_FAILED`.

use super::{PipelineContext, StageError, discard_stale};
use crate::file_hash;
use crate::staging::Staging;
use crate::state::ItemState;
use crate::store::{CommitFields, StoreError, WorkItem};

/// Claim one batch and process it. Returns how many items were claimed.
pub async fn run_batch(ctx: &PipelineContext, owner: &str) -> Result<usize, StoreError> {
    let items = ctx
        .store
        .claim_batch(
            owner,
            ItemState::Discovered,
            ItemState::Fetching,
            ctx.settings.fetch_lease,
            ctx.settings.fetch_batch_size,
        )
        .await?;
    let claimed = items.len();

    for item in items {
        // The rest of the batch is left to lease expiry.
        if ctx.shutdown.is_cancelled() {
            break;
        }
        fetch_item(ctx, owner, item).await?;
    }
    Ok(claimed)
}

#[tracing::instrument(skip(ctx, item), fields(id = item.id, source_id = %item.source_id))]
async fn fetch_item(ctx: &PipelineContext, owner: &str, item: WorkItem) -> Result<(), StoreError> {
    let claim = item.lease_expires_at.unwrap_or_default();
    let content_ref = Staging::content_ref_for(item.id, claim);

    match stage(ctx, &item, &content_ref).await {
        Ok(content_hash) => {
            tracing::debug!(%content_hash, "Fetched");
            let result = ctx
                .store
                .commit(
                    owner,
                    &item.source_id,
                    ItemState::Fetching,
                    ItemState::Fetched,
                    CommitFields::fetched(&content_ref, content_hash),
                )
                .await;
            if matches!(&result, Err(error) if error.is_stale_lease())
                && let Err(cleanup) = ctx.staging.discard(&content_ref).await
            {
                tracing::warn!(%cleanup, "Failed to discard staging file of a lost lease");
            }
            discard_stale(result, &item.source_id)
        }
        Err(error) => {
            if let Err(cleanup) = ctx.staging.discard(&content_ref).await {
                tracing::warn!(%cleanup, "Failed to discard partial staging file");
            }
            let failure =
                ctx.settings
                    .fetch_retry
                    .failure(&error, item.attempt_count, ctx.store.now());
            tracing::warn!(
                %error,
                attempt = item.attempt_count + 1,
                retry_at = ?failure.retry_at,
                "Fetch failed"
            );
            let result = ctx
                .store
                .fail(
                    owner,
                    &item.source_id,
                    ItemState::Fetching,
                    ItemState::FetchFailed,
                    &failure,
                )
                .await;
            discard_stale(result, &item.source_id)
        }
    }
}

/// Download into staging and return the verified hash.
async fn stage(ctx: &PipelineContext, item: &WorkItem, content_ref: &str) -> Result<String, StageError> {
    let bytes = ctx.source.fetch(&item.source_id).await?;
    let expected = file_hash::sha256_bytes(&bytes);

    ctx.staging.write(content_ref, &bytes).await?;
    let actual = ctx.staging.hash(content_ref).await?;
    if actual != expected {
        return Err(StageError::Integrity { expected, actual });
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapters::{AdapterError, DiscoveredItem, MockDestinationAdapter, MockSourceAdapter};
    use crate::test_utils::{TestPipeline, test_pipeline};

    async fn with_source(source: MockSourceAdapter) -> TestPipeline {
        let t = test_pipeline(source, MockDestinationAdapter::new(), |_| {}).await;
        t.ctx
            .store
            .register(&DiscoveredItem::new("IMG_0001.jpg"))
            .await
            .unwrap();
        t
    }

    #[tokio::test]
    async fn test_fetch_stages_content_and_records_hash() {
        let mut source = MockSourceAdapter::new();
        source
            .expect_fetch()
            .withf(|id| id.eq("IMG_0001.jpg"))
            .times(1)
            .returning(|_| Ok(b"abc".to_vec()));
        let t = with_source(source).await;

        assert_eq!(run_batch(&t.ctx, "fetch-0").await.unwrap(), 1);

        let item = t.ctx.store.find("IMG_0001.jpg").await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Fetched);
        let content_ref = item.content_ref.as_deref().unwrap();
        assert!(content_ref.starts_with(&format!("{}-", item.id)));
        assert_eq!(
            item.content_hash.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        let staged = t.ctx.staging.read(content_ref).await.unwrap();
        assert_eq!(staged, b"abc");
    }

    /// Worker `a` loses its lease to `b`, which fetches and commits first.
    async fn lost_lease(source: MockSourceAdapter) -> (TestPipeline, WorkItem) {
        let t = with_source(source).await;
        let mut claimed = t
            .ctx
            .store
            .claim_batch(
                "fetch-a",
                ItemState::Discovered,
                ItemState::Fetching,
                Duration::from_secs(60),
                1,
            )
            .await
            .unwrap();
        t.clock.advance(Duration::from_secs(90));
        t.ctx.store.reclaim_expired(t.ctx.store.now()).await.unwrap();
        assert_eq!(run_batch(&t.ctx, "fetch-b").await.unwrap(), 1);
        (t, claimed.remove(0))
    }

    async fn assert_committed_content_intact(t: &TestPipeline) {
        let item = t.ctx.store.find("IMG_0001.jpg").await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Fetched);
        assert_eq!(item.lease_owner, None);
        let staged = t
            .ctx
            .staging
            .read(item.content_ref.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(staged, b"abc");
        assert_eq!(std::fs::read_dir(t.ctx.staging.dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_after_lost_lease_keeps_new_holders_file() {
        let mut source = MockSourceAdapter::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(b"abc".to_vec()));
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(AdapterError::transient("connection reset")));
        let (t, stale) = lost_lease(source).await;

        fetch_item(&t.ctx, "fetch-a", stale).await.unwrap();

        assert_committed_content_intact(&t).await;
    }

    #[tokio::test]
    async fn test_late_success_after_lost_lease_leaves_no_extra_file() {
        let mut source = MockSourceAdapter::new();
        source.expect_fetch().times(2).returning(|_| Ok(b"abc".to_vec()));
        let (t, stale) = lost_lease(source).await;

        fetch_item(&t.ctx, "fetch-a", stale).await.unwrap();

        assert_committed_content_intact(&t).await;
    }

    #[tokio::test]
    async fn test_transient_error_schedules_retry() {
        let mut source = MockSourceAdapter::new();
        source
            .expect_fetch()
            .returning(|_| Err(AdapterError::transient("HTTP 503")));
        let t = with_source(source).await;

        run_batch(&t.ctx, "fetch-0").await.unwrap();

        let item = t.ctx.store.find("IMG_0001.jpg").await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::FetchFailed);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.last_error.as_deref(), Some("HTTP 503"));
        let backoff = t.ctx.settings.fetch_retry.backoff(1);
        assert_eq!(
            item.retry_at,
            Some(t.ctx.store.now().timestamp_millis() + backoff.as_millis() as i64)
        );
        assert_eq!(item.content_ref, None);
        assert_eq!(std::fs::read_dir(t.ctx.staging.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_is_never_requeued() {
        let mut source = MockSourceAdapter::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|_| Err(AdapterError::permanent("HTTP 404")));
        let t = with_source(source).await;

        run_batch(&t.ctx, "fetch-0").await.unwrap();
        t.clock.advance(Duration::from_secs(24 * 60 * 60));
        let requeued = t
            .ctx
            .store
            .requeue_failed(ItemState::FetchFailed, 5)
            .await
            .unwrap();

        assert_eq!(requeued, 0);
        let item = t.ctx.store.find("IMG_0001.jpg").await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::FetchFailed);
        assert_eq!(item.retry_at, None);
    }

    #[tokio::test]
    async fn test_empty_claim_does_nothing() {
        let t = test_pipeline(MockSourceAdapter::new(), MockDestinationAdapter::new(), |_| {}).await;
        assert_eq!(run_batch(&t.ctx, "fetch-0").await.unwrap(), 0);
    }
}
