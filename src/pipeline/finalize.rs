//! Finalizer: `DELIVERED → FINALIZING → DONE`, releasing the staging file.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{PipelineContext, discard_stale};
use crate::state::ItemState;
use crate::store::{CommitFields, Failure, StoreError, WorkItem};

pub async fn run_batch(ctx: &PipelineContext, owner: &str) -> Result<usize, StoreError> {
    let items = ctx
        .store
        .claim_batch(
            owner,
            ItemState::Delivered,
            ItemState::Finalizing,
            ctx.settings.finalize_lease,
            ctx.settings.finalize_batch_size,
        )
        .await?;
    let claimed = items.len();

    for item in items {
        if ctx.shutdown.is_cancelled() {
            break;
        }
        finalize_item(ctx, owner, item).await?;
    }
    Ok(claimed)
}

#[tracing::instrument(skip(ctx, item), fields(id = item.id, source_id = %item.source_id))]
async fn finalize_item(ctx: &PipelineContext, owner: &str, item: WorkItem) -> Result<(), StoreError> {
    let released = match item.content_ref.as_deref() {
        // An already missing file counts as released.
        Some(content_ref) => ctx.staging.remove(content_ref).await.map(|_| ()),
        None => Ok(()),
    };

    let result = match released {
        Ok(()) => {
            ctx.store
                .commit(
                    owner,
                    &item.source_id,
                    ItemState::Finalizing,
                    ItemState::Done,
                    CommitFields::finalized(),
                )
                .await
        }
        Err(error) => {
            let attempt = u32::try_from(item.attempt_count).unwrap_or(0) + 1;
            let message = format!("Failed to release staging file: {error}");
            if attempt < ctx.settings.finalize_release_attempts {
                let not_before = retry_after(ctx.store.now(), ctx.settings.sweep_interval);
                tracing::warn!(%error, attempt, %not_before, "Staging release failed, will retry");
                ctx.store
                    .release(
                        owner,
                        &item.source_id,
                        ItemState::Finalizing,
                        &Failure::retry_at(message, not_before),
                    )
                    .await
            } else {
                tracing::warn!(%error, attempt, "Giving up on staging release, leaving artifact");
                ctx.store
                    .commit(
                        owner,
                        &item.source_id,
                        ItemState::Finalizing,
                        ItemState::Done,
                        CommitFields::finalized_with_leftover(message),
                    )
                    .await
            }
        }
    };
    discard_stale(result, &item.source_id)
}

/// A released row sits out until the next sweep interval has passed.
fn retry_after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{CollectionHandle, DiscoveredItem, MockDestinationAdapter, MockSourceAdapter};
    use crate::pipeline::{deliver, fetch};
    use crate::test_utils::{TestPipeline, test_pipeline};

    const ID: &str = "IMG_0001.jpg";

    async fn delivered(release_attempts: u32) -> TestPipeline {
        let mut source = MockSourceAdapter::new();
        source.expect_fetch().returning(|_| Ok(b"pixels".to_vec()));
        let mut destination = MockDestinationAdapter::new();
        destination.expect_ensure_collection().returning(|name| {
            Ok(CollectionHandle {
                id: "album-1".into(),
                name: name.to_string(),
            })
        });
        destination
            .expect_upload()
            .returning(|_, _| Ok("media-1".into()));
        destination
            .expect_add_to_collection()
            .returning(|_, _| Ok(()));

        let t = test_pipeline(source, destination, |settings| {
            settings.finalize_release_attempts = release_attempts;
        })
        .await;
        t.ctx.store.register(&DiscoveredItem::new(ID)).await.unwrap();
        fetch::run_batch(&t.ctx, "fetch-0").await.unwrap();
        deliver::run_batch(&t.ctx, "deliver-0").await.unwrap();
        t
    }

    /// Swap the staged file for a directory so removing it fails.
    fn jam_staging_file(t: &TestPipeline, item: &WorkItem) {
        let path = t
            .ctx
            .staging
            .path_of(item.content_ref.as_deref().unwrap())
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"").unwrap();
    }

    #[tokio::test]
    async fn test_finalize_releases_staging() {
        let t = delivered(3).await;

        assert_eq!(run_batch(&t.ctx, "finalize-0").await.unwrap(), 1);

        let item = t.ctx.store.find(ID).await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Done);
        assert!(item.staging_released);
        assert_eq!(item.destination_id.as_deref(), Some("media-1"));
        assert_eq!(std::fs::read_dir(t.ctx.staging.dir()).unwrap().count(), 0);
        assert!(t.ctx.store.leftover_staging().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_already_missing_file_counts_as_released() {
        let t = delivered(3).await;
        let item = t.ctx.store.find(ID).await.unwrap().unwrap();
        t.ctx
            .staging
            .remove(item.content_ref.as_deref().unwrap())
            .await
            .unwrap();

        run_batch(&t.ctx, "finalize-0").await.unwrap();

        let item = t.ctx.store.find(ID).await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Done);
        assert!(item.staging_released);
    }

    #[tokio::test]
    async fn test_release_failure_retries_then_reports_leftover() {
        let t = delivered(2).await;
        let item = t.ctx.store.find(ID).await.unwrap().unwrap();
        jam_staging_file(&t, &item);

        run_batch(&t.ctx, "finalize-0").await.unwrap();
        let item = t.ctx.store.find(ID).await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Delivered);
        assert_eq!(item.attempt_count, 1);

        // Held back until the next sweep interval.
        assert_eq!(run_batch(&t.ctx, "finalize-0").await.unwrap(), 0);
        t.clock.advance(t.ctx.settings.sweep_interval);
        assert_eq!(run_batch(&t.ctx, "finalize-0").await.unwrap(), 1);
        let item = t.ctx.store.find(ID).await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Done);
        assert!(!item.staging_released);
        assert!(
            item.last_error
                .as_deref()
                .unwrap()
                .starts_with("Failed to release staging file")
        );

        let leftover = t.ctx.store.leftover_staging().await.unwrap();
        assert_eq!(leftover.len(), 1);
        assert_eq!(leftover[0].source_id, ID);
    }

    #[tokio::test]
    async fn test_back_to_back_passes_do_not_burn_release_attempts() {
        let t = delivered(3).await;
        let item = t.ctx.store.find(ID).await.unwrap().unwrap();
        jam_staging_file(&t, &item);

        for _ in 0..3 {
            run_batch(&t.ctx, "finalize-0").await.unwrap();
        }

        let item = t.ctx.store.find(ID).await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Delivered);
        assert_eq!(item.attempt_count, 1);
        assert!(t.ctx.store.leftover_staging().await.unwrap().is_empty());
    }
}
