//! Delivery pool: `FETCHED → DELIVERING → DELIVERED | DELIVER_FAILED`.

use std::io;

use super::{PipelineContext, StageError, discard_stale};
use crate::adapters::ItemMetadata;
use crate::file_hash;
use crate::state::ItemState;
use crate::store::{CommitFields, StoreError, WorkItem};

pub async fn run_batch(ctx: &PipelineContext, owner: &str) -> Result<usize, StoreError> {
    let items = ctx
        .store
        .claim_batch(
            owner,
            ItemState::Fetched,
            ItemState::Delivering,
            ctx.settings.delivery_lease,
            ctx.settings.delivery_batch_size,
        )
        .await?;
    let claimed = items.len();

    for item in items {
        if ctx.shutdown.is_cancelled() {
            break;
        }
        deliver_item(ctx, owner, item).await?;
    }
    Ok(claimed)
}

#[tracing::instrument(skip(ctx, item), fields(id = item.id, source_id = %item.source_id))]
async fn deliver_item(ctx: &PipelineContext, owner: &str, item: WorkItem) -> Result<(), StoreError> {
    match deliver(ctx, owner, &item).await {
        Ok(destination_id) => {
            let result = ctx
                .store
                .commit(
                    owner,
                    &item.source_id,
                    ItemState::Delivering,
                    ItemState::Delivered,
                    CommitFields::delivered(&destination_id),
                )
                .await;
            if result.is_ok() {
                tracing::info!(%destination_id, "Delivered");
            }
            discard_stale(result, &item.source_id)
        }
        Err(StageError::Store(error)) => discard_stale(Err(error), &item.source_id),
        Err(error) => {
            let failure =
                ctx.settings
                    .delivery_retry
                    .failure(&error, item.attempt_count, ctx.store.now());
            tracing::warn!(
                %error,
                attempt = item.attempt_count + 1,
                retry_at = ?failure.retry_at,
                "Delivery failed"
            );
            let result = ctx
                .store
                .fail(
                    owner,
                    &item.source_id,
                    ItemState::Delivering,
                    ItemState::DeliverFailed,
                    &failure,
                )
                .await;
            discard_stale(result, &item.source_id)
        }
    }
}

async fn deliver(ctx: &PipelineContext, owner: &str, item: &WorkItem) -> Result<String, StageError> {
    let bytes = verified_content(ctx, item).await?;
    let collection = ctx.collection().await?;

    let destination_id = match &item.upload_ref {
        Some(upload_ref) => {
            tracing::debug!(%upload_ref, "Reusing earlier upload");
            upload_ref.clone()
        }
        None => {
            let metadata = metadata_for(item, &bytes);
            let destination_id = ctx.destination.upload(bytes, &metadata).await?;
            ctx.store
                .record_upload(owner, &item.source_id, &destination_id)
                .await?;
            destination_id
        }
    };

    ctx.destination
        .add_to_collection(&destination_id, collection)
        .await?;
    Ok(destination_id)
}

/// Staged bytes, checked against the hash recorded at fetch time.
async fn verified_content(ctx: &PipelineContext, item: &WorkItem) -> Result<Vec<u8>, StageError> {
    let expected = item.content_hash.clone().unwrap_or_default();
    let missing = |actual: &str| StageError::Integrity {
        expected: expected.clone(),
        actual: actual.to_string(),
    };
    let Some(content_ref) = item.content_ref.as_deref() else {
        return Err(missing("no staged content"));
    };

    let bytes = match ctx.staging.read(content_ref).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(missing("missing staging file"));
        }
        Err(e) => return Err(StageError::Staging(e)),
    };
    let actual = file_hash::sha256_bytes(&bytes);
    if actual != expected {
        return Err(missing(&actual));
    }
    Ok(bytes)
}

fn metadata_for(item: &WorkItem, bytes: &[u8]) -> ItemMetadata {
    let file_name = item.file_name.clone().unwrap_or_else(|| {
        item.source_id
            .rsplit('/')
            .next()
            .unwrap_or(&item.source_id)
            .to_string()
    });
    ItemMetadata {
        source_id: item.source_id.clone(),
        file_name,
        mime_type: infer::get(bytes).map(|kind| kind.mime_type().to_string()),
        created_at: item.source_created_at,
    }
}
