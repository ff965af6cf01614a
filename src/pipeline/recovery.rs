//! Recovery sweep: hand expired leases back to their stage input, then
//! re-queue failed rows whose backoff has elapsed.

use std::sync::Arc;

use super::{PipelineContext, retry};
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub reclaimed: u64,
    pub requeued: u64,
}

#[tracing::instrument(skip_all, level = "debug")]
pub async fn sweep(ctx: &PipelineContext) -> Result<SweepOutcome, StoreError> {
    let reclaimed = ctx.store.reclaim_expired(ctx.store.now()).await?;
    let requeued = retry::requeue_due(
        &ctx.store,
        &ctx.settings.fetch_retry,
        &ctx.settings.delivery_retry,
    )
    .await?;

    if reclaimed > 0 || requeued > 0 {
        tracing::info!(reclaimed, requeued, "Recovery sweep");
    }
    Ok(SweepOutcome {
        reclaimed,
        requeued,
    })
}

pub async fn run(ctx: Arc<PipelineContext>) -> Result<(), StoreError> {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(ctx.settings.sweep_interval) => {}
        }
        if let Err(error) = sweep(&ctx).await {
            tracing::error!(%error, "Recovery sweep stopping on store error");
            ctx.shutdown.cancel();
            return Err(error);
        }
    }
}
