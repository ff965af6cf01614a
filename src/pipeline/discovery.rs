use std::sync::Arc;

use futures::StreamExt;

use super::PipelineContext;
use crate::store::{RegisterOutcome, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryPass {
    pub inserted: u64,
    pub already_present: u64,
    pub skipped: u64,
    /// The listing ran to its end without a single error. Only such a pass
    /// lets `--until-complete` finish.
    pub completed: bool,
}

/// One listing of the source. Existing rows are never modified.
#[tracing::instrument(skip_all)]
pub async fn discover(ctx: &PipelineContext) -> Result<DiscoveryPass, StoreError> {
    let mut pass = DiscoveryPass::default();
    let mut listing = ctx.source.list_items();

    while let Some(entry) = listing.next().await {
        if ctx.shutdown.is_cancelled() {
            tracing::info!(?pass, "Discovery interrupted by shutdown");
            return Ok(pass);
        }
        match entry {
            Ok(item) => match ctx.store.register(&item).await? {
                RegisterOutcome::Inserted => pass.inserted += 1,
                RegisterOutcome::AlreadyPresent => pass.already_present += 1,
            },
            Err(error) => {
                tracing::warn!(%error, "Skipping unlistable source entry");
                pass.skipped += 1;
            }
        }
    }

    pass.completed = pass.skipped == 0;
    if pass.completed {
        ctx.record_discovery_pass();
    }
    tracing::info!(
        inserted = pass.inserted,
        already_present = pass.already_present,
        skipped = pass.skipped,
        completed = pass.completed,
        "Discovery pass finished"
    );
    Ok(pass)
}

pub async fn run(ctx: Arc<PipelineContext>) -> Result<(), StoreError> {
    loop {
        if let Err(error) = discover(&ctx).await {
            tracing::error!(%error, "Discovery stopping on store error");
            ctx.shutdown.cancel();
            return Err(error);
        }
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(ctx.settings.discovery_interval) => {}
        }
    }
}
