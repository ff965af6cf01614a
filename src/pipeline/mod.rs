//! The migration pipeline: discovery, the fetch and delivery pools, the
//! finalizer and the recovery sweep. Stages never talk to each other; each
//! claims from and commits to the store.

pub mod deliver;
pub mod discovery;
mod error;
pub mod fetch;
pub mod finalize;
pub mod recovery;
pub mod retry;

pub use error::StageError;
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use color_eyre::eyre::{Result, eyre};
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::adapters::{CollectionHandle, DestinationAdapter, SourceAdapter};
use crate::config::Config;
use crate::staging::Staging;
use crate::store::{RetryLimits, Store, StoreError};

const IDLE_MIN: Duration = Duration::from_millis(100);
const IDLE_MAX: Duration = Duration::from_secs(30);
const COMPLETION_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub collection: String,
    pub fetch_workers: usize,
    pub delivery_workers: usize,
    pub fetch_batch_size: u64,
    pub delivery_batch_size: u64,
    pub finalize_batch_size: u64,
    pub fetch_lease: Duration,
    pub delivery_lease: Duration,
    pub finalize_lease: Duration,
    pub fetch_retry: RetryPolicy,
    pub delivery_retry: RetryPolicy,
    pub finalize_release_attempts: u32,
    pub discovery_interval: Duration,
    pub sweep_interval: Duration,
    /// Stop once every row is done or permanently failed.
    pub until_complete: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let retry = |limit| RetryPolicy {
            limit,
            backoff_base: config.retry.backoff_base,
            backoff_max: config.retry.backoff_max,
        };
        Self {
            collection: config.collection.clone(),
            fetch_workers: config.workers.fetch_workers,
            delivery_workers: config.workers.delivery_workers,
            fetch_batch_size: config.workers.fetch_batch_size,
            delivery_batch_size: config.workers.delivery_batch_size,
            finalize_batch_size: config.workers.finalize_batch_size,
            fetch_lease: config.leases.fetch,
            delivery_lease: config.leases.delivery,
            finalize_lease: config.leases.finalize,
            fetch_retry: retry(config.retry.fetch_limit),
            delivery_retry: retry(config.retry.delivery_limit),
            finalize_release_attempts: config.retry.finalize_release_attempts,
            discovery_interval: config.schedule.discovery_interval,
            sweep_interval: config.schedule.sweep_interval,
            until_complete: false,
        }
    }

    pub fn retry_limits(&self) -> RetryLimits {
        RetryLimits {
            fetch: self.fetch_retry.limit,
            delivery: self.delivery_retry.limit,
        }
    }
}

/// Everything a worker needs, shared by all tasks of one run.
pub struct PipelineContext {
    pub store: Arc<Store>,
    pub staging: Staging,
    pub source: Arc<dyn SourceAdapter>,
    pub destination: Arc<dyn DestinationAdapter>,
    pub settings: PipelineSettings,
    pub shutdown: CancellationToken,
    collection: OnceCell<CollectionHandle>,
    discovery_passes: AtomicU64,
}

impl PipelineContext {
    pub fn new(
        store: Arc<Store>,
        staging: Staging,
        source: Arc<dyn SourceAdapter>,
        destination: Arc<dyn DestinationAdapter>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            staging,
            source,
            destination,
            settings,
            shutdown: CancellationToken::new(),
            collection: OnceCell::new(),
            discovery_passes: AtomicU64::new(0),
        }
    }

    /// The target collection, looked up (or created) on first use.
    pub(crate) async fn collection(&self) -> Result<&CollectionHandle, StageError> {
        self.collection
            .get_or_try_init(|| async {
                let handle = self
                    .destination
                    .ensure_collection(&self.settings.collection)
                    .await
                    .map_err(StageError::Transient)?;
                tracing::info!(id = %handle.id, name = %handle.name, "Using destination collection");
                Ok(handle)
            })
            .await
    }

    pub fn discovery_passes(&self) -> u64 {
        self.discovery_passes.load(Ordering::Acquire)
    }

    pub(crate) fn record_discovery_pass(&self) {
        self.discovery_passes.fetch_add(1, Ordering::AcqRel);
    }
}

/// Lease owner identity for worker `index` of `pool` in this process.
pub fn worker_id(pool: &str, index: usize) -> String {
    format!("{pool}-{index}@{}", std::process::id())
}

/// Poll delay for a worker that found nothing to claim. Grows from 100 ms to
/// 30 s and starts over after any work.
struct IdleBackoff {
    delays: ExponentialBackoff,
}

impl IdleBackoff {
    fn new() -> Self {
        Self {
            delays: Self::builder().build(),
        }
    }

    fn builder() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(IDLE_MIN)
            .with_max_delay(IDLE_MAX)
            .with_factor(2.0)
            .without_max_times()
    }

    fn next_delay(&mut self) -> Duration {
        self.delays.next().unwrap_or(IDLE_MAX)
    }

    fn reset(&mut self) {
        self.delays = Self::builder().build();
    }
}

/// Keep a soft lease failure out of the error path: the row moved on and
/// whoever holds it now owns the outcome.
pub(crate) fn discard_stale(result: Result<(), StoreError>, source_id: &str) -> Result<(), StoreError> {
    match result {
        Err(error) if error.is_stale_lease() => {
            tracing::debug!(source_id, %error, "Discarding result for lost lease");
            Ok(())
        }
        other => other,
    }
}

/// Drive one worker: run `pass` until shutdown, backing off while it finds
/// no work. A store error stops the whole pipeline.
async fn poll_loop<F, Fut>(shutdown: &CancellationToken, owner: &str, mut pass: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, StoreError>>,
{
    tracing::debug!(owner, "Worker started");
    let mut idle = IdleBackoff::new();

    while !shutdown.is_cancelled() {
        match pass().await {
            Ok(0) => {
                let delay = idle.next_delay();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Ok(_) => idle.reset(),
            Err(error) => {
                tracing::error!(owner, %error, "Worker stopping on store error");
                shutdown.cancel();
                return Err(error);
            }
        }
    }

    tracing::debug!(owner, "Worker stopped");
    Ok(())
}

async fn watch_completion(ctx: Arc<PipelineContext>) -> Result<(), StoreError> {
    let limits = ctx.settings.retry_limits();
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(COMPLETION_POLL) => {}
        }
        if ctx.discovery_passes() > 0 && ctx.store.is_migration_complete(limits).await? {
            tracing::info!("Migration complete, shutting down");
            ctx.shutdown.cancel();
            return Ok(());
        }
    }
}

/// Run the whole pipeline until `ctx.shutdown` is cancelled, or until the
/// migration completes with `until_complete` set.
#[tracing::instrument(skip_all)]
pub async fn run(ctx: Arc<PipelineContext>) -> Result<()> {
    // Leases left by a previous process must be back in play before any claim.
    let startup = recovery::sweep(&ctx).await?;
    tracing::info!(
        reclaimed = startup.reclaimed,
        requeued = startup.requeued,
        "Startup recovery sweep finished"
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(discovery::run(ctx.clone()));
    tasks.spawn(recovery::run(ctx.clone()));

    for index in 0..ctx.settings.fetch_workers {
        let ctx = ctx.clone();
        let owner = worker_id("fetch", index);
        tasks.spawn(async move {
            poll_loop(&ctx.shutdown, &owner, || fetch::run_batch(&ctx, &owner)).await
        });
    }
    for index in 0..ctx.settings.delivery_workers {
        let ctx = ctx.clone();
        let owner = worker_id("deliver", index);
        tasks.spawn(async move {
            poll_loop(&ctx.shutdown, &owner, || deliver::run_batch(&ctx, &owner)).await
        });
    }
    {
        let ctx = ctx.clone();
        let owner = worker_id("finalize", 0);
        tasks.spawn(async move {
            poll_loop(&ctx.shutdown, &owner, || finalize::run_batch(&ctx, &owner)).await
        });
    }
    if ctx.settings.until_complete {
        tasks.spawn(watch_completion(ctx.clone()));
    }

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let error = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => color_eyre::Report::new(error),
            Err(join_error) => eyre!("Pipeline task panicked: {join_error}"),
        };
        ctx.shutdown.cancel();
        failure.get_or_insert(error);
    }

    match failure {
        Some(error) => Err(error.wrap_err("Pipeline stopped")),
        None => {
            tracing::info!("Pipeline stopped");
            Ok(())
        }
    }
}
