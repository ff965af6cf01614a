//! The durable store: one SQLite table that every worker coordinates through.
//!
//! Each mutation is a single statement scoped to one row (or one bounded claim
//! batch). Leased mutations compare-and-swap on `(state, lease_owner)`, so a
//! worker whose lease was reclaimed can never overwrite newer progress.

mod error;
mod report;

pub use error::StoreError;
pub use report::{FailedItem, RetryLimits, StateCounts};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::{Result, eyre::Context};
use migration::MigratorTrait;
use sea_orm::prelude::Expr;
use sea_orm::sea_query::{ExprTrait, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, Condition, ConnectOptions, ConnectionTrait,
    Database as SeaDatabase, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, QueryTrait, UpdateMany,
};
use tracing::instrument;

use crate::adapters::DiscoveredItem;
use crate::clock::{Clock, SystemClock, duration_millis};
use crate::entities::work_item;
use crate::state::{CLAIM_EDGES, ItemState};

pub type WorkItem = work_item::Model;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    AlreadyPresent,
}

/// Columns written alongside a successful transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitFields {
    pub content_ref: Option<String>,
    pub content_hash: Option<String>,
    pub destination_id: Option<String>,
    pub staging_released: Option<bool>,
    pub last_error: Option<String>,
}

impl CommitFields {
    pub fn fetched(content_ref: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            content_ref: Some(content_ref.into()),
            content_hash: Some(content_hash.into()),
            ..Default::default()
        }
    }

    pub fn delivered(destination_id: impl Into<String>) -> Self {
        Self {
            destination_id: Some(destination_id.into()),
            ..Default::default()
        }
    }

    pub fn finalized() -> Self {
        Self {
            staging_released: Some(true),
            ..Default::default()
        }
    }

    /// Finalize while the staging artifact could not be removed.
    pub fn finalized_with_leftover(error: impl Into<String>) -> Self {
        Self {
            staging_released: Some(false),
            last_error: Some(error.into()),
            ..Default::default()
        }
    }

    fn check(&self, to: ItemState) -> Result<(), StoreError> {
        let missing = |field| Err(StoreError::MissingField { state: to, field });
        match to {
            ItemState::Fetched if self.content_ref.is_none() => missing("content_ref"),
            ItemState::Fetched if self.content_hash.is_none() => missing("content_hash"),
            ItemState::Delivered if self.destination_id.is_none() => missing("destination_id"),
            _ => Ok(()),
        }
    }
}

/// A failed attempt. `retry_at: None` marks the failure permanent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub error: String,
    pub retry_at: Option<DateTime<Utc>>,
}

impl Failure {
    pub fn retry_at(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            error: error.into(),
            retry_at: Some(at),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retry_at: None,
        }
    }
}

pub struct Store {
    conn: DatabaseConnection,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open or create the store at the given path
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        tracing::debug!("Opening store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(format!(
                "Failed to create store directory: {}",
                parent.display()
            ))?;
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());

        let mut opt = ConnectOptions::new(url);
        opt.max_connections(16)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(8))
            .acquire_timeout(Duration::from_secs(30))
            .sqlx_logging(false);

        let conn = SeaDatabase::connect(opt)
            .await
            .context(format!("Failed to open store: {}", path.display()))?;

        // Readers must not block the claiming writer.
        conn.execute_unprepared("PRAGMA journal_mode = WAL")
            .await
            .context("Failed to enable WAL journal")?;

        tracing::debug!("Running store migrations");
        migration::Migrator::up(&conn, None)
            .await
            .context("Failed to run store migrations")?;

        tracing::info!("Store ready at: {}", path.display());
        Ok(Store { conn, clock })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert a newly discovered item in `Discovered`. A `source_id` that is
    /// already known is left untouched.
    pub async fn register(&self, item: &DiscoveredItem) -> Result<RegisterOutcome, StoreError> {
        let now = self.clock.now_millis();
        let row = work_item::ActiveModel {
            id: ActiveValue::NotSet,
            source_id: ActiveValue::Set(item.source_id.clone()),
            file_name: ActiveValue::Set(item.file_name.clone()),
            size_bytes: ActiveValue::Set(item.size_bytes),
            source_created_at: ActiveValue::Set(item.created_at),
            state: ActiveValue::Set(ItemState::Discovered),
            lease_owner: ActiveValue::Set(None),
            lease_expires_at: ActiveValue::Set(None),
            attempt_count: ActiveValue::Set(0),
            retry_at: ActiveValue::Set(None),
            content_ref: ActiveValue::Set(None),
            content_hash: ActiveValue::Set(None),
            upload_ref: ActiveValue::Set(None),
            destination_id: ActiveValue::Set(None),
            staging_released: ActiveValue::Set(false),
            last_error: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };

        let inserted = work_item::Entity::insert(row)
            .on_conflict(
                OnConflict::column(work_item::Column::SourceId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await?;

        if inserted == 0 {
            Ok(RegisterOutcome::AlreadyPresent)
        } else {
            tracing::debug!(source_id = %item.source_id, "Registered work item");
            Ok(RegisterOutcome::Inserted)
        }
    }

    /// Atomically lease up to `max_n` rows sitting in `from`, moving them to
    /// `to`. Concurrent callers always receive disjoint sets.
    #[instrument(skip(self), level = "debug")]
    pub async fn claim_batch(
        &self,
        owner: &str,
        from: ItemState,
        to: ItemState,
        lease: Duration,
        max_n: u64,
    ) -> Result<Vec<WorkItem>, StoreError> {
        if !ItemState::is_claim_edge(from, to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        if max_n == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(lease));

        let eligible = work_item::Entity::find()
            .select_only()
            .column(work_item::Column::Id)
            .filter(work_item::Column::State.eq(from))
            .filter(
                Condition::any()
                    .add(work_item::Column::LeaseExpiresAt.is_null())
                    .add(work_item::Column::LeaseExpiresAt.lt(now)),
            )
            .filter(
                Condition::any()
                    .add(work_item::Column::RetryAt.is_null())
                    .add(work_item::Column::RetryAt.lte(now)),
            )
            .order_by_asc(work_item::Column::Id)
            .limit(max_n)
            .into_query();

        // One UPDATE ... WHERE id IN (SELECT ... LIMIT n) RETURNING *: the
        // selection and the lease happen under the same write lock.
        let mut claimed = work_item::Entity::update_many()
            .col_expr(work_item::Column::State, Expr::value(to))
            .col_expr(work_item::Column::LeaseOwner, Expr::value(owner.to_string()))
            .col_expr(work_item::Column::LeaseExpiresAt, Expr::value(expires_at))
            .col_expr(work_item::Column::UpdatedAt, Expr::value(now))
            .filter(work_item::Column::Id.in_subquery(eligible))
            .exec_with_returning(&self.conn)
            .await?;

        claimed.sort_by_key(|item| item.id);
        if !claimed.is_empty() {
            tracing::debug!(owner, count = claimed.len(), %from, %to, "Claimed work items");
        }
        Ok(claimed)
    }

    /// Move a leased row forward and release the lease.
    pub async fn commit(
        &self,
        owner: &str,
        source_id: &str,
        expected: ItemState,
        to: ItemState,
        fields: CommitFields,
    ) -> Result<(), StoreError> {
        if expected.commit_target() != Some(to) {
            return Err(StoreError::InvalidTransition { from: expected, to });
        }
        fields.check(to)?;

        let mut update = work_item::Entity::update_many()
            .col_expr(work_item::Column::State, Expr::value(to))
            .col_expr(work_item::Column::AttemptCount, Expr::value(0))
            .col_expr(work_item::Column::RetryAt, Expr::value(Option::<i64>::None))
            .col_expr(work_item::Column::LastError, Expr::value(fields.last_error));
        if let Some(content_ref) = fields.content_ref {
            update = update.col_expr(work_item::Column::ContentRef, Expr::value(content_ref));
        }
        if let Some(content_hash) = fields.content_hash {
            update = update.col_expr(work_item::Column::ContentHash, Expr::value(content_hash));
        }
        if let Some(destination_id) = fields.destination_id {
            update = update
                .col_expr(work_item::Column::DestinationId, Expr::value(destination_id))
                .col_expr(work_item::Column::UploadRef, Expr::value(Option::<String>::None));
        }
        if let Some(released) = fields.staging_released {
            update = update.col_expr(work_item::Column::StagingReleased, Expr::value(released));
        }

        self.exec_leased(update, owner, source_id, expected).await?;
        tracing::debug!(source_id, %to, "Committed work item");
        Ok(())
    }

    /// Record a failed attempt at the stage `expected` belongs to.
    pub async fn fail(
        &self,
        owner: &str,
        source_id: &str,
        expected: ItemState,
        failure_state: ItemState,
        failure: &Failure,
    ) -> Result<(), StoreError> {
        if expected.failure_target() != Some(failure_state) {
            return Err(StoreError::InvalidTransition {
                from: expected,
                to: failure_state,
            });
        }

        let mut update = work_item::Entity::update_many()
            .col_expr(work_item::Column::State, Expr::value(failure_state))
            .col_expr(
                work_item::Column::AttemptCount,
                Expr::col(work_item::Column::AttemptCount).add(1),
            )
            .col_expr(
                work_item::Column::RetryAt,
                Expr::value(failure.retry_at.map(|at| at.timestamp_millis())),
            )
            .col_expr(work_item::Column::LastError, Expr::value(failure.error.clone()));
        if !failure_state.has_content() {
            update = update
                .col_expr(work_item::Column::ContentRef, Expr::value(Option::<String>::None))
                .col_expr(work_item::Column::ContentHash, Expr::value(Option::<String>::None));
        }

        self.exec_leased(update, owner, source_id, expected).await?;
        tracing::debug!(source_id, %failure_state, "Recorded failed attempt");
        Ok(())
    }

    /// Hand a leased row back to its claim input after a failed attempt that
    /// has no failure state of its own (finalization). The row is not claimed
    /// again before `failure.retry_at`.
    pub async fn release(
        &self,
        owner: &str,
        source_id: &str,
        expected: ItemState,
        failure: &Failure,
    ) -> Result<(), StoreError> {
        let Some(input) = expected.claim_input() else {
            return Err(StoreError::InvalidTransition {
                from: expected,
                to: expected,
            });
        };

        let update = work_item::Entity::update_many()
            .col_expr(work_item::Column::State, Expr::value(input))
            .col_expr(
                work_item::Column::AttemptCount,
                Expr::col(work_item::Column::AttemptCount).add(1),
            )
            .col_expr(
                work_item::Column::RetryAt,
                Expr::value(failure.retry_at.map(|at| at.timestamp_millis())),
            )
            .col_expr(work_item::Column::LastError, Expr::value(failure.error.clone()));

        self.exec_leased(update, owner, source_id, expected).await
    }

    /// Persist the destination id of a finished upload while the delivery
    /// lease is still held, so a retry after a later failure reuses it.
    pub async fn record_upload(
        &self,
        owner: &str,
        source_id: &str,
        upload_ref: &str,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let result = work_item::Entity::update_many()
            .col_expr(work_item::Column::UploadRef, Expr::value(upload_ref.to_string()))
            .col_expr(work_item::Column::UpdatedAt, Expr::value(now))
            .filter(work_item::Column::SourceId.eq(source_id))
            .filter(work_item::Column::State.eq(ItemState::Delivering))
            .filter(work_item::Column::LeaseOwner.eq(owner))
            .exec(&self.conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::StaleLease {
                source_id: source_id.to_string(),
                owner: owner.to_string(),
                expected: ItemState::Delivering,
            });
        }
        Ok(())
    }

    /// Revert every transient row whose lease expired before `now` to the
    /// state it was claimed from.
    #[instrument(skip(self), level = "debug")]
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let now = now.timestamp_millis();
        let mut reclaimed = 0;

        for (input, transient) in CLAIM_EDGES {
            let result = work_item::Entity::update_many()
                .col_expr(work_item::Column::State, Expr::value(input))
                .col_expr(work_item::Column::LeaseOwner, Expr::value(Option::<String>::None))
                .col_expr(work_item::Column::LeaseExpiresAt, Expr::value(Option::<i64>::None))
                .col_expr(work_item::Column::UpdatedAt, Expr::value(now))
                .filter(work_item::Column::State.eq(transient))
                .filter(work_item::Column::LeaseExpiresAt.lt(now))
                .exec(&self.conn)
                .await?;

            if result.rows_affected > 0 {
                tracing::info!(
                    count = result.rows_affected,
                    from = %transient,
                    to = %input,
                    "Reclaimed expired leases"
                );
            }
            reclaimed += result.rows_affected;
        }

        Ok(reclaimed)
    }

    /// Put failed rows whose backoff elapsed back in front of their stage,
    /// as long as they are under `limit` attempts.
    pub async fn requeue_failed(
        &self,
        failure_state: ItemState,
        limit: u32,
    ) -> Result<u64, StoreError> {
        let Some(retry_state) = failure_state.retry_target() else {
            return Err(StoreError::InvalidTransition {
                from: failure_state,
                to: failure_state,
            });
        };
        let now = self.clock.now_millis();

        let result = work_item::Entity::update_many()
            .col_expr(work_item::Column::State, Expr::value(retry_state))
            .col_expr(work_item::Column::RetryAt, Expr::value(Option::<i64>::None))
            .col_expr(work_item::Column::UpdatedAt, Expr::value(now))
            .filter(work_item::Column::State.eq(failure_state))
            .filter(work_item::Column::RetryAt.is_not_null())
            .filter(work_item::Column::RetryAt.lte(now))
            .filter(work_item::Column::AttemptCount.lt(i64::from(limit)))
            .exec(&self.conn)
            .await?;

        if result.rows_affected > 0 {
            tracing::info!(
                count = result.rows_affected,
                from = %failure_state,
                to = %retry_state,
                "Re-queued failed work items"
            );
        }
        Ok(result.rows_affected)
    }

    pub async fn find(&self, source_id: &str) -> Result<Option<WorkItem>, StoreError> {
        Ok(work_item::Entity::find()
            .filter(work_item::Column::SourceId.eq(source_id))
            .one(&self.conn)
            .await?)
    }

    async fn exec_leased(
        &self,
        update: UpdateMany<work_item::Entity>,
        owner: &str,
        source_id: &str,
        expected: ItemState,
    ) -> Result<(), StoreError> {
        let result = update
            .col_expr(work_item::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(work_item::Column::LeaseExpiresAt, Expr::value(Option::<i64>::None))
            .col_expr(work_item::Column::UpdatedAt, Expr::value(self.clock.now_millis()))
            .filter(work_item::Column::SourceId.eq(source_id))
            .filter(work_item::Column::State.eq(expected))
            .filter(work_item::Column::LeaseOwner.eq(owner))
            .exec(&self.conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::StaleLease {
                source_id: source_id.to_string(),
                owner: owner.to_string(),
                expected,
            });
        }
        Ok(())
    }
}
