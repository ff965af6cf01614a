use std::collections::BTreeMap;

use sea_orm::{ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use super::{Store, StoreError, WorkItem};
use crate::entities::work_item;
use crate::state::ItemState;

/// Attempt ceilings per stage, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryLimits {
    pub fetch: u32,
    pub delivery: u32,
}

impl RetryLimits {
    pub fn for_failure_state(&self, state: ItemState) -> Option<u32> {
        match state {
            ItemState::FetchFailed => Some(self.fetch),
            ItemState::DeliverFailed => Some(self.delivery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts(BTreeMap<ItemState, u64>);

/// Serialized with every state present, zeros included.
impl Serialize for StateCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(ItemState::ALL.len()))?;
        for (state, count) in self.iter() {
            map.serialize_entry(state.as_str(), &count)?;
        }
        map.end()
    }
}

impl StateCounts {
    pub fn get(&self, state: ItemState) -> u64 {
        self.0.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemState, u64)> + '_ {
        ItemState::ALL.into_iter().map(|state| (state, self.get(state)))
    }
}

/// A row that will not be retried again without an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub source_id: String,
    pub state: ItemState,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

impl From<WorkItem> for FailedItem {
    fn from(item: WorkItem) -> Self {
        Self {
            source_id: item.source_id,
            state: item.state,
            attempt_count: item.attempt_count,
            last_error: item.last_error,
            updated_at: item.updated_at,
        }
    }
}

impl Store {
    pub async fn state_counts(&self) -> Result<StateCounts, StoreError> {
        let mut counts = BTreeMap::new();
        for state in ItemState::ALL {
            let count = work_item::Entity::find()
                .filter(work_item::Column::State.eq(state))
                .count(&self.conn)
                .await?;
            if count > 0 {
                counts.insert(state, count);
            }
        }
        Ok(StateCounts(counts))
    }

    /// Failed rows that are either marked permanent or have used up their
    /// attempts.
    pub async fn permanent_failures(
        &self,
        limits: RetryLimits,
    ) -> Result<Vec<FailedItem>, StoreError> {
        let mut condition = Condition::any();
        for state in [ItemState::FetchFailed, ItemState::DeliverFailed] {
            let limit = limits.for_failure_state(state).unwrap_or(0);
            condition = condition.add(
                Condition::all()
                    .add(work_item::Column::State.eq(state))
                    .add(
                        Condition::any()
                            .add(work_item::Column::RetryAt.is_null())
                            .add(work_item::Column::AttemptCount.gte(i64::from(limit))),
                    ),
            );
        }

        let rows = work_item::Entity::find()
            .filter(condition)
            .order_by_asc(work_item::Column::Id)
            .all(&self.conn)
            .await?;

        Ok(rows.into_iter().map(FailedItem::from).collect())
    }

    /// Finalized rows whose staging file could not be removed.
    pub async fn leftover_staging(&self) -> Result<Vec<WorkItem>, StoreError> {
        Ok(work_item::Entity::find()
            .filter(work_item::Column::State.eq(ItemState::Done))
            .filter(work_item::Column::StagingReleased.eq(false))
            .order_by_asc(work_item::Column::Id)
            .all(&self.conn)
            .await?)
    }

    /// Every row is either done or permanently failed.
    pub async fn is_migration_complete(&self, limits: RetryLimits) -> Result<bool, StoreError> {
        let counts = self.state_counts().await?;
        let failed = self.permanent_failures(limits).await?.len() as u64;
        Ok(counts.total() == counts.get(ItemState::Done) + failed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapters::DiscoveredItem;
    use crate::store::Failure;
    use crate::test_utils::test_store;

    const LIMITS: RetryLimits = RetryLimits {
        fetch: 3,
        delivery: 3,
    };

    #[tokio::test]
    async fn test_state_counts_and_completion() {
        let t = test_store().await;
        for id in ["a", "b", "c"] {
            t.store.register(&DiscoveredItem::new(id)).await.unwrap();
        }
        t.store
            .claim_batch(
                "w1",
                ItemState::Discovered,
                ItemState::Fetching,
                Duration::from_secs(60),
                1,
            )
            .await
            .unwrap();

        let counts = t.store.state_counts().await.unwrap();
        assert_eq!(counts.get(ItemState::Discovered), 2);
        assert_eq!(counts.get(ItemState::Fetching), 1);
        assert_eq!(counts.get(ItemState::Done), 0);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.iter().count(), ItemState::ALL.len());
        assert!(!t.store.is_migration_complete(LIMITS).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_store_is_complete() {
        let t = test_store().await;
        assert!(t.store.is_migration_complete(LIMITS).await.unwrap());
    }

    #[tokio::test]
    async fn test_retryable_failure_is_not_permanent() {
        let t = test_store().await;
        t.store.register(&DiscoveredItem::new("a")).await.unwrap();
        t.store
            .claim_batch(
                "w1",
                ItemState::Discovered,
                ItemState::Fetching,
                Duration::from_secs(60),
                1,
            )
            .await
            .unwrap();
        t.store
            .fail(
                "w1",
                "a",
                ItemState::Fetching,
                ItemState::FetchFailed,
                &Failure::retry_at("503", t.store.now()),
            )
            .await
            .unwrap();

        assert!(t.store.permanent_failures(LIMITS).await.unwrap().is_empty());
        assert!(!t.store.is_migration_complete(LIMITS).await.unwrap());
    }
}
