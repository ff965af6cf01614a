//! The per-item pipeline as an explicit state machine.
//!
//! ```text
//! DISCOVERED -> FETCHING -> FETCHED -> DELIVERING -> DELIVERED -> FINALIZING -> DONE
//!                  |            ^          |            ^
//!                  v            |          v            |
//!            FETCH_FAILED ------+    DELIVER_FAILED ----+   (retry edges)
//! ```
//!
//! Every mutation the store performs is checked against these tables, so the
//! invariants hold no matter which worker loop drives a row.

use std::fmt;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[sea_orm(string_value = "discovered")]
    Discovered,
    #[sea_orm(string_value = "fetching")]
    Fetching,
    #[sea_orm(string_value = "fetched")]
    Fetched,
    #[sea_orm(string_value = "fetch_failed")]
    FetchFailed,
    #[sea_orm(string_value = "delivering")]
    Delivering,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "deliver_failed")]
    DeliverFailed,
    #[sea_orm(string_value = "finalizing")]
    Finalizing,
    #[sea_orm(string_value = "done")]
    Done,
}

/// `(input, transient)` pairs a worker may claim across.
pub const CLAIM_EDGES: [(ItemState, ItemState); 3] = [
    (ItemState::Discovered, ItemState::Fetching),
    (ItemState::Fetched, ItemState::Delivering),
    (ItemState::Delivered, ItemState::Finalizing),
];

impl ItemState {
    pub const ALL: [ItemState; 9] = [
        ItemState::Discovered,
        ItemState::Fetching,
        ItemState::Fetched,
        ItemState::FetchFailed,
        ItemState::Delivering,
        ItemState::Delivered,
        ItemState::DeliverFailed,
        ItemState::Finalizing,
        ItemState::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Fetching => "fetching",
            Self::Fetched => "fetched",
            Self::FetchFailed => "fetch_failed",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::DeliverFailed => "deliver_failed",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        }
    }

    /// A state only ever held under a lease.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetching | Self::Delivering | Self::Finalizing)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::FetchFailed | Self::DeliverFailed)
    }

    /// The state a transient row reverts to when its lease is abandoned.
    pub fn claim_input(&self) -> Option<ItemState> {
        CLAIM_EDGES
            .iter()
            .find(|(_, transient)| transient == self)
            .map(|(input, _)| *input)
    }

    /// The state a transient row moves to on success.
    pub fn commit_target(&self) -> Option<ItemState> {
        match self {
            Self::Fetching => Some(Self::Fetched),
            Self::Delivering => Some(Self::Delivered),
            Self::Finalizing => Some(Self::Done),
            _ => None,
        }
    }

    /// The state a transient row moves to on a failed attempt. Finalizing has
    /// no failure state; its failures return the row to `Delivered`.
    pub fn failure_target(&self) -> Option<ItemState> {
        match self {
            Self::Fetching => Some(Self::FetchFailed),
            Self::Delivering => Some(Self::DeliverFailed),
            _ => None,
        }
    }

    /// The state a failed row is re-queued into.
    pub fn retry_target(&self) -> Option<ItemState> {
        match self {
            Self::FetchFailed => Some(Self::Discovered),
            Self::DeliverFailed => Some(Self::Fetched),
            _ => None,
        }
    }

    pub fn is_claim_edge(from: ItemState, to: ItemState) -> bool {
        CLAIM_EDGES.contains(&(from, to))
    }

    /// Whether `content_ref`/`content_hash` must be set in this state.
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            Self::Fetched
                | Self::Delivering
                | Self::Delivered
                | Self::DeliverFailed
                | Self::Finalizing
                | Self::Done
        )
    }

    /// Whether `destination_id` must be set in this state.
    pub fn has_destination(&self) -> bool {
        matches!(self, Self::Delivered | Self::Finalizing | Self::Done)
    }

    /// Position along the happy path. Failure states share the rank of the
    /// transient state they came from.
    pub fn stage_rank(&self) -> u8 {
        match self {
            Self::Discovered => 0,
            Self::Fetching | Self::FetchFailed => 1,
            Self::Fetched => 2,
            Self::Delivering | Self::DeliverFailed => 3,
            Self::Delivered => 4,
            Self::Finalizing => 5,
            Self::Done => 6,
        }
    }

    /// Whether a row may move directly from `self` to `next`.
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        Self::is_claim_edge(*self, next)
            || self.commit_target() == Some(next)
            || self.failure_target() == Some(next)
            || self.retry_target() == Some(next)
            || self.claim_input() == Some(next)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_states_revert_to_claim_input() {
        assert_eq!(ItemState::Fetching.claim_input(), Some(ItemState::Discovered));
        assert_eq!(ItemState::Delivering.claim_input(), Some(ItemState::Fetched));
        assert_eq!(ItemState::Finalizing.claim_input(), Some(ItemState::Delivered));
        assert_eq!(ItemState::Done.claim_input(), None);
    }

    #[test]
    fn test_retry_edges_return_to_same_stage() {
        for failed in [ItemState::FetchFailed, ItemState::DeliverFailed] {
            let retry = failed.retry_target().unwrap();
            assert!(retry.stage_rank() < failed.stage_rank());
            assert!(ItemState::is_claim_edge(
                retry,
                ItemState::ALL
                    .into_iter()
                    .find(|s| s.failure_target() == Some(failed))
                    .unwrap()
            ));
        }
    }

    #[test]
    fn test_happy_path_never_skips_a_stage() {
        let path = [
            ItemState::Discovered,
            ItemState::Fetching,
            ItemState::Fetched,
            ItemState::Delivering,
            ItemState::Delivered,
            ItemState::Finalizing,
            ItemState::Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert_eq!(pair[0].stage_rank() + 1, pair[1].stage_rank());
        }
        assert!(!ItemState::Discovered.can_transition_to(ItemState::Fetched));
        assert!(!ItemState::Done.can_transition_to(ItemState::Discovered));
    }

    #[test]
    fn test_presence_predicates() {
        assert!(!ItemState::Discovered.has_content());
        assert!(!ItemState::FetchFailed.has_content());
        assert!(ItemState::DeliverFailed.has_content());
        assert!(!ItemState::DeliverFailed.has_destination());
        assert!(ItemState::Finalizing.has_destination());
    }
}
