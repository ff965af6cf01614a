use sea_orm::DbErr;

use crate::state::ItemState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Database(#[from] DbErr),

    /// The row moved on without us: our lease expired and was reclaimed, or
    /// another worker committed first. Not an operator-facing failure.
    #[error("Lease on {source_id} in state {expected} is no longer held by {owner}")]
    StaleLease {
        source_id: String,
        owner: String,
        expected: ItemState,
    },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: ItemState, to: ItemState },

    #[error("Transition to {state} requires {field}")]
    MissingField {
        state: ItemState,
        field: &'static str,
    },
}

impl StoreError {
    pub fn is_stale_lease(&self) -> bool {
        matches!(self, Self::StaleLease { .. })
    }
}
