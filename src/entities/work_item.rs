use sea_orm::entity::prelude::*;
use sea_orm::ActiveModelBehavior;
use serde::Serialize;

use crate::state::ItemState;

/// One source asset tracked through the migration. Timestamps are unix
/// milliseconds except `source_created_at`, which is unix seconds as reported
/// by the source.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize)]
#[sea_orm(table_name = "work_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub source_id: String,
    pub file_name: Option<String>,
    pub size_bytes: Option<i64>,
    pub source_created_at: Option<i64>,
    pub state: ItemState,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub attempt_count: i32,
    /// `None` on a failed row means the failure is permanent.
    pub retry_at: Option<i64>,
    pub content_ref: Option<String>,
    pub content_hash: Option<String>,
    pub upload_ref: Option<String>,
    pub destination_id: Option<String>,
    pub staging_released: bool,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ActiveModelBehavior for ActiveModel {}
