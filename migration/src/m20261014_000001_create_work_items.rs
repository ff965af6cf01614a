use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table("work_items")
                    .if_not_exists()
                    .col(pk_auto("id"))
                    .col(string_uniq("source_id"))
                    .col(string_null("file_name"))
                    .col(big_integer_null("size_bytes"))
                    .col(big_integer_null("source_created_at"))
                    .col(string("state").not_null())
                    .col(string_null("lease_owner"))
                    .col(big_integer_null("lease_expires_at"))
                    .col(integer("attempt_count").not_null().default(0))
                    .col(big_integer_null("retry_at"))
                    .col(string_null("content_ref"))
                    .col(string_null("content_hash"))
                    .col(string_null("upload_ref"))
                    .col(string_null("destination_id"))
                    .col(boolean("staging_released").not_null().default(false))
                    .col(string_null("last_error"))
                    .col(big_integer("created_at").not_null())
                    .col(big_integer("updated_at").not_null())
                    .to_owned(),
            )
            .await?;

        // Claims filter on state and lease expiry together.
        manager
            .create_index(
                Index::create()
                    .name("idx_work_items_state_lease")
                    .table("work_items")
                    .col("state")
                    .col("lease_expires_at")
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_work_items_lease_expires_at")
                    .table("work_items")
                    .col("lease_expires_at")
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table("work_items").to_owned())
            .await
    }
}
