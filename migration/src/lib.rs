pub use sea_orm_migration::prelude::*;

mod m20261014_000001_create_work_items;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20261014_000001_create_work_items::Migration)]
    }
}
