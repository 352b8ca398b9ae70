pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_gateway_credentials;
mod m20250301_000002_create_gateway_resources;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_gateway_credentials::Migration),
            Box::new(m20250301_000002_create_gateway_resources::Migration),
        ]
    }
}
