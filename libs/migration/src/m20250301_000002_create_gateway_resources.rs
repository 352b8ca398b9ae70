use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // resource_key is "tenant/database" or "tenant/database/table" and is
        // the compare-and-set target for create and drop.
        manager
            .create_table(
                Table::create()
                    .table(GatewayResources::Table)
                    .if_not_exists()
                    .col(string(GatewayResources::ResourceKey).primary_key())
                    .col(string(GatewayResources::Tenant))
                    .col(string(GatewayResources::DatabaseName))
                    .col(string_null(GatewayResources::TableName))
                    .col(json(GatewayResources::Config))
                    .col(string_null(GatewayResources::EngineHandle))
                    .col(string(GatewayResources::State))
                    .col(big_integer(GatewayResources::Version).default(1))
                    .col(
                        timestamp_with_time_zone(GatewayResources::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(GatewayResources::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_gateway_resources_tenant_database")
                    .table(GatewayResources::Table)
                    .col(GatewayResources::Tenant)
                    .col(GatewayResources::DatabaseName)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(GatewayResources::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum GatewayResources {
    Table,
    ResourceKey,
    Tenant,
    DatabaseName,
    TableName,
    Config,
    EngineHandle,
    State,
    Version,
    CreatedAt,
    UpdatedAt,
}
