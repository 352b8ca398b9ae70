use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(GatewayCredentials::Table)
                    .if_not_exists()
                    .col(pk_uuid(GatewayCredentials::Id))
                    .col(string(GatewayCredentials::Tenant))
                    .col(string(GatewayCredentials::Name))
                    .col(string_uniq(GatewayCredentials::SecretHash))
                    .col(json(GatewayCredentials::Permissions).default("[]"))
                    .col(json_null(GatewayCredentials::Scope))
                    .col(string(GatewayCredentials::Status).default("active"))
                    .col(
                        timestamp_with_time_zone(GatewayCredentials::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(GatewayCredentials::RevokedAt))
                    .col(timestamp_with_time_zone_null(GatewayCredentials::LastUsedAt))
                    .col(big_integer(GatewayCredentials::Version).default(1))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_gateway_credentials_tenant")
                    .table(GatewayCredentials::Table)
                    .col(GatewayCredentials::Tenant)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(GatewayCredentials::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum GatewayCredentials {
    Table,
    Id,
    Tenant,
    Name,
    SecretHash,
    Permissions,
    Scope,
    Status,
    CreatedAt,
    RevokedAt,
    LastUsedAt,
    Version,
}
