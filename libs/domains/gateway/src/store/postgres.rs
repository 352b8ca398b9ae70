use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, FromQueryResult, Statement};
use uuid::Uuid;

use super::{MetadataStore, StoreError, StoreResult};
use crate::models::{
    Credential, CredentialStatus, EngineHandle, ResourceConfig, ResourceHandle, ResourceKey,
    ResourcePath, ResourceState,
};

/// PostgreSQL implementation of MetadataStore
#[derive(Clone)]
pub struct PgMetadataStore {
    db: DatabaseConnection,
}

impl PgMetadataStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn db_error(e: DbErr) -> StoreError {
    StoreError::Unavailable(format!("Database error: {}", e))
}

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[derive(Debug, FromQueryResult)]
struct CredentialRow {
    id: Uuid,
    tenant: String,
    name: String,
    secret_hash: String,
    permissions: serde_json::Value,
    scope: Option<serde_json::Value>,
    status: String,
    created_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = StoreError;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("credential {} {}: {}", row.id, field, e))
        };

        let permissions =
            serde_json::from_value(row.permissions.clone()).map_err(|e| corrupt("permissions", &e))?;
        let scope = row
            .scope
            .clone()
            .filter(|v| !v.is_null())
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| corrupt("scope", &e))?;
        let status = row
            .status
            .parse::<CredentialStatus>()
            .map_err(|e| corrupt("status", &e))?;

        Ok(Self {
            id: row.id,
            tenant: row.tenant,
            name: row.name,
            secret_hash: row.secret_hash,
            permissions,
            scope,
            status,
            created_at: row.created_at,
            revoked_at: row.revoked_at,
            last_used_at: row.last_used_at,
            version: row.version,
        })
    }
}

#[derive(Debug, FromQueryResult)]
struct ResourceRow {
    resource_key: String,
    tenant: String,
    database_name: String,
    table_name: Option<String>,
    config: serde_json::Value,
    engine_handle: Option<String>,
    state: String,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ResourceRow> for ResourceHandle {
    type Error = StoreError;

    fn try_from(row: ResourceRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("resource {} {}: {}", row.resource_key, field, e))
        };

        let config: ResourceConfig =
            serde_json::from_value(row.config.clone()).map_err(|e| corrupt("config", &e))?;
        let state = row
            .state
            .parse::<ResourceState>()
            .map_err(|e| corrupt("state", &e))?;

        Ok(Self {
            tenant: row.tenant,
            path: ResourcePath {
                database: row.database_name,
                table: row.table_name,
            },
            config,
            engine_handle: row.engine_handle.map(EngineHandle),
            state,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl PgMetadataStore {
    async fn one_credential(&self, stmt: Statement) -> StoreResult<Option<Credential>> {
        CredentialRow::find_by_statement(stmt)
            .one(&self.db)
            .await
            .map_err(db_error)?
            .map(Credential::try_from)
            .transpose()
    }

    async fn one_resource(&self, stmt: Statement) -> StoreResult<Option<ResourceHandle>> {
        ResourceRow::find_by_statement(stmt)
            .one(&self.db)
            .await
            .map_err(db_error)?
            .map(ResourceHandle::try_from)
            .transpose()
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn insert_credential(&self, credential: &Credential) -> StoreResult<bool> {
        let sql = r#"
            INSERT INTO gateway_credentials (
                id, tenant, name, secret_hash, permissions, scope, status,
                created_at, revoked_at, last_used_at, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT DO NOTHING
        "#;

        let scope = credential.scope.as_ref().map(encode).transpose()?;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                credential.id.into(),
                credential.tenant.clone().into(),
                credential.name.clone().into(),
                credential.secret_hash.clone().into(),
                encode(&credential.permissions)?.into(),
                scope.into(),
                credential.status.to_string().into(),
                credential.created_at.into(),
                credential.revoked_at.into(),
                credential.last_used_at.into(),
                credential.version.into(),
            ],
        );

        let result = self.db.execute_raw(stmt).await.map_err(db_error)?;
        let inserted = result.rows_affected() > 0;
        if inserted {
            tracing::info!(credential_id = %credential.id, tenant = %credential.tenant, "Created credential");
        }
        Ok(inserted)
    }

    async fn find_credential_by_hash(&self, secret_hash: &str) -> StoreResult<Option<Credential>> {
        let sql = "SELECT * FROM gateway_credentials WHERE secret_hash = $1";
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [secret_hash.into()]);
        self.one_credential(stmt).await
    }

    async fn find_credential(&self, tenant: &str, id: Uuid) -> StoreResult<Option<Credential>> {
        let sql = "SELECT * FROM gateway_credentials WHERE id = $1 AND tenant = $2";
        let stmt =
            Statement::from_sql_and_values(DbBackend::Postgres, sql, [id.into(), tenant.into()]);
        self.one_credential(stmt).await
    }

    async fn list_credentials(&self, tenant: &str) -> StoreResult<Vec<Credential>> {
        let sql = "SELECT * FROM gateway_credentials WHERE tenant = $1 ORDER BY created_at DESC";
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [tenant.into()]);

        let rows = CredentialRow::find_by_statement(stmt)
            .all(&self.db)
            .await
            .map_err(db_error)?;

        rows.into_iter().map(Credential::try_from).collect()
    }

    async fn update_credential(
        &self,
        credential: &Credential,
        expected_version: i64,
    ) -> StoreResult<bool> {
        let sql = r#"
            UPDATE gateway_credentials
            SET name = $2,
                permissions = $3,
                scope = $4,
                status = $5,
                revoked_at = $6,
                version = $7
            WHERE id = $1 AND version = $8
        "#;

        let scope = credential.scope.as_ref().map(encode).transpose()?;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                credential.id.into(),
                credential.name.clone().into(),
                encode(&credential.permissions)?.into(),
                scope.into(),
                credential.status.to_string().into(),
                credential.revoked_at.into(),
                credential.version.into(),
                expected_version.into(),
            ],
        );

        let result = self.db.execute_raw(stmt).await.map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_credential(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let sql = r#"
            UPDATE gateway_credentials
            SET last_used_at = GREATEST(COALESCE(last_used_at, $2), $2)
            WHERE id = $1
        "#;
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [id.into(), at.into()]);

        self.db.execute_raw(stmt).await.map_err(db_error)?;
        Ok(())
    }

    async fn count_credentials(&self, tenant: &str) -> StoreResult<u64> {
        #[derive(Debug, FromQueryResult)]
        struct CountRow {
            count: i64,
        }

        let sql = "SELECT COUNT(*) AS count FROM gateway_credentials WHERE tenant = $1";
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [tenant.into()]);

        let row = CountRow::find_by_statement(stmt)
            .one(&self.db)
            .await
            .map_err(db_error)?;

        Ok(row.map(|r| r.count.max(0) as u64).unwrap_or(0))
    }

    async fn insert_resource(&self, handle: &ResourceHandle) -> StoreResult<bool> {
        let sql = r#"
            INSERT INTO gateway_resources (
                resource_key, tenant, database_name, table_name, config,
                engine_handle, state, version, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (resource_key) DO NOTHING
        "#;

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                handle.key().storage_key().into(),
                handle.tenant.clone().into(),
                handle.path.database.clone().into(),
                handle.path.table.clone().into(),
                encode(&handle.config)?.into(),
                handle.engine_handle.as_ref().map(|h| h.0.clone()).into(),
                handle.state.to_string().into(),
                handle.version.into(),
                handle.created_at.into(),
                handle.updated_at.into(),
            ],
        );

        let result = self.db.execute_raw(stmt).await.map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_resource(&self, key: &ResourceKey) -> StoreResult<Option<ResourceHandle>> {
        let sql = "SELECT * FROM gateway_resources WHERE resource_key = $1";
        let stmt =
            Statement::from_sql_and_values(DbBackend::Postgres, sql, [key.storage_key().into()]);
        self.one_resource(stmt).await
    }

    async fn resource_version(&self, key: &ResourceKey) -> StoreResult<Option<i64>> {
        #[derive(Debug, FromQueryResult)]
        struct VersionRow {
            version: i64,
        }

        let sql = "SELECT version FROM gateway_resources WHERE resource_key = $1";
        let stmt =
            Statement::from_sql_and_values(DbBackend::Postgres, sql, [key.storage_key().into()]);

        let row = VersionRow::find_by_statement(stmt)
            .one(&self.db)
            .await
            .map_err(db_error)?;

        Ok(row.map(|r| r.version))
    }

    async fn update_resource(
        &self,
        handle: &ResourceHandle,
        expected_version: i64,
    ) -> StoreResult<bool> {
        let sql = r#"
            UPDATE gateway_resources
            SET config = $2,
                engine_handle = $3,
                state = $4,
                version = $5,
                updated_at = $6
            WHERE resource_key = $1 AND version = $7
        "#;

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                handle.key().storage_key().into(),
                encode(&handle.config)?.into(),
                handle.engine_handle.as_ref().map(|h| h.0.clone()).into(),
                handle.state.to_string().into(),
                handle.version.into(),
                handle.updated_at.into(),
                expected_version.into(),
            ],
        );

        let result = self.db.execute_raw(stmt).await.map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_resource(
        &self,
        key: &ResourceKey,
        expected_version: i64,
    ) -> StoreResult<bool> {
        let sql = "DELETE FROM gateway_resources WHERE resource_key = $1 AND version = $2";
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [key.storage_key().into(), expected_version.into()],
        );

        let result = self.db.execute_raw(stmt).await.map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_resources(
        &self,
        tenant: &str,
        database: Option<&str>,
    ) -> StoreResult<Vec<ResourceHandle>> {
        let stmt = match database {
            None => Statement::from_sql_and_values(
                DbBackend::Postgres,
                r#"
                    SELECT * FROM gateway_resources
                    WHERE tenant = $1 AND table_name IS NULL
                    ORDER BY database_name
                "#,
                [tenant.into()],
            ),
            Some(db) => Statement::from_sql_and_values(
                DbBackend::Postgres,
                r#"
                    SELECT * FROM gateway_resources
                    WHERE tenant = $1 AND database_name = $2 AND table_name IS NOT NULL
                    ORDER BY table_name
                "#,
                [tenant.into(), db.into()],
            ),
        };

        let rows = ResourceRow::find_by_statement(stmt)
            .all(&self.db)
            .await
            .map_err(db_error)?;

        rows.into_iter().map(ResourceHandle::try_from).collect()
    }
}
