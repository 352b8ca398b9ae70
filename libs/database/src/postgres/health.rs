use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tracing::debug;

use crate::common::DatabaseResult;

/// `SELECT 1` against the pool.
pub async fn check_health(db: &DatabaseConnection) -> DatabaseResult<()> {
    debug!("Probing metadata store");
    let stmt = Statement::from_string(DatabaseBackend::Postgres, "SELECT 1".to_owned());
    db.query_one_raw(stmt).await?;
    Ok(())
}
