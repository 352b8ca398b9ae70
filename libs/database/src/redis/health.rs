use redis::aio::ConnectionManager;
use tracing::debug;

use crate::common::{DatabaseError, DatabaseResult};

/// `PING`, expecting `PONG`.
pub async fn check_health(conn: &mut ConnectionManager) -> DatabaseResult<()> {
    debug!("Probing credential cache");
    let reply: String = redis::cmd("PING").query_async(conn).await?;
    if reply != "PONG" {
        return Err(DatabaseError::UnexpectedReply(reply));
    }
    Ok(())
}
