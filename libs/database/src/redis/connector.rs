use redis::Client;
use redis::aio::ConnectionManager;
use tracing::info;

use super::RedisConfig;
use crate::common::{RetryConfig, retry_with_backoff};

/// Open a `ConnectionManager` and verify it with `PING`.
///
/// The manager reconnects on its own after the first successful connect.
pub async fn connect_from_config(config: RedisConfig) -> redis::RedisResult<ConnectionManager> {
    let client = Client::open(config.url.as_str())?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Connected to Redis");
    Ok(manager)
}

/// [`connect_from_config`] with exponential backoff.
pub async fn connect_from_config_with_retry(
    config: RedisConfig,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<ConnectionManager> {
    retry_with_backoff(
        || connect_from_config(config.clone()),
        retry_config.unwrap_or_default(),
    )
    .await
}
