use core_config::{AppInfo, FromEnv, app_info, server::ServerConfig};
use database::postgres::PostgresConfig;
use database::redis::RedisConfig;
use domain_gateway::{EngineKind, GatewayConfig, QdrantConfig};
use std::time::Duration;

pub use core_config::Environment;

/// Process configuration, composed from the shared config components
#[derive(Clone, Debug)]
pub struct Config {
    pub app: AppInfo,
    pub database: PostgresConfig,
    /// `None` when `REDIS_URL` is unset
    pub redis: Option<RedisConfig>,
    pub qdrant: Option<QdrantConfig>,
    pub gateway: GatewayConfig,
    pub server: ServerConfig,
    pub environment: Environment,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        let environment = Environment::from_env();
        let gateway = GatewayConfig::from_env()?;
        let qdrant = match gateway.engine {
            EngineKind::Qdrant => Some(QdrantConfig::from_env()?),
            EngineKind::Memory => None,
        };

        Ok(Self {
            app: app_info!(),
            database: PostgresConfig::from_env()?,
            redis: RedisConfig::from_env_optional()?,
            qdrant,
            gateway,
            server: ServerConfig::from_env()?,
            environment,
            shutdown_timeout: Duration::from_secs(core_config::env_parse(
                "SHUTDOWN_TIMEOUT_SECS",
                30u64,
            )?),
        })
    }
}
