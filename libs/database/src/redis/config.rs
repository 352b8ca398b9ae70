#[cfg(feature = "config")]
use core_config::{ConfigError, FromEnv, env_optional, env_parse};

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    /// Upper bound for a single command, in milliseconds
    pub response_timeout_ms: u64,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// `Some` when `REDIS_URL` is set. Redis is optional for the gateway, so
    /// an unset variable is not an error.
    #[cfg(feature = "config")]
    pub fn from_env_optional() -> Result<Option<Self>, ConfigError> {
        match env_optional("REDIS_URL") {
            Some(url) => Ok(Some(Self {
                url,
                response_timeout_ms: env_parse(
                    "REDIS_RESPONSE_TIMEOUT_MS",
                    Self::default().response_timeout_ms,
                )?,
            })),
            None => Ok(None),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            response_timeout_ms: 500,
        }
    }
}

#[cfg(feature = "config")]
impl FromEnv for RedisConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_optional()?
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))
    }
}
