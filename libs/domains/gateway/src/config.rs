use core_config::{ConfigError, FromEnv, env_optional, env_or_default, env_parse};
use database::common::RetryConfig;
use std::time::Duration;

use crate::models::is_valid_name;

/// Which [`StorageEngine`](crate::engine::StorageEngine) backs the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EngineKind {
    Memory,
    Qdrant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
    /// Buckets untouched this long are evicted
    pub idle_eviction: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_per_sec: 50.0,
            idle_eviction: Duration::from_secs(600),
        }
    }
}

/// Admin credential seeded into an empty tenant at startup
#[derive(Clone, PartialEq)]
pub struct BootstrapCredential {
    pub tenant: String,
    pub secret: String,
}

impl std::fmt::Debug for BootstrapCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapCredential")
            .field("tenant", &self.tenant)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub engine: EngineKind,
    pub credential_cache_ttl: Duration,
    pub rate_limit: RateLimitConfig,
    pub max_concurrent_requests: usize,
    pub overload_retry_after: Duration,
    /// Total attempts per metadata-store call, first try included
    pub store_retry_attempts: u32,
    /// A `creating` record untouched this long is treated as abandoned
    pub creating_lease: Duration,
    pub bootstrap: Option<BootstrapCredential>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Memory,
            credential_cache_ttl: Duration::from_secs(5),
            rate_limit: RateLimitConfig::default(),
            max_concurrent_requests: 100,
            overload_retry_after: Duration::from_millis(1000),
            store_retry_attempts: 3,
            creating_lease: Duration::from_secs(120),
            bootstrap: None,
        }
    }
}

impl GatewayConfig {
    /// Backoff policy for metadata-store calls.
    pub fn store_retry(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(self.store_retry_attempts.saturating_sub(1))
            .with_initial_delay(50)
            .with_max_delay(1000)
    }
}

fn parse_error(key: &str, details: impl Into<String>) -> ConfigError {
    ConfigError::ParseError {
        key: key.to_string(),
        details: details.into(),
    }
}

impl FromEnv for GatewayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let engine = env_or_default("GATEWAY_ENGINE", &defaults.engine.to_string())
            .parse::<EngineKind>()
            .map_err(|e| parse_error("GATEWAY_ENGINE", e.to_string()))?;

        let rate_limit = RateLimitConfig {
            capacity: env_parse("GATEWAY_RATE_LIMIT_CAPACITY", defaults.rate_limit.capacity)?,
            refill_per_sec: env_parse(
                "GATEWAY_RATE_LIMIT_REFILL_PER_SEC",
                defaults.rate_limit.refill_per_sec,
            )?,
            idle_eviction: Duration::from_secs(env_parse(
                "GATEWAY_RATE_LIMIT_IDLE_SECS",
                defaults.rate_limit.idle_eviction.as_secs(),
            )?),
        };
        if rate_limit.capacity < 1.0 {
            return Err(parse_error("GATEWAY_RATE_LIMIT_CAPACITY", "must be at least 1"));
        }
        if rate_limit.refill_per_sec <= 0.0 {
            return Err(parse_error(
                "GATEWAY_RATE_LIMIT_REFILL_PER_SEC",
                "must be positive",
            ));
        }

        let max_concurrent_requests = env_parse(
            "GATEWAY_MAX_CONCURRENT_REQUESTS",
            defaults.max_concurrent_requests,
        )?;
        if max_concurrent_requests == 0 {
            return Err(parse_error("GATEWAY_MAX_CONCURRENT_REQUESTS", "must be positive"));
        }

        let bootstrap = match (
            env_optional("GATEWAY_BOOTSTRAP_TENANT"),
            env_optional("GATEWAY_BOOTSTRAP_KEY"),
        ) {
            (Some(tenant), Some(_)) if !is_valid_name(&tenant) => {
                return Err(parse_error(
                    "GATEWAY_BOOTSTRAP_TENANT",
                    "use 1-64 letters, digits, '_' or '-'",
                ));
            }
            (Some(tenant), Some(secret)) => Some(BootstrapCredential { tenant, secret }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingEnvVar("GATEWAY_BOOTSTRAP_KEY".into())),
            (None, Some(_)) => {
                return Err(ConfigError::MissingEnvVar("GATEWAY_BOOTSTRAP_TENANT".into()));
            }
        };

        Ok(Self {
            engine,
            credential_cache_ttl: Duration::from_secs(env_parse(
                "GATEWAY_CREDENTIAL_CACHE_TTL_SECS",
                defaults.credential_cache_ttl.as_secs(),
            )?),
            rate_limit,
            max_concurrent_requests,
            overload_retry_after: Duration::from_millis(env_parse(
                "GATEWAY_OVERLOAD_RETRY_AFTER_MS",
                defaults.overload_retry_after.as_millis() as u64,
            )?),
            store_retry_attempts: env_parse(
                "GATEWAY_STORE_RETRY_ATTEMPTS",
                defaults.store_retry_attempts,
            )?
            .max(1),
            creating_lease: Duration::from_secs(env_parse(
                "GATEWAY_CREATING_LEASE_SECS",
                defaults.creating_lease.as_secs(),
            )?),
            bootstrap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 11] = [
        "GATEWAY_ENGINE",
        "GATEWAY_CREDENTIAL_CACHE_TTL_SECS",
        "GATEWAY_RATE_LIMIT_CAPACITY",
        "GATEWAY_RATE_LIMIT_REFILL_PER_SEC",
        "GATEWAY_RATE_LIMIT_IDLE_SECS",
        "GATEWAY_MAX_CONCURRENT_REQUESTS",
        "GATEWAY_OVERLOAD_RETRY_AFTER_MS",
        "GATEWAY_STORE_RETRY_ATTEMPTS",
        "GATEWAY_CREATING_LEASE_SECS",
        "GATEWAY_BOOTSTRAP_TENANT",
        "GATEWAY_BOOTSTRAP_KEY",
    ];

    #[test]
    fn test_defaults_when_unset() {
        temp_env::with_vars_unset(VARS, || {
            let config = GatewayConfig::from_env().unwrap();
            assert_eq!(config, GatewayConfig::default());
        });
    }

    #[test]
    fn test_overrides() {
        temp_env::with_vars(
            [
                ("GATEWAY_ENGINE", Some("qdrant")),
                ("GATEWAY_RATE_LIMIT_CAPACITY", Some("5")),
                ("GATEWAY_MAX_CONCURRENT_REQUESTS", Some("2")),
                ("GATEWAY_BOOTSTRAP_TENANT", Some("acme")),
                ("GATEWAY_BOOTSTRAP_KEY", Some("vgw_secret")),
            ],
            || {
                let config = GatewayConfig::from_env().unwrap();
                assert_eq!(config.engine, EngineKind::Qdrant);
                assert_eq!(config.rate_limit.capacity, 5.0);
                assert_eq!(config.max_concurrent_requests, 2);
                assert_eq!(config.bootstrap.unwrap().tenant, "acme");
            },
        );
    }

    #[test]
    fn test_invalid_values_fail() {
        temp_env::with_var("GATEWAY_ENGINE", Some("lancedb"), || {
            assert!(GatewayConfig::from_env().is_err());
        });
        temp_env::with_var("GATEWAY_MAX_CONCURRENT_REQUESTS", Some("0"), || {
            assert!(GatewayConfig::from_env().is_err());
        });
        temp_env::with_vars(
            [
                ("GATEWAY_BOOTSTRAP_TENANT", Some("acme")),
                ("GATEWAY_BOOTSTRAP_KEY", None),
            ],
            || {
                assert!(matches!(
                    GatewayConfig::from_env(),
                    Err(ConfigError::MissingEnvVar(_))
                ));
            },
        );
    }

    #[test]
    fn test_bootstrap_tenant_must_be_a_valid_name() {
        for tenant in ["acme corp", "a.b", "x/y"] {
            temp_env::with_vars(
                [
                    ("GATEWAY_BOOTSTRAP_TENANT", Some(tenant)),
                    ("GATEWAY_BOOTSTRAP_KEY", Some("vgw_secret")),
                ],
                || {
                    assert!(matches!(
                        GatewayConfig::from_env(),
                        Err(ConfigError::ParseError { ref key, .. }) if key == "GATEWAY_BOOTSTRAP_TENANT"
                    ));
                },
            );
        }
    }

    #[test]
    fn test_store_retry_counts_first_attempt() {
        let config = GatewayConfig {
            store_retry_attempts: 3,
            ..GatewayConfig::default()
        };
        assert_eq!(config.store_retry().max_retries, 2);
    }
}
