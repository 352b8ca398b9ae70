//! Per-credential token buckets.
//!
//! Buckets start full, refill continuously at `refill_per_sec` up to
//! `capacity`, and are dropped after an idle period. A recreated bucket starts
//! full again; an idle credential has no debt to carry over.

use axum_helpers::ShutdownCoordinator;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::error::{GatewayError, GatewayResult};

/// Absorbs float drift so a bucket refilled for exactly one token's worth of
/// time grants that token.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct RateBucket {
    pub capacity: f64,
    /// Always within `0..=capacity`
    pub tokens: f64,
    pub last_refill: Instant,
}

impl RateBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, refill_per_sec: f64, now: Instant) {
        // Instants never go backwards, so refill is monotonic.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    buckets: Arc<Mutex<HashMap<Uuid, RateBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(config),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<Uuid, RateBucket>> {
        // Bucket arithmetic never panics mid-update, so a poisoned map is still consistent.
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take `cost` tokens from the credential's bucket, or report how long
    /// until they will be available.
    pub fn try_acquire(&self, credential_id: Uuid, cost: f64) -> GatewayResult<()> {
        let capacity = self.config.capacity;
        let rate = self.config.refill_per_sec;
        if cost > capacity {
            return Err(GatewayError::Validation(format!(
                "request cost {} exceeds bucket capacity {}",
                cost, capacity
            )));
        }

        let now = Instant::now();
        let mut buckets = self.buckets();
        let bucket = buckets
            .entry(credential_id)
            .or_insert_with(|| RateBucket::full(capacity, now));
        bucket.refill(rate, now);

        if bucket.tokens + EPSILON >= cost {
            bucket.tokens = (bucket.tokens - cost).max(0.0);
            return Ok(());
        }

        let missing = cost - bucket.tokens;
        let retry_after = Duration::from_secs_f64(missing / rate);
        tracing::debug!(
            credential_id = %credential_id,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit exceeded"
        );
        Err(GatewayError::RateLimited { retry_after })
    }

    /// Tokens currently available to a credential, without consuming any.
    pub fn available(&self, credential_id: Uuid) -> f64 {
        let now = Instant::now();
        let mut buckets = self.buckets();
        match buckets.get_mut(&credential_id) {
            Some(bucket) => {
                bucket.refill(self.config.refill_per_sec, now);
                bucket.tokens
            }
            None => self.config.capacity,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets().len()
    }

    /// Drop buckets untouched for at least the idle period. Returns how many
    /// were removed.
    pub fn evict_idle(&self) -> usize {
        let idle = self.config.idle_eviction;
        let now = Instant::now();
        let mut buckets = self.buckets();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle);
        before - buckets.len()
    }

    /// Periodically evict idle buckets until shutdown.
    pub fn spawn_sweeper(&self, shutdown: ShutdownCoordinator) -> JoinHandle<()> {
        let limiter = self.clone();
        let period = (limiter.config.idle_eviction / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = limiter.evict_idle();
                        if evicted > 0 {
                            tracing::info!(evicted, "Evicted idle rate-limit buckets");
                        }
                    }
                    _ = shutdown.wait() => {
                        tracing::debug!("Rate-limit sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
