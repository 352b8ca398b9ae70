//! API key lifecycle: issue, authenticate, list, revoke.
//!
//! Only the SHA-256 of a secret is ever stored. Lookups go through a
//! short-lived cache; revocation is written to the metadata store first and
//! then removes the cache entry before it returns.
//!
//! # Revocation and in-flight requests
//!
//! A revoke applies to every authentication that *begins* after the durable
//! write. Requests that already authenticated keep running to completion.

use chrono::Utc;
use database::common::RetryConfig;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::CredentialCache;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    CreateCredential, Credential, CredentialStatus, CredentialView, IssuedCredential, Permission,
};
use crate::store::{MetadataStore, with_retry};

/// Prefix of every issued secret
pub const SECRET_PREFIX: &str = "vgw_";

/// Attempts at a compare-and-set revoke before giving up on a busy record.
const REVOKE_CAS_ATTEMPTS: usize = 3;

/// SHA-256 hex digest of a bearer secret.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    const_hex::encode(hasher.finalize())
}

fn generate_secret() -> String {
    let random_bytes: Vec<u8> = (0..32).map(|_| rand::random::<u8>()).collect();
    format!("{}{}", SECRET_PREFIX, const_hex::encode(random_bytes))
}

#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn MetadataStore>,
    cache: Arc<dyn CredentialCache>,
    cache_ttl: Duration,
    retry: RetryConfig,
    /// Hashes revoked by this process, held for one cache TTL so a lookup
    /// racing the revoke cannot repopulate the local view
    tombstones: Arc<Mutex<HashMap<String, Instant>>>,
}

impl CredentialStore {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        cache: Arc<dyn CredentialCache>,
        cache_ttl: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            cache,
            cache_ttl,
            retry,
            tombstones: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn is_tombstoned(&self, secret_hash: &str) -> bool {
        let mut tombstones = self.tombstones.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        tombstones.retain(|_, expires_at| *expires_at > now);
        tombstones.contains_key(secret_hash)
    }

    fn tombstone(&self, secret_hash: &str) {
        self.tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(secret_hash.to_string(), Instant::now() + self.cache_ttl);
    }

    async fn lookup(&self, secret_hash: &str) -> GatewayResult<Option<Credential>> {
        if !self.is_tombstoned(secret_hash) {
            match self.cache.get(secret_hash).await {
                Ok(Some(credential)) => return Ok(Some(credential)),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Credential cache read failed, using store"),
            }
        }

        let found = with_retry(&self.retry, || self.store.find_credential_by_hash(secret_hash))
            .await?;

        if let Some(credential) = found.as_ref().filter(|c| c.is_active()) {
            if !self.is_tombstoned(secret_hash) {
                if let Err(e) = self.cache.put(credential, self.cache_ttl).await {
                    tracing::warn!(error = %e, "Credential cache write failed");
                }
            }
        }

        Ok(found)
    }

    /// Resolve a bearer secret to its active credential.
    pub async fn authenticate(&self, secret: &str) -> GatewayResult<Credential> {
        if secret.is_empty() {
            return Err(GatewayError::unauthenticated());
        }

        let secret_hash = hash_secret(secret);
        let Some(credential) = self.lookup(&secret_hash).await? else {
            tracing::debug!("Unknown credential presented");
            return Err(GatewayError::unauthenticated());
        };

        let matches: bool = credential
            .secret_hash
            .as_bytes()
            .ct_eq(secret_hash.as_bytes())
            .into();
        if !matches || !credential.is_active() {
            tracing::info!(credential_id = %credential.id, "Rejected inactive credential");
            return Err(GatewayError::unauthenticated());
        }

        let store = self.store.clone();
        let id = credential.id;
        tokio::spawn(async move {
            if let Err(e) = store.touch_credential(id, Utc::now()).await {
                tracing::debug!(credential_id = %id, error = %e, "Failed to record credential use");
            }
        });

        Ok(credential)
    }

    /// Issue a new credential in `tenant`. The secret is returned here and
    /// nowhere else.
    pub async fn create(
        &self,
        tenant: &str,
        input: CreateCredential,
    ) -> GatewayResult<IssuedCredential> {
        let secret = generate_secret();
        let credential = Credential {
            id: Uuid::now_v7(),
            tenant: tenant.to_string(),
            name: input.name,
            secret_hash: hash_secret(&secret),
            permissions: input.permissions.into_iter().collect(),
            scope: input.scope,
            status: CredentialStatus::Active,
            created_at: Utc::now(),
            revoked_at: None,
            last_used_at: None,
            version: 1,
        };

        let inserted =
            with_retry(&self.retry, || self.store.insert_credential(&credential)).await?;
        if !inserted {
            return Err(GatewayError::Conflict(format!(
                "credential {} already exists",
                credential.id
            )));
        }

        Ok(IssuedCredential {
            credential: CredentialView::from(&credential),
            secret,
        })
    }

    /// Revoke a credential of `tenant`. Revoking twice succeeds and keeps the
    /// first `revoked_at`.
    pub async fn revoke(&self, tenant: &str, id: Uuid) -> GatewayResult<CredentialView> {
        for _ in 0..REVOKE_CAS_ATTEMPTS {
            let current = with_retry(&self.retry, || self.store.find_credential(tenant, id))
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("credential {} not found", id)))?;

            if current.status == CredentialStatus::Revoked {
                return Ok(CredentialView::from(&current));
            }

            let revoked = current.revoked(Utc::now());
            let updated = with_retry(&self.retry, || {
                self.store.update_credential(&revoked, current.version)
            })
            .await?;

            if updated {
                self.tombstone(&revoked.secret_hash);
                if let Err(e) = self.cache.invalidate(&revoked.secret_hash).await {
                    tracing::error!(
                        credential_id = %id,
                        error = %e,
                        "Failed to invalidate cached credential; entry expires with its TTL"
                    );
                }
                tracing::info!(credential_id = %id, tenant = %tenant, "Revoked credential");
                return Ok(CredentialView::from(&revoked));
            }
        }

        Err(GatewayError::Conflict(format!(
            "credential {} was modified concurrently",
            id
        )))
    }

    pub async fn list(&self, tenant: &str) -> GatewayResult<Vec<CredentialView>> {
        let credentials = with_retry(&self.retry, || self.store.list_credentials(tenant)).await?;
        Ok(credentials.iter().map(CredentialView::from).collect())
    }

    pub async fn get(&self, tenant: &str, id: Uuid) -> GatewayResult<CredentialView> {
        with_retry(&self.retry, || self.store.find_credential(tenant, id))
            .await?
            .map(|c| CredentialView::from(&c))
            .ok_or_else(|| GatewayError::NotFound(format!("credential {} not found", id)))
    }

    /// Seed an all-permission credential for `secret` when `tenant` has none.
    /// Returns whether a credential was created.
    pub async fn ensure_bootstrap(&self, tenant: &str, secret: &str) -> GatewayResult<bool> {
        if with_retry(&self.retry, || self.store.count_credentials(tenant)).await? > 0 {
            return Ok(false);
        }

        let credential = Credential {
            id: Uuid::now_v7(),
            tenant: tenant.to_string(),
            name: "bootstrap".to_string(),
            secret_hash: hash_secret(secret),
            permissions: BTreeSet::from([Permission::Read, Permission::Write, Permission::Admin]),
            scope: None,
            status: CredentialStatus::Active,
            created_at: Utc::now(),
            revoked_at: None,
            last_used_at: None,
            version: 1,
        };

        let inserted =
            with_retry(&self.retry, || self.store.insert_credential(&credential)).await?;
        if inserted {
            tracing::info!(tenant = %tenant, credential_id = %credential.id, "Seeded bootstrap credential");
        }
        Ok(inserted)
    }
}
