use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{MetadataStore, StoreResult};
use crate::models::{Credential, ResourceHandle, ResourceKey};

/// In-memory implementation of MetadataStore (for development/testing)
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetadataStore {
    credentials: Arc<RwLock<HashMap<Uuid, Credential>>>,
    resources: Arc<RwLock<BTreeMap<ResourceKey, ResourceHandle>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert_credential(&self, credential: &Credential) -> StoreResult<bool> {
        let mut credentials = self.credentials.write().await;

        let taken = credentials.contains_key(&credential.id)
            || credentials
                .values()
                .any(|c| c.secret_hash == credential.secret_hash);
        if taken {
            return Ok(false);
        }

        credentials.insert(credential.id, credential.clone());
        tracing::info!(credential_id = %credential.id, tenant = %credential.tenant, "Created credential");
        Ok(true)
    }

    async fn find_credential_by_hash(&self, secret_hash: &str) -> StoreResult<Option<Credential>> {
        let credentials = self.credentials.read().await;
        Ok(credentials
            .values()
            .find(|c| c.secret_hash == secret_hash)
            .cloned())
    }

    async fn find_credential(&self, tenant: &str, id: Uuid) -> StoreResult<Option<Credential>> {
        let credentials = self.credentials.read().await;
        Ok(credentials.get(&id).filter(|c| c.tenant == tenant).cloned())
    }

    async fn list_credentials(&self, tenant: &str) -> StoreResult<Vec<Credential>> {
        let credentials = self.credentials.read().await;
        let mut result: Vec<Credential> = credentials
            .values()
            .filter(|c| c.tenant == tenant)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn update_credential(
        &self,
        credential: &Credential,
        expected_version: i64,
    ) -> StoreResult<bool> {
        let mut credentials = self.credentials.write().await;
        match credentials.get_mut(&credential.id) {
            Some(current) if current.version == expected_version => {
                *current = credential.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_credential(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut credentials = self.credentials.write().await;
        if let Some(credential) = credentials.get_mut(&id) {
            credential.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn count_credentials(&self, tenant: &str) -> StoreResult<u64> {
        let credentials = self.credentials.read().await;
        Ok(credentials.values().filter(|c| c.tenant == tenant).count() as u64)
    }

    async fn insert_resource(&self, handle: &ResourceHandle) -> StoreResult<bool> {
        let mut resources = self.resources.write().await;
        let key = handle.key();
        if resources.contains_key(&key) {
            return Ok(false);
        }
        resources.insert(key, handle.clone());
        Ok(true)
    }

    async fn find_resource(&self, key: &ResourceKey) -> StoreResult<Option<ResourceHandle>> {
        let resources = self.resources.read().await;
        Ok(resources.get(key).cloned())
    }

    async fn resource_version(&self, key: &ResourceKey) -> StoreResult<Option<i64>> {
        let resources = self.resources.read().await;
        Ok(resources.get(key).map(|h| h.version))
    }

    async fn update_resource(
        &self,
        handle: &ResourceHandle,
        expected_version: i64,
    ) -> StoreResult<bool> {
        let mut resources = self.resources.write().await;
        match resources.get_mut(&handle.key()) {
            Some(current) if current.version == expected_version => {
                *current = handle.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_resource(
        &self,
        key: &ResourceKey,
        expected_version: i64,
    ) -> StoreResult<bool> {
        let mut resources = self.resources.write().await;
        match resources.get(key) {
            Some(current) if current.version == expected_version => {
                resources.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_resources(
        &self,
        tenant: &str,
        database: Option<&str>,
    ) -> StoreResult<Vec<ResourceHandle>> {
        let resources = self.resources.read().await;
        Ok(resources
            .values()
            .filter(|h| h.tenant == tenant)
            .filter(|h| match database {
                Some(db) => h.path.database == db && h.path.table.is_some(),
                None => h.path.table.is_none(),
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CredentialStatus, Permission, ResourceConfig, ResourceState};
    use std::collections::BTreeSet;

    fn credential(tenant: &str, hash: &str) -> Credential {
        Credential {
            id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            name: "test".to_string(),
            secret_hash: hash.to_string(),
            permissions: BTreeSet::from([Permission::Read]),
            scope: None,
            status: CredentialStatus::Active,
            created_at: Utc::now(),
            revoked_at: None,
            last_used_at: None,
            version: 1,
        }
    }

    #[tokio::test]
    async fn test_credential_hash_is_unique() {
        let store = InMemoryMetadataStore::new();
        assert!(store.insert_credential(&credential("acme", "h1")).await.unwrap());
        assert!(!store.insert_credential(&credential("acme", "h1")).await.unwrap());
        assert_eq!(store.count_credentials("acme").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_credentials_are_tenant_isolated() {
        let store = InMemoryMetadataStore::new();
        let c = credential("acme", "h1");
        store.insert_credential(&c).await.unwrap();

        assert!(store.find_credential("acme", c.id).await.unwrap().is_some());
        assert!(store.find_credential("globex", c.id).await.unwrap().is_none());
        assert!(store.list_credentials("globex").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_credential_compare_and_set() {
        let store = InMemoryMetadataStore::new();
        let c = credential("acme", "h1");
        store.insert_credential(&c).await.unwrap();

        let revoked = c.revoked(Utc::now());
        assert!(store.update_credential(&revoked, 1).await.unwrap());
        // stale writer loses
        assert!(!store.update_credential(&revoked, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_resource_lifecycle() {
        let store = InMemoryMetadataStore::new();
        let key = ResourceKey::new("acme", "db1".parse().unwrap());
        let handle = ResourceHandle::creating(&key, ResourceConfig::Database { description: None });

        assert!(store.insert_resource(&handle).await.unwrap());
        assert!(!store.insert_resource(&handle).await.unwrap());

        let ready = handle.transition(ResourceState::Ready);
        assert!(store.update_resource(&ready, 1).await.unwrap());
        assert_eq!(store.resource_version(&key).await.unwrap(), Some(2));

        assert!(!store.delete_resource(&key, 1).await.unwrap());
        assert!(store.delete_resource(&key, 2).await.unwrap());
        assert!(store.find_resource(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_resources_by_level() {
        let store = InMemoryMetadataStore::new();
        for path in ["db1", "db2", "db1/t1", "db1/t2", "db2/t1"] {
            let key = ResourceKey::new("acme", path.parse().unwrap());
            let handle =
                ResourceHandle::creating(&key, ResourceConfig::Database { description: None });
            store.insert_resource(&handle).await.unwrap();
        }

        let databases = store.list_resources("acme", None).await.unwrap();
        assert_eq!(databases.len(), 2);

        let tables = store.list_resources("acme", Some("db1")).await.unwrap();
        let names: Vec<_> = tables.iter().map(|h| h.path.to_string()).collect();
        assert_eq!(names, vec!["db1/t1", "db1/t2"]);

        assert!(store.list_resources("globex", None).await.unwrap().is_empty());
    }
}
