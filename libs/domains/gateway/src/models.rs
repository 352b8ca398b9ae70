use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use strum::{Display, EnumString};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::error::{GatewayError, GatewayResult};

/// Database, table and tenant names: 1-64 of `[A-Za-z0-9_-]`.
static RESOURCE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

pub fn is_valid_name(name: &str) -> bool {
    RESOURCE_NAME.is_match(name)
}

fn validate_resource_name(name: &str) -> Result<(), validator::ValidationError> {
    if !is_valid_name(name) {
        return Err(validator::ValidationError::new("invalid_resource_name"));
    }
    Ok(())
}

fn check_name(kind: &str, name: &str) -> GatewayResult<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(GatewayError::Validation(format!(
            "invalid {} name '{}': use 1-64 letters, digits, '_' or '-'",
            kind, name
        )))
    }
}

// ============================================================================
// Permissions
// ============================================================================

/// Capability tag granted to a credential
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

/// What a request wants to do, before it is checked against a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, ToSchema)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Action {
    Read,
    Write,
    AdminCreate,
    AdminDrop,
    AdminKeyManage,
}

impl Action {
    /// The single permission tag that grants this action.
    pub const fn required_permission(self) -> Permission {
        match self {
            Action::Read => Permission::Read,
            Action::Write => Permission::Write,
            Action::AdminCreate | Action::AdminDrop | Action::AdminKeyManage => Permission::Admin,
        }
    }
}

// ============================================================================
// Resource paths and scope
// ============================================================================

/// `(database, table?)` inside one tenant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub struct ResourcePath {
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl ResourcePath {
    pub fn database(database: impl Into<String>) -> GatewayResult<Self> {
        let database = database.into();
        check_name("database", &database)?;
        Ok(Self {
            database,
            table: None,
        })
    }

    pub fn table(database: impl Into<String>, table: impl Into<String>) -> GatewayResult<Self> {
        let mut path = Self::database(database)?;
        let table = table.into();
        check_name("table", &table)?;
        path.table = Some(table);
        Ok(path)
    }

    pub fn is_table(&self) -> bool {
        self.table.is_some()
    }

    /// The owning database of a table path.
    pub fn parent(&self) -> Option<ResourcePath> {
        self.table.as_ref().map(|_| ResourcePath {
            database: self.database.clone(),
            table: None,
        })
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}/{}", self.database, table),
            None => f.write_str(&self.database),
        }
    }
}

impl FromStr for ResourcePath {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((database, table)) => ResourcePath::table(database, table),
            None => ResourcePath::database(s),
        }
    }
}

/// Scope entry of a credential: an exact database, or an exact
/// database/table pair. No wildcards or prefixes.
///
/// Serialized as `"db"` or `"db/table"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopePattern(ResourcePath);

impl ScopePattern {
    pub fn new(path: ResourcePath) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.0
    }

    /// A database pattern covers the database and all of its tables; a table
    /// pattern covers only that table.
    pub fn matches(&self, target: &ResourcePath) -> bool {
        if self.0.database != target.database {
            return false;
        }
        match (&self.0.table, &target.table) {
            (None, _) => true,
            (Some(pattern), Some(table)) => pattern == table,
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for ScopePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ScopePattern {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ScopePattern)
    }
}

impl TryFrom<String> for ScopePattern {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScopePattern> for String {
    fn from(pattern: ScopePattern) -> Self {
        pattern.to_string()
    }
}

/// A resource path qualified by its owning tenant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub tenant: String,
    pub path: ResourcePath,
}

impl ResourceKey {
    pub fn new(tenant: impl Into<String>, path: ResourcePath) -> Self {
        Self {
            tenant: tenant.into(),
            path,
        }
    }

    /// Primary key in the metadata store: `tenant/db` or `tenant/db/table`.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.tenant, self.path)
    }

    /// Engine-side name. `.` never appears in a valid name, so names from
    /// different tenants or databases cannot collide.
    pub fn engine_namespace(&self) -> String {
        match &self.path.table {
            Some(table) => format!("{}.{}.{}", self.tenant, self.path.database, table),
            None => format!("{}.{}", self.tenant, self.path.database),
        }
    }

    pub fn parent(&self) -> Option<ResourceKey> {
        self.path
            .parent()
            .map(|path| ResourceKey::new(self.tenant.clone(), path))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Revoked,
}

/// Persisted API key record. The plaintext secret is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub tenant: String,
    pub name: String,
    /// SHA-256 hex of the bearer token
    pub secret_hash: String,
    pub permissions: BTreeSet<Permission>,
    /// `None` grants every resource of the tenant
    pub scope: Option<Vec<ScopePattern>>,
    pub status: CredentialStatus,
    pub created_at: DateTime<Utc>,
    /// Set once, on the first revoke
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter
    pub version: i64,
}

impl Credential {
    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// The revoked form of this record. Revoking twice keeps the first
    /// `revoked_at`.
    pub fn revoked(&self, at: DateTime<Utc>) -> Self {
        Self {
            status: CredentialStatus::Revoked,
            revoked_at: self.revoked_at.or(Some(at)),
            version: self.version + 1,
            ..self.clone()
        }
    }
}

/// Credential metadata as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CredentialView {
    pub id: Uuid,
    pub tenant: String,
    pub name: String,
    pub permissions: Vec<Permission>,
    #[schema(value_type = Option<Vec<String>>)]
    pub scope: Option<Vec<ScopePattern>>,
    pub status: CredentialStatus,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&Credential> for CredentialView {
    fn from(credential: &Credential) -> Self {
        Self {
            id: credential.id,
            tenant: credential.tenant.clone(),
            name: credential.name.clone(),
            permissions: credential.permissions.iter().copied().collect(),
            scope: credential.scope.clone(),
            status: credential.status,
            created_at: credential.created_at,
            revoked_at: credential.revoked_at,
            last_used_at: credential.last_used_at,
        }
    }
}

/// A freshly created credential. `secret` is shown exactly once.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IssuedCredential {
    #[serde(flatten)]
    pub credential: CredentialView,
    pub secret: String,
}

// ============================================================================
// Resources
// ============================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    L2,
    Dot,
}

/// Requested shape of a database or table. Two creates of the same path are
/// idempotent only when their configs are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceConfig {
    Database {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Table {
        dimension: u32,
        metric: DistanceMetric,
    },
}

impl ResourceConfig {
    pub fn dimension(&self) -> Option<u32> {
        match self {
            ResourceConfig::Table { dimension, .. } => Some(*dimension),
            ResourceConfig::Database { .. } => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResourceState {
    Creating,
    Ready,
    Dropping,
    /// Terminal; the record is removed right after entering this state
    Gone,
}

/// Opaque reference into the storage engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineHandle(pub String);

impl EngineHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry entry for one tenant database or table
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ResourceHandle {
    #[serde(skip)]
    pub tenant: String,
    #[serde(flatten)]
    pub path: ResourcePath,
    pub config: ResourceConfig,
    #[serde(skip)]
    pub engine_handle: Option<EngineHandle>,
    pub state: ResourceState,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceHandle {
    /// New record in `creating`, before the engine is called.
    pub fn creating(key: &ResourceKey, config: ResourceConfig) -> Self {
        let now = Utc::now();
        Self {
            tenant: key.tenant.clone(),
            path: key.path.clone(),
            config,
            engine_handle: None,
            state: ResourceState::Creating,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.tenant.clone(), self.path.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.state == ResourceState::Ready
    }

    /// Copy of this record in `state`, with the version bumped.
    pub fn transition(&self, state: ResourceState) -> Self {
        Self {
            state,
            version: self.version + 1,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

// ============================================================================
// Engine payloads
// ============================================================================

/// One row to insert into a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VectorRecord {
    /// Generated when omitted
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SearchQuery {
    pub vector: Vec<f32>,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct InsertSummary {
    pub inserted: usize,
}

/// One window of a table's rows, ordered by row id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RowPage {
    pub rows: Vec<VectorRecord>,
    /// Rows in the whole table
    pub total_rows: u64,
    pub offset: u64,
    pub limit: u32,
}

// ============================================================================
// Request DTOs
// ============================================================================

pub const DEFAULT_SEARCH_LIMIT: u32 = 10;
pub const MAX_SEARCH_LIMIT: u32 = 1000;
pub const MAX_VECTOR_DIMENSION: u32 = 65_536;
pub const MAX_INSERT_BATCH: usize = 10_000;

pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const MAX_PAGE_LIMIT: u32 = 1000;

fn default_search_limit() -> u32 {
    DEFAULT_SEARCH_LIMIT
}

fn default_page_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateDatabase {
    #[validate(custom(function = "validate_resource_name"))]
    pub name: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateTable {
    #[validate(custom(function = "validate_resource_name"))]
    pub name: String,
    #[validate(range(min = 1, max = 65536))]
    pub dimension: u32,
    #[serde(default = "default_metric")]
    pub metric: DistanceMetric,
}

fn default_metric() -> DistanceMetric {
    DistanceMetric::Cosine
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct InsertRows {
    #[validate(length(min = 1, max = 10000))]
    pub rows: Vec<VectorRecord>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct SearchRequest {
    #[validate(length(min = 1))]
    pub vector: Vec<f32>,
    #[serde(default = "default_search_limit")]
    #[validate(range(min = 1, max = 1000))]
    pub limit: u32,
}

/// Paging for a table's rows
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate, ToSchema, IntoParams)]
pub struct ListRows {
    #[serde(default = "default_page_limit")]
    #[validate(range(min = 1, max = 1000))]
    pub limit: u32,
    #[serde(default)]
    pub offset: u64,
}

impl Default for ListRows {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateCredential {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(min = 1))]
    pub permissions: Vec<Permission>,
    /// `"db"` or `"db/table"` entries; omit for tenant-wide access
    #[schema(value_type = Option<Vec<String>>)]
    pub scope: Option<Vec<ScopePattern>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_permission_mapping() {
        assert_eq!(Action::Read.required_permission(), Permission::Read);
        assert_eq!(Action::Write.required_permission(), Permission::Write);
        for action in [Action::AdminCreate, Action::AdminDrop, Action::AdminKeyManage] {
            assert_eq!(action.required_permission(), Permission::Admin);
        }
    }

    #[test]
    fn test_resource_path_parse_and_display() {
        let db: ResourcePath = "db1".parse().unwrap();
        assert_eq!(db, ResourcePath::database("db1").unwrap());
        assert!(!db.is_table());

        let table: ResourcePath = "db1/tableA".parse().unwrap();
        assert_eq!(table.to_string(), "db1/tableA");
        assert_eq!(table.parent(), Some(db));
    }

    #[test]
    fn test_resource_path_rejects_bad_names() {
        assert!(ResourcePath::database("").is_err());
        assert!(ResourcePath::database("has space").is_err());
        assert!(ResourcePath::database("dot.ted").is_err());
        assert!("db/t/extra".parse::<ResourcePath>().is_err());
        assert!(ResourcePath::database("a".repeat(65)).is_err());
    }

    #[test]
    fn test_scope_pattern_exact_matching() {
        let db_scope: ScopePattern = "db1".parse().unwrap();
        let table_scope: ScopePattern = "db1/tableA".parse().unwrap();

        assert!(db_scope.matches(&"db1".parse().unwrap()));
        assert!(db_scope.matches(&"db1/tableA".parse().unwrap()));
        assert!(!db_scope.matches(&"db10".parse().unwrap()));
        assert!(!db_scope.matches(&"db10/tableA".parse().unwrap()));

        assert!(table_scope.matches(&"db1/tableA".parse().unwrap()));
        assert!(!table_scope.matches(&"db1/tableAB".parse().unwrap()));
        assert!(!table_scope.matches(&"db1".parse().unwrap()));
    }

    #[test]
    fn test_scope_pattern_serde_as_string() {
        let scope: Vec<ScopePattern> = serde_json::from_str(r#"["db1","db2/t"]"#).unwrap();
        assert_eq!(serde_json::to_string(&scope).unwrap(), r#"["db1","db2/t"]"#);
        assert!(serde_json::from_str::<Vec<ScopePattern>>(r#"["db*"]"#).is_err());
    }

    #[test]
    fn test_resource_key_namespaces_are_tenant_qualified() {
        let a = ResourceKey::new("acme", "db1/t".parse().unwrap());
        let b = ResourceKey::new("globex", "db1/t".parse().unwrap());
        assert_eq!(a.storage_key(), "acme/db1/t");
        assert_eq!(a.engine_namespace(), "acme.db1.t");
        assert_ne!(a.engine_namespace(), b.engine_namespace());
    }

    #[test]
    fn test_revoke_keeps_first_timestamp() {
        let first = Utc::now();
        let credential = Credential {
            id: Uuid::new_v4(),
            tenant: "acme".into(),
            name: "ci".into(),
            secret_hash: "00".into(),
            permissions: BTreeSet::from([Permission::Read]),
            scope: None,
            status: CredentialStatus::Active,
            created_at: first,
            revoked_at: None,
            last_used_at: None,
            version: 1,
        };

        let once = credential.revoked(first);
        let twice = once.revoked(first + chrono::Duration::seconds(10));
        assert_eq!(twice.revoked_at, Some(first));
        assert_eq!(twice.status, CredentialStatus::Revoked);
        assert_eq!(twice.version, 3);
    }

    #[test]
    fn test_resource_config_serde_shape() {
        let config: ResourceConfig =
            serde_json::from_str(r#"{"kind":"table","dimension":3,"metric":"l2"}"#).unwrap();
        assert_eq!(
            config,
            ResourceConfig::Table {
                dimension: 3,
                metric: DistanceMetric::L2
            }
        );
        assert_eq!(config.dimension(), Some(3));
    }
}
