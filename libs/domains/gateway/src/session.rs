//! Per-request orchestration.
//!
//! ```text
//! Received ─► Authenticated ─► Authorized ─► Admitted ─► ResourceResolved ─► Delegated ─► Completed
//!     │             │               │            │               │                │
//!     └─────────────┴───────────────┴────────────┴───────────────┴────────────────┴─► Rejected(kind)
//! ```
//!
//! Authentication and authorization run before any rate or capacity
//! accounting, so a denied request consumes no budget. Names and bodies are
//! validated only after admission: an unreadable request from a caller who
//! may not act, or has no budget left, is refused as such. The admission slot is
//! owned by the session and released on every exit, including when the
//! caller goes away mid-request. Create and drop run on their own task: once
//! the engine call has started it finishes even if the caller disconnects.

use axum_helpers::{AuditEvent, AuditOutcome};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;
use validator::Validate;

use crate::admission::{AdmissionSlot, ConnectionAdmission};
use crate::cache::CredentialCache;
use crate::config::GatewayConfig;
use crate::credentials::CredentialStore;
use crate::engine::{EngineError, StorageEngine};
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::models::{
    Action, CreateCredential, CreateDatabase, CreateTable, Credential, CredentialView,
    EngineHandle, InsertRows, InsertSummary, IssuedCredential, ListRows, ResourceConfig,
    ResourceHandle, ResourceKey, ResourcePath, RowPage, SearchHit, SearchQuery, SearchRequest,
};
use crate::permission::{self, Decision};
use crate::ratelimit::RateLimiter;
use crate::registry::{Created, ResourceRegistry};
use crate::store::MetadataStore;

/// Token cost of one request
const REQUEST_COST: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Received,
    Authenticated,
    Authorized,
    Admitted,
    ResourceResolved,
    Delegated,
    Completed,
    Rejected(ErrorKind),
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Rejected(kind) => write!(f, "Rejected({})", kind),
            other => write!(f, "{:?}", other),
        }
    }
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Rejected(_))
    }
}

/// What the caller wants done, inside its own tenant
#[derive(Debug, Clone)]
pub enum Operation {
    WhoAmI,
    ListDatabases,
    CreateDatabase(CreateDatabase),
    GetDatabase { database: String },
    DropDatabase { database: String },
    ListTables { database: String },
    CreateTable { database: String, input: CreateTable },
    GetTable { database: String, table: String },
    DropTable { database: String, table: String },
    Insert { database: String, table: String, input: InsertRows },
    Search { database: String, table: String, input: SearchRequest },
    ListRows { database: String, table: String, query: ListRows },
    CreateKey(CreateCredential),
    ListKeys,
    GetKey { id: Uuid },
    RevokeKey { id: Uuid },
    /// A request whose body could not be decoded
    Malformed(MalformedRequest),
}

/// What is known about a request whose body failed to decode: enough to
/// authorize and admit it before it is rejected.
#[derive(Debug, Clone)]
pub struct MalformedRequest {
    operation: &'static str,
    action: Action,
    database: Option<String>,
    table: Option<String>,
    reason: String,
}

impl MalformedRequest {
    pub fn new(operation: &'static str, action: Action, reason: impl Into<String>) -> Self {
        Self {
            operation,
            action,
            database: None,
            table: None,
            reason: reason.into(),
        }
    }

    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn in_table(mut self, database: impl Into<String>, table: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self.table = Some(table.into());
        self
    }
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::WhoAmI => "whoami",
            Operation::ListDatabases => "database.list",
            Operation::CreateDatabase(_) => "database.create",
            Operation::GetDatabase { .. } => "database.get",
            Operation::DropDatabase { .. } => "database.drop",
            Operation::ListTables { .. } => "table.list",
            Operation::CreateTable { .. } => "table.create",
            Operation::GetTable { .. } => "table.get",
            Operation::DropTable { .. } => "table.drop",
            Operation::Insert { .. } => "rows.insert",
            Operation::Search { .. } => "rows.search",
            Operation::ListRows { .. } => "rows.list",
            Operation::CreateKey(_) => "credential.create",
            Operation::ListKeys => "credential.list",
            Operation::GetKey { .. } => "credential.get",
            Operation::RevokeKey { .. } => "credential.revoke",
            Operation::Malformed(m) => m.operation,
        }
    }

    /// Required action; `None` needs only a valid credential.
    pub fn action(&self) -> Option<Action> {
        match self {
            Operation::WhoAmI => None,
            Operation::ListDatabases
            | Operation::GetDatabase { .. }
            | Operation::ListTables { .. }
            | Operation::GetTable { .. }
            | Operation::Search { .. }
            | Operation::ListRows { .. } => Some(Action::Read),
            Operation::Insert { .. } => Some(Action::Write),
            Operation::CreateDatabase(_) | Operation::CreateTable { .. } => {
                Some(Action::AdminCreate)
            }
            Operation::DropDatabase { .. } | Operation::DropTable { .. } => {
                Some(Action::AdminDrop)
            }
            Operation::CreateKey(_)
            | Operation::ListKeys
            | Operation::GetKey { .. }
            | Operation::RevokeKey { .. } => Some(Action::AdminKeyManage),
            Operation::Malformed(m) => Some(m.action),
        }
    }

    /// Target path, from the resource names in the request.
    fn target(&self) -> GatewayResult<Option<ResourcePath>> {
        let path = match self {
            Operation::WhoAmI
            | Operation::ListDatabases
            | Operation::CreateKey(_)
            | Operation::ListKeys
            | Operation::GetKey { .. }
            | Operation::RevokeKey { .. } => return Ok(None),
            Operation::CreateDatabase(input) => ResourcePath::database(&input.name)?,
            Operation::GetDatabase { database }
            | Operation::DropDatabase { database }
            | Operation::ListTables { database } => ResourcePath::database(database)?,
            Operation::CreateTable { database, input } => {
                ResourcePath::table(database, &input.name)?
            }
            Operation::GetTable { database, table }
            | Operation::DropTable { database, table }
            | Operation::Insert { database, table, .. }
            | Operation::Search { database, table, .. }
            | Operation::ListRows { database, table, .. } => ResourcePath::table(database, table)?,
            Operation::Malformed(m) => match (&m.database, &m.table) {
                (Some(database), Some(table)) => ResourcePath::table(database, table)?,
                (Some(database), None) => ResourcePath::database(database)?,
                _ => return Ok(None),
            },
        };
        Ok(Some(path))
    }

    /// Path the permission check runs against: the target when its names
    /// are valid, else the request's database when that name is valid.
    fn authorization_path(&self) -> Option<ResourcePath> {
        match self.target() {
            Ok(path) => path,
            Err(_) => self
                .database()
                .and_then(|database| ResourcePath::database(database).ok()),
        }
    }

    fn database(&self) -> Option<&str> {
        match self {
            Operation::CreateDatabase(input) => Some(input.name.as_str()),
            Operation::GetDatabase { database }
            | Operation::DropDatabase { database }
            | Operation::ListTables { database }
            | Operation::CreateTable { database, .. }
            | Operation::GetTable { database, .. }
            | Operation::DropTable { database, .. }
            | Operation::Insert { database, .. }
            | Operation::Search { database, .. }
            | Operation::ListRows { database, .. } => Some(database.as_str()),
            Operation::Malformed(m) => m.database.as_deref(),
            _ => None,
        }
    }

    /// Validate the request body.
    fn validate(&self) -> GatewayResult<()> {
        match self {
            Operation::CreateKey(input) => input.validate()?,
            Operation::CreateDatabase(input) => input.validate()?,
            Operation::CreateTable { input, .. } => input.validate()?,
            Operation::Insert { input, .. } => input.validate()?,
            Operation::Search { input, .. } => input.validate()?,
            Operation::ListRows { query, .. } => query.validate()?,
            Operation::Malformed(m) => return Err(GatewayError::Validation(m.reason.clone())),
            _ => {}
        }
        Ok(())
    }

    fn is_audited(&self) -> bool {
        matches!(
            self,
            Operation::CreateDatabase(_)
                | Operation::CreateTable { .. }
                | Operation::DropDatabase { .. }
                | Operation::DropTable { .. }
                | Operation::CreateKey(_)
                | Operation::RevokeKey { .. }
        )
    }
}

/// One inbound request as delivered by the transport
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub token: String,
    pub operation: Operation,
    pub client_ip: Option<String>,
}

impl GatewayRequest {
    pub fn new(token: impl Into<String>, operation: Operation) -> Self {
        Self {
            token: token.into(),
            operation,
            client_ip: None,
        }
    }

    pub fn with_client_ip(mut self, client_ip: Option<String>) -> Self {
        self.client_ip = client_ip;
        self
    }
}

#[derive(Debug, Clone)]
pub enum GatewayResponse {
    Credential(CredentialView),
    Issued(IssuedCredential),
    Credentials(Vec<CredentialView>),
    Resource(Created),
    Resources(Vec<ResourceHandle>),
    Dropped,
    Inserted(InsertSummary),
    Hits(Vec<SearchHit>),
    Rows(RowPage),
}

/// Lifecycle bookkeeping for one request.
struct Session {
    id: Uuid,
    operation: &'static str,
    state: SessionState,
    slot: Option<AdmissionSlot>,
}

impl Session {
    fn new(operation: &'static str) -> Self {
        Self {
            id: Uuid::now_v7(),
            operation,
            state: SessionState::Received,
            slot: None,
        }
    }

    fn advance(&mut self, next: SessionState) {
        tracing::debug!(from = %self.state, to = %next, "Session transition");
        self.state = next;
        if next.is_terminal() {
            self.slot = None;
        }
    }

    fn reject(&mut self, err: &GatewayError) {
        let kind = err.kind();
        match kind {
            ErrorKind::EngineFailure => tracing::error!(error = %err, "Request failed"),
            ErrorKind::Overloaded => tracing::warn!(error = %err, "Request rejected"),
            _ => tracing::info!(error = %err, "Request rejected"),
        }
        self.advance(SessionState::Rejected(kind));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::info!(
                session_id = %self.id,
                operation = self.operation,
                state = %self.state,
                "Caller went away, session cancelled"
            );
            self.advance(SessionState::Rejected(ErrorKind::Cancelled));
        }
    }
}

/// The gateway core: every request goes through [`Gateway::dispatch`].
pub struct Gateway {
    credentials: CredentialStore,
    registry: ResourceRegistry,
    rate_limiter: RateLimiter,
    admission: ConnectionAdmission,
    engine: Arc<dyn StorageEngine>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        cache: Arc<dyn CredentialCache>,
        engine: Arc<dyn StorageEngine>,
        config: &GatewayConfig,
    ) -> Self {
        let retry = config.store_retry();
        Self {
            credentials: CredentialStore::new(
                store.clone(),
                cache,
                config.credential_cache_ttl,
                retry.clone(),
            ),
            registry: ResourceRegistry::new(store, engine.clone(), retry)
                .with_creating_lease(config.creating_lease),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            admission: ConnectionAdmission::new(
                config.max_concurrent_requests,
                config.overload_retry_after,
            ),
            engine,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn admission(&self) -> &ConnectionAdmission {
        &self.admission
    }

    pub async fn dispatch(&self, request: GatewayRequest) -> GatewayResult<GatewayResponse> {
        self.dispatch_with_cancel(request, std::future::pending())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), but resolving `cancelled` ends the
    /// session with `Cancelled` and releases its slot.
    pub async fn dispatch_with_cancel(
        &self,
        request: GatewayRequest,
        cancelled: impl Future<Output = ()>,
    ) -> GatewayResult<GatewayResponse> {
        let mut session = Session::new(request.operation.name());
        let span = tracing::info_span!(
            "gateway_session",
            session_id = %session.id,
            operation = session.operation,
        );

        let outcome = {
            let run = self.run(&mut session, request).instrument(span.clone());
            tokio::select! {
                biased;
                _ = cancelled => None,
                result = run => Some(result),
            }
        };

        match outcome {
            Some(result) => result,
            None => {
                let err = GatewayError::Cancelled;
                span.in_scope(|| session.reject(&err));
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        session: &mut Session,
        request: GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        match self.pipeline(session, request).await {
            Ok(response) => {
                session.advance(SessionState::Completed);
                Ok(response)
            }
            Err(err) => {
                session.reject(&err);
                Err(err)
            }
        }
    }

    async fn pipeline(
        &self,
        session: &mut Session,
        request: GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        let GatewayRequest {
            token,
            operation,
            client_ip,
        } = request;

        let credential = self.credentials.authenticate(&token).await?;
        session.advance(SessionState::Authenticated);

        if let Some(action) = operation.action() {
            let path = operation.authorization_path();
            if let Decision::Deny(reason) = permission::evaluate(&credential, action, path.as_ref())
            {
                AuditTrail::new(&credential, &operation, path.as_ref(), client_ip)
                    .record(AuditOutcome::Denied);
                return Err(GatewayError::Forbidden(reason.to_string()));
            }
        }
        session.advance(SessionState::Authorized);

        self.rate_limiter.try_acquire(credential.id, REQUEST_COST)?;
        session.slot = Some(self.admission.acquire_slot()?);
        session.advance(SessionState::Admitted);

        let target = operation.target()?;
        operation.validate()?;

        let trail = operation
            .is_audited()
            .then(|| AuditTrail::new(&credential, &operation, target.as_ref(), client_ip));
        // create and drop record their outcome on the task that runs them
        let (inline_trail, task_trail) = match operation {
            Operation::CreateKey(_) | Operation::RevokeKey { .. } => (trail, None),
            _ => (None, trail),
        };

        let result = self
            .execute(session, &credential, operation, target, task_trail)
            .await;
        if let Some(trail) = inline_trail {
            trail.record_result(&result);
        }
        result
    }

    async fn execute(
        &self,
        session: &mut Session,
        credential: &Credential,
        operation: Operation,
        target: Option<ResourcePath>,
        trail: Option<AuditTrail>,
    ) -> GatewayResult<GatewayResponse> {
        let tenant = credential.tenant.as_str();
        let resource = target.map(|path| ResourceKey::new(tenant, path));
        let key = || {
            resource
                .clone()
                .ok_or_else(|| GatewayError::Validation("missing resource path".to_string()))
        };

        match operation {
            Operation::WhoAmI => Ok(GatewayResponse::Credential(CredentialView::from(credential))),

            Operation::ListDatabases => {
                let databases = self.registry.list(tenant, None).await?;
                session.advance(SessionState::ResourceResolved);
                Ok(GatewayResponse::Resources(visible(credential, databases)))
            }

            Operation::ListTables { .. } => {
                let db = self.registry.resolve(&key()?).await?;
                session.advance(SessionState::ResourceResolved);
                let tables = self.registry.list(tenant, Some(&db.path.database)).await?;
                Ok(GatewayResponse::Resources(visible(credential, tables)))
            }

            Operation::GetDatabase { .. } | Operation::GetTable { .. } => {
                let handle = self.registry.resolve(&key()?).await?;
                session.advance(SessionState::ResourceResolved);
                Ok(GatewayResponse::Resource(Created {
                    handle,
                    created: false,
                }))
            }

            Operation::CreateDatabase(input) => {
                let config = ResourceConfig::Database {
                    description: input.description,
                };
                self.create(session, key()?, config, trail).await
            }

            Operation::CreateTable { input, .. } => {
                let config = ResourceConfig::Table {
                    dimension: input.dimension,
                    metric: input.metric,
                };
                self.create(session, key()?, config, trail).await
            }

            Operation::DropDatabase { .. } | Operation::DropTable { .. } => {
                let registry = self.registry.clone();
                let key = key()?;
                session.advance(SessionState::ResourceResolved);
                session.advance(SessionState::Delegated);
                detached(trail, async move { registry.drop(&key).await }).await?;
                Ok(GatewayResponse::Dropped)
            }

            Operation::Insert { input, .. } => {
                let handle = self.registry.resolve(&key()?).await?;
                session.advance(SessionState::ResourceResolved);

                let dimension = table_dimension(&handle)?;
                if let Some(row) = input
                    .rows
                    .iter()
                    .find(|r| r.vector.len() != dimension as usize)
                {
                    return Err(GatewayError::Validation(format!(
                        "row {} has {} dimensions, table '{}' expects {}",
                        row.id,
                        row.vector.len(),
                        handle.path,
                        dimension
                    )));
                }

                let engine_handle = engine_handle(&handle)?;
                session.advance(SessionState::Delegated);
                let summary = self.engine.insert(engine_handle, input.rows).await?;
                tracing::debug!(resource = %handle.path, inserted = summary.inserted, "Inserted rows");
                Ok(GatewayResponse::Inserted(summary))
            }

            Operation::Search { input, .. } => {
                let handle = self.registry.resolve(&key()?).await?;
                session.advance(SessionState::ResourceResolved);

                let dimension = table_dimension(&handle)?;
                if input.vector.len() != dimension as usize {
                    return Err(GatewayError::Validation(format!(
                        "query has {} dimensions, table '{}' expects {}",
                        input.vector.len(),
                        handle.path,
                        dimension
                    )));
                }

                let engine_handle = engine_handle(&handle)?;
                session.advance(SessionState::Delegated);
                let hits = self
                    .engine
                    .search(
                        engine_handle,
                        SearchQuery {
                            vector: input.vector,
                            limit: input.limit,
                        },
                    )
                    .await?;
                Ok(GatewayResponse::Hits(hits))
            }

            Operation::ListRows { query, .. } => {
                let handle = self.registry.resolve(&key()?).await?;
                session.advance(SessionState::ResourceResolved);

                table_dimension(&handle)?;
                let engine_handle = engine_handle(&handle)?;
                session.advance(SessionState::Delegated);
                let page = self
                    .engine
                    .scan(engine_handle, query.offset, query.limit)
                    .await?;
                Ok(GatewayResponse::Rows(page))
            }

            Operation::CreateKey(input) => {
                session.advance(SessionState::Delegated);
                let issued = self.credentials.create(tenant, input).await?;
                Ok(GatewayResponse::Issued(issued))
            }

            Operation::ListKeys => {
                session.advance(SessionState::Delegated);
                Ok(GatewayResponse::Credentials(
                    self.credentials.list(tenant).await?,
                ))
            }

            Operation::GetKey { id } => {
                session.advance(SessionState::Delegated);
                Ok(GatewayResponse::Credential(
                    self.credentials.get(tenant, id).await?,
                ))
            }

            Operation::RevokeKey { id } => {
                session.advance(SessionState::Delegated);
                Ok(GatewayResponse::Credential(
                    self.credentials.revoke(tenant, id).await?,
                ))
            }

            Operation::Malformed(m) => Err(GatewayError::Validation(m.reason)),
        }
    }

    async fn create(
        &self,
        session: &mut Session,
        key: ResourceKey,
        config: ResourceConfig,
        trail: Option<AuditTrail>,
    ) -> GatewayResult<GatewayResponse> {
        let registry = self.registry.clone();
        session.advance(SessionState::ResourceResolved);
        session.advance(SessionState::Delegated);
        let created = detached(trail, async move { registry.create(&key, config).await }).await?;
        Ok(GatewayResponse::Resource(created))
    }
}

/// Run a registry mutation on its own task so it completes, and is audited,
/// even if the caller's future is dropped.
async fn detached<T, F>(trail: Option<AuditTrail>, mutation: F) -> GatewayResult<T>
where
    T: Send + 'static,
    F: Future<Output = GatewayResult<T>> + Send + 'static,
{
    let task = async move {
        let result = mutation.await;
        if let Some(trail) = trail {
            trail.record_result(&result);
        }
        result
    };
    tokio::spawn(task.in_current_span())
        .await
        .unwrap_or_else(|e| {
            Err(GatewayError::EngineFailure(EngineError::Internal(format!(
                "resource task failed: {}",
                e
            ))))
        })
}

fn visible(credential: &Credential, handles: Vec<ResourceHandle>) -> Vec<ResourceHandle> {
    handles
        .into_iter()
        .filter(|h| permission::is_visible(credential, &h.path))
        .collect()
}

fn table_dimension(handle: &ResourceHandle) -> GatewayResult<u32> {
    handle.config.dimension().ok_or_else(|| {
        GatewayError::Validation(format!("'{}' is not a table", handle.path))
    })
}

fn engine_handle(handle: &ResourceHandle) -> GatewayResult<&EngineHandle> {
    handle.engine_handle.as_ref().ok_or_else(|| {
        GatewayError::EngineFailure(EngineError::NotFound(format!(
            "'{}' has no engine handle",
            handle.path
        )))
    })
}

/// Who did what to which resource, for the audit log.
#[derive(Debug, Clone)]
struct AuditTrail {
    operation: &'static str,
    actor: Uuid,
    tenant: String,
    resource: Option<String>,
    client_ip: Option<String>,
}

impl AuditTrail {
    fn new(
        credential: &Credential,
        operation: &Operation,
        target: Option<&ResourcePath>,
        client_ip: Option<String>,
    ) -> Self {
        let resource = match operation {
            Operation::GetKey { id } | Operation::RevokeKey { id } => {
                Some(format!("credential:{}", id))
            }
            _ => target.map(ToString::to_string),
        };
        Self {
            operation: operation.name(),
            actor: credential.id,
            tenant: credential.tenant.clone(),
            resource,
            client_ip,
        }
    }

    fn event(&self, outcome: AuditOutcome) -> AuditEvent {
        AuditEvent::new(self.operation, outcome)
            .with_actor(Some(self.actor.to_string()))
            .with_tenant(Some(self.tenant.clone()))
            .with_resource(self.resource.clone())
            .with_ip(self.client_ip.clone())
    }

    fn record(&self, outcome: AuditOutcome) {
        self.event(outcome).log();
    }

    fn record_result<T>(&self, result: &GatewayResult<T>) {
        self.record(if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        });
    }
}
