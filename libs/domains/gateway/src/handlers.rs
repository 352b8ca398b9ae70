use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_helpers::{ErrorResponse, UuidPath, extract_ip_from_headers};
use std::sync::Arc;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::models::{
    Action, CreateCredential, CreateDatabase, CreateTable, CredentialView, DistanceMetric,
    InsertRows, InsertSummary, IssuedCredential, ListRows, Permission, ResourceConfig,
    ResourceHandle, ResourceState, RowPage, SearchHit, SearchRequest, VectorRecord,
};
use crate::session::{Gateway, GatewayRequest, GatewayResponse, MalformedRequest, Operation};

const AUTH_TAG: &str = "auth";
const RESOURCE_TAG: &str = "resources";
const DATA_TAG: &str = "data";

/// OpenAPI documentation for the gateway API
#[derive(OpenApi)]
#[openapi(
    paths(
        whoami,
        create_key,
        list_keys,
        get_key,
        revoke_key,
        list_databases,
        create_database,
        get_database,
        drop_database,
        list_tables,
        create_table,
        get_table,
        drop_table,
        insert_rows,
        search,
        list_rows,
    ),
    components(schemas(
        CredentialView,
        IssuedCredential,
        Permission,
        CreateCredential,
        ResourceHandle,
        ResourceConfig,
        ResourceState,
        DistanceMetric,
        CreateDatabase,
        CreateTable,
        InsertRows,
        VectorRecord,
        InsertSummary,
        SearchRequest,
        SearchHit,
        RowPage,
        ErrorResponse,
    )),
    tags(
        (name = AUTH_TAG, description = "Credential introspection and key management"),
        (name = RESOURCE_TAG, description = "Tenant databases and tables"),
        (name = DATA_TAG, description = "Row insertion, paging and vector search")
    )
)]
pub struct ApiDoc;

/// Every gateway endpoint. Nest it where the API is versioned.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/auth/me", get(whoami))
        .route("/auth/keys", get(list_keys).post(create_key))
        .route("/auth/keys/{id}", get(get_key).delete(revoke_key))
        .route("/databases", get(list_databases).post(create_database))
        .route(
            "/databases/{database}",
            get(get_database).delete(drop_database),
        )
        .route(
            "/databases/{database}/tables",
            get(list_tables).post(create_table),
        )
        .route(
            "/databases/{database}/tables/{table}",
            get(get_table).delete(drop_table),
        )
        .route("/databases/{database}/tables/{table}/rows", post(insert_rows))
        .route("/databases/{database}/tables/{table}/search", post(search))
        .route("/databases/{database}/tables/{table}/data", get(list_rows))
        .with_state(gateway)
}

/// Token from `Authorization: Bearer <token>`, scheme matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim().to_string())
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        match self {
            GatewayResponse::Credential(view) => Json(view).into_response(),
            GatewayResponse::Issued(issued) => (StatusCode::CREATED, Json(issued)).into_response(),
            GatewayResponse::Credentials(views) => Json(views).into_response(),
            GatewayResponse::Resource(created) => {
                let status = if created.created {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                };
                (status, Json(created.handle)).into_response()
            }
            GatewayResponse::Resources(handles) => Json(handles).into_response(),
            GatewayResponse::Dropped => StatusCode::NO_CONTENT.into_response(),
            GatewayResponse::Inserted(summary) => Json(summary).into_response(),
            GatewayResponse::Hits(hits) => Json(hits).into_response(),
            GatewayResponse::Rows(page) => Json(page).into_response(),
        }
    }
}

async fn dispatch(
    gateway: &Gateway,
    headers: &HeaderMap,
    operation: Operation,
) -> GatewayResult<GatewayResponse> {
    // A missing header is an empty token, which authentication rejects.
    let token = bearer_token(headers).unwrap_or_default();
    let request = GatewayRequest::new(token, operation)
        .with_client_ip(extract_ip_from_headers(headers));
    gateway.dispatch(request).await
}

/// Build the operation from a decoded body. An undecodable body still goes
/// through authentication, authorization and admission before it is
/// rejected as invalid.
fn decode<T, R: std::fmt::Display>(
    input: Result<T, R>,
    build: impl FnOnce(T) -> Operation,
    malformed: impl FnOnce(String) -> MalformedRequest,
) -> Operation {
    match input {
        Ok(value) => build(value),
        Err(rejection) => Operation::Malformed(malformed(rejection.to_string())),
    }
}

/// Describe the calling credential
#[utoipa::path(
    get,
    path = "/auth/me",
    tag = AUTH_TAG,
    responses(
        (status = 200, description = "Calling credential", body = CredentialView),
        (status = 401, description = "Missing, unknown or revoked key", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse)
    )
)]
async fn whoami(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::WhoAmI).await
}

/// Issue a new key in the caller's tenant. The secret is only returned here.
#[utoipa::path(
    post,
    path = "/auth/keys",
    tag = AUTH_TAG,
    request_body = CreateCredential,
    responses(
        (status = 201, description = "Key issued", body = IssuedCredential),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Unauthenticated", body = ErrorResponse),
        (status = 403, description = "Admin permission required", body = ErrorResponse)
    )
)]
async fn create_key(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    input: Result<Json<CreateCredential>, JsonRejection>,
) -> GatewayResult<GatewayResponse> {
    let operation = decode(input.map(|Json(v)| v), Operation::CreateKey, |reason| {
        MalformedRequest::new("credential.create", Action::AdminKeyManage, reason)
    });
    dispatch(&gateway, &headers, operation).await
}

/// List the tenant's keys, revoked ones included
#[utoipa::path(
    get,
    path = "/auth/keys",
    tag = AUTH_TAG,
    responses(
        (status = 200, description = "Keys of the tenant", body = Vec<CredentialView>),
        (status = 401, description = "Unauthenticated", body = ErrorResponse),
        (status = 403, description = "Admin permission required", body = ErrorResponse)
    )
)]
async fn list_keys(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::ListKeys).await
}

#[utoipa::path(
    get,
    path = "/auth/keys/{id}",
    tag = AUTH_TAG,
    params(("id" = Uuid, Path, description = "Key id")),
    responses(
        (status = 200, description = "Key metadata", body = CredentialView),
        (status = 400, description = "Invalid UUID", body = ErrorResponse),
        (status = 404, description = "No such key in this tenant", body = ErrorResponse)
    )
)]
async fn get_key(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    UuidPath(id): UuidPath,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::GetKey { id }).await
}

/// Revoke a key. Revoking twice is not an error.
#[utoipa::path(
    delete,
    path = "/auth/keys/{id}",
    tag = AUTH_TAG,
    params(("id" = Uuid, Path, description = "Key id")),
    responses(
        (status = 200, description = "Key revoked", body = CredentialView),
        (status = 404, description = "No such key in this tenant", body = ErrorResponse),
        (status = 503, description = "Metadata store unavailable", body = ErrorResponse)
    )
)]
async fn revoke_key(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    UuidPath(id): UuidPath,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::RevokeKey { id }).await
}

/// List databases visible to the caller
#[utoipa::path(
    get,
    path = "/databases",
    tag = RESOURCE_TAG,
    responses(
        (status = 200, description = "Databases of the tenant", body = Vec<ResourceHandle>),
        (status = 401, description = "Unauthenticated", body = ErrorResponse),
        (status = 403, description = "Read permission required", body = ErrorResponse)
    )
)]
async fn list_databases(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::ListDatabases).await
}

/// Create a database. Repeating an identical create returns the existing one.
#[utoipa::path(
    post,
    path = "/databases",
    tag = RESOURCE_TAG,
    request_body = CreateDatabase,
    responses(
        (status = 201, description = "Database created", body = ResourceHandle),
        (status = 200, description = "Identical database already exists", body = ResourceHandle),
        (status = 400, description = "Invalid name", body = ErrorResponse),
        (status = 409, description = "Exists with a different configuration", body = ErrorResponse),
        (status = 502, description = "Storage engine failure", body = ErrorResponse)
    )
)]
async fn create_database(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    input: Result<Json<CreateDatabase>, JsonRejection>,
) -> GatewayResult<GatewayResponse> {
    let operation = decode(input.map(|Json(v)| v), Operation::CreateDatabase, |reason| {
        MalformedRequest::new("database.create", Action::AdminCreate, reason)
    });
    dispatch(&gateway, &headers, operation).await
}

#[utoipa::path(
    get,
    path = "/databases/{database}",
    tag = RESOURCE_TAG,
    params(("database" = String, Path, description = "Database name")),
    responses(
        (status = 200, description = "Database", body = ResourceHandle),
        (status = 404, description = "Not found or not ready", body = ErrorResponse)
    )
)]
async fn get_database(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(database): Path<String>,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::GetDatabase { database }).await
}

/// Drop an empty database
#[utoipa::path(
    delete,
    path = "/databases/{database}",
    tag = RESOURCE_TAG,
    params(("database" = String, Path, description = "Database name")),
    responses(
        (status = 204, description = "Database dropped"),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Database still has tables", body = ErrorResponse),
        (status = 502, description = "Storage engine failure", body = ErrorResponse)
    )
)]
async fn drop_database(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(database): Path<String>,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::DropDatabase { database }).await
}

#[utoipa::path(
    get,
    path = "/databases/{database}/tables",
    tag = RESOURCE_TAG,
    params(("database" = String, Path, description = "Database name")),
    responses(
        (status = 200, description = "Tables of the database", body = Vec<ResourceHandle>),
        (status = 404, description = "Database not found", body = ErrorResponse)
    )
)]
async fn list_tables(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(database): Path<String>,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::ListTables { database }).await
}

#[utoipa::path(
    post,
    path = "/databases/{database}/tables",
    tag = RESOURCE_TAG,
    params(("database" = String, Path, description = "Database name")),
    request_body = CreateTable,
    responses(
        (status = 201, description = "Table created", body = ResourceHandle),
        (status = 200, description = "Identical table already exists", body = ResourceHandle),
        (status = 404, description = "Database not found", body = ErrorResponse),
        (status = 409, description = "Exists with a different configuration", body = ErrorResponse),
        (status = 502, description = "Storage engine failure", body = ErrorResponse)
    )
)]
async fn create_table(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(database): Path<String>,
    input: Result<Json<CreateTable>, JsonRejection>,
) -> GatewayResult<GatewayResponse> {
    let operation = decode(
        input.map(|Json(v)| v),
        |input| Operation::CreateTable {
            database: database.clone(),
            input,
        },
        |reason| {
            MalformedRequest::new("table.create", Action::AdminCreate, reason)
                .in_database(database.clone())
        },
    );
    dispatch(&gateway, &headers, operation).await
}

#[utoipa::path(
    get,
    path = "/databases/{database}/tables/{table}",
    tag = RESOURCE_TAG,
    params(
        ("database" = String, Path, description = "Database name"),
        ("table" = String, Path, description = "Table name")
    ),
    responses(
        (status = 200, description = "Table", body = ResourceHandle),
        (status = 404, description = "Not found or not ready", body = ErrorResponse)
    )
)]
async fn get_table(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path((database, table)): Path<(String, String)>,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::GetTable { database, table }).await
}

#[utoipa::path(
    delete,
    path = "/databases/{database}/tables/{table}",
    tag = RESOURCE_TAG,
    params(
        ("database" = String, Path, description = "Database name"),
        ("table" = String, Path, description = "Table name")
    ),
    responses(
        (status = 204, description = "Table dropped"),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 502, description = "Storage engine failure", body = ErrorResponse)
    )
)]
async fn drop_table(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path((database, table)): Path<(String, String)>,
) -> GatewayResult<GatewayResponse> {
    dispatch(&gateway, &headers, Operation::DropTable { database, table }).await
}

/// Insert rows. Every vector must match the table dimension.
#[utoipa::path(
    post,
    path = "/databases/{database}/tables/{table}/rows",
    tag = DATA_TAG,
    params(
        ("database" = String, Path, description = "Database name"),
        ("table" = String, Path, description = "Table name")
    ),
    request_body = InsertRows,
    responses(
        (status = 200, description = "Rows written", body = InsertSummary),
        (status = 400, description = "Dimension mismatch or empty batch", body = ErrorResponse),
        (status = 403, description = "Write permission required", body = ErrorResponse),
        (status = 404, description = "Table not found", body = ErrorResponse),
        (status = 502, description = "Storage engine failure", body = ErrorResponse)
    )
)]
async fn insert_rows(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path((database, table)): Path<(String, String)>,
    input: Result<Json<InsertRows>, JsonRejection>,
) -> GatewayResult<GatewayResponse> {
    let operation = decode(
        input.map(|Json(v)| v),
        |input| Operation::Insert {
            database: database.clone(),
            table: table.clone(),
            input,
        },
        |reason| {
            MalformedRequest::new("rows.insert", Action::Write, reason)
                .in_table(database.clone(), table.clone())
        },
    );
    dispatch(&gateway, &headers, operation).await
}

/// Nearest neighbours of a query vector
#[utoipa::path(
    post,
    path = "/databases/{database}/tables/{table}/search",
    tag = DATA_TAG,
    params(
        ("database" = String, Path, description = "Database name"),
        ("table" = String, Path, description = "Table name")
    ),
    request_body = SearchRequest,
    responses(
        (status = 200, description = "Hits, best first", body = Vec<SearchHit>),
        (status = 400, description = "Dimension mismatch or bad limit", body = ErrorResponse),
        (status = 404, description = "Table not found", body = ErrorResponse),
        (status = 502, description = "Storage engine failure", body = ErrorResponse)
    )
)]
async fn search(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path((database, table)): Path<(String, String)>,
    input: Result<Json<SearchRequest>, JsonRejection>,
) -> GatewayResult<GatewayResponse> {
    let operation = decode(
        input.map(|Json(v)| v),
        |input| Operation::Search {
            database: database.clone(),
            table: table.clone(),
            input,
        },
        |reason| {
            MalformedRequest::new("rows.search", Action::Read, reason)
                .in_table(database.clone(), table.clone())
        },
    );
    dispatch(&gateway, &headers, operation).await
}

/// Page through a table's rows in row-id order
#[utoipa::path(
    get,
    path = "/databases/{database}/tables/{table}/data",
    tag = DATA_TAG,
    params(
        ("database" = String, Path, description = "Database name"),
        ("table" = String, Path, description = "Table name"),
        ListRows
    ),
    responses(
        (status = 200, description = "Rows and the table's total row count", body = RowPage),
        (status = 400, description = "Bad limit or offset", body = ErrorResponse),
        (status = 403, description = "Read permission required", body = ErrorResponse),
        (status = 404, description = "Table not found", body = ErrorResponse),
        (status = 502, description = "Storage engine failure", body = ErrorResponse)
    )
)]
async fn list_rows(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path((database, table)): Path<(String, String)>,
    query: Result<Query<ListRows>, QueryRejection>,
) -> GatewayResult<GatewayResponse> {
    let operation = decode(
        query.map(|Query(q)| q),
        |query| Operation::ListRows {
            database: database.clone(),
            table: table.clone(),
            query,
        },
        |reason| {
            MalformedRequest::new("rows.list", Action::Read, reason)
                .in_table(database.clone(), table.clone())
        },
    );
    dispatch(&gateway, &headers, operation).await
}
