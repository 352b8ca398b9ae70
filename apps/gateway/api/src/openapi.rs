use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Vector Gateway API",
        version = "0.1.0",
        description = "Multi-tenant API keys, databases, tables and vector search"
    ),
    servers(
        (url = "/api", description = "API base path")
    ),
    nest(
        (path = "/v1", api = domain_gateway::ApiDoc)
    )
)]
pub struct ApiDoc;
