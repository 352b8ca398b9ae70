//! HTTP tests for the gateway router.
//!
//! These drive `handlers::router` with `oneshot` against in-memory
//! collaborators: status codes, JSON bodies and headers only.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{CountingEngine, setup, setup_with, test_config};
use domain_gateway::config::RateLimitConfig;
use domain_gateway::{CredentialView, Permission, handlers};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;

async fn json_body<T: serde::de::DeserializeOwned>(body: Body) -> T {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn send(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn garbage(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap()
}

fn delete(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_whoami_requires_bearer_token() {
    let t = setup().await;
    let app = handlers::router(t.gateway.clone());

    let response = app.clone().oneshot(get("/auth/me", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["error"], "UNAUTHORIZED");

    let request = Request::builder()
        .uri("/auth/me")
        .header(header::AUTHORIZATION, format!("bEaReR {}", t.admin))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let me: CredentialView = json_body(response.into_body()).await;
    assert_eq!(me.tenant, "acme");
}

#[tokio::test]
async fn test_database_lifecycle_status_codes() {
    let t = setup().await;
    let app = handlers::router(t.gateway.clone());

    let create = || send("POST", "/databases", &t.admin, json!({ "name": "db1" }));

    let response = app.clone().oneshot(create()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let handle: Value = json_body(response.into_body()).await;
    assert_eq!(handle["database"], "db1");
    assert_eq!(handle["state"], "ready");
    assert_eq!(handle["config"]["kind"], "database");

    let response = app.clone().oneshot(create()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/databases", Some(&t.admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed: Vec<Value> = json_body(response.into_body()).await;
    assert_eq!(listed.len(), 1);

    let response = app
        .clone()
        .oneshot(delete("/databases/db1", &t.admin))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(get("/databases/db1", Some(&t.admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_table_rows_and_search() {
    let t = setup().await;
    let app = handlers::router(t.gateway.clone());

    app.clone()
        .oneshot(send("POST", "/databases", &t.admin, json!({ "name": "db1" })))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(send(
            "POST",
            "/databases/db1/tables",
            &t.admin,
            json!({ "name": "docs", "dimension": 2, "metric": "dot" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(get("/databases/db1/tables/docs", Some(&t.admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let table: Value = json_body(response.into_body()).await;
    assert_eq!(table["table"], "docs");
    assert_eq!(table["config"]["dimension"], 2);

    let response = app
        .clone()
        .oneshot(send(
            "POST",
            "/databases/db1/tables/docs/rows",
            &t.admin,
            json!({ "rows": [
                { "vector": [1.0, 0.0], "payload": { "title": "a" } },
                { "vector": [0.0, 1.0] }
            ] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary: Value = json_body(response.into_body()).await;
    assert_eq!(summary["inserted"], 2);

    let response = app
        .clone()
        .oneshot(send(
            "POST",
            "/databases/db1/tables/docs/search",
            &t.admin,
            json!({ "vector": [1.0, 0.0], "limit": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let hits: Vec<Value> = json_body(response.into_body()).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["payload"]["title"], "a");

    let response = app
        .oneshot(send(
            "POST",
            "/databases/db1/tables/docs/search",
            &t.admin,
            json!({ "vector": [1.0, 0.0, 0.0] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_body_needs_authentication_first() {
    let t = setup().await;
    let app = handlers::router(t.gateway.clone());

    let response = app
        .clone()
        .oneshot(garbage("/databases", "vgw_unknown"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(garbage("/databases", &t.admin)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_body_from_read_only_key_is_forbidden() {
    let t = setup().await;
    let reader = t.issue(&[Permission::Read], None).await;
    let app = handlers::router(t.gateway.clone());

    for uri in [
        "/databases",
        "/databases/db1/tables",
        "/databases/db1/tables/docs/rows",
        "/auth/keys",
    ] {
        let response = app.clone().oneshot(garbage(uri, &reader)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", uri);
    }
}

#[tokio::test]
async fn test_malformed_body_after_budget_is_spent_is_rate_limited() {
    let mut config = test_config();
    config.rate_limit = RateLimitConfig {
        capacity: 1.0,
        refill_per_sec: 0.001,
        idle_eviction: Duration::from_secs(600),
    };
    let t = setup_with(config, CountingEngine::new()).await;
    let app = handlers::router(t.gateway.clone());

    let response = app
        .clone()
        .oneshot(get("/auth/me", Some(&t.admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(garbage("/databases", &t.admin))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}

#[tokio::test]
async fn test_row_data_is_paged() {
    let t = setup().await;
    let app = handlers::router(t.gateway.clone());

    app.clone()
        .oneshot(send("POST", "/databases", &t.admin, json!({ "name": "db1" })))
        .await
        .unwrap();
    app.clone()
        .oneshot(send(
            "POST",
            "/databases/db1/tables",
            &t.admin,
            json!({ "name": "docs", "dimension": 2 }),
        ))
        .await
        .unwrap();
    let response = app
        .clone()
        .oneshot(send(
            "POST",
            "/databases/db1/tables/docs/rows",
            &t.admin,
            json!({ "rows": [
                { "vector": [1.0, 0.0], "payload": { "n": 1 } },
                { "vector": [0.0, 1.0], "payload": { "n": 2 } },
                { "vector": [1.0, 1.0], "payload": { "n": 3 } }
            ] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let reader = t.issue(&[Permission::Read], Some(&["db1"])).await;
    let response = app
        .clone()
        .oneshot(get("/databases/db1/tables/docs/data?limit=2", Some(&reader)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page: Value = json_body(response.into_body()).await;
    assert_eq!(page["total_rows"], 3);
    assert_eq!(page["rows"].as_array().unwrap().len(), 2);
    assert!(page["rows"][0]["vector"].is_array());

    let response = app
        .clone()
        .oneshot(get(
            "/databases/db1/tables/docs/data?limit=2&offset=2",
            Some(&reader),
        ))
        .await
        .unwrap();
    let page: Value = json_body(response.into_body()).await;
    assert_eq!(page["rows"].as_array().unwrap().len(), 1);
    assert_eq!(page["offset"], 2);

    let response = app
        .clone()
        .oneshot(get("/databases/db1/tables/docs/data?limit=abc", Some(&reader)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let outsider = t.issue(&[Permission::Read], Some(&["db2"])).await;
    let response = app
        .oneshot(get("/databases/db1/tables/docs/data", Some(&outsider)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_key_management_endpoints() {
    let t = setup().await;
    let app = handlers::router(t.gateway.clone());

    let response = app
        .clone()
        .oneshot(send(
            "POST",
            "/auth/keys",
            &t.admin,
            json!({ "name": "reader", "permissions": ["read"], "scope": ["db1"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let issued: Value = json_body(response.into_body()).await;
    let secret = issued["secret"].as_str().unwrap().to_string();
    let id = issued["id"].as_str().unwrap().to_string();
    assert_eq!(issued["scope"], json!(["db1"]));

    let response = app
        .clone()
        .oneshot(get("/auth/keys", Some(&secret)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(get(&format!("/auth/keys/{}", id), Some(&t.admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view: Value = json_body(response.into_body()).await;
    assert!(view.get("secret").is_none());

    let response = app
        .clone()
        .oneshot(delete(&format!("/auth/keys/{}", id), &t.admin))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/auth/me", Some(&secret)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(get("/auth/keys/not-a-uuid", Some(&t.admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rate_limited_response_has_retry_after() {
    let mut config = test_config();
    config.rate_limit = RateLimitConfig {
        capacity: 1.0,
        refill_per_sec: 0.5,
        idle_eviction: Duration::from_secs(600),
    };
    let t = setup_with(config, CountingEngine::new()).await;
    let app = handlers::router(t.gateway.clone());

    let response = app
        .clone()
        .oneshot(get("/auth/me", Some(&t.admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get("/auth/me", Some(&t.admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["error"], "RATE_LIMITED");
}
