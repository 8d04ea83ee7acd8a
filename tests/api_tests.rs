//! Integration tests for the HTTP API.
//!
//! Each test builds the full router (auth guards, logging middleware) over a
//! fresh store and drives it with `oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use activator::config::RateLimitConfig;
use activator::license::add_months;
use activator::server::auth::SecretGuard;
use activator::server::database::Database;
use activator::server::handlers::AppState;
use activator::server::memory::MemoryStore;
use activator::server::routes::build_router;
use activator::server::ActivationEngine;

const CLIENT_SECRET: &str = "4y2b9tdg!2024";
const ADMIN_SECRET: &str = "admin-secret";

fn memory_db() -> Arc<Database> {
    Arc::new(Database::Memory(MemoryStore::new()))
}

#[cfg(feature = "sqlite")]
async fn sqlite_db() -> Arc<Database> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory sqlite");
    let db = Database::SQLite(pool);
    db.migrate().await.expect("failed to create licenses table");
    Arc::new(db)
}

/// Helper to build the router over `db`.
fn app_with(db: Arc<Database>) -> axum::Router {
    let engine = ActivationEngine::new(db.clone(), Duration::from_secs(5));
    let state = AppState::new(db, engine);
    let rate_limit = RateLimitConfig {
        enabled: false,
        ..RateLimitConfig::default()
    };

    build_router(
        state,
        SecretGuard::new("api_key", CLIENT_SECRET).unwrap(),
        SecretGuard::new("api_key", ADMIN_SECRET).unwrap(),
        &rate_limit,
    )
    .expect("failed to build router")
}

/// Helper to make a JSON request to the app.
async fn json_request(
    app: &axum::Router,
    method: &str,
    uri: &str,
    secret: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let body_bytes = body
        .map(|v| serde_json::to_vec(&v).unwrap())
        .unwrap_or_default();

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json");
    if let Some(secret) = secret {
        builder = builder.header("api_key", secret);
    }
    let request = builder.body(Body::from(body_bytes)).unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();

    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&body_bytes).unwrap_or(json!({}));

    (status, body)
}

async fn add_license(app: &axum::Router, key: &str, months: i64) -> (StatusCode, Value) {
    json_request(
        app,
        "POST",
        "/add_license",
        Some(ADMIN_SECRET),
        Some(json!({
            "license_key": key,
            "user_name": "Alice",
            "duration_months": months,
            "is_used": 0,
            "license_type": "pro"
        })),
    )
    .await
}

async fn verify(app: &axum::Router, key: &str, machine: &str) -> (StatusCode, Value) {
    json_request(
        app,
        "POST",
        "/verify_license",
        Some(CLIENT_SECRET),
        Some(json!({ "license_key": key, "machine_identifier": machine })),
    )
    .await
}

fn expected_valid_until(months: i64) -> String {
    add_months(Utc::now().date_naive(), months)
        .unwrap()
        .format("%Y-%m-%d")
        .to_string()
}

async fn first_use_binds_one_machine(app: axum::Router) {
    let (status, body) = add_license(&app, "ABC", 12).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "status": "success", "message": "License added successfully" })
    );

    let (status, body) = verify(&app, "ABC", "dev-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "status": "valid",
            "user": "Alice",
            "valid_until": expected_valid_until(12),
            "license_type": "pro"
        })
    );

    // Same machine keeps the original window.
    let (_, again) = verify(&app, "ABC", "dev-1").await;
    assert_eq!(again, body);

    let (status, body) = verify(&app, "ABC", "dev-2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "invalid" }));
}

#[tokio::test]
async fn first_use_binds_one_machine_memory() {
    first_use_binds_one_machine(app_with(memory_db())).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn first_use_binds_one_machine_sqlite() {
    first_use_binds_one_machine(app_with(sqlite_db().await)).await;
}

#[tokio::test]
async fn health_is_public() {
    let app = app_with(memory_db());
    let (status, body) = json_request(&app, "GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"]["db_type"], "memory");
    assert_eq!(body["database"]["connected"], true);
}

#[tokio::test]
async fn verify_requires_client_secret() {
    let app = app_with(memory_db());
    add_license(&app, "ABC", 12).await;
    let body = json!({ "license_key": "ABC", "machine_identifier": "dev-1" });

    let (status, resp) =
        json_request(&app, "POST", "/verify_license", None, Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(resp["error"], "Unauthorized");

    let (status, _) = json_request(
        &app,
        "POST",
        "/verify_license",
        Some("4y2b9tdg!2025"),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A rejected request must not have activated the key.
    let (_, resp) = verify(&app, "ABC", "dev-9").await;
    assert_eq!(resp["status"], "valid");
}

#[tokio::test]
async fn admin_routes_require_admin_secret() {
    let app = app_with(memory_db());

    let (status, _) = json_request(&app, "GET", "/list_licenses", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) =
        json_request(&app, "GET", "/list_licenses", Some(CLIENT_SECRET), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) =
        json_request(&app, "GET", "/list_licenses", Some(ADMIN_SECRET), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "success", "licenses": [] }));
}

#[tokio::test]
async fn verify_unknown_key_is_invalid() {
    let app = app_with(memory_db());
    let (status, body) = verify(&app, "NOPE", "dev-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "invalid" }));
}

#[tokio::test]
async fn verify_rejects_missing_and_malformed_fields() {
    let app = app_with(memory_db());

    let (status, body) = json_request(
        &app,
        "POST",
        "/verify_license",
        Some(CLIENT_SECRET),
        Some(json!({ "license_key": "ABC" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert!(body["error"].as_str().unwrap().contains("machine_identifier"));

    let (status, _) = verify(&app, "ABC", "dev 1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let app = app_with(memory_db());
    let request = Request::builder()
        .method("POST")
        .uri("/add_license")
        .header("Content-Type", "application/json")
        .header("api_key", ADMIN_SECRET)
        .body(Body::from("{not json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_add_fails() {
    let app = app_with(memory_db());
    add_license(&app, "ABC", 12).await;

    let (status, body) = add_license(&app, "ABC", 6).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "LICENSE_EXISTS");
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn duplicate_add_fails_sqlite() {
    let app = app_with(sqlite_db().await);
    add_license(&app, "ABC", 12).await;

    let (status, body) = add_license(&app, "ABC", 6).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "LICENSE_EXISTS");
}

#[tokio::test]
async fn add_rejects_invalid_bodies() {
    let app = app_with(memory_db());

    let cases = [
        // Expiry is derived from activation; a fixed date is refused.
        json!({
            "license_key": "K1", "user_name": "Alice", "duration_months": 12,
            "valid_until": "2030-01-01", "license_type": "pro"
        }),
        json!({
            "license_key": "K2", "user_name": "Alice", "duration_months": 12,
            "is_used": true, "license_type": "pro"
        }),
        json!({
            "license_key": "K3", "user_name": "Alice", "duration_months": 0,
            "license_type": "pro"
        }),
        json!({ "license_key": "K4", "user_name": "Alice", "license_type": "pro" }),
        json!({
            "license_key": "K 5", "user_name": "Alice", "duration_months": 12,
            "license_type": "pro"
        }),
    ];

    for body in cases {
        let (status, resp) =
            json_request(&app, "POST", "/add_license", Some(ADMIN_SECRET), Some(body.clone()))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body} gave {resp}");
    }

    let (_, listed) = json_request(&app, "GET", "/list_licenses", Some(ADMIN_SECRET), None).await;
    assert_eq!(listed["licenses"], json!([]));
}

#[tokio::test]
async fn update_only_touches_allowed_columns() {
    let app = app_with(memory_db());
    add_license(&app, "ABC", 12).await;

    for column in ["is_used", "machine_identifier", "activation_date", "license_key", "x; DROP TABLE licenses"] {
        let (status, body) = json_request(
            &app,
            "POST",
            "/update_license",
            Some(ADMIN_SECRET),
            Some(json!({ "license_key": "ABC", "column": column, "value": "dev-9" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "column {column}");
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    let (status, body) = json_request(
        &app,
        "POST",
        "/update_license",
        Some(ADMIN_SECRET),
        Some(json!({ "license_key": "ABC", "column": "user_name", "value": "Bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "status": "success", "message": "user_name updated successfully" })
    );

    let (_, body) = verify(&app, "ABC", "dev-1").await;
    assert_eq!(body["user"], "Bob");
}

#[tokio::test]
async fn update_duration_moves_expiry() {
    let app = app_with(memory_db());
    add_license(&app, "ABC", 12).await;
    verify(&app, "ABC", "dev-1").await;

    let (status, _) = json_request(
        &app,
        "POST",
        "/update_license",
        Some(ADMIN_SECRET),
        Some(json!({ "license_key": "ABC", "column": "duration_months", "value": 24 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = verify(&app, "ABC", "dev-1").await;
    assert_eq!(body["valid_until"], expected_valid_until(24));
}

#[tokio::test]
async fn update_rejects_mistyped_value_and_unknown_key() {
    let app = app_with(memory_db());
    add_license(&app, "ABC", 12).await;

    let (status, _) = json_request(
        &app,
        "POST",
        "/update_license",
        Some(ADMIN_SECRET),
        Some(json!({ "license_key": "ABC", "column": "duration_months", "value": "soon" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = json_request(
        &app,
        "POST",
        "/update_license",
        Some(ADMIN_SECRET),
        Some(json!({ "license_key": "NOPE", "column": "user_name", "value": "Bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "License key not found");
}

#[tokio::test]
async fn soft_delete_hides_and_revokes() {
    let app = app_with(memory_db());
    add_license(&app, "ABC", 12).await;
    add_license(&app, "DEF", 6).await;
    verify(&app, "ABC", "dev-1").await;

    let (status, body) = json_request(
        &app,
        "POST",
        "/delete_license",
        Some(ADMIN_SECRET),
        Some(json!({ "license_key": "ABC" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "status": "success", "message": "License soft deleted successfully" })
    );

    let (_, listed) = json_request(&app, "GET", "/list_licenses", Some(ADMIN_SECRET), None).await;
    let keys: Vec<&str> = listed["licenses"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["license_key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, vec!["DEF"]);

    let (_, body) = verify(&app, "ABC", "dev-1").await;
    assert_eq!(body, json!({ "status": "invalid" }));

    // Restoring through update brings the binding back unchanged.
    let (status, _) = json_request(
        &app,
        "POST",
        "/update_license",
        Some(ADMIN_SECRET),
        Some(json!({ "license_key": "ABC", "column": "is_deleted", "value": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = verify(&app, "ABC", "dev-1").await;
    assert_eq!(body["status"], "valid");
}

#[tokio::test]
async fn delete_unknown_key_is_not_found() {
    let app = app_with(memory_db());
    let (status, body) = json_request(
        &app,
        "POST",
        "/delete_license",
        Some(ADMIN_SECRET),
        Some(json!({ "license_key": "NOPE" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "LICENSE_NOT_FOUND");
}

#[tokio::test]
async fn list_reports_activation_state() {
    let app = app_with(memory_db());
    add_license(&app, "ABC", 12).await;
    add_license(&app, "DEF", 6).await;
    verify(&app, "ABC", "dev-1").await;

    let (status, body) =
        json_request(&app, "GET", "/list_licenses", Some(ADMIN_SECRET), None).await;
    assert_eq!(status, StatusCode::OK);

    let licenses = body["licenses"].as_array().unwrap();
    assert_eq!(licenses.len(), 2);

    let abc = &licenses[0];
    assert_eq!(abc["license_key"], "ABC");
    assert_eq!(abc["is_used"], true);
    assert_eq!(abc["machine_identifier"], "dev-1");
    assert_eq!(abc["valid_until"], expected_valid_until(12));

    let def = &licenses[1];
    assert_eq!(def["is_used"], false);
    assert_eq!(def["activation_date"], Value::Null);
    assert_eq!(def["valid_until"], Value::Null);
}

#[tokio::test]
async fn responses_carry_request_id() {
    let app = app_with(memory_db());
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
