use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::errors::{LicenseError, LicenseResult};
use crate::license::{LicenseField, LicenseRecord};
use crate::server::activation::{with_deadline, ActivationEngine, Verification};
use crate::server::database::Database;
use crate::server::logging::{log_license_event, HealthResponse, LicenseEvent};
use crate::server::validation::{
    require, validate_duration_months, validate_identifier, validate_length, validate_not_empty,
};

/// Shared application state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub engine: ActivationEngine,
}

impl AppState {
    pub fn new(db: Arc<Database>, engine: ActivationEngine) -> Self {
        Self { db, engine }
    }
}

/// Standard error response body for HTTP errors.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

/// Map internal LicenseError into an HTTP response Axum understands.
///
/// Storage and server failures are logged here and answered with a generic
/// message; their details never reach the caller.
impl IntoResponse for LicenseError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            LicenseError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            LicenseError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            LicenseError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "License key not found".to_string())
            }
            LicenseError::Conflict(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "License key already exists".to_string(),
            ),
            LicenseError::StorageError(_)
            | LicenseError::Timeout(_)
            | LicenseError::ConfigError(_)
            | LicenseError::ServerError(_) => {
                error!(code = self.code(), "request failed: {self}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: message,
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for LicenseError {
    fn from(rejection: JsonRejection) -> Self {
        LicenseError::Validation(rejection.body_text())
    }
}

/// Generic success body for admin operations.
#[derive(Debug, Deserialize, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
}

impl StatusResponse {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Verification
// ============================================================================

/// Request body for `/verify_license`.
#[derive(Debug, Deserialize, Serialize)]
pub struct VerifyRequest {
    pub license_key: Option<String>,
    pub machine_identifier: Option<String>,
}

/// Response body for `/verify_license`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum VerifyResponse {
    Valid {
        user: String,
        valid_until: NaiveDate,
        license_type: String,
    },
    Invalid,
}

impl From<Verification> for VerifyResponse {
    fn from(verification: Verification) -> Self {
        match verification {
            Verification::Valid(details) => VerifyResponse::Valid {
                user: details.user,
                valid_until: details.valid_until,
                license_type: details.license_type,
            },
            Verification::Invalid => VerifyResponse::Invalid,
        }
    }
}

/// Handler for verifying a license and activating it on first use.
///
/// `POST /verify_license`
pub async fn verify_license_handler(
    State(state): State<AppState>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> LicenseResult<Json<VerifyResponse>> {
    let Json(payload) = payload?;

    let license_key = require(payload.license_key, "license_key")?;
    let machine_identifier = require(payload.machine_identifier, "machine_identifier")?;
    validate_identifier(&license_key, "license_key")?;
    validate_identifier(&machine_identifier, "machine_identifier")?;

    info!(
        "Verifying license_key={} for machine_identifier={}",
        license_key, machine_identifier
    );

    let verification = state
        .engine
        .verify(&license_key, &machine_identifier)
        .await
        .inspect_err(|e| {
            warn!(license_key = %license_key, operation = "verify", "verification failed: {e}");
        })?;

    Ok(Json(verification.into()))
}

// ============================================================================
// Admin CRUD
// ============================================================================

/// Accepts `false`/`true` or `0`/`1`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Int(i64),
}

impl Flag {
    pub fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Int(n) => *n != 0,
        }
    }
}

/// Request body for `/add_license`.
///
/// Unknown fields are refused, so a `valid_until` body is a 400 rather than
/// being silently ignored.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AddLicenseRequest {
    pub license_key: Option<String>,
    pub user_name: Option<String>,
    pub duration_months: Option<i64>,
    pub is_used: Option<Flag>,
    pub license_type: Option<String>,
}

/// Handler for adding a fresh license.
///
/// `POST /add_license`
pub async fn add_license_handler(
    State(state): State<AppState>,
    payload: Result<Json<AddLicenseRequest>, JsonRejection>,
) -> LicenseResult<Json<StatusResponse>> {
    let Json(payload) = payload?;

    let license_key = require(payload.license_key, "license_key")?;
    let user_name = require(payload.user_name, "user_name")?;
    let license_type = require(payload.license_type, "license_type")?;
    let duration_months = require(payload.duration_months, "duration_months")?;

    validate_identifier(&license_key, "license_key")?;
    validate_not_empty(&user_name, "user_name")?;
    validate_length(&user_name, 1, 256, "user_name")?;
    validate_not_empty(&license_type, "license_type")?;
    validate_length(&license_type, 1, 64, "license_type")?;
    validate_duration_months(duration_months, "duration_months")?;

    if payload.is_used.is_some_and(|flag| flag.is_set()) {
        return Err(LicenseError::Validation(
            "is_used: licenses are created unused and activate on first verification"
                .to_string(),
        ));
    }

    let record = LicenseRecord::new(license_key, user_name, license_type, duration_months);

    with_deadline(
        state.engine.timeout(),
        "create_license",
        state.db.create_license(&record),
    )
    .await?;

    log_license_event(LicenseEvent::Created, &record.license_key, None);

    Ok(Json(StatusResponse::success("License added successfully")))
}

/// Request body for `/update_license`.
#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateLicenseRequest {
    pub license_key: Option<String>,
    pub column: Option<String>,
    pub value: Option<serde_json::Value>,
}

/// Handler for patching one allow-listed column.
///
/// `POST /update_license`
pub async fn update_license_handler(
    State(state): State<AppState>,
    payload: Result<Json<UpdateLicenseRequest>, JsonRejection>,
) -> LicenseResult<Json<StatusResponse>> {
    let Json(payload) = payload?;

    let license_key = require(payload.license_key, "license_key")?;
    let column = require(payload.column, "column")?;
    let value = require(payload.value, "value")?;
    validate_identifier(&license_key, "license_key")?;

    let field: LicenseField = column.parse().map_err(|msg| {
        warn!(license_key = %license_key, column = %column, "rejected update of non-updatable column");
        LicenseError::Validation(msg)
    })?;
    let value = field
        .parse_value(&value)
        .map_err(|msg| LicenseError::Validation(format!("{field}: {msg}")))?;

    let updated = with_deadline(
        state.engine.timeout(),
        "patch_field",
        state.db.patch_field(&license_key, field, &value),
    )
    .await?;

    if !updated {
        return Err(LicenseError::NotFound(license_key));
    }

    log_license_event(LicenseEvent::Updated, &license_key, Some(field.column()));

    Ok(Json(StatusResponse::success(format!(
        "{field} updated successfully"
    ))))
}

/// Request body for `/delete_license`.
#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteLicenseRequest {
    pub license_key: Option<String>,
}

/// Handler for soft-deleting a license.
///
/// `POST /delete_license`
pub async fn delete_license_handler(
    State(state): State<AppState>,
    payload: Result<Json<DeleteLicenseRequest>, JsonRejection>,
) -> LicenseResult<Json<StatusResponse>> {
    let Json(payload) = payload?;

    let license_key = require(payload.license_key, "license_key")?;
    validate_identifier(&license_key, "license_key")?;

    let deleted = with_deadline(
        state.engine.timeout(),
        "soft_delete",
        state.db.soft_delete(&license_key),
    )
    .await?;

    if !deleted {
        return Err(LicenseError::NotFound(license_key));
    }

    log_license_event(LicenseEvent::Deleted, &license_key, None);

    Ok(Json(StatusResponse::success(
        "License soft deleted successfully",
    )))
}

/// One license as returned by `/list_licenses`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LicenseView {
    pub license_key: String,
    pub user_name: String,
    pub license_type: String,
    pub duration_months: i64,
    pub is_used: bool,
    pub activation_date: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
    pub machine_identifier: Option<String>,
}

impl From<LicenseRecord> for LicenseView {
    fn from(record: LicenseRecord) -> Self {
        let valid_until = record.expiration();
        Self {
            license_key: record.license_key,
            user_name: record.user_name,
            license_type: record.license_type,
            duration_months: record.duration_months,
            is_used: record.is_used,
            activation_date: record.activation_date,
            valid_until,
            machine_identifier: record.machine_identifier,
        }
    }
}

/// Response body for `/list_licenses`.
#[derive(Debug, Deserialize, Serialize)]
pub struct ListLicensesResponse {
    pub status: String,
    pub licenses: Vec<LicenseView>,
}

/// Handler for listing all licenses that are not soft-deleted.
///
/// `GET /list_licenses`
pub async fn list_licenses_handler(
    State(state): State<AppState>,
) -> LicenseResult<Json<ListLicensesResponse>> {
    let records = with_deadline(
        state.engine.timeout(),
        "list_licenses",
        state.db.list_licenses(),
    )
    .await?;

    info!("Listing {} licenses", records.len());

    Ok(Json(ListLicensesResponse {
        status: "success".to_string(),
        licenses: records.into_iter().map(LicenseView::from).collect(),
    }))
}

/// Handler for the unauthenticated health probe.
///
/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected = with_deadline(state.engine.timeout(), "ping", state.db.ping())
        .await
        .is_ok();

    Json(HealthResponse::new(connected, state.db.backend()))
}
