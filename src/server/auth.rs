//! Shared-secret authentication for the activation API.
//!
//! Every endpoint except `/health` requires a secret in a request header
//! (default `api_key`). The verification endpoint and the admin endpoints use
//! separate guards so they can carry different secrets.
//!
//! # Usage
//!
//! ```rust,ignore
//! use activator::server::auth::{require_secret, SecretGuard};
//!
//! let guard = SecretGuard::new("api_key", "s3cret")?;
//! let routes = Router::new()
//!     .route("/verify_license", post(verify_license_handler))
//!     .layer(axum::middleware::from_fn_with_state(guard, require_secret));
//! ```

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderName,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::AuthConfig;
use crate::errors::{LicenseError, LicenseResult};

/// Expected secret for one group of routes.
#[derive(Clone)]
pub struct SecretGuard {
    header: HeaderName,
    secret: Arc<[u8]>,
}

impl SecretGuard {
    pub fn new(header_name: &str, secret: &str) -> LicenseResult<Self> {
        if secret.is_empty() {
            return Err(LicenseError::ConfigError(
                "shared secret cannot be empty".to_string(),
            ));
        }
        let header = HeaderName::from_bytes(header_name.to_ascii_lowercase().as_bytes())
            .map_err(|e| {
                LicenseError::ConfigError(format!("invalid auth header name '{header_name}': {e}"))
            })?;

        Ok(Self {
            header,
            secret: Arc::from(secret.as_bytes()),
        })
    }

    /// Guard for `/verify_license`.
    pub fn client(config: &AuthConfig) -> LicenseResult<Self> {
        Self::new(&config.header_name, &config.client_secret()?)
    }

    /// Guard for the admin endpoints.
    pub fn admin(config: &AuthConfig) -> LicenseResult<Self> {
        Self::new(&config.header_name, &config.admin_secret()?)
    }

    /// Header the guard reads.
    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    /// Constant-time comparison against the expected secret.
    pub fn matches(&self, provided: &[u8]) -> bool {
        if provided.len() != self.secret.len() {
            // Burn a comparison so a length mismatch is not measurably faster.
            let _ = self.secret.ct_eq(&self.secret);
            return false;
        }
        provided.ct_eq(&self.secret).into()
    }
}

impl std::fmt::Debug for SecretGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretGuard")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Middleware rejecting requests whose secret header is missing or wrong.
pub async fn require_secret(
    State(guard): State<SecretGuard>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(guard.header())
        .map(|value| guard.matches(value.as_bytes()))
        .unwrap_or(false);

    if !authorized {
        warn!(
            path = %request.uri().path(),
            header = %guard.header(),
            "rejected request with missing or invalid secret"
        );
        return LicenseError::Unauthorized.into_response();
    }

    next.run(request).await
}
