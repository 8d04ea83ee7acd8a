use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
#[cfg(not(feature = "rate-limiting"))]
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::errors::LicenseResult;
use crate::server::auth::{require_secret, SecretGuard};
use crate::server::handlers::{
    add_license_handler, delete_license_handler, health_handler, list_licenses_handler,
    update_license_handler, verify_license_handler, AppState,
};
use crate::server::logging::request_logging_middleware;

/// Build the application router for the activation server.
///
/// # Routes
///
/// ## Client endpoint (client secret)
/// - `POST /verify_license` - Verify a key, activating it on first use
///
/// ## Admin endpoints (admin secret)
/// - `POST /add_license` - Add a fresh license
/// - `POST /update_license` - Patch one allow-listed column
/// - `POST /delete_license` - Soft-delete a license
/// - `GET /list_licenses` - List licenses that are not deleted
///
/// ## Public
/// - `GET /health` - Liveness and store connectivity
///
/// When `rate_limit.enabled` is set and the `rate-limiting` feature is
/// compiled in, `/verify_license` is limited per client IP.
pub fn build_router(
    state: AppState,
    client_guard: SecretGuard,
    admin_guard: SecretGuard,
    rate_limit: &RateLimitConfig,
) -> LicenseResult<Router> {
    let verify = Router::new()
        .route("/verify_license", post(verify_license_handler))
        .route_layer(from_fn_with_state(client_guard, require_secret));

    #[cfg(feature = "rate-limiting")]
    let verify = if rate_limit.enabled {
        verify.layer(crate::server::rate_limit::create_verify_rate_limiter(
            rate_limit,
        )?)
    } else {
        verify
    };

    #[cfg(not(feature = "rate-limiting"))]
    if rate_limit.enabled {
        warn!("rate_limit.enabled is set but the `rate-limiting` feature is not compiled in");
    }

    let admin = Router::new()
        .route("/add_license", post(add_license_handler))
        .route("/update_license", post(update_license_handler))
        .route("/delete_license", post(delete_license_handler))
        .route("/list_licenses", get(list_licenses_handler))
        .route_layer(from_fn_with_state(admin_guard, require_secret));

    let router = Router::new()
        .route("/health", get(health_handler))
        .merge(verify)
        .merge(admin)
        .layer(from_fn(request_logging_middleware))
        .with_state(state);

    Ok(router)
}
