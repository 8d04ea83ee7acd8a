//! Rate limiting middleware for `/verify_license`.
//!
//! Verification is the only endpoint reachable with the client secret, so it
//! is the one exposed to key-guessing. Limits are per client IP and come from
//! `config.toml` or environment variables.
//!
//! # Configuration
//!
//! ```toml
//! [rate_limit]
//! enabled = true
//! verify_rpm = 100   # /verify_license: 100 requests per minute
//! burst_size = 5     # Allow short bursts above the limit
//! ```
//!
//! Exceeding the limit yields 429 Too Many Requests with a Retry-After header.

use governor::middleware::NoOpMiddleware;
use std::sync::Arc;
use tower_governor::governor::GovernorConfigBuilder;

pub use tower_governor::key_extractor::SmartIpKeyExtractor;
pub use tower_governor::GovernorLayer;

use crate::config::RateLimitConfig;
use crate::errors::{LicenseError, LicenseResult};

/// Replenish interval for a requests-per-minute budget.
fn replenish_interval_ms(rpm: u32) -> u64 {
    if rpm > 0 {
        (60_000 / u64::from(rpm)).max(1)
    } else {
        60_000
    }
}

/// Create the rate limiting layer for the verification route.
///
/// Uses `SmartIpKeyExtractor`, which checks X-Forwarded-For and X-Real-IP
/// before falling back to the peer address.
///
/// # Important
///
/// The server must be started with
/// ```ignore
/// .into_make_service_with_connect_info::<SocketAddr>()
/// ```
/// for peer IP extraction to work.
pub fn create_verify_rate_limiter(
    config: &RateLimitConfig,
) -> LicenseResult<GovernorLayer<SmartIpKeyExtractor, NoOpMiddleware>> {
    let governor_config = GovernorConfigBuilder::default()
        .per_millisecond(replenish_interval_ms(config.verify_rpm))
        .burst_size(config.burst_size)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .ok_or_else(|| {
            LicenseError::ConfigError(format!(
                "invalid rate limit: verify_rpm={} burst_size={}",
                config.verify_rpm, config.burst_size
            ))
        })?;

    Ok(GovernorLayer {
        config: Arc::new(governor_config),
    })
}
