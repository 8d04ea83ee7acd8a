//! Configuration for the activation server.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `config.toml` file
//! 3. Default values (lowest priority)
//!
//! The loaded [`ActivatorConfig`] is handed to the server at startup; nothing
//! in the crate reads configuration from global state.
//!
//! # Environment Variables
//!
//! - `ACTIVATOR_SERVER_HOST` - Server bind address
//! - `ACTIVATOR_SERVER_PORT` - Server port
//! - `ACTIVATOR_DATABASE_TYPE` - `sqlite`, `postgres` or `memory`
//! - `ACTIVATOR_DATABASE_URL` - Database connection URL
//! - `ACTIVATOR_DATABASE_TIMEOUT_MS` - Deadline for every store operation
//! - `ACTIVATOR_API_KEY` - Shared secret for `/verify_license`
//! - `ACTIVATOR_ADMIN_KEY` - Shared secret for the admin endpoints
//! - `ACTIVATOR_LOGGING_ENABLED` - Enable logging
//! - `ACTIVATOR_LOG_LEVEL` - Log level (trace, debug, info, warn, error)
//! - `ACTIVATOR_RATE_LIMIT_ENABLED` - Enable rate limiting (requires `rate-limiting` feature)

use config::{Config, ConfigBuilder};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::errors::{LicenseError, LicenseResult};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ActivatorConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Shared-secret authentication
    pub auth: AuthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Rate limiting (requires "rate-limiting" feature)
    pub rate_limit: RateLimitConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database type: "sqlite", "postgres" or "memory"
    pub db_type: String,
    /// SQLite connection URL
    pub sqlite_url: String,
    /// PostgreSQL connection URL
    pub postgres_url: String,
    /// Maximum pool size
    pub max_connections: u32,
    /// Deadline for a single store operation, in milliseconds
    pub timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".to_string(),
            sqlite_url: "sqlite://licenses.db?mode=rwc".to_string(),
            postgres_url: "postgres://localhost/licenses".to_string(),
            max_connections: 5,
            timeout_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    /// Store operation deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Shared-secret authentication.
///
/// Secrets may be written as `env:VAR_NAME` to read them from another
/// environment variable at startup.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Request header carrying the secret
    pub header_name: String,
    /// Secret required by `/verify_license`
    pub api_key: String,
    /// Secret required by the admin endpoints (falls back to `api_key`)
    pub admin_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header_name: "api_key".to_string(),
            api_key: String::new(),
            admin_key: String::new(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("header_name", &self.header_name)
            .field("api_key", &"<redacted>")
            .field("admin_key", &"<redacted>")
            .finish()
    }
}

impl AuthConfig {
    /// Secret for client verification calls.
    pub fn client_secret(&self) -> LicenseResult<String> {
        resolve_secret(&self.api_key, "auth.api_key")
    }

    /// Secret for admin calls.
    pub fn admin_secret(&self) -> LicenseResult<String> {
        if self.admin_key.is_empty() {
            self.client_secret()
        } else {
            resolve_secret(&self.admin_key, "auth.admin_key")
        }
    }
}

fn resolve_secret(raw: &str, field: &str) -> LicenseResult<String> {
    let secret = match raw.strip_prefix("env:") {
        Some(var) => env::var(var).map_err(|_| {
            LicenseError::ConfigError(format!(
                "environment variable '{var}' not found for {field}"
            ))
        })?,
        None => raw.to_string(),
    };

    if secret.is_empty() {
        return Err(LicenseError::ConfigError(format!("{field} cannot be empty")));
    }
    Ok(secret)
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
        }
    }
}

/// Rate limiting configuration for `/verify_license`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Verification requests per minute, per client IP
    pub verify_rpm: u32,
    /// Requests allowed above the steady rate in a short burst
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_rpm: 100,
            burst_size: 5,
        }
    }
}

fn config_err(e: config::ConfigError) -> LicenseError {
    LicenseError::ConfigError(e.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl ActivatorConfig {
    /// Load configuration from defaults, `config.toml` and the environment,
    /// then validate it.
    pub fn load() -> LicenseResult<Self> {
        Self::load_from("config")
    }

    /// Like [`ActivatorConfig::load`] but reads the named config file
    /// (extension optional) instead of `config`.
    pub fn load_from(file: &str) -> LicenseResult<Self> {
        let defaults = Self::default();

        let builder = Config::builder()
            .set_default("server.host", defaults.server.host.clone())
            .map_err(config_err)?
            .set_default("server.port", i64::from(defaults.server.port))
            .map_err(config_err)?
            .set_default("database.db_type", defaults.database.db_type.clone())
            .map_err(config_err)?
            .set_default("database.sqlite_url", defaults.database.sqlite_url.clone())
            .map_err(config_err)?
            .set_default("database.postgres_url", defaults.database.postgres_url.clone())
            .map_err(config_err)?
            .set_default(
                "database.max_connections",
                i64::from(defaults.database.max_connections),
            )
            .map_err(config_err)?
            .set_default("database.timeout_ms", defaults.database.timeout_ms as i64)
            .map_err(config_err)?
            .set_default("auth.header_name", defaults.auth.header_name.clone())
            .map_err(config_err)?
            .set_default("auth.api_key", "")
            .map_err(config_err)?
            .set_default("auth.admin_key", "")
            .map_err(config_err)?
            .set_default("logging.enabled", defaults.logging.enabled)
            .map_err(config_err)?
            .set_default("logging.level", defaults.logging.level.clone())
            .map_err(config_err)?
            .set_default("rate_limit.enabled", defaults.rate_limit.enabled)
            .map_err(config_err)?
            .set_default("rate_limit.verify_rpm", i64::from(defaults.rate_limit.verify_rpm))
            .map_err(config_err)?
            .set_default("rate_limit.burst_size", i64::from(defaults.rate_limit.burst_size))
            .map_err(config_err)?
            .add_source(config::File::with_name(file).required(false));

        let settings = Self::with_env_overrides(builder)?
            .build()
            .map_err(|e| LicenseError::ConfigError(format!("failed to build config: {e}")))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| LicenseError::ConfigError(format!("failed to deserialize config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> LicenseResult<ConfigBuilder<config::builder::DefaultState>> {
        let database_url = env::var("ACTIVATOR_DATABASE_URL").ok();

        builder
            .set_override_option("server.host", env::var("ACTIVATOR_SERVER_HOST").ok())
            .map_err(config_err)?
            .set_override_option("server.port", env_parsed::<i64>("ACTIVATOR_SERVER_PORT"))
            .map_err(config_err)?
            .set_override_option("database.db_type", env::var("ACTIVATOR_DATABASE_TYPE").ok())
            .map_err(config_err)?
            .set_override_option(
                "database.sqlite_url",
                database_url.clone().filter(|url| url.starts_with("sqlite")),
            )
            .map_err(config_err)?
            .set_override_option(
                "database.postgres_url",
                database_url.filter(|url| url.starts_with("postgres")),
            )
            .map_err(config_err)?
            .set_override_option(
                "database.timeout_ms",
                env_parsed::<i64>("ACTIVATOR_DATABASE_TIMEOUT_MS"),
            )
            .map_err(config_err)?
            .set_override_option("auth.api_key", env::var("ACTIVATOR_API_KEY").ok())
            .map_err(config_err)?
            .set_override_option("auth.admin_key", env::var("ACTIVATOR_ADMIN_KEY").ok())
            .map_err(config_err)?
            .set_override_option(
                "logging.enabled",
                env_parsed::<bool>("ACTIVATOR_LOGGING_ENABLED"),
            )
            .map_err(config_err)?
            .set_override_option("logging.level", env::var("ACTIVATOR_LOG_LEVEL").ok())
            .map_err(config_err)?
            .set_override_option(
                "rate_limit.enabled",
                env_parsed::<bool>("ACTIVATOR_RATE_LIMIT_ENABLED"),
            )
            .map_err(config_err)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> LicenseResult<()> {
        if self.server.port == 0 {
            return Err(LicenseError::ConfigError(
                "server.port must be greater than 0".to_string(),
            ));
        }

        match self.database.db_type.as_str() {
            "sqlite" | "postgres" | "memory" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "database.db_type must be 'sqlite', 'postgres' or 'memory', got '{other}'"
                )));
            }
        }

        if self.database.timeout_ms == 0 {
            return Err(LicenseError::ConfigError(
                "database.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(LicenseError::ConfigError(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if self.auth.header_name.trim().is_empty() {
            return Err(LicenseError::ConfigError(
                "auth.header_name cannot be empty".to_string(),
            ));
        }
        self.auth.client_secret()?;
        self.auth.admin_secret()?;

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        if self.rate_limit.enabled && self.rate_limit.verify_rpm == 0 {
            return Err(LicenseError::ConfigError(
                "rate_limit.verify_rpm must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address string the server binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
