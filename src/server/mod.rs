// src/server/mod.rs

//! Server-side components for the activation server.
//!
//! This module contains:
//! - `database`    → Store abstraction over SQLite/Postgres/in-memory
//! - `memory`      → In-memory store for tests and local runs
//! - `activation`  → Verification and first-use activation
//! - `handlers`    → Axum HTTP handlers for the license endpoints
//! - `routes`      → Router builder
//! - `auth`        → Shared-secret middleware
//! - `logging`     → Request logging and tracing setup
//! - `rate_limit`  → Rate limiting middleware (requires `rate-limiting` feature)
//! - `validation`  → Request validation utilities

pub mod activation;
pub mod auth;
pub mod database;
pub mod handlers;
pub mod logging;
pub mod memory;
pub mod routes;
pub mod validation;

#[cfg(feature = "rate-limiting")]
pub mod rate_limit;

pub use activation::{ActivationEngine, Verification, VerifiedLicense};
pub use auth::{require_secret, SecretGuard};
pub use database::{Activation, Database};
pub use handlers::{
    add_license_handler, delete_license_handler, health_handler, list_licenses_handler,
    update_license_handler, verify_license_handler, AppState, VerifyResponse,
};
pub use memory::MemoryStore;
pub use routes::build_router;

#[cfg(feature = "rate-limiting")]
pub use rate_limit::{create_verify_rate_limiter, SmartIpKeyExtractor};

pub use validation::{
    require, validate_duration_months, validate_identifier, validate_length, validate_not_empty,
    ValidationError, ValidationResult,
};
