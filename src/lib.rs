//! Activator - a license activation server.
//!
//! Keys are added by an administrator, bound to the first machine that
//! verifies them and stay valid for a number of calendar months counted from
//! that first verification.
//!
//! # Features
//!
//! - `server` - HTTP server components (handlers, store). Enabled by default.
//! - `sqlite` - SQLite store backend. Enabled by default.
//! - `postgres` - PostgreSQL store backend.
//! - `rate-limiting` - Per-IP rate limiting on `/verify_license`.
//!
//! # Example
//!
//! ```toml
//! # Use defaults (server + sqlite)
//! netviper-activator = { path = "../activator" }
//!
//! # License model and config only
//! netviper-activator = { path = "../activator", default-features = false }
//!
//! # Server with PostgreSQL and rate limiting
//! netviper-activator = { path = "../activator", features = ["postgres", "rate-limiting"] }
//! ```

// Core modules (always available)
pub mod config;
pub mod errors;
pub mod license;

// Server-related modules (requires "server" feature)
#[cfg(feature = "server")]
#[path = "server/mod.rs"]
pub mod server;
