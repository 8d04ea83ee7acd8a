//! Request validation utilities for the activation API.
//!
//! This module provides validation functions for the fields the endpoints
//! accept. Every failure names the offending field.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::LicenseError;
use crate::license::MAX_DURATION_MONTHS;

lazy_static! {
    /// Printable ASCII without whitespace, 1 to 128 characters.
    static ref TOKEN_REGEX: Regex = Regex::new(r"^[!-~]{1,128}$").unwrap();
}

/// Validation error type.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for LicenseError {
    fn from(err: ValidationError) -> Self {
        LicenseError::Validation(err.to_string())
    }
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Unwrap a required field, rejecting absent values.
///
/// # Example
/// ```
/// use activator::server::validation::require;
///
/// assert_eq!(require(Some(5), "duration_months").unwrap(), 5);
/// assert!(require::<u32>(None, "duration_months").is_err());
/// ```
pub fn require<T>(value: Option<T>, field_name: &str) -> ValidationResult<T> {
    value.ok_or_else(|| ValidationError::new(field_name, "is required"))
}

/// Validate that a string is not empty or whitespace only.
///
/// # Example
/// ```
/// use activator::server::validation::validate_not_empty;
///
/// assert!(validate_not_empty("hello", "user_name").is_ok());
/// assert!(validate_not_empty("", "user_name").is_err());
/// assert!(validate_not_empty("   ", "user_name").is_err());
/// ```
pub fn validate_not_empty(value: &str, field_name: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        Err(ValidationError::new(field_name, "cannot be empty"))
    } else {
        Ok(())
    }
}

/// Validate string length is within bounds.
pub fn validate_length(
    value: &str,
    min: usize,
    max: usize,
    field_name: &str,
) -> ValidationResult<()> {
    let len = value.chars().count();
    if len < min {
        Err(ValidationError::new(
            field_name,
            format!("must be at least {min} characters"),
        ))
    } else if len > max {
        Err(ValidationError::new(
            field_name,
            format!("must be at most {max} characters"),
        ))
    } else {
        Ok(())
    }
}

/// Validate an opaque identifier (license key or machine identifier).
///
/// Identifiers are 1-128 printable ASCII characters without whitespace.
///
/// # Example
/// ```
/// use activator::server::validation::validate_identifier;
///
/// assert!(validate_identifier("ABC-123", "license_key").is_ok());
/// assert!(validate_identifier("dev 1", "machine_identifier").is_err());
/// assert!(validate_identifier("", "license_key").is_err());
/// ```
pub fn validate_identifier(value: &str, field_name: &str) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::new(field_name, "cannot be empty"));
    }
    if TOKEN_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new(
            field_name,
            "must be 1-128 printable ASCII characters without spaces",
        ))
    }
}

/// Validate a license duration in months.
pub fn validate_duration_months(value: i64, field_name: &str) -> ValidationResult<()> {
    if (1..=MAX_DURATION_MONTHS).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new(
            field_name,
            format!("must be between 1 and {MAX_DURATION_MONTHS}"),
        ))
    }
}
