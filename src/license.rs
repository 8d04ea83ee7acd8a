//! License record model and lifecycle rules.
//!
//! A record is created *fresh*, becomes *active* exactly once when a machine
//! first verifies it, and *expires* purely by the passage of time. Expiry is
//! never stored; it is derived from `activation_date + duration_months`.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "server")]
use sqlx::FromRow;

/// Longest validity accepted for a license (100 years).
pub const MAX_DURATION_MONTHS: i64 = 1200;

/// A license record as stored in the `licenses` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "server", derive(FromRow))]
pub struct LicenseRecord {
    pub license_key: String,
    pub user_name: String,
    pub license_type: String,
    pub duration_months: i64,
    pub activation_date: Option<NaiveDate>,
    pub is_used: bool,
    pub machine_identifier: Option<String>,
    pub is_deleted: bool,
}

/// Lifecycle state of a record relative to a requesting machine and a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseState {
    /// Never activated.
    Fresh,
    /// Bound to the requesting machine and inside the validity window.
    Active,
    /// Bound to some other machine.
    Foreign,
    /// Bound to the requesting machine but outside the validity window.
    Expired,
    /// Soft-deleted; never validates.
    Revoked,
}

impl LicenseRecord {
    /// Build a fresh, never-activated record.
    pub fn new(
        license_key: impl Into<String>,
        user_name: impl Into<String>,
        license_type: impl Into<String>,
        duration_months: i64,
    ) -> Self {
        Self {
            license_key: license_key.into(),
            user_name: user_name.into(),
            license_type: license_type.into(),
            duration_months,
            activation_date: None,
            is_used: false,
            machine_identifier: None,
            is_deleted: false,
        }
    }

    /// True while the record has never been activated.
    pub fn is_fresh(&self) -> bool {
        !self.is_used && self.activation_date.is_none()
    }

    /// Last valid day, or `None` if the record was never activated.
    pub fn expiration(&self) -> Option<NaiveDate> {
        self.activation_date
            .and_then(|date| add_months(date, self.duration_months))
    }

    /// Classify the record for `machine_identifier` on `today`.
    ///
    /// The window `[activation_date, expiration]` is inclusive at both ends.
    pub fn state(&self, machine_identifier: &str, today: NaiveDate) -> LicenseState {
        if self.is_deleted {
            return LicenseState::Revoked;
        }
        if self.is_fresh() {
            return LicenseState::Fresh;
        }
        if self.machine_identifier.as_deref() != Some(machine_identifier) {
            return LicenseState::Foreign;
        }

        match (self.activation_date, self.expiration()) {
            (Some(start), Some(end)) if start <= today && today <= end => LicenseState::Active,
            _ => LicenseState::Expired,
        }
    }
}

/// Calendar-month addition.
///
/// Days past the end of the target month clamp to its last day, so
/// 2024-01-31 plus one month is 2024-02-29. Returns `None` for
/// non-positive or out-of-range durations.
pub fn add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    if months <= 0 {
        return None;
    }
    let months = u32::try_from(months).ok()?;
    date.checked_add_months(Months::new(months))
}

/// Columns an administrator may change through `update_license`.
///
/// `license_key`, `is_used`, `activation_date` and `machine_identifier` are
/// absent on purpose: they are written only by activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseField {
    UserName,
    LicenseType,
    DurationMonths,
    IsDeleted,
}

impl LicenseField {
    pub const ALL: [LicenseField; 4] = [
        LicenseField::UserName,
        LicenseField::LicenseType,
        LicenseField::DurationMonths,
        LicenseField::IsDeleted,
    ];

    /// Column name as exposed by the API and used in the schema.
    pub fn column(&self) -> &'static str {
        match self {
            LicenseField::UserName => "user_name",
            LicenseField::LicenseType => "license_type",
            LicenseField::DurationMonths => "duration_months",
            LicenseField::IsDeleted => "is_deleted",
        }
    }

    /// Parse and type-check a JSON value for this column.
    pub fn parse_value(&self, value: &serde_json::Value) -> Result<FieldValue, String> {
        match self {
            LicenseField::UserName | LicenseField::LicenseType => match value {
                serde_json::Value::String(s) if !s.trim().is_empty() => {
                    Ok(FieldValue::Text(s.clone()))
                }
                _ => Err("expected a non-empty string".to_string()),
            },
            LicenseField::DurationMonths => {
                let months = match value {
                    serde_json::Value::Number(n) => n.as_i64(),
                    serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| "expected an integer number of months".to_string())?;

                if (1..=MAX_DURATION_MONTHS).contains(&months) {
                    Ok(FieldValue::Integer(months))
                } else {
                    Err(format!("must be between 1 and {MAX_DURATION_MONTHS}"))
                }
            }
            LicenseField::IsDeleted => match value {
                serde_json::Value::Bool(b) => Ok(FieldValue::Flag(*b)),
                serde_json::Value::Number(n) if n.as_i64() == Some(0) => Ok(FieldValue::Flag(false)),
                serde_json::Value::Number(n) if n.as_i64() == Some(1) => Ok(FieldValue::Flag(true)),
                _ => Err("expected a boolean or 0/1".to_string()),
            },
        }
    }

    /// True when `value` has the type this column stores.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (LicenseField::UserName, FieldValue::Text(_))
                | (LicenseField::LicenseType, FieldValue::Text(_))
                | (LicenseField::DurationMonths, FieldValue::Integer(_))
                | (LicenseField::IsDeleted, FieldValue::Flag(_))
        )
    }
}

impl fmt::Display for LicenseField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for LicenseField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LicenseField::ALL
            .into_iter()
            .find(|field| field.column() == s)
            .ok_or_else(|| {
                let allowed: Vec<&str> = LicenseField::ALL.iter().map(|f| f.column()).collect();
                format!("column '{s}' is not updatable (allowed: {})", allowed.join(", "))
            })
    }
}

/// A type-checked value for a [`LicenseField`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Flag(bool),
}

impl LicenseRecord {
    /// Apply a patch in place. Used by the in-memory store.
    pub fn apply(&mut self, field: LicenseField, value: &FieldValue) -> Result<(), String> {
        match (field, value) {
            (LicenseField::UserName, FieldValue::Text(s)) => self.user_name = s.clone(),
            (LicenseField::LicenseType, FieldValue::Text(s)) => self.license_type = s.clone(),
            (LicenseField::DurationMonths, FieldValue::Integer(n)) => self.duration_months = *n,
            (LicenseField::IsDeleted, FieldValue::Flag(b)) => self.is_deleted = *b,
            (field, value) => return Err(format!("value {value:?} does not fit column {field}")),
        }
        Ok(())
    }
}
