use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{error, warn};

#[cfg(any(feature = "sqlite", feature = "postgres"))]
use sqlx::{query, query_as};

#[cfg(feature = "sqlite")]
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[cfg(feature = "postgres")]
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::DatabaseConfig;
use crate::errors::{LicenseError, LicenseResult};
use crate::license::{FieldValue, LicenseField, LicenseRecord, MAX_DURATION_MONTHS};
use crate::server::memory::MemoryStore;

/// Outcome of [`Database::compare_and_activate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// This call performed the Fresh → Active transition.
    Committed(LicenseRecord),
    /// The record was no longer fresh (or is gone); nothing was written.
    Stale,
}

/// Unified license store over SQLite, Postgres and process memory.
///
/// Available variants depend on enabled features:
/// - `sqlite` feature enables `Database::SQLite`
/// - `postgres` feature enables `Database::Postgres`
/// - `Database::Memory` is always available
#[derive(Debug, Clone)]
pub enum Database {
    #[cfg(feature = "sqlite")]
    SQLite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
    Memory(MemoryStore),
}

#[cfg(feature = "sqlite")]
const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS licenses (
    license_key        TEXT PRIMARY KEY,
    user_name          TEXT NOT NULL,
    license_type       TEXT NOT NULL,
    duration_months    INTEGER NOT NULL CHECK (duration_months > 0),
    activation_date    TEXT,
    is_used            INTEGER NOT NULL DEFAULT 0,
    machine_identifier TEXT,
    is_deleted         INTEGER NOT NULL DEFAULT 0,
    CHECK (
        (is_used = 0 AND activation_date IS NULL AND machine_identifier IS NULL)
        OR (is_used = 1 AND activation_date IS NOT NULL AND machine_identifier IS NOT NULL)
    )
)
"#;

#[cfg(feature = "postgres")]
const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS licenses (
    license_key        TEXT PRIMARY KEY,
    user_name          TEXT NOT NULL,
    license_type       TEXT NOT NULL,
    duration_months    BIGINT NOT NULL CHECK (duration_months > 0),
    activation_date    DATE,
    is_used            BOOLEAN NOT NULL DEFAULT FALSE,
    machine_identifier TEXT,
    is_deleted         BOOLEAN NOT NULL DEFAULT FALSE,
    CHECK (
        (NOT is_used AND activation_date IS NULL AND machine_identifier IS NULL)
        OR (is_used AND activation_date IS NOT NULL AND machine_identifier IS NOT NULL)
    )
)
"#;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
const RECORD_COLUMNS: &str = "license_key, user_name, license_type, duration_months, \
     activation_date, is_used, machine_identifier, is_deleted";

/// Fixed UPDATE statement for each patchable column.
#[cfg(feature = "sqlite")]
fn sqlite_patch_statement(field: LicenseField) -> &'static str {
    match field {
        LicenseField::UserName => "UPDATE licenses SET user_name = ? WHERE license_key = ?",
        LicenseField::LicenseType => "UPDATE licenses SET license_type = ? WHERE license_key = ?",
        LicenseField::DurationMonths => {
            "UPDATE licenses SET duration_months = ? WHERE license_key = ?"
        }
        LicenseField::IsDeleted => "UPDATE licenses SET is_deleted = ? WHERE license_key = ?",
    }
}

#[cfg(feature = "postgres")]
fn postgres_patch_statement(field: LicenseField) -> &'static str {
    match field {
        LicenseField::UserName => "UPDATE licenses SET user_name = $1 WHERE license_key = $2",
        LicenseField::LicenseType => "UPDATE licenses SET license_type = $1 WHERE license_key = $2",
        LicenseField::DurationMonths => {
            "UPDATE licenses SET duration_months = $1 WHERE license_key = $2"
        }
        LicenseField::IsDeleted => "UPDATE licenses SET is_deleted = $1 WHERE license_key = $2",
    }
}

/// Log a driver error with its operation and key, and wrap it.
#[cfg(any(feature = "sqlite", feature = "postgres"))]
fn storage_error(backend: &str, operation: &str, license_key: &str, e: sqlx::Error) -> LicenseError {
    error!(
        backend,
        operation,
        license_key,
        "database operation failed: {e}"
    );
    LicenseError::StorageError(format!("{operation} failed: {e}"))
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

#[cfg(feature = "postgres")]
fn is_serialization_failure(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("40001"))
}

impl Database {
    /// Connect to the store described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> LicenseResult<Arc<Self>> {
        match config.db_type.as_str() {
            "memory" => Ok(Arc::new(Database::Memory(MemoryStore::new()))),
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(config.timeout())
                    .connect(&config.sqlite_url)
                    .await
                    .map_err(|e| {
                        error!("Failed to connect to SQLite: {e}");
                        LicenseError::StorageError(format!("failed to connect to SQLite: {e}"))
                    })?;

                Ok(Arc::new(Database::SQLite(pool)))
            }
            #[cfg(not(feature = "sqlite"))]
            "sqlite" => Err(LicenseError::ConfigError(
                "SQLite support not compiled in. Enable the 'sqlite' feature.".to_string(),
            )),
            #[cfg(feature = "postgres")]
            "postgres" => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(config.timeout())
                    .connect(&config.postgres_url)
                    .await
                    .map_err(|e| {
                        error!("Failed to connect to PostgreSQL: {e}");
                        LicenseError::StorageError(format!(
                            "failed to connect to PostgreSQL: {e}"
                        ))
                    })?;

                Ok(Arc::new(Database::Postgres(pool)))
            }
            #[cfg(not(feature = "postgres"))]
            "postgres" => Err(LicenseError::ConfigError(
                "PostgreSQL support not compiled in. Enable the 'postgres' feature.".to_string(),
            )),
            other => Err(LicenseError::ConfigError(format!(
                "unsupported database type: {other}"
            ))),
        }
    }

    /// Backend name, for health reporting.
    pub fn backend(&self) -> &'static str {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            Database::Postgres(_) => "postgres",
            Database::Memory(_) => "memory",
        }
    }

    /// Create the `licenses` table if it does not exist yet.
    pub async fn migrate(&self) -> LicenseResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query(SQLITE_SCHEMA)
                    .execute(pool)
                    .await
                    .map_err(|e| storage_error("sqlite", "migrate", "-", e))?;
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query(POSTGRES_SCHEMA)
                    .execute(pool)
                    .await
                    .map_err(|e| storage_error("postgres", "migrate", "-", e))?;
            }
            Database::Memory(_) => {}
        }
        Ok(())
    }

    /// Round-trip to the backend.
    pub async fn ping(&self) -> LicenseResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query("SELECT 1")
                    .execute(pool)
                    .await
                    .map_err(|e| storage_error("sqlite", "ping", "-", e))?;
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query("SELECT 1")
                    .execute(pool)
                    .await
                    .map_err(|e| storage_error("postgres", "ping", "-", e))?;
            }
            Database::Memory(store) => {
                store.get("")?;
            }
        }
        Ok(())
    }

    /// Fetch a license by key, including soft-deleted ones.
    ///
    /// Returns:
    /// - `Ok(Some(LicenseRecord))` if found
    /// - `Ok(None)` if not found
    /// - `Err(LicenseError::StorageError)` on DB failure
    pub async fn get_license(&self, license_key: &str) -> LicenseResult<Option<LicenseRecord>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_as::<_, LicenseRecord>(&format!(
                "SELECT {RECORD_COLUMNS} FROM licenses WHERE license_key = ?"
            ))
            .bind(license_key)
            .fetch_optional(pool)
            .await
            .map_err(|e| storage_error("sqlite", "get_license", license_key, e)),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_as::<_, LicenseRecord>(&format!(
                "SELECT {RECORD_COLUMNS} FROM licenses WHERE license_key = $1"
            ))
            .bind(license_key)
            .fetch_optional(pool)
            .await
            .map_err(|e| storage_error("postgres", "get_license", license_key, e)),
            Database::Memory(store) => store.get(license_key),
        }
    }

    /// Insert a new, fresh license.
    ///
    /// Fails with `LicenseError::Conflict` if the key already exists; the
    /// existing row is left untouched. Durations outside 1..=1200 months are
    /// a `LicenseError::Validation` on every backend.
    pub async fn create_license(&self, record: &LicenseRecord) -> LicenseResult<()> {
        if !(1..=MAX_DURATION_MONTHS).contains(&record.duration_months) {
            return Err(LicenseError::Validation(format!(
                "duration_months must be between 1 and {MAX_DURATION_MONTHS}"
            )));
        }

        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query(
                    "INSERT INTO licenses (license_key, user_name, license_type, duration_months) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&record.license_key)
                .bind(&record.user_name)
                .bind(&record.license_type)
                .bind(record.duration_months)
                .execute(pool)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        warn!(license_key = %record.license_key, "duplicate license key");
                        LicenseError::Conflict(record.license_key.clone())
                    } else {
                        storage_error("sqlite", "create_license", &record.license_key, e)
                    }
                })?;
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query(
                    "INSERT INTO licenses (license_key, user_name, license_type, duration_months) \
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(&record.license_key)
                .bind(&record.user_name)
                .bind(&record.license_type)
                .bind(record.duration_months)
                .execute(pool)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        warn!(license_key = %record.license_key, "duplicate license key");
                        LicenseError::Conflict(record.license_key.clone())
                    } else {
                        storage_error("postgres", "create_license", &record.license_key, e)
                    }
                })?;
            }
            Database::Memory(store) => store.create(record.clone())?,
        }

        Ok(())
    }

    /// Write one allow-listed column.
    ///
    /// Returns:
    /// - `Ok(true)` if a row was updated
    /// - `Ok(false)` if no license has this key
    pub async fn patch_field(
        &self,
        license_key: &str,
        field: LicenseField,
        value: &FieldValue,
    ) -> LicenseResult<bool> {
        if !field.accepts(value) {
            return Err(LicenseError::Validation(format!(
                "value {value:?} does not fit column {field}"
            )));
        }

        let rows_affected = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                let statement = query(sqlite_patch_statement(field));
                let statement = match value {
                    FieldValue::Text(s) => statement.bind(s.clone()),
                    FieldValue::Integer(n) => statement.bind(*n),
                    FieldValue::Flag(b) => statement.bind(*b),
                };
                statement
                    .bind(license_key)
                    .execute(pool)
                    .await
                    .map_err(|e| storage_error("sqlite", "patch_field", license_key, e))?
                    .rows_affected()
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                let statement = query(postgres_patch_statement(field));
                let statement = match value {
                    FieldValue::Text(s) => statement.bind(s.clone()),
                    FieldValue::Integer(n) => statement.bind(*n),
                    FieldValue::Flag(b) => statement.bind(*b),
                };
                statement
                    .bind(license_key)
                    .execute(pool)
                    .await
                    .map_err(|e| storage_error("postgres", "patch_field", license_key, e))?
                    .rows_affected()
            }
            Database::Memory(store) => u64::from(store.patch(license_key, field, value)?),
        };

        Ok(rows_affected > 0)
    }

    /// Set the soft-delete flag.
    ///
    /// Returns `Ok(false)` if no license has this key.
    pub async fn soft_delete(&self, license_key: &str) -> LicenseResult<bool> {
        let rows_affected = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query("UPDATE licenses SET is_deleted = 1 WHERE license_key = ?")
                .bind(license_key)
                .execute(pool)
                .await
                .map_err(|e| storage_error("sqlite", "soft_delete", license_key, e))?
                .rows_affected(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query("UPDATE licenses SET is_deleted = TRUE WHERE license_key = $1")
                    .bind(license_key)
                    .execute(pool)
                    .await
                    .map_err(|e| storage_error("postgres", "soft_delete", license_key, e))?
                    .rows_affected()
            }
            Database::Memory(store) => u64::from(store.soft_delete(license_key)?),
        };

        Ok(rows_affected > 0)
    }

    /// All licenses that are not soft-deleted, ordered by key.
    pub async fn list_licenses(&self) -> LicenseResult<Vec<LicenseRecord>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_as::<_, LicenseRecord>(&format!(
                "SELECT {RECORD_COLUMNS} FROM licenses WHERE is_deleted = 0 ORDER BY license_key"
            ))
            .fetch_all(pool)
            .await
            .map_err(|e| storage_error("sqlite", "list_licenses", "-", e)),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_as::<_, LicenseRecord>(&format!(
                "SELECT {RECORD_COLUMNS} FROM licenses WHERE NOT is_deleted ORDER BY license_key"
            ))
            .fetch_all(pool)
            .await
            .map_err(|e| storage_error("postgres", "list_licenses", "-", e)),
            Database::Memory(store) => store.list(),
        }
    }

    /// Atomically bind a fresh license to `machine_identifier`.
    ///
    /// The conditional update only matches a row that is still fresh and not
    /// soft-deleted, so concurrent callers race on a single row write and
    /// exactly one of them commits. Every other path rolls the transaction
    /// back, including the future being dropped by a timeout.
    pub async fn compare_and_activate(
        &self,
        license_key: &str,
        machine_identifier: &str,
        activation_date: NaiveDate,
    ) -> LicenseResult<Activation> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                let fail = |e| storage_error("sqlite", "compare_and_activate", license_key, e);
                let mut tx = pool.begin().await.map_err(fail)?;

                let updated = query(
                    "UPDATE licenses \
                     SET is_used = 1, activation_date = ?, machine_identifier = ? \
                     WHERE license_key = ? AND is_used = 0 AND activation_date IS NULL \
                     AND is_deleted = 0",
                )
                .bind(activation_date)
                .bind(machine_identifier)
                .bind(license_key)
                .execute(&mut *tx)
                .await
                .map_err(fail)?
                .rows_affected();

                if updated != 1 {
                    tx.rollback().await.map_err(fail)?;
                    return Ok(Activation::Stale);
                }

                let record = query_as::<_, LicenseRecord>(&format!(
                    "SELECT {RECORD_COLUMNS} FROM licenses WHERE license_key = ?"
                ))
                .bind(license_key)
                .fetch_one(&mut *tx)
                .await
                .map_err(fail)?;

                tx.commit().await.map_err(fail)?;
                Ok(Activation::Committed(record))
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                let fail = |e| storage_error("postgres", "compare_and_activate", license_key, e);
                let mut tx = pool.begin().await.map_err(fail)?;

                query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                    .execute(&mut *tx)
                    .await
                    .map_err(fail)?;

                let updated = query_as::<_, LicenseRecord>(&format!(
                    "UPDATE licenses \
                     SET is_used = TRUE, activation_date = $1, machine_identifier = $2 \
                     WHERE license_key = $3 AND NOT is_used AND activation_date IS NULL \
                     AND NOT is_deleted \
                     RETURNING {RECORD_COLUMNS}"
                ))
                .bind(activation_date)
                .bind(machine_identifier)
                .bind(license_key)
                .fetch_optional(&mut *tx)
                .await;

                let record = match updated {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        tx.rollback().await.map_err(fail)?;
                        return Ok(Activation::Stale);
                    }
                    // Lost a serialization race: the winner's commit is visible to a re-read.
                    Err(e) if is_serialization_failure(&e) => {
                        warn!(license_key, "activation lost serialization race");
                        return Ok(Activation::Stale);
                    }
                    Err(e) => return Err(fail(e)),
                };

                match tx.commit().await {
                    Ok(()) => Ok(Activation::Committed(record)),
                    Err(e) if is_serialization_failure(&e) => {
                        warn!(license_key, "activation commit lost serialization race");
                        Ok(Activation::Stale)
                    }
                    Err(e) => Err(fail(e)),
                }
            }
            Database::Memory(store) => {
                store.compare_and_activate(license_key, machine_identifier, activation_date)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_patch_statements_are_fixed_per_column() {
        for field in LicenseField::ALL {
            let sql = sqlite_patch_statement(field);
            assert!(sql.contains(field.column()));
            assert!(sql.ends_with("WHERE license_key = ?"));
        }
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn postgres_patch_statements_are_fixed_per_column() {
        for field in LicenseField::ALL {
            let sql = postgres_patch_statement(field);
            assert!(sql.contains(field.column()));
            assert!(sql.ends_with("WHERE license_key = $2"));
        }
    }

    #[tokio::test]
    async fn patch_rejects_mistyped_values() {
        let db = Database::Memory(MemoryStore::new());
        db.create_license(&LicenseRecord::new("ABC", "Alice", "pro", 12))
            .await
            .unwrap();

        let err = db
            .patch_field("ABC", LicenseField::DurationMonths, &FieldValue::Flag(true))
            .await
            .unwrap_err();
        assert!(matches!(err, LicenseError::Validation(_)));
    }

    #[tokio::test]
    async fn memory_backend_reports_name() {
        let db = Database::Memory(MemoryStore::new());
        assert_eq!(db.backend(), "memory");
        assert!(db.ping().await.is_ok());
        assert!(db.migrate().await.is_ok());
    }
}
