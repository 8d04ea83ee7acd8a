//! License verification and one-time activation.
//!
//! `verify` loads the record, classifies it for the requesting machine and,
//! on first use, binds it through [`Database::compare_and_activate`]. A caller
//! that loses the activation race is re-evaluated against the winner's
//! committed record, so it sees the key as bound to another machine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{LicenseError, LicenseResult};
use crate::license::{LicenseRecord, LicenseState};
use crate::server::database::{Activation, Database};
use crate::server::logging::{log_license_binding_event, log_license_event, LicenseEvent};

/// Details returned for a valid license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedLicense {
    pub user: String,
    pub license_type: String,
    pub valid_until: NaiveDate,
}

/// Outcome of a verification.
///
/// Invalid deliberately carries no reason: unknown keys, foreign machines,
/// expired and revoked licenses all look the same to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid(VerifiedLicense),
    Invalid,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid(_))
    }
}

/// Decides verification outcomes and performs first-use activation.
#[derive(Debug, Clone)]
pub struct ActivationEngine {
    db: Arc<Database>,
    timeout: Duration,
}

impl ActivationEngine {
    pub fn new(db: Arc<Database>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Verify `license_key` for `machine_identifier` as of today (UTC).
    pub async fn verify(
        &self,
        license_key: &str,
        machine_identifier: &str,
    ) -> LicenseResult<Verification> {
        let today = Utc::now().date_naive();
        self.verify_on(license_key, machine_identifier, today).await
    }

    /// Verify as of an explicit date.
    pub async fn verify_on(
        &self,
        license_key: &str,
        machine_identifier: &str,
        today: NaiveDate,
    ) -> LicenseResult<Verification> {
        let Some(record) = self
            .bounded("get_license", self.db.get_license(license_key))
            .await?
        else {
            log_license_event(LicenseEvent::VerificationFailed, license_key, Some("unknown key"));
            return Ok(Verification::Invalid);
        };

        let record = match record.state(machine_identifier, today) {
            LicenseState::Fresh => {
                match self.activate(license_key, machine_identifier, today).await? {
                    Some(activated) => activated,
                    // Lost the race: judge against the committed binding.
                    None => return self.reevaluate(license_key, machine_identifier, today).await,
                }
            }
            _ => record,
        };

        Ok(decide(&record, machine_identifier, today))
    }

    /// Run the compare-and-activate transaction under the store deadline.
    ///
    /// Returns `None` when another caller activated the key first.
    async fn activate(
        &self,
        license_key: &str,
        machine_identifier: &str,
        today: NaiveDate,
    ) -> LicenseResult<Option<LicenseRecord>> {
        let outcome = self
            .bounded(
                "compare_and_activate",
                self.db
                    .compare_and_activate(license_key, machine_identifier, today),
            )
            .await?;

        match outcome {
            Activation::Committed(record) => {
                log_license_binding_event(LicenseEvent::Activated, license_key, machine_identifier);
                Ok(Some(record))
            }
            Activation::Stale => {
                debug!(license_key, "activation skipped, record no longer fresh");
                Ok(None)
            }
        }
    }

    async fn reevaluate(
        &self,
        license_key: &str,
        machine_identifier: &str,
        today: NaiveDate,
    ) -> LicenseResult<Verification> {
        let record = self
            .bounded("get_license", self.db.get_license(license_key))
            .await?;

        match record {
            Some(record) if !record.is_fresh() => Ok(decide(&record, machine_identifier, today)),
            // Still fresh after a stale CAS means the row is soft-deleted or vanished.
            _ => {
                log_license_event(
                    LicenseEvent::VerificationFailed,
                    license_key,
                    Some("activation not possible"),
                );
                Ok(Verification::Invalid)
            }
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = LicenseResult<T>>,
    ) -> LicenseResult<T> {
        with_deadline(self.timeout, operation, fut).await
    }

    /// Deadline applied to each store operation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Apply a store deadline to one operation.
///
/// Dropping the inner future on expiry drops any open transaction with it,
/// which rolls it back.
pub async fn with_deadline<T>(
    timeout: Duration,
    operation: &str,
    fut: impl Future<Output = LicenseResult<T>>,
) -> LicenseResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                operation,
                timeout_ms = timeout.as_millis() as u64,
                "store operation timed out"
            );
            Err(LicenseError::Timeout(operation.to_string()))
        }
    }
}

/// Final decision for a record that is no longer fresh.
fn decide(record: &LicenseRecord, machine_identifier: &str, today: NaiveDate) -> Verification {
    let state = record.state(machine_identifier, today);
    match (state, record.expiration()) {
        (LicenseState::Active, Some(valid_until)) => {
            log_license_event(LicenseEvent::Verified, &record.license_key, None);
            Verification::Valid(VerifiedLicense {
                user: record.user_name.clone(),
                license_type: record.license_type.clone(),
                valid_until,
            })
        }
        (state, _) => {
            info!(
                license_key = %record.license_key,
                state = ?state,
                "license rejected"
            );
            log_license_event(LicenseEvent::VerificationFailed, &record.license_key, None);
            Verification::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::memory::MemoryStore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn engine_with(records: &[LicenseRecord]) -> ActivationEngine {
        let db = Arc::new(Database::Memory(MemoryStore::new()));
        for record in records {
            db.create_license(record).await.unwrap();
        }
        ActivationEngine::new(db, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn unknown_key_is_invalid() {
        let engine = engine_with(&[]).await;
        let outcome = engine.verify_on("NOPE", "dev-1", date(2024, 1, 10)).await.unwrap();
        assert_eq!(outcome, Verification::Invalid);
    }

    #[tokio::test]
    async fn first_use_activates_and_binds() {
        let engine = engine_with(&[LicenseRecord::new("ABC", "Alice", "pro", 12)]).await;

        let outcome = engine.verify_on("ABC", "dev-1", date(2024, 1, 10)).await.unwrap();
        assert_eq!(
            outcome,
            Verification::Valid(VerifiedLicense {
                user: "Alice".to_string(),
                license_type: "pro".to_string(),
                valid_until: date(2025, 1, 10),
            })
        );

        let stored = engine.database().get_license("ABC").await.unwrap().unwrap();
        assert!(stored.is_used);
        assert_eq!(stored.activation_date, Some(date(2024, 1, 10)));
        assert_eq!(stored.machine_identifier.as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn repeat_verification_keeps_original_window() {
        let engine = engine_with(&[LicenseRecord::new("ABC", "Alice", "pro", 12)]).await;
        engine.verify_on("ABC", "dev-1", date(2024, 1, 10)).await.unwrap();

        let again = engine.verify_on("ABC", "dev-1", date(2024, 6, 1)).await.unwrap();
        match again {
            Verification::Valid(details) => assert_eq!(details.valid_until, date(2025, 1, 10)),
            Verification::Invalid => panic!("bound machine should still be valid"),
        }
    }

    #[tokio::test]
    async fn foreign_and_expired_are_invalid() {
        let engine = engine_with(&[LicenseRecord::new("ABC", "Alice", "pro", 12)]).await;
        engine.verify_on("ABC", "dev-1", date(2024, 1, 10)).await.unwrap();

        assert_eq!(
            engine.verify_on("ABC", "dev-2", date(2024, 6, 1)).await.unwrap(),
            Verification::Invalid
        );
        assert_eq!(
            engine.verify_on("ABC", "dev-1", date(2025, 2, 1)).await.unwrap(),
            Verification::Invalid
        );
        assert!(engine
            .verify_on("ABC", "dev-1", date(2025, 1, 10))
            .await
            .unwrap()
            .is_valid());
    }

    #[tokio::test]
    async fn soft_deleted_key_never_validates() {
        let engine = engine_with(&[LicenseRecord::new("ABC", "Alice", "pro", 12)]).await;
        engine.database().soft_delete("ABC").await.unwrap();

        let outcome = engine.verify_on("ABC", "dev-1", date(2024, 1, 10)).await.unwrap();
        assert_eq!(outcome, Verification::Invalid);

        let stored = engine.database().get_license("ABC").await.unwrap().unwrap();
        assert!(stored.is_fresh(), "revoked keys must not be activated");
    }

    #[tokio::test]
    async fn deadline_turns_slow_operations_into_timeouts() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, LicenseError>(())
        };
        let err = with_deadline(Duration::from_millis(10), "get_license", slow)
            .await
            .unwrap_err();
        assert!(matches!(err, LicenseError::Timeout(op) if op == "get_license"));
    }

    #[tokio::test]
    async fn concurrent_first_use_binds_exactly_one_machine() {
        let engine = engine_with(&[LicenseRecord::new("ABC", "Alice", "pro", 12)]).await;
        let today = date(2024, 1, 10);

        let mut handles = Vec::new();
        for i in 0..16 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let machine = format!("dev-{i}");
                let outcome = engine.verify_on("ABC", &machine, today).await.unwrap();
                (machine, outcome)
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            let (machine, outcome) = handle.await.unwrap();
            if outcome.is_valid() {
                winners.push(machine);
            }
        }

        assert_eq!(winners.len(), 1);
        let stored = engine.database().get_license("ABC").await.unwrap().unwrap();
        assert_eq!(stored.machine_identifier.as_deref(), Some(winners[0].as_str()));
    }
}
