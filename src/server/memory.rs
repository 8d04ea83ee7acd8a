//! In-memory license store.
//!
//! Backs `Database::Memory`. Every operation takes the map lock for its whole
//! read-modify-write, so `compare_and_activate` is atomic per call. The lock
//! is never held across an `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;

use crate::errors::{LicenseError, LicenseResult};
use crate::license::{FieldValue, LicenseField, LicenseRecord, MAX_DURATION_MONTHS};
use crate::server::database::Activation;

/// Process-local store keyed by license key.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<String, LicenseRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> LicenseResult<MutexGuard<'_, BTreeMap<String, LicenseRecord>>> {
        self.records
            .lock()
            .map_err(|_| LicenseError::StorageError("failed to acquire license store lock".into()))
    }

    pub fn get(&self, license_key: &str) -> LicenseResult<Option<LicenseRecord>> {
        Ok(self.lock()?.get(license_key).cloned())
    }

    pub fn create(&self, record: LicenseRecord) -> LicenseResult<()> {
        // Same bound the SQL schemas enforce; a record without an expiry could never validate.
        if !(1..=MAX_DURATION_MONTHS).contains(&record.duration_months) {
            return Err(LicenseError::Validation(format!(
                "duration_months must be between 1 and {MAX_DURATION_MONTHS}"
            )));
        }
        let mut records = self.lock()?;
        if records.contains_key(&record.license_key) {
            return Err(LicenseError::Conflict(record.license_key));
        }
        records.insert(record.license_key.clone(), record);
        Ok(())
    }

    pub fn patch(
        &self,
        license_key: &str,
        field: LicenseField,
        value: &FieldValue,
    ) -> LicenseResult<bool> {
        let mut records = self.lock()?;
        match records.get_mut(license_key) {
            Some(record) => {
                record.apply(field, value).map_err(LicenseError::Validation)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn soft_delete(&self, license_key: &str) -> LicenseResult<bool> {
        let mut records = self.lock()?;
        match records.get_mut(license_key) {
            Some(record) => {
                record.is_deleted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list(&self) -> LicenseResult<Vec<LicenseRecord>> {
        Ok(self
            .lock()?
            .values()
            .filter(|record| !record.is_deleted)
            .cloned()
            .collect())
    }

    pub fn compare_and_activate(
        &self,
        license_key: &str,
        machine_identifier: &str,
        activation_date: NaiveDate,
    ) -> LicenseResult<Activation> {
        let mut records = self.lock()?;
        match records.get_mut(license_key) {
            Some(record) if record.is_fresh() && !record.is_deleted => {
                record.is_used = true;
                record.activation_date = Some(activation_date);
                record.machine_identifier = Some(machine_identifier.to_string());
                Ok(Activation::Committed(record.clone()))
            }
            _ => Ok(Activation::Stale),
        }
    }
}
