use crate::delivery::RecordLocks;
use crate::document_store::Stores;
use crate::error::StoreError;
use crate::integrity::IntegrityValidator;
use crate::models::{DeliveryStatus, Event, EventKind, Record};
use serde::Serialize;
use tracing::{info, instrument, warn};

/// Totals of one validation pass
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct AuditSummary {
    pub checked: usize,
    pub verified: usize,
    pub invalidated: usize,
    /// Invalid or delivered records, which are never revalidated
    pub skipped: usize,
}

/// Record and event statistics
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RecordStats {
    pub total_records: usize,
    pub pending: usize,
    pub sending: usize,
    pub delivered: usize,
    pub archived: usize,
    pub failed: usize,
    pub invalid: usize,
    pub verified: usize,
    pub with_media: usize,
    pub with_location: usize,
    pub with_sensors: usize,
    pub total_events: usize,
    pub impact_events: usize,
    pub pressure_events: usize,
}

/// Bulk validation and reporting over the stored records
pub struct Auditor {
    stores: Stores,
    validator: IntegrityValidator,
    locks: RecordLocks,
}

impl Auditor {
    /// `locks` must be the set delivery uses, so a pass never overwrites
    /// an attempt in flight.
    pub fn new(stores: Stores, validator: IntegrityValidator, locks: RecordLocks) -> Self {
        Self {
            stores,
            validator,
            locks,
        }
    }

    /// Revalidate every record that is neither invalid nor delivered.
    ///
    /// Each record is re-read under its lock right before it is checked.
    #[instrument(skip(self))]
    pub async fn validate_all(&self) -> Result<AuditSummary, StoreError> {
        let ids: Vec<String> = self
            .stores
            .records
            .list(false)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();
        let mut summary = AuditSummary::default();

        for id in ids {
            let _guard = self.locks.lock(&id).await;
            let mut record = match self.stores.records.get_as::<Record>(&id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(StoreError::Serialization(e)) => {
                    warn!(record_id = %id, error = %e, "Skipping record with unexpected shape");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if record.is_terminal() {
                summary.skipped += 1;
                continue;
            }

            let verdict = self.validator.validate(&record);
            IntegrityValidator::apply(&mut record, &verdict);
            self.stores.records.put_as(&record).await?;

            summary.checked += 1;
            if verdict.valid {
                summary.verified += 1;
            } else {
                summary.invalidated += 1;
                warn!(record_id = %record.id, reason = %verdict.reason, "Record invalidated");
            }
        }

        metrics::counter!("audit.records.invalidated").increment(summary.invalidated as u64);
        info!(
            checked = summary.checked,
            verified = summary.verified,
            invalidated = summary.invalidated,
            "Validation pass complete"
        );
        Ok(summary)
    }

    pub async fn stats(&self) -> Result<RecordStats, StoreError> {
        let records: Vec<Record> = self.stores.records.list_as().await?;
        let events: Vec<Event> = self.stores.events.list_as().await?;

        let mut stats = RecordStats {
            total_records: records.len(),
            total_events: events.len(),
            ..Default::default()
        };

        for record in &records {
            match record.delivery_status {
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::Sending => stats.sending += 1,
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Archived => stats.archived += 1,
                DeliveryStatus::Failed => stats.failed += 1,
            }
            if record.invalid {
                stats.invalid += 1;
            }
            if record.integrity_verified {
                stats.verified += 1;
            }
            if record.has_media() {
                stats.with_media += 1;
            }
            if record.location.is_some() {
                stats.with_location += 1;
            }
            if record.sensor_snapshot.as_ref().is_some_and(|s| !s.is_empty()) {
                stats.with_sensors += 1;
            }
        }

        for event in &events {
            match event.kind {
                EventKind::Impact => stats.impact_events += 1,
                EventKind::ExtremeTemperature => stats.pressure_events += 1,
                _ => {}
            }
        }

        Ok(stats)
    }
}
