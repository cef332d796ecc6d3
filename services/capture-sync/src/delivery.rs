//! Remote synchronization of validated records.
//!
//! [`Uploader`] performs single delivery attempts, serialised per record id;
//! [`SyncQueue`] keeps a persistent list of records awaiting delivery and
//! drains it with bounded concurrency.

use crate::document_store::DocumentStore;
use crate::error::{DeliveryError, StoreError};
use crate::models::{
    CollectionMode, DeliveryStatus, DiscoveredDevice, Event, Location, Record, SensorSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Sensor data sent alongside a record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorBundle {
    pub snapshot: Option<SensorSnapshot>,
    pub devices: Vec<DiscoveredDevice>,
    pub events: Vec<Event>,
    pub location: Option<Location>,
    pub collection_mode: CollectionMode,
    pub collection_duration_seconds: u64,
}

/// The fixed projection of a record that leaves the device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryPayload {
    pub record_id: String,
    pub subject_label: String,
    pub category_id: String,
    pub category_name: String,
    pub context_id: String,
    pub content_hash: String,
    pub captured_at_millis: i64,
    pub integrity_signature: Option<String>,
    pub integrity_verified: bool,
    pub sensors: SensorBundle,
}

impl From<&Record> for DeliveryPayload {
    fn from(record: &Record) -> Self {
        Self {
            record_id: record.id.clone(),
            subject_label: record.subject_label.clone(),
            category_id: record.category_id.clone(),
            category_name: record.category_name.clone(),
            context_id: record.context_id.clone(),
            content_hash: record.content_hash.clone(),
            captured_at_millis: record.captured_at_millis,
            integrity_signature: record.integrity_signature.clone(),
            integrity_verified: record.integrity_verified,
            sensors: SensorBundle {
                snapshot: record.sensor_snapshot.clone(),
                devices: record.detected_devices.clone(),
                events: record.associated_events.clone(),
                location: record.location,
                collection_mode: record.collection_mode,
                collection_duration_seconds: record.collection_duration_seconds,
            },
        }
    }
}

/// Sends a payload to the remote endpoint, returning its content identifier
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(&self, payload: &DeliveryPayload) -> Result<String, DeliveryError>;
}

/// JSON-over-HTTP delivery
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_error(&self, e: reqwest::Error) -> DeliveryError {
        if e.is_timeout() {
            DeliveryError::Timeout(self.timeout)
        } else {
            DeliveryError::Network(e.to_string())
        }
    }
}

/// Content identifier from a sync response, `IpfsHash` first, then `cid`
pub fn remote_identifier(body: &serde_json::Value) -> Option<String> {
    ["IpfsHash", "cid"]
        .iter()
        .filter_map(|field| body.get(field).and_then(serde_json::Value::as_str))
        .find(|id| !id.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn send(&self, payload: &DeliveryPayload) -> Result<String, DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Http {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DeliveryError::InvalidResponse(e.to_string()))?;

        remote_identifier(&body).ok_or(DeliveryError::RemoteIdentifierMissing)
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { remote_id: String },
    Failed { error: DeliveryError },
    /// The record was not eligible; nothing was sent
    Skipped { reason: String },
}

/// Why a record may not be delivered, if it may not
pub fn ineligibility(record: &Record) -> Option<&'static str> {
    if record.invalid {
        Some("record is invalid")
    } else if !record.integrity_verified {
        Some("record is not verified")
    } else if record.is_delivered() {
        Some("record already delivered")
    } else if record.delivery_status == DeliveryStatus::Archived {
        Some("record is archived")
    } else {
        None
    }
}

/// Totals of a bulk delivery pass
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SyncSummary {
    fn count(&mut self, outcome: &DeliveryOutcome) {
        self.attempted += 1;
        match outcome {
            DeliveryOutcome::Delivered { .. } => self.delivered += 1,
            DeliveryOutcome::Failed { .. } => self.failed += 1,
            DeliveryOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

type LockMap = parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Per-record async locks shared by every writer of stored records.
///
/// Entries only live while someone holds or waits for them.
#[derive(Clone, Default)]
pub struct RecordLocks {
    inner: Arc<LockMap>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `record_id`
    pub async fn lock(&self, record_id: &str) -> RecordGuard {
        let mutex = self
            .inner
            .lock()
            .entry(record_id.to_string())
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;
        RecordGuard {
            locks: self.inner.clone(),
            record_id: record_id.to_string(),
            guard: Some(guard),
        }
    }

    /// No record is locked or awaited
    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Exclusive access to one record until dropped
pub struct RecordGuard {
    locks: Arc<LockMap>,
    record_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        if let Some(guard) = self.guard.take() {
            let mutex = OwnedMutexGuard::mutex(&guard).clone();
            drop(guard);
            // Map entry plus ours: nobody else is waiting.
            if Arc::strong_count(&mutex) == 2 {
                locks.remove(&self.record_id);
            }
        }
    }
}

/// Delivers records, never more than one attempt per record at a time
pub struct Uploader {
    records: Arc<DocumentStore>,
    transport: Arc<dyn DeliveryTransport>,
    timeout: Duration,
    locks: RecordLocks,
}

impl Uploader {
    pub fn new(
        records: Arc<DocumentStore>,
        transport: Arc<dyn DeliveryTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            records,
            transport,
            timeout,
            locks: RecordLocks::new(),
        }
    }

    /// The lock set other record writers must share with delivery
    pub fn locks(&self) -> RecordLocks {
        self.locks.clone()
    }

    /// One delivery attempt for `record_id`.
    ///
    /// Store errors abort the attempt; delivery errors are recorded on the
    /// record and reported as [`DeliveryOutcome::Failed`].
    #[instrument(skip(self))]
    pub async fn attempt_delivery(&self, record_id: &str) -> Result<DeliveryOutcome, StoreError> {
        let _guard = self.locks.lock(record_id).await;
        self.attempt_locked(record_id).await
    }

    async fn attempt_locked(&self, record_id: &str) -> Result<DeliveryOutcome, StoreError> {
        let Some(mut record) = self.records.get_as::<Record>(record_id).await? else {
            return Ok(DeliveryOutcome::Skipped {
                reason: "record not found".to_string(),
            });
        };

        if let Some(reason) = ineligibility(&record) {
            debug!(record_id = %record_id, reason = reason, "Skipping delivery");
            return Ok(DeliveryOutcome::Skipped {
                reason: reason.to_string(),
            });
        }

        record.delivery_status = DeliveryStatus::Sending;
        record.delivery_attempts += 1;
        self.records.put_as(&record).await?;

        let payload = DeliveryPayload::from(&record);
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.transport.send(&payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.timeout)),
        };
        metrics::histogram!("sync.delivery.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(remote_id) => {
                record.delivery_status = DeliveryStatus::Delivered;
                record.remote_content_id = Some(remote_id.clone());
                record.synced_at = Some(Utc::now());
                record.last_delivery_error = None;
                self.records.put_as(&record).await?;

                metrics::counter!("sync.deliveries.succeeded").increment(1);
                info!(
                    record_id = %record_id,
                    remote_id = %remote_id,
                    attempts = record.delivery_attempts,
                    "Record delivered"
                );
                Ok(DeliveryOutcome::Delivered { remote_id })
            }
            Err(error) => {
                record.delivery_status = DeliveryStatus::Failed;
                record.last_delivery_error = Some(error.to_string());
                self.records.put_as(&record).await?;

                metrics::counter!("sync.deliveries.failed").increment(1);
                warn!(
                    record_id = %record_id,
                    attempts = record.delivery_attempts,
                    error = %error,
                    "Delivery failed"
                );
                Ok(DeliveryOutcome::Failed { error })
            }
        }
    }

    /// Keep a pending record local for good. Returns whether it was archived.
    #[instrument(skip(self))]
    pub async fn archive(&self, record_id: &str) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(record_id).await;
        match self.records.get_as::<Record>(record_id).await? {
            Some(mut record) if record.delivery_status == DeliveryStatus::Pending => {
                record.delivery_status = DeliveryStatus::Archived;
                self.records.put_as(&record).await?;
                info!(record_id = %record_id, "Record archived");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Attempt every record that is eligible and not yet delivered, one at a time
    #[instrument(skip(self))]
    pub async fn sync_pending(&self) -> Result<SyncSummary, StoreError> {
        let records: Vec<Record> = self.records.list_as().await?;
        let mut summary = SyncSummary::default();

        for record in records.iter().filter(|r| ineligibility(r).is_none()) {
            let outcome = self.attempt_delivery(&record.id).await?;
            summary.count(&outcome);
        }

        info!(
            attempted = summary.attempted,
            delivered = summary.delivered,
            failed = summary.failed,
            "Pending records synchronized"
        );
        Ok(summary)
    }
}

/// A record waiting in the delivery queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: String,
    pub record: Record,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub in_progress: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Totals of one queue drain pass
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DrainSummary {
    pub processed: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Entries removed after reaching the attempt ceiling
    pub dropped: usize,
    pub errors: usize,
}

enum EntryResult {
    Delivered,
    Failed { dropped: bool },
    Skipped,
    Error,
}

/// Persistent queue of records awaiting delivery
pub struct SyncQueue {
    queue: Arc<DocumentStore>,
    uploader: Arc<Uploader>,
    concurrency: usize,
    max_attempts: Option<u32>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl SyncQueue {
    pub fn new(
        queue: Arc<DocumentStore>,
        uploader: Arc<Uploader>,
        concurrency: usize,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            queue,
            uploader,
            concurrency: concurrency.max(1),
            max_attempts,
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Add a record; an existing entry for the same record is kept as is
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn enqueue(&self, record: &Record) -> Result<QueueEntry, StoreError> {
        if let Some(existing) = self.queue.get_as::<QueueEntry>(&record.id).await? {
            debug!("Record already queued");
            return Ok(existing);
        }

        let entry = QueueEntry {
            id: record.id.clone(),
            record: record.clone(),
            attempts: 0,
            in_progress: false,
            created_at: Utc::now(),
            last_error: None,
        };
        self.queue.put_as(&entry).await?;
        metrics::counter!("sync.queue.enqueued").increment(1);
        info!("Record queued for delivery");
        Ok(entry)
    }

    pub async fn entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let mut entries: Vec<QueueEntry> = self.queue.list_as().await?;
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.queue.list(false).await?.len())
    }

    /// Clear `in_progress` flags left behind by an interrupted drain
    pub async fn reset_stale(&self) -> Result<usize, StoreError> {
        let mut reset = 0;
        for mut entry in self.entries().await? {
            if entry.in_progress {
                entry.in_progress = false;
                self.queue.put_as(&entry).await?;
                reset += 1;
            }
        }
        if reset > 0 {
            warn!(entries = reset, "Reset stale queue entries");
        }
        Ok(reset)
    }

    /// One pass over the queue, oldest entry first, one attempt per entry
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainSummary, StoreError> {
        let _pass = self.drain_lock.lock().await;

        let entries: Vec<QueueEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| !e.in_progress)
            .collect();

        let results: Vec<EntryResult> = stream::iter(entries)
            .map(|entry| self.process(entry))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = DrainSummary::default();
        for result in results {
            summary.processed += 1;
            match result {
                EntryResult::Delivered => summary.delivered += 1,
                EntryResult::Failed { dropped } => {
                    summary.failed += 1;
                    if dropped {
                        summary.dropped += 1;
                    }
                }
                EntryResult::Skipped => summary.skipped += 1,
                EntryResult::Error => summary.errors += 1,
            }
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                delivered = summary.delivered,
                failed = summary.failed,
                dropped = summary.dropped,
                "Delivery queue drained"
            );
        }
        Ok(summary)
    }

    async fn process(&self, mut entry: QueueEntry) -> EntryResult {
        entry.in_progress = true;
        if let Err(e) = self.queue.put_as(&entry).await {
            error!(record_id = %entry.id, error = %e, "Failed to claim queue entry");
            return EntryResult::Error;
        }

        match self.uploader.attempt_delivery(&entry.id).await {
            Ok(DeliveryOutcome::Delivered { .. }) => {
                self.remove(&entry.id).await;
                EntryResult::Delivered
            }
            Ok(DeliveryOutcome::Skipped { reason }) => {
                debug!(record_id = %entry.id, reason = %reason, "Dropping ineligible queue entry");
                self.remove(&entry.id).await;
                EntryResult::Skipped
            }
            Ok(DeliveryOutcome::Failed { error }) => {
                entry.attempts += 1;
                entry.last_error = Some(error.to_string());
                entry.in_progress = false;

                if self.max_attempts.is_some_and(|max| entry.attempts >= max) {
                    warn!(
                        record_id = %entry.id,
                        attempts = entry.attempts,
                        "Queue entry reached attempt ceiling, dropping"
                    );
                    metrics::counter!("sync.queue.dropped").increment(1);
                    self.remove(&entry.id).await;
                    return EntryResult::Failed { dropped: true };
                }

                if let Err(e) = self.queue.put_as(&entry).await {
                    error!(record_id = %entry.id, error = %e, "Failed to update queue entry");
                }
                EntryResult::Failed { dropped: false }
            }
            Err(e) => {
                error!(record_id = %entry.id, error = %e, "Delivery attempt aborted");
                entry.in_progress = false;
                if let Err(e) = self.queue.put_as(&entry).await {
                    error!(record_id = %entry.id, error = %e, "Failed to release queue entry");
                }
                EntryResult::Error
            }
        }
    }

    async fn remove(&self, id: &str) {
        if let Err(e) = self.queue.remove(id).await {
            error!(record_id = %id, error = %e, "Failed to remove queue entry");
        }
    }
}
