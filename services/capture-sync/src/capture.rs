//! Record assembly.
//!
//! Gathers a sensor snapshot, a best-effort location fix, nearby devices and
//! recent events into a [`Record`], validates it and persists it. Hardware
//! access sits behind small capability traits so the assembler can run
//! against real adapters, the HTTP API or test doubles.

use crate::config::{CaptureConfig, IntegrityConfig};
use crate::document_store::Stores;
use crate::error::CaptureError;
use crate::event_detector::RecentEvents;
use crate::integrity::{
    location_hash, media_content_hash, sha256_hex, IntegrityValidator, LOCATION_ERROR, NO_LOCATION,
};
use crate::models::{
    CollectionMode, DiscoveredDevice, Event, Location, Media, MediaKind, MediaReference, Record,
    SensorReading, SensorSnapshot, SensorValue,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Current readings of every sensor
pub trait SensorSource: Send + Sync {
    fn snapshot(&self) -> SensorSnapshot;
}

/// Geolocation and reverse geocoding
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current fix; `CaptureError::PermissionDenied` when access is refused
    async fn current_fix(&self) -> Result<Location, CaptureError>;

    async fn reverse_geocode(&self, location: &Location) -> Result<Option<Address>, CaptureError>;
}

/// Reads captured media files
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn load(&self, locator: &str) -> Result<Vec<u8>, CaptureError>;
}

/// Nearby device discovery
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    async fn discover(&self) -> Vec<DiscoveredDevice>;
}

/// Discovery that never finds anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDiscovery;

#[async_trait]
impl DeviceDiscovery for NullDiscovery {
    async fn discover(&self) -> Vec<DiscoveredDevice> {
        Vec::new()
    }
}

/// Location provider for hosts without a positioning source
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocation;

#[async_trait]
impl LocationProvider for NoLocation {
    async fn current_fix(&self) -> Result<Location, CaptureError> {
        Err(CaptureError::PermissionDenied(
            "no location provider configured".to_string(),
        ))
    }

    async fn reverse_geocode(&self, _location: &Location) -> Result<Option<Address>, CaptureError> {
        Ok(None)
    }
}

/// Loads media from the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FsMediaCapture {
    root: Option<PathBuf>,
}

impl FsMediaCapture {
    /// Resolve relative locators against `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, locator: &str) -> PathBuf {
        let path = PathBuf::from(locator.trim_start_matches("file://"));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl MediaCapture for FsMediaCapture {
    async fn load(&self, locator: &str) -> Result<Vec<u8>, CaptureError> {
        let path = self.resolve(locator);
        tokio::fs::read(&path)
            .await
            .map_err(|e| CaptureError::Media(format!("{}: {}", path.display(), e)))
    }
}

/// Snapshot kept current from the sensor reading stream
#[derive(Debug, Clone, Default)]
pub struct LatestReadings {
    snapshot: Arc<RwLock<SensorSnapshot>>,
}

impl LatestReadings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, reading: &SensorReading) {
        let mut snapshot = self.snapshot.write();
        match reading.value {
            SensorValue::Accelerometer(v) => snapshot.accelerometer = Some(v),
            SensorValue::Gyroscope(v) => snapshot.gyroscope = Some(v),
            SensorValue::Magnetometer(v) => snapshot.magnetometer = Some(v),
            SensorValue::Barometer { pressure } => snapshot.pressure = Some(pressure),
            SensorValue::Light { illuminance } => snapshot.illuminance = Some(illuminance),
        }
        snapshot.captured_at = Some(reading.timestamp);
    }
}

impl SensorSource for LatestReadings {
    fn snapshot(&self) -> SensorSnapshot {
        self.snapshot.read().clone()
    }
}

/// Reverse geocoding result
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
}

impl Address {
    /// `street, city, region` without a trailing separator
    pub fn display(&self) -> String {
        let parts = [&self.street, &self.city, &self.region]
            .map(|part| part.as_deref().unwrap_or_default());
        parts
            .join(", ")
            .trim()
            .trim_end_matches(',')
            .to_string()
    }
}

/// Location part of a capture
#[derive(Debug, Clone, PartialEq)]
pub struct LocationCapture {
    pub location: Option<Location>,
    pub approximate_address: String,
    pub location_hash: String,
}

impl LocationCapture {
    pub fn from_fix(location: Location, approximate_address: impl Into<String>) -> Self {
        Self {
            location_hash: location_hash(&location),
            location: Some(location),
            approximate_address: approximate_address.into(),
        }
    }

    fn denied() -> Self {
        Self {
            location: None,
            approximate_address: "permission denied".to_string(),
            location_hash: NO_LOCATION.to_string(),
        }
    }

    fn failed() -> Self {
        Self {
            location: None,
            approximate_address: "capture error".to_string(),
            location_hash: LOCATION_ERROR.to_string(),
        }
    }
}

/// What the record's content hash is derived from
#[derive(Debug, Clone, PartialEq)]
pub enum ContentSource {
    /// Hashed, and mined when enabled, from a seed string
    Seed(String),
    /// The hash of the referenced media
    Media(MediaReference),
}

/// Inputs of one capture, copied verbatim onto the record
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub subject_label: String,
    pub category_id: String,
    pub category_name: String,
    pub context_id: String,
    pub provenance: String,
    pub mode: CollectionMode,
    pub automatic: bool,
    pub duration_seconds: u64,
    pub content: ContentSource,
    pub events: Vec<Event>,
    /// Use this location instead of querying the provider
    pub location: Option<LocationCapture>,
}

impl CaptureRequest {
    pub fn manual(events: Vec<Event>) -> Self {
        Self {
            subject_label: "Operator".to_string(),
            category_id: "manual-collection".to_string(),
            category_name: "Manual sensor collection".to_string(),
            context_id: "manual-monitoring".to_string(),
            provenance: "manual-collection".to_string(),
            mode: CollectionMode::Manual,
            automatic: false,
            duration_seconds: 0,
            content: ContentSource::Seed(format!(
                "manual-collection_{}_{}",
                Utc::now().timestamp_millis(),
                Uuid::new_v4().simple()
            )),
            events,
            location: None,
        }
    }

    /// Subject and category describe the triggering event
    pub fn automatic(event: Event) -> Self {
        let seed = format!(
            "{}_{}_{}",
            event.kind.as_str(),
            event.timestamp.to_rfc3339(),
            event.payload
        );
        Self {
            subject_label: "automatic-system".to_string(),
            category_id: "sensor-event".to_string(),
            category_name: format!(
                "Event: {} - {}",
                event.kind.as_str(),
                event.severity.as_str()
            ),
            context_id: "iot-monitoring".to_string(),
            provenance: "automatic-sensor".to_string(),
            mode: CollectionMode::Automatic,
            automatic: true,
            duration_seconds: 0,
            content: ContentSource::Seed(seed),
            events: vec![event],
            location: None,
        }
    }

    pub fn continuous(duration_seconds: u64, events: Vec<Event>) -> Self {
        Self {
            subject_label: "System".to_string(),
            category_id: "continuous-collection".to_string(),
            category_name: format!("Continuous collection - {}s", duration_seconds),
            context_id: "telemetry".to_string(),
            provenance: "continuous-collection".to_string(),
            mode: CollectionMode::Continuous,
            automatic: true,
            duration_seconds,
            content: ContentSource::Seed(format!(
                "continuous-collection_{}_{}",
                Utc::now().timestamp_millis(),
                Uuid::new_v4().simple()
            )),
            events,
            location: None,
        }
    }

    pub fn media(reference: MediaReference, events: Vec<Event>) -> Self {
        let kind = match reference.kind {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::None => "no media",
        };
        Self {
            subject_label: "Operator".to_string(),
            category_id: "full-evidence".to_string(),
            category_name: format!("Capture with {}", kind),
            context_id: "iot-sensors".to_string(),
            provenance: "sensor-explorer".to_string(),
            mode: CollectionMode::Manual,
            automatic: false,
            duration_seconds: 0,
            content: ContentSource::Media(reference),
            events,
            location: None,
        }
    }
}

/// Start/stop bookkeeping for continuous collection
#[derive(Debug, Default)]
pub struct CollectionSession {
    started: Option<Instant>,
}

impl CollectionSession {
    /// Returns false when a session is already running
    pub fn start(&mut self) -> bool {
        if self.started.is_some() {
            return false;
        }
        self.started = Some(Instant::now());
        true
    }

    /// Elapsed seconds of the session just stopped
    pub fn stop(&mut self) -> Option<u64> {
        self.started.take().map(|started| started.elapsed().as_secs())
    }

    pub fn is_active(&self) -> bool {
        self.started.is_some()
    }
}

/// Media file handed in for a media capture
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInput {
    pub locator: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

/// Builds, validates and persists records
pub struct RecordAssembler {
    stores: Stores,
    validator: IntegrityValidator,
    sensors: Arc<dyn SensorSource>,
    location: Arc<dyn LocationProvider>,
    media: Arc<dyn MediaCapture>,
    discovery: Arc<dyn DeviceDiscovery>,
    recent_events: RecentEvents,
    session: Mutex<CollectionSession>,
    capture_config: CaptureConfig,
    mine_content_hash: bool,
    max_pow_iterations: u64,
}

impl RecordAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        validator: IntegrityValidator,
        sensors: Arc<dyn SensorSource>,
        location: Arc<dyn LocationProvider>,
        media: Arc<dyn MediaCapture>,
        discovery: Arc<dyn DeviceDiscovery>,
        recent_events: RecentEvents,
        capture_config: CaptureConfig,
        integrity_config: &IntegrityConfig,
    ) -> Self {
        Self {
            stores,
            validator,
            sensors,
            location,
            media,
            discovery,
            recent_events,
            session: Mutex::new(CollectionSession::default()),
            capture_config,
            mine_content_hash: integrity_config.mine_content_hash,
            max_pow_iterations: integrity_config.max_pow_iterations,
        }
    }

    pub fn recent_events(&self) -> &RecentEvents {
        &self.recent_events
    }

    /// Best-effort location lookup bounded by the configured timeout.
    ///
    /// Never fails: refusal and errors degrade to a placeholder hash.
    pub async fn capture_location(&self) -> LocationCapture {
        let limit = Duration::from_secs(self.capture_config.location_timeout_secs);

        let location = match timeout(limit, self.location.current_fix()).await {
            Ok(Ok(location)) => location,
            Ok(Err(CaptureError::PermissionDenied(reason))) => {
                info!(reason = %reason, "Location not permitted");
                return LocationCapture::denied();
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to capture location");
                return LocationCapture::failed();
            }
            Err(_) => {
                warn!(timeout_secs = limit.as_secs(), "Location lookup timed out");
                return LocationCapture::failed();
            }
        };

        let address = match timeout(limit, self.location.reverse_geocode(&location)).await {
            Ok(Ok(Some(address))) => address.display(),
            Ok(Ok(None)) => "address unavailable".to_string(),
            Ok(Err(e)) => {
                warn!(error = %e, "Reverse geocoding failed");
                "address unavailable".to_string()
            }
            Err(_) => {
                warn!("Reverse geocoding timed out");
                "address unavailable".to_string()
            }
        };

        LocationCapture::from_fix(location, address)
    }

    /// Assemble, validate and persist one record.
    ///
    /// Failures are logged and nothing is persisted. A record that fails
    /// validation is still persisted, flagged invalid.
    #[instrument(
        skip(self, request),
        fields(category_id = %request.category_id, mode = request.mode.as_str())
    )]
    pub async fn assemble(&self, request: CaptureRequest) -> Result<Record, CaptureError> {
        let result = self.build_and_store(request).await;
        if let Err(e) = &result {
            error!(error = %e, "Failed to create record");
            metrics::counter!("capture.records.failed").increment(1);
        }
        result
    }

    async fn build_and_store(&self, request: CaptureRequest) -> Result<Record, CaptureError> {
        let location = match request.location {
            Some(location) => location,
            None => self.capture_location().await,
        };
        let snapshot = self.sensors.snapshot();
        let devices = self.discovery.discover().await;

        let (content_hash, pow_nonce, media) = match request.content {
            ContentSource::Seed(seed) => {
                let (nonce, hash) = self.content_hash(seed).await?;
                (hash, nonce, MediaReference::default())
            }
            ContentSource::Media(reference) => (
                reference.content_hash.clone().unwrap_or_default(),
                None,
                reference,
            ),
        };

        let captured_at: DateTime<Utc> = Utc::now();
        let has_location = location.location.is_some();

        let mut record = Record {
            id: Uuid::new_v4().to_string(),
            subject_label: request.subject_label,
            category_id: request.category_id,
            category_name: request.category_name,
            context_id: request.context_id,
            captured_at_millis: captured_at.timestamp_millis(),
            captured_at: Some(captured_at),
            content_hash,
            pow_nonce,
            location: location.location,
            approximate_address: has_location.then_some(location.approximate_address),
            location_hash: has_location.then_some(location.location_hash),
            sensor_snapshot: Some(snapshot),
            associated_events: request.events,
            detected_devices: devices,
            collection_mode: request.mode,
            collection_duration_seconds: request.duration_seconds,
            automatic: request.automatic,
            provenance: request.provenance,
            media,
            ..Default::default()
        };

        let verdict = self.validator.validate(&record);
        IntegrityValidator::apply(&mut record, &verdict);
        if !verdict.valid {
            warn!(record_id = %record.id, reason = %verdict.reason, "Record failed validation");
            metrics::counter!("capture.records.invalid").increment(1);
        }

        self.stores.records.put_as(&record).await?;

        metrics::counter!("capture.records.created").increment(1);
        info!(
            record_id = %record.id,
            verified = record.integrity_verified,
            events = record.associated_events.len(),
            "Record created"
        );

        Ok(record)
    }

    /// Mining runs on the blocking pool so long searches never stall the runtime.
    async fn content_hash(&self, seed: String) -> Result<(Option<u64>, String), CaptureError> {
        if !self.mine_content_hash {
            return Ok((None, sha256_hex(seed)));
        }

        let pow = self.validator.proof_of_work().clone();
        let max_iterations = self.max_pow_iterations;
        let solved = tokio::task::spawn_blocking(move || {
            pow.solve(&seed, max_iterations)
                .ok_or_else(|| CaptureError::ProofOfWork {
                    prefix: pow.difficulty_prefix().to_string(),
                    iterations: max_iterations,
                })
        })
        .await
        .map_err(|e| CaptureError::Mining(format!("task join error: {e}")))?;

        let (nonce, hash) = solved?;
        debug!(nonce = nonce, "Content hash mined");
        Ok((Some(nonce), hash))
    }

    /// Manual capture with the most recent events attached.
    ///
    /// A location supplied by the caller replaces the provider lookup.
    pub async fn capture_manual(
        &self,
        location: Option<LocationCapture>,
    ) -> Result<Record, CaptureError> {
        let events = self
            .recent_events
            .last(self.capture_config.manual_event_window);
        let mut request = CaptureRequest::manual(events);
        request.location = location;
        self.assemble(request).await
    }

    /// Capture triggered by a detected event
    pub async fn capture_automatic(&self, event: Event) -> Result<Record, CaptureError> {
        self.assemble(CaptureRequest::automatic(event)).await
    }

    /// Capture closing a continuous collection, carrying every buffered event
    pub async fn capture_continuous(&self, duration_seconds: u64) -> Result<Record, CaptureError> {
        let events = self.recent_events.all();
        self.assemble(CaptureRequest::continuous(duration_seconds, events))
            .await
    }

    /// Persist the media entity, then a record whose content hash is the media hash
    #[instrument(skip(self, input), fields(locator = %input.locator))]
    pub async fn capture_media(&self, input: MediaInput) -> Result<Record, CaptureError> {
        if input.kind == MediaKind::None {
            return Err(CaptureError::Media("media kind must be photo or video".to_string()));
        }

        let bytes = self.media.load(&input.locator).await.map_err(|e| {
            error!(error = %e, "Failed to read media");
            e
        })?;
        let content_hash = media_content_hash(&bytes);
        let snapshot = self.sensors.snapshot();

        let media = Media {
            id: Uuid::new_v4().to_string(),
            kind: input.kind,
            storage_locator: input.locator.clone(),
            content_hash: content_hash.clone(),
            timestamp: Utc::now(),
            size_bytes: bytes.len() as u64,
            resolution: input.resolution,
            duration_seconds: input.duration_seconds,
            metadata: serde_json::json!({
                "active_sensors": snapshot.active_sensors(),
            }),
        };
        self.stores.media.put_as(&media).await.map_err(|e| {
            error!(error = %e, "Failed to store media");
            CaptureError::from(e)
        })?;
        metrics::counter!("capture.media.stored").increment(1);

        let reference = MediaReference {
            media_id: Some(media.id),
            kind: input.kind,
            content_hash: Some(content_hash),
            locator: Some(input.locator),
        };
        let events = self
            .recent_events
            .last(self.capture_config.media_event_window);
        self.assemble(CaptureRequest::media(reference, events)).await
    }

    /// Returns false when a collection is already running
    pub fn start_collection(&self) -> bool {
        let started = self.session.lock().start();
        if started {
            info!("Continuous collection started");
        }
        started
    }

    /// Stop the running collection and record it; `None` when none was running
    pub async fn stop_collection(&self) -> Result<Option<Record>, CaptureError> {
        let Some(elapsed) = self.session.lock().stop() else {
            return Ok(None);
        };
        info!(duration_secs = elapsed, "Continuous collection stopped");
        self.capture_continuous(elapsed).await.map(Some)
    }

    pub fn collection_active(&self) -> bool {
        self.session.lock().is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::{HmacSigner, ProofOfWork};
    use crate::models::{EventKind, Severity, Vector3};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn integrity_config(mine: bool) -> IntegrityConfig {
        IntegrityConfig {
            secret: "field-secret".to_string(),
            difficulty_prefix: "00".to_string(),
            mine_content_hash: mine,
            max_pow_iterations: 1_000_000,
        }
    }

    fn validator() -> IntegrityValidator {
        IntegrityValidator::new(
            Arc::new(HmacSigner::new("field-secret").unwrap()),
            ProofOfWork::default(),
        )
    }

    fn assembler_with(
        stores: Stores,
        location: Arc<dyn LocationProvider>,
        media: Arc<dyn MediaCapture>,
        mine: bool,
    ) -> RecordAssembler {
        RecordAssembler::new(
            stores,
            validator(),
            Arc::new(LatestReadings::new()),
            location,
            media,
            Arc::new(NullDiscovery),
            RecentEvents::new(20),
            CaptureConfig::default(),
            &integrity_config(mine),
        )
    }

    fn assembler(stores: Stores) -> RecordAssembler {
        assembler_with(
            stores,
            Arc::new(NoLocation),
            Arc::new(FsMediaCapture::default()),
            true,
        )
    }

    fn impact_event() -> Event {
        Event {
            id: "evt-1".to_string(),
            kind: EventKind::Impact,
            source_sensor: "accelerometer".to_string(),
            payload: serde_json::json!({ "force": 17.32 }),
            timestamp: Utc::now(),
            severity: Severity::High,
        }
    }

    fn fix() -> Location {
        Location {
            latitude: -23.55,
            longitude: -46.63,
            accuracy: Some(4.0),
            altitude: None,
            heading: None,
            speed: None,
        }
    }

    #[tokio::test]
    async fn test_manual_capture_is_mined_signed_and_persisted() {
        let stores = Stores::in_memory().unwrap();
        let assembler = assembler(stores.clone());

        let record = assembler.capture_manual(None).await.unwrap();

        assert!(record.content_hash.starts_with("00"));
        assert!(record.pow_nonce.is_some());
        assert!(record.integrity_verified);
        assert!(!record.invalid);
        assert!(record.integrity_signature.is_some());
        assert_eq!(record.collection_mode, CollectionMode::Manual);
        assert!(record.detected_devices.is_empty());

        let stored: Record = stores.records.get_as(&record.id).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_unmined_capture_usually_fails_proof_of_work() {
        let stores = Stores::in_memory().unwrap();
        let assembler = assembler_with(
            stores,
            Arc::new(NoLocation),
            Arc::new(FsMediaCapture::default()),
            false,
        );

        let record = assembler.capture_manual(None).await.unwrap();
        assert_eq!(record.pow_nonce, None);
        assert_eq!(record.invalid, !record.content_hash.starts_with("00"));
    }

    /// Deterministic values with full 17-digit precision
    fn awkward_values(state: &mut u64) -> f64 {
        *state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (*state >> 11) as f64 / (1u64 << 53) as f64 * 40.0 - 20.0
    }

    #[tokio::test]
    async fn test_signature_survives_store_round_trip() {
        let stores = Stores::in_memory().unwrap();
        let readings = LatestReadings::new();

        let counter = AtomicU64::new(1);
        let mut provider = MockLocationProvider::new();
        provider.expect_current_fix().returning(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) as f64;
            Ok(Location {
                latitude: -23.5 - n / 3_000_003.0,
                longitude: -46.6 + n / 7_000_001.0,
                accuracy: Some(4.0),
                altitude: None,
                heading: Some(n / 11.0),
                speed: Some(0.1 + 0.2 * n),
            })
        });
        provider.expect_reverse_geocode().returning(|_| Ok(None));

        let assembler = RecordAssembler::new(
            stores.clone(),
            validator(),
            Arc::new(readings.clone()),
            Arc::new(provider),
            Arc::new(FsMediaCapture::default()),
            Arc::new(NullDiscovery),
            RecentEvents::new(20),
            CaptureConfig::default(),
            &integrity_config(true),
        );

        let mut state = 42;
        for _ in 0..200 {
            let reading = SensorReading::now(SensorValue::Accelerometer(Vector3::new(
                awkward_values(&mut state),
                awkward_values(&mut state),
                awkward_values(&mut state),
            )));
            readings.update(&reading);
            readings.update(&SensorReading::now(SensorValue::Barometer {
                pressure: 1000.0 + awkward_values(&mut state),
            }));

            let record = assembler.capture_manual(None).await.unwrap();
            assert!(record.integrity_verified);

            let stored: Record = stores.records.get_as(&record.id).await.unwrap().unwrap();
            let check = validator().check_signature(&stored);
            assert!(check.valid, "record {} failed after reload", stored.id);
            assert!(validator().validate(&stored).valid);
        }
    }

    #[tokio::test]
    async fn test_mining_leaves_runtime_responsive() {
        let validator = IntegrityValidator::new(
            Arc::new(HmacSigner::new("field-secret").unwrap()),
            // Hex digests never start with "zz": the search runs to exhaustion.
            ProofOfWork::new("zz"),
        );
        let mut config = integrity_config(true);
        config.max_pow_iterations = 200_000;
        let assembler = RecordAssembler::new(
            Stores::in_memory().unwrap(),
            validator,
            Arc::new(LatestReadings::new()),
            Arc::new(NoLocation),
            Arc::new(FsMediaCapture::default()),
            Arc::new(NullDiscovery),
            RecentEvents::new(20),
            CaptureConfig::default(),
            &config,
        );

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        let result = assembler.capture_manual(None).await;
        ticker.abort();

        assert!(matches!(
            result,
            Err(CaptureError::ProofOfWork {
                iterations: 200_000,
                ..
            })
        ));
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_automatic_capture_describes_event() {
        let stores = Stores::in_memory().unwrap();
        let assembler = assembler(stores);

        let record = assembler.capture_automatic(impact_event()).await.unwrap();

        assert_eq!(record.category_name, "Event: impact - high");
        assert_eq!(record.context_id, "iot-monitoring");
        assert!(record.automatic);
        assert_eq!(record.collection_mode, CollectionMode::Automatic);
        assert_eq!(record.associated_events.len(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_degrades_capture() {
        let stores = Stores::in_memory().unwrap();
        let assembler = assembler(stores);

        let location = assembler.capture_location().await;
        assert_eq!(location.location, None);
        assert_eq!(location.approximate_address, "permission denied");
        assert_eq!(location.location_hash, NO_LOCATION);

        let record = assembler.capture_manual(None).await.unwrap();
        assert!(record.location.is_none());
        assert!(record.location_hash.is_none());
        assert!(record.integrity_verified);
    }

    #[tokio::test]
    async fn test_location_error_uses_error_placeholder() {
        let mut provider = MockLocationProvider::new();
        provider
            .expect_current_fix()
            .returning(|| Err(CaptureError::Location("gps offline".to_string())));
        provider.expect_reverse_geocode().times(0);

        let assembler = assembler_with(
            Stores::in_memory().unwrap(),
            Arc::new(provider),
            Arc::new(FsMediaCapture::default()),
            true,
        );

        let location = assembler.capture_location().await;
        assert_eq!(location.approximate_address, "capture error");
        assert_eq!(location.location_hash, LOCATION_ERROR);
    }

    #[tokio::test]
    async fn test_location_fix_with_address() {
        let mut provider = MockLocationProvider::new();
        provider.expect_current_fix().returning(|| Ok(fix()));
        provider.expect_reverse_geocode().returning(|_| {
            Ok(Some(Address {
                street: Some("Rua Augusta".to_string()),
                city: Some("Sao Paulo".to_string()),
                region: None,
            }))
        });

        let assembler = assembler_with(
            Stores::in_memory().unwrap(),
            Arc::new(provider),
            Arc::new(FsMediaCapture::default()),
            true,
        );

        let record = assembler.capture_manual(None).await.unwrap();
        assert_eq!(record.location, Some(fix()));
        assert_eq!(record.approximate_address.as_deref(), Some("Rua Augusta, Sao Paulo"));
        assert_eq!(record.location_hash, Some(location_hash(&fix())));
    }

    #[tokio::test]
    async fn test_geocoding_failure_keeps_fix() {
        let mut provider = MockLocationProvider::new();
        provider.expect_current_fix().returning(|| Ok(fix()));
        provider
            .expect_reverse_geocode()
            .returning(|_| Err(CaptureError::Location("geocoder down".to_string())));

        let assembler = assembler_with(
            Stores::in_memory().unwrap(),
            Arc::new(provider),
            Arc::new(FsMediaCapture::default()),
            true,
        );

        let location = assembler.capture_location().await;
        assert_eq!(location.location, Some(fix()));
        assert_eq!(location.approximate_address, "address unavailable");
    }

    #[tokio::test]
    async fn test_media_capture_stores_media_first() {
        let mut media = MockMediaCapture::new();
        media
            .expect_load()
            .withf(|locator| locator == "file:///captures/photo-1.jpg")
            .returning(|_| Ok(b"jpeg-bytes".to_vec()));

        let stores = Stores::in_memory().unwrap();
        let assembler = assembler_with(stores.clone(), Arc::new(NoLocation), Arc::new(media), true);

        let record = assembler
            .capture_media(MediaInput {
                locator: "file:///captures/photo-1.jpg".to_string(),
                kind: MediaKind::Photo,
                resolution: Some("1920x1080".to_string()),
                duration_seconds: None,
            })
            .await
            .unwrap();

        let expected_hash = media_content_hash(b"jpeg-bytes");
        assert_eq!(record.content_hash, expected_hash);
        assert_eq!(record.media_hash(), Some(expected_hash.as_str()));

        let media_id = record.media.media_id.clone().unwrap();
        let stored: Media = stores.media.get_as(&media_id).await.unwrap().unwrap();
        assert_eq!(stored.size_bytes, 10);
        assert_eq!(stored.content_hash, expected_hash);

        // Media hashes are not mined, so proof-of-work decides validity.
        assert_eq!(record.invalid, !expected_hash.starts_with("00"));
    }

    #[tokio::test]
    async fn test_media_read_failure_persists_nothing() {
        let mut media = MockMediaCapture::new();
        media
            .expect_load()
            .returning(|_| Err(CaptureError::Media("missing file".to_string())));

        let stores = Stores::in_memory().unwrap();
        let assembler = assembler_with(stores.clone(), Arc::new(NoLocation), Arc::new(media), true);

        let result = assembler
            .capture_media(MediaInput {
                locator: "missing.jpg".to_string(),
                kind: MediaKind::Video,
                resolution: None,
                duration_seconds: Some(4),
            })
            .await;

        assert!(matches!(result, Err(CaptureError::Media(_))));
        assert!(stores.records.list(false).await.unwrap().is_empty());
        assert!(stores.media.list(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mining_exhaustion_persists_nothing() {
        let stores = Stores::in_memory().unwrap();
        let mut config = integrity_config(true);
        config.max_pow_iterations = 0;
        let assembler = RecordAssembler::new(
            stores.clone(),
            validator(),
            Arc::new(LatestReadings::new()),
            Arc::new(NoLocation),
            Arc::new(FsMediaCapture::default()),
            Arc::new(NullDiscovery),
            RecentEvents::new(20),
            CaptureConfig::default(),
            &config,
        );

        let result = assembler.capture_manual(None).await;
        assert!(matches!(result, Err(CaptureError::ProofOfWork { .. })));
        assert!(stores.records.list(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_capture_attaches_last_five_events() {
        let stores = Stores::in_memory().unwrap();
        let assembler = assembler(stores);
        for i in 0..8 {
            let mut event = impact_event();
            event.id = format!("evt-{}", i);
            assembler.recent_events().push(event);
        }

        let record = assembler.capture_manual(None).await.unwrap();
        let ids: Vec<_> = record.associated_events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["evt-3", "evt-4", "evt-5", "evt-6", "evt-7"]);
    }

    #[tokio::test]
    async fn test_collection_session_produces_continuous_record() {
        let stores = Stores::in_memory().unwrap();
        let assembler = assembler(stores);

        assert!(assembler.stop_collection().await.unwrap().is_none());
        assert!(assembler.start_collection());
        assert!(!assembler.start_collection());
        assert!(assembler.collection_active());

        let record = assembler.stop_collection().await.unwrap().unwrap();
        assert_eq!(record.collection_mode, CollectionMode::Continuous);
        assert_eq!(record.context_id, "telemetry");
        assert!(!assembler.collection_active());
    }

    #[test]
    fn test_latest_readings_snapshot() {
        let readings = LatestReadings::new();
        readings.update(&SensorReading::now(SensorValue::Accelerometer(Vector3::new(
            0.1, 9.8, 0.2,
        ))));
        readings.update(&SensorReading::now(SensorValue::Barometer { pressure: 1012.0 }));

        let snapshot = readings.snapshot();
        assert_eq!(snapshot.active_sensors(), 2);
        assert_eq!(snapshot.pressure, Some(1012.0));
        assert!(snapshot.captured_at.is_some());
    }

    #[test]
    fn test_address_display_trims_trailing_separator() {
        let address = Address {
            street: None,
            city: Some("Recife".to_string()),
            region: Some("PE".to_string()),
        };
        assert_eq!(address.display(), ", Recife, PE");

        let address = Address {
            street: Some("Av. Boa Viagem".to_string()),
            city: Some("Recife".to_string()),
            region: None,
        };
        assert_eq!(address.display(), "Av. Boa Viagem, Recife");
    }

    #[tokio::test]
    async fn test_fs_media_capture_reads_relative_to_root() {
        let dir = std::env::temp_dir().join(format!("capture-sync-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("clip.mp4"), b"video").await.unwrap();

        let capture = FsMediaCapture::with_root(&dir);
        assert_eq!(capture.load("clip.mp4").await.unwrap(), b"video");
        assert!(matches!(
            capture.load("absent.mp4").await,
            Err(CaptureError::Media(_))
        ));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
