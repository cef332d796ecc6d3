use crate::capture::{LatestReadings, RecordAssembler};
use crate::config::DetectionConfig;
use crate::document_store::Stores;
use crate::models::{Event, EventKind, SensorReading, SensorValue, Severity};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Thresholds applied to incoming readings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionThresholds {
    pub impact: f64,
    pub critical_impact: f64,
    pub low_pressure: f64,
    pub rotation: f64,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self::from(&DetectionConfig::default())
    }
}

impl From<&DetectionConfig> for DetectionThresholds {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            impact: config.impact_threshold,
            critical_impact: config.critical_impact_threshold,
            low_pressure: config.low_pressure_threshold,
            rotation: config.rotation_threshold,
        }
    }
}

impl DetectionThresholds {
    /// Classify one reading. Pure: no state is touched.
    pub fn evaluate(&self, reading: &SensorReading) -> Option<Event> {
        let (kind, severity, payload) = match reading.value {
            SensorValue::Accelerometer(v) => {
                let force = v.magnitude();
                if force <= self.impact {
                    return None;
                }
                let severity = if force > self.critical_impact {
                    Severity::Critical
                } else {
                    Severity::High
                };
                (
                    EventKind::Impact,
                    severity,
                    serde_json::json!({ "force": force, "reading": v }),
                )
            }
            SensorValue::Barometer { pressure } => {
                if pressure >= self.low_pressure {
                    return None;
                }
                (
                    EventKind::ExtremeTemperature,
                    Severity::Medium,
                    serde_json::json!({ "pressure": pressure }),
                )
            }
            SensorValue::Gyroscope(v) => {
                let rate = v.magnitude();
                if rate <= self.rotation {
                    return None;
                }
                (
                    EventKind::Movement,
                    Severity::Medium,
                    serde_json::json!({ "angular_rate": rate, "reading": v }),
                )
            }
            SensorValue::Magnetometer(_) | SensorValue::Light { .. } => return None,
        };

        Some(Event {
            id: Uuid::new_v4().to_string(),
            kind,
            source_sensor: reading.value.sensor_name().to_string(),
            payload,
            timestamp: reading.timestamp,
            severity,
        })
    }
}

/// Bounded FIFO of the most recent events, shared with the assembler
#[derive(Debug, Clone)]
pub struct RecentEvents {
    inner: Arc<Mutex<VecDeque<Event>>>,
    capacity: usize,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append, evicting the oldest event once full
    pub fn push(&self, event: Event) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.inner.lock();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Up to `n` most recent events, oldest first
    pub fn last(&self, n: usize) -> Vec<Event> {
        let events = self.inner.lock();
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn all(&self) -> Vec<Event> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Consumes the sensor reading stream and turns threshold crossings into events
pub struct EventDetector {
    thresholds: DetectionThresholds,
    readings: LatestReadings,
    recent: RecentEvents,
    stores: Stores,
    assembler: Arc<RecordAssembler>,
    auto_capture: bool,
}

impl EventDetector {
    pub fn new(
        config: &DetectionConfig,
        readings: LatestReadings,
        stores: Stores,
        assembler: Arc<RecordAssembler>,
    ) -> Self {
        Self {
            thresholds: DetectionThresholds::from(config),
            readings,
            recent: assembler.recent_events().clone(),
            stores,
            assembler,
            auto_capture: config.auto_capture,
        }
    }

    pub fn thresholds(&self) -> &DetectionThresholds {
        &self.thresholds
    }

    pub fn recent_events(&self) -> &RecentEvents {
        &self.recent
    }

    pub fn evaluate(&self, reading: &SensorReading) -> Option<Event> {
        self.thresholds.evaluate(reading)
    }

    /// Process one reading to completion, returning the detected event
    #[instrument(skip(self, reading), fields(sensor = reading.value.sensor_name()))]
    pub async fn handle(&self, reading: SensorReading) -> Option<Event> {
        self.readings.update(&reading);

        let event = self.evaluate(&reading)?;
        metrics::counter!("detector.events.detected").increment(1);

        if let Err(e) = self.stores.events.put_as(&event).await {
            error!(event_id = %event.id, error = %e, "Failed to store event");
            return Some(event);
        }
        self.recent.push(event.clone());

        warn!(
            event_id = %event.id,
            kind = event.kind.as_str(),
            severity = event.severity.as_str(),
            "Sensor event detected"
        );

        if self.auto_capture && event.severity.triggers_capture() {
            // Failures are logged by the assembler.
            if let Ok(record) = self.assembler.capture_automatic(event.clone()).await {
                debug!(event_id = %event.id, record_id = %record.id, "Automatic record created");
            }
        }

        Some(event)
    }

    /// Consume readings in order until every sender is dropped
    pub async fn run(&self, mut readings: mpsc::Receiver<SensorReading>) {
        info!("Event detector started");
        while let Some(reading) = readings.recv().await {
            self.handle(reading).await;
        }
        info!("Sensor reading stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FsMediaCapture, NoLocation, NullDiscovery};
    use crate::config::{CaptureConfig, IntegrityConfig};
    use crate::integrity::{HmacSigner, IntegrityValidator, ProofOfWork};
    use crate::models::{CollectionMode, Record, Vector3};

    fn reading(value: SensorValue) -> SensorReading {
        SensorReading::now(value)
    }

    fn detector_with(config: DetectionConfig) -> (EventDetector, Stores) {
        let stores = Stores::in_memory().unwrap();
        let readings = LatestReadings::new();
        let validator = IntegrityValidator::new(
            Arc::new(HmacSigner::new("field-secret").unwrap()),
            ProofOfWork::default(),
        );
        let integrity = IntegrityConfig {
            secret: "field-secret".to_string(),
            difficulty_prefix: "00".to_string(),
            mine_content_hash: true,
            max_pow_iterations: 1_000_000,
        };
        let assembler = Arc::new(RecordAssembler::new(
            stores.clone(),
            validator,
            Arc::new(readings.clone()),
            Arc::new(NoLocation),
            Arc::new(FsMediaCapture::default()),
            Arc::new(NullDiscovery),
            RecentEvents::new(config.recent_events_capacity),
            CaptureConfig::default(),
            &integrity,
        ));

        (
            EventDetector::new(&config, readings, stores.clone(), assembler),
            stores,
        )
    }

    #[test]
    fn test_moderate_acceleration_is_high_impact() {
        let thresholds = DetectionThresholds::default();
        let event = thresholds
            .evaluate(&reading(SensorValue::Accelerometer(Vector3::new(10.0, 10.0, 10.0))))
            .unwrap();

        assert_eq!(event.kind, EventKind::Impact);
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.source_sensor, "accelerometer");
        let force = event.payload["force"].as_f64().unwrap();
        assert!((force - 17.3205).abs() < 1e-3);
    }

    #[test]
    fn test_strong_acceleration_is_critical() {
        let thresholds = DetectionThresholds::default();
        let event = thresholds
            .evaluate(&reading(SensorValue::Accelerometer(Vector3::new(20.0, 20.0, 0.0))))
            .unwrap();
        assert_eq!(event.severity, Severity::Critical);
    }

    #[test]
    fn test_resting_device_raises_nothing() {
        let thresholds = DetectionThresholds::default();
        assert!(thresholds
            .evaluate(&reading(SensorValue::Accelerometer(Vector3::new(0.0, 9.81, 0.0))))
            .is_none());
        assert!(thresholds
            .evaluate(&reading(SensorValue::Barometer { pressure: 1013.25 }))
            .is_none());
        assert!(thresholds
            .evaluate(&reading(SensorValue::Light { illuminance: 90_000.0 }))
            .is_none());
    }

    #[test]
    fn test_low_pressure_and_rotation_are_medium() {
        let thresholds = DetectionThresholds::default();

        let pressure = thresholds
            .evaluate(&reading(SensorValue::Barometer { pressure: 990.0 }))
            .unwrap();
        assert_eq!(pressure.kind, EventKind::ExtremeTemperature);
        assert_eq!(pressure.severity, Severity::Medium);

        // Exactly at the threshold does not count.
        assert!(thresholds
            .evaluate(&reading(SensorValue::Gyroscope(Vector3::new(3.0, 4.0, 0.0))))
            .is_none());
        let rotation = thresholds
            .evaluate(&reading(SensorValue::Gyroscope(Vector3::new(3.0, 4.0, 1.0))))
            .unwrap();
        assert_eq!(rotation.kind, EventKind::Movement);
        assert_eq!(rotation.severity, Severity::Medium);
    }

    #[test]
    fn test_recent_events_is_bounded_fifo() {
        let (detector, _) = detector_with(DetectionConfig::default());
        let thresholds = DetectionThresholds::default();
        let recent = detector.recent_events();

        for i in 0..25 {
            let mut event = thresholds
                .evaluate(&reading(SensorValue::Barometer { pressure: 900.0 }))
                .unwrap();
            event.id = format!("evt-{}", i);
            recent.push(event);
        }

        assert_eq!(recent.len(), 20);
        assert_eq!(recent.all()[0].id, "evt-5");
        assert_eq!(recent.last(2)[1].id, "evt-24");
        assert_eq!(recent.last(100).len(), 20);
    }

    #[tokio::test]
    async fn test_high_impact_persists_event_and_creates_record() {
        let (detector, stores) = detector_with(DetectionConfig::default());

        let event = detector
            .handle(reading(SensorValue::Accelerometer(Vector3::new(10.0, 10.0, 10.0))))
            .await
            .unwrap();

        let events: Vec<Event> = stores.events.list_as().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);

        let records: Vec<Record> = stores.records.list_as().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].collection_mode, CollectionMode::Automatic);
        assert_eq!(records[0].associated_events[0].id, event.id);
        assert_eq!(detector.recent_events().len(), 1);
    }

    #[tokio::test]
    async fn test_medium_event_creates_no_record() {
        let (detector, stores) = detector_with(DetectionConfig::default());

        detector
            .handle(reading(SensorValue::Barometer { pressure: 950.0 }))
            .await
            .unwrap();

        assert_eq!(stores.events.list(false).await.unwrap().len(), 1);
        assert!(stores.records.list(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_capture_can_be_disabled() {
        let config = DetectionConfig {
            auto_capture: false,
            ..DetectionConfig::default()
        };
        let (detector, stores) = detector_with(config);

        detector
            .handle(reading(SensorValue::Accelerometer(Vector3::new(30.0, 0.0, 0.0))))
            .await
            .unwrap();

        assert!(stores.records.list(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_consumes_stream_in_order() {
        let (detector, stores) = detector_with(DetectionConfig::default());
        let (tx, rx) = mpsc::channel(8);

        tx.send(reading(SensorValue::Gyroscope(Vector3::new(0.1, 0.1, 0.1))))
            .await
            .unwrap();
        tx.send(reading(SensorValue::Barometer { pressure: 980.0 }))
            .await
            .unwrap();
        tx.send(reading(SensorValue::Gyroscope(Vector3::new(6.0, 0.0, 0.0))))
            .await
            .unwrap();
        drop(tx);

        detector.run(rx).await;

        let kinds: Vec<_> = detector
            .recent_events()
            .all()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::ExtremeTemperature, EventKind::Movement]);
        assert_eq!(stores.events.list(false).await.unwrap().len(), 2);
    }
}
