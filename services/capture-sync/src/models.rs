//! Persisted entities and the sensor reading types consumed from collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of a record
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Sending,
    Delivered,
    /// Kept locally by explicit choice, never delivered
    Archived,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Archived => "archived",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// How a record came to be captured
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    #[default]
    Manual,
    Automatic,
    Continuous,
}

impl CollectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionMode::Manual => "manual",
            CollectionMode::Automatic => "automatic",
            CollectionMode::Continuous => "continuous",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    #[default]
    None,
}

/// Reference from a record to a stored [`Media`] entity
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaReference {
    pub media_id: Option<String>,
    pub kind: MediaKind,
    pub content_hash: Option<String>,
    pub locator: Option<String>,
}

/// Geolocation fix as reported by the location collaborator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Concurrent readings of every sensor at capture time
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SensorSnapshot {
    pub accelerometer: Option<Vector3>,
    pub gyroscope: Option<Vector3>,
    pub magnetometer: Option<Vector3>,
    pub pressure: Option<f64>,
    pub illuminance: Option<f64>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl SensorSnapshot {
    pub fn is_empty(&self) -> bool {
        self.accelerometer.is_none()
            && self.gyroscope.is_none()
            && self.magnetometer.is_none()
            && self.pressure.is_none()
            && self.illuminance.is_none()
    }

    pub fn active_sensors(&self) -> usize {
        [
            self.accelerometer.is_some(),
            self.gyroscope.is_some(),
            self.magnetometer.is_some(),
            self.pressure.is_some(),
            self.illuminance.is_some(),
        ]
        .iter()
        .filter(|active| **active)
        .count()
    }
}

/// One value pushed by a sensor subscription
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "sensor", rename_all = "snake_case")]
pub enum SensorValue {
    Accelerometer(Vector3),
    Gyroscope(Vector3),
    Magnetometer(Vector3),
    Barometer { pressure: f64 },
    Light { illuminance: f64 },
}

impl SensorValue {
    pub fn sensor_name(&self) -> &'static str {
        match self {
            SensorValue::Accelerometer(_) => "accelerometer",
            SensorValue::Gyroscope(_) => "gyroscope",
            SensorValue::Magnetometer(_) => "magnetometer",
            SensorValue::Barometer { .. } => "barometer",
            SensorValue::Light { .. } => "light",
        }
    }
}

/// A timestamped sensor reading
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SensorReading {
    #[serde(flatten)]
    pub value: SensorValue,
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    pub fn now(value: SensorValue) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Impact,
    ExcessiveVibration,
    /// Also used for atmospheric pressure anomalies
    ExtremeTemperature,
    DoorOpen,
    Movement,
    LocationChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Impact => "impact",
            EventKind::ExcessiveVibration => "excessive-vibration",
            EventKind::ExtremeTemperature => "extreme-temperature",
            EventKind::DoorOpen => "door-open",
            EventKind::Movement => "movement",
            EventKind::LocationChanged => "location-changed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// High and critical events create a record automatically
    pub fn triggers_capture(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

/// A threshold crossing detected on the sensor stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub source_sensor: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

/// A captured photo or video, referenced by records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Media {
    pub id: String,
    pub kind: MediaKind,
    pub storage_locator: String,
    pub content_hash: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    pub resolution: Option<String>,
    pub duration_seconds: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Nearby device reported by discovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i32>,
}

/// The core persisted entity.
///
/// Required fields carry serde defaults so documents written by older
/// clients still load and can be reported as incomplete by validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub subject_label: String,
    #[serde(default)]
    pub category_id: String,
    #[serde(default)]
    pub category_name: String,
    #[serde(default)]
    pub context_id: String,
    #[serde(default)]
    pub captured_at_millis: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pow_nonce: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_signature: Option<String>,
    #[serde(default)]
    pub integrity_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,

    #[serde(default)]
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub delivery_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_snapshot: Option<SensorSnapshot>,
    #[serde(default)]
    pub associated_events: Vec<Event>,
    #[serde(default)]
    pub detected_devices: Vec<DiscoveredDevice>,

    #[serde(default)]
    pub collection_mode: CollectionMode,
    #[serde(default)]
    pub collection_duration_seconds: u64,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub provenance: String,
    #[serde(default)]
    pub media: MediaReference,
}

impl Record {
    /// Delivered records are identified by their remote content id
    pub fn is_delivered(&self) -> bool {
        self.remote_content_id.is_some() || self.delivery_status == DeliveryStatus::Delivered
    }

    /// Neither further validation nor delivery applies
    pub fn is_terminal(&self) -> bool {
        self.invalid || self.is_delivered()
    }

    /// Hash of the referenced photo or video, if any
    pub fn media_hash(&self) -> Option<&str> {
        match self.media.kind {
            MediaKind::Photo | MediaKind::Video => self.media.content_hash.as_deref(),
            MediaKind::None => None,
        }
    }

    pub fn has_media(&self) -> bool {
        self.media.kind != MediaKind::None
    }
}
