//! Capture Sync Service
//!
//! Record integrity and synchronization for field sensor captures. Records
//! are assembled from sensor snapshots, location fixes and detected events,
//! proven with a proof-of-work content hash and an HMAC integrity signature,
//! persisted in a keyed document store, and delivered to a remote endpoint
//! through a retryable queue.
//!
//! ## Features
//!
//! - **Keyed Document Store**: namespaced JSON documents over SQLite (or an
//!   in-memory map), keyed `<namespace>_<id>`
//! - **Integrity Validation**: structural and proof-of-work check followed by
//!   a keyed HMAC-SHA256 signature over a canonical projection
//! - **Event Detection**: threshold detection over the sensor stream, with
//!   automatic capture for high and critical events
//! - **Reliable Delivery**: per-record serialised attempts, a persistent
//!   queue drained with bounded concurrency
//!
//! ## Architecture
//!
//! ```text
//! Sensor readings           Record Assembler            Document Store
//! ┌──────────────┐          ┌──────────────┐           ┌──────────────┐
//! │ mpsc stream  │─────────▶│ snapshot +   │──────────▶│ records      │
//! └──────────────┘          │ location +   │           │ events       │
//!        │                  │ events       │           │ media        │
//!        ▼                  └──────────────┘           │ delivery-    │
//! ┌──────────────┐                 │                   │   queue      │
//! │ Event        │─────────────────┘                   └──────────────┘
//! │ Detector     │          ┌──────────────┐                  │
//! └──────────────┘          │ Integrity    │                  ▼
//!                           │ Validator    │           ┌──────────────┐
//!                           └──────────────┘           │ Sync Queue / │
//!                                                      │ Uploader     │──▶ HTTP
//!                                                      └──────────────┘
//! ```

pub mod api;
pub mod audit;
pub mod capture;
pub mod config;
pub mod delivery;
pub mod document_store;
pub mod error;
pub mod event_detector;
pub mod integrity;
pub mod models;

pub use api::{start_api_server, AppState};
pub use audit::{AuditSummary, Auditor, RecordStats};
pub use capture::{
    CaptureRequest, FsMediaCapture, LatestReadings, LocationCapture, NoLocation, NullDiscovery,
    RecordAssembler,
};
pub use config::Config;
pub use delivery::{
    DeliveryOutcome, DeliveryPayload, HttpTransport, RecordLocks, SyncQueue, Uploader,
};
pub use document_store::{DocumentStore, KeyValueBackend, MemoryBackend, SqliteBackend, Stores};
pub use error::{CaptureError, DeliveryError, StoreError, ValidationFailure};
pub use event_detector::{DetectionThresholds, EventDetector, RecentEvents};
pub use integrity::{HmacSigner, IntegrityValidator, ProofOfWork, Verdict};
pub use models::{Event, Media, Record, SensorReading};
