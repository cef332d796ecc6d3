use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Main configuration for the capture sync service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Document store configuration
    pub store: StoreConfig,
    /// Integrity validation configuration
    pub integrity: IntegrityConfig,
    /// Remote synchronization configuration
    #[serde(default)]
    pub sync: SyncConfig,
    /// Event detection thresholds
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Record capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Document store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite connection URL
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Integrity validation configuration.
///
/// The secret has no default; it must come from a config file or
/// `CAPTURE__INTEGRITY__SECRET`.
#[derive(Clone, Deserialize)]
pub struct IntegrityConfig {
    /// Shared secret for the keyed integrity signature
    pub secret: String,
    /// Required hex prefix of a record's content hash
    #[serde(default = "default_difficulty_prefix")]
    pub difficulty_prefix: String,
    /// Mine a nonce so generated content hashes meet the difficulty
    #[serde(default = "default_true")]
    pub mine_content_hash: bool,
    /// Upper bound on nonces tried while mining
    #[serde(default = "default_max_pow_iterations")]
    pub max_pow_iterations: u64,
}

impl fmt::Debug for IntegrityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityConfig")
            .field("secret", &"<redacted>")
            .field("difficulty_prefix", &self.difficulty_prefix)
            .field("mine_content_hash", &self.mine_content_hash)
            .field("max_pow_iterations", &self.max_pow_iterations)
            .finish()
    }
}

/// Remote synchronization configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Endpoint receiving delivered records
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,
    /// Per-attempt timeout in seconds
    #[serde(default = "default_delivery_timeout_secs")]
    pub timeout_secs: u64,
    /// Interval between queue drain passes in seconds
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
    /// Concurrent deliveries per drain pass
    #[serde(default = "default_drain_concurrency")]
    pub drain_concurrency: usize,
    /// Drop a queue entry after this many failed attempts (unbounded if unset)
    #[serde(default)]
    pub max_queue_attempts: Option<u32>,
}

/// Event detection thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Acceleration magnitude above which an impact is raised
    #[serde(default = "default_impact_threshold")]
    pub impact_threshold: f64,
    /// Acceleration magnitude above which an impact is critical
    #[serde(default = "default_critical_impact_threshold")]
    pub critical_impact_threshold: f64,
    /// Barometric pressure below which an atmospheric anomaly is raised
    #[serde(default = "default_low_pressure_threshold")]
    pub low_pressure_threshold: f64,
    /// Angular rate magnitude above which a rotation event is raised
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold: f64,
    /// Number of recent events kept in memory
    #[serde(default = "default_recent_events_capacity")]
    pub recent_events_capacity: usize,
    /// Create a record automatically for high/critical events
    #[serde(default = "default_true")]
    pub auto_capture: bool,
    /// Buffer size of the sensor reading channel
    #[serde(default = "default_reading_channel_capacity")]
    pub reading_channel_capacity: usize,
}

/// Record capture configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Location lookup timeout in seconds
    #[serde(default = "default_location_timeout_secs")]
    pub location_timeout_secs: u64,
    /// Recent events attached to a manual capture
    #[serde(default = "default_manual_event_window")]
    pub manual_event_window: usize,
    /// Recent events attached to a media capture
    #[serde(default = "default_media_event_window")]
    pub media_event_window: usize,
}

/// API configuration for the record endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "capture-sync-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_store_url() -> String {
    "sqlite://data/capture-sync.db".to_string()
}

fn default_max_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_difficulty_prefix() -> String {
    "00".to_string()
}

fn default_max_pow_iterations() -> u64 {
    1_000_000
}

fn default_endpoint_url() -> String {
    "https://api.example.com/data".to_string()
}

fn default_delivery_timeout_secs() -> u64 {
    15
}

fn default_drain_interval_secs() -> u64 {
    60
}

fn default_drain_concurrency() -> usize {
    4
}

fn default_impact_threshold() -> f64 {
    15.0
}

fn default_critical_impact_threshold() -> f64 {
    25.0
}

fn default_low_pressure_threshold() -> f64 {
    1000.0
}

fn default_rotation_threshold() -> f64 {
    5.0
}

fn default_recent_events_capacity() -> usize {
    20
}

fn default_reading_channel_capacity() -> usize {
    256
}

fn default_location_timeout_secs() -> u64 {
    10
}

fn default_manual_event_window() -> usize {
    5
}

fn default_media_event_window() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "capture-sync-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("store.url", default_store_url())?
            // Add config file if present
            .add_source(config::File::with_name("config/capture-sync").required(false))
            .add_source(config::File::with_name("/etc/capture-sync/capture-sync").required(false))
            // Override with environment variables
            // CAPTURE__INTEGRITY__SECRET -> integrity.secret
            .add_source(
                config::Environment::with_prefix("CAPTURE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.integrity.secret.trim().is_empty() {
            anyhow::bail!("integrity.secret must not be empty");
        }
        if !self
            .integrity
            .difficulty_prefix
            .chars()
            .all(|c| matches!(c, '0'..='9' | 'a'..='f'))
        {
            anyhow::bail!(
                "integrity.difficulty_prefix must be lowercase hex, got {:?}",
                self.integrity.difficulty_prefix
            );
        }
        if self.integrity.difficulty_prefix.len() > 64 {
            anyhow::bail!("integrity.difficulty_prefix is longer than a SHA-256 digest");
        }
        if self.sync.timeout_secs == 0 {
            anyhow::bail!("sync.timeout_secs must be greater than zero");
        }
        if self.sync.drain_concurrency == 0 {
            anyhow::bail!("sync.drain_concurrency must be greater than zero");
        }
        if self.sync.drain_interval_secs == 0 {
            anyhow::bail!("sync.drain_interval_secs must be greater than zero");
        }
        if self.detection.reading_channel_capacity == 0 {
            anyhow::bail!("detection.reading_channel_capacity must be greater than zero");
        }
        if self.detection.critical_impact_threshold < self.detection.impact_threshold {
            anyhow::bail!("detection.critical_impact_threshold is below impact_threshold");
        }
        Ok(())
    }

    /// Get store connection timeout as Duration
    pub fn store_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.store.connect_timeout_secs)
    }

    /// Get per-attempt delivery timeout as Duration
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout_secs)
    }

    /// Get queue drain interval as Duration
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.sync.drain_interval_secs)
    }

    /// Get location lookup timeout as Duration
    pub fn location_timeout(&self) -> Duration {
        Duration::from_secs(self.capture.location_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            timeout_secs: default_delivery_timeout_secs(),
            drain_interval_secs: default_drain_interval_secs(),
            drain_concurrency: default_drain_concurrency(),
            max_queue_attempts: None,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            impact_threshold: default_impact_threshold(),
            critical_impact_threshold: default_critical_impact_threshold(),
            low_pressure_threshold: default_low_pressure_threshold(),
            rotation_threshold: default_rotation_threshold(),
            recent_events_capacity: default_recent_events_capacity(),
            auto_capture: true,
            reading_channel_capacity: default_reading_channel_capacity(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            location_timeout_secs: default_location_timeout_secs(),
            manual_event_window: default_manual_event_window(),
            media_event_window: default_media_event_window(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
