use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the uploads service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 / MinIO configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Event bus configuration
    #[serde(default)]
    pub events: EventsConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Pagination defaults for file listings
    #[serde(default)]
    pub pagination: PaginationConfig,
    /// Orphaned object reconciliation
    #[serde(default)]
    pub janitor: JanitorConfig,
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

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding uploaded files
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Static access key. Falls back to the default AWS credential chain when unset.
    pub access_key_id: Option<String>,
    /// Static secret key
    pub secret_access_key: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// In-process event bus configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Per-topic broadcast buffer. Subscribers further behind than this skip events.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// API configuration
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
    /// Request body ceiling for uploads (10MB default)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Uploads allowed per user within one window. Zero disables the limiter.
    #[serde(default = "default_upload_rate_limit")]
    pub upload_rate_limit: u32,
    #[serde(default = "default_upload_rate_window_secs")]
    pub upload_rate_window_secs: u64,
}

/// Pagination defaults
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    #[serde(default = "default_page")]
    pub default_page: i64,
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    /// Larger requested limits are clamped to this value
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
}

/// Reconciliation sweep that removes blobs no live file record references
#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between sweeps
    #[serde(default = "default_janitor_interval_secs")]
    pub interval_secs: u64,
    /// Objects younger than this are never reclaimed (their row may still be in flight)
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "uploads-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bucket() -> String {
    "fileuploads".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    256
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_upload_rate_limit() -> u32 {
    10
}

fn default_upload_rate_window_secs() -> u64 {
    60
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    10
}

fn default_max_limit() -> i64 {
    100
}

fn default_janitor_interval_secs() -> u64 {
    3600
}

fn default_grace_period_secs() -> u64 {
    900 // 15 minutes
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "uploads-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/uploads").required(false))
            .add_source(config::File::with_name("/etc/uploads/uploads").required(false))
            // Override with environment variables
            // UPLOADS__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("UPLOADS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ApiConfig {
    pub fn upload_rate_window(&self) -> Duration {
        Duration::from_secs(self.upload_rate_window_secs)
    }
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
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

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
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
            max_upload_bytes: default_max_upload_bytes(),
            upload_rate_limit: default_upload_rate_limit(),
            upload_rate_window_secs: default_upload_rate_window_secs(),
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page: default_page(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_janitor_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_bucket(), "fileuploads");
        assert_eq!(default_presigned_url_expiry_secs(), 3600);
        assert_eq!(default_max_upload_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn test_pagination_defaults() {
        let pagination = PaginationConfig::default();
        assert_eq!(pagination.default_page, 1);
        assert_eq!(pagination.default_limit, 10);
        assert_eq!(pagination.max_limit, 100);
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = config::Config::builder()
            .set_override("s3.endpoint_url", "http://localhost:9000")
            .unwrap()
            .set_override("database.url", "postgres://localhost/uploads")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.s3.bucket, "fileuploads");
        assert_eq!(config.api.port, 3000);
        assert!(config.janitor.enabled);
        assert_eq!(config.janitor.grace_period(), Duration::from_secs(900));
        assert_eq!(config.events.channel_capacity, 256);
        assert_eq!(config.api.upload_rate_limit, 10);
        assert_eq!(config.api.upload_rate_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_database_timeouts() {
        let config: Config = config::Config::builder()
            .set_override("s3.endpoint_url", "http://localhost:9000")
            .unwrap()
            .set_override("database.url", "postgres://localhost/uploads")
            .unwrap()
            .set_override("database.connect_timeout_secs", 5)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.database.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.database.idle_timeout(), Duration::from_secs(600));
    }
}
