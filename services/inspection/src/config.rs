use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the inspection service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Report rendering configuration
    #[serde(default)]
    pub report: ReportConfig,
    /// Notification configuration
    #[serde(default)]
    pub notification: NotificationConfig,
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
    /// Deadline applied to each public service operation
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding uploaded views, reports and per-location configs
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Expiry of signed URLs handed out for interactive viewing
    #[serde(default = "default_view_url_expiry_secs")]
    pub view_url_expiry_secs: u64,
    /// Expiry of signed report links sent in notifications
    #[serde(default = "default_notification_url_expiry_secs")]
    pub notification_url_expiry_secs: u64,
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

/// Report rendering configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Attempts per view image download
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    /// Wait after the first failed download, doubled on each further failure
    #[serde(default = "default_download_initial_backoff_ms")]
    pub download_initial_backoff_ms: u64,
    /// Limit on generating and sending a report after a freeze has committed
    #[serde(default = "default_report_timeout_secs")]
    pub timeout_secs: u64,
}

/// Email gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Send notifications after a report is generated
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Email gateway endpoint
    #[serde(default = "default_notification_endpoint")]
    pub endpoint: String,
    /// Sender address
    #[serde(default = "default_sender")]
    pub sender: String,
    /// Gateway application key
    #[serde(default)]
    pub app_key: String,
    /// Gateway application secret
    #[serde(default)]
    pub app_secret: String,
    /// Request timeout in seconds
    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "inspection-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_region() -> String {
    "ap-south-1".to_string()
}

fn default_view_url_expiry_secs() -> u64 {
    3600
}

fn default_notification_url_expiry_secs() -> u64 {
    24 * 3600
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_download_attempts() -> u32 {
    3
}

fn default_download_initial_backoff_ms() -> u64 {
    2000
}

fn default_report_timeout_secs() -> u64 {
    300
}

fn default_notification_endpoint() -> String {
    "https://epatra.padma-ai.com/v1/email/kriya".to_string()
}

fn default_sender() -> String {
    "kriya@aicuedatalab.com".to_string()
}

fn default_notification_timeout_secs() -> u64 {
    15
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "inspection-service")?
            .set_default("service.log_level", "info")?
            .add_source(config::File::with_name("config/inspection").required(false))
            .add_source(config::File::with_name("/etc/inspection/inspection").required(false))
            // INSPECTION__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("INSPECTION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Deadline for a single public service operation
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.service.request_timeout_secs)
    }

    /// Get view URL expiry as Duration
    pub fn view_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.view_url_expiry_secs)
    }

    /// Get notification link expiry as Duration
    pub fn notification_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.notification_url_expiry_secs)
    }
}

impl ReportConfig {
    /// Wait after the first failed download
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.download_initial_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl NotificationConfig {
    /// Gateway request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            download_attempts: default_download_attempts(),
            download_initial_backoff_ms: default_download_initial_backoff_ms(),
            timeout_secs: default_report_timeout_secs(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_notification_endpoint(),
            sender: default_sender(),
            app_key: String::new(),
            app_secret: String::new(),
            timeout_secs: default_notification_timeout_secs(),
        }
    }
}
