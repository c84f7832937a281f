//! Configuration loading for crm-sync-engine.
//!
//! Configuration is loaded from a TOML file (default: `crm-sync.toml`).
//! Every section and every field may be omitted; missing values take the
//! defaults documented on each field.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use sync_client::RetryPolicy;
use sync_core::JobOptions;
use sync_types::EntityType;

/// Root configuration for the sync engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Remote API rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Per-call retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Job queue configuration.
    #[serde(default)]
    pub queues: QueueConfig,
    /// Batch polling configuration.
    #[serde(default)]
    pub polling: PollingConfig,
    /// Conflict handling.
    #[serde(default)]
    pub conflicts: ConflictConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Token-bucket limits for the remote API.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity (default: 100).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Refill window in milliseconds (default: 10000).
    #[serde(default = "default_refill_window_ms")]
    pub refill_window_ms: u64,
}

/// Retry policy for single remote calls.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds (default: 32000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Worker pools and job-level reliability.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Outbound-sync workers (default: 5).
    #[serde(default = "default_sync_concurrency")]
    pub outbound_concurrency: usize,
    /// Inbound-sync workers (default: 5).
    #[serde(default = "default_sync_concurrency")]
    pub inbound_concurrency: usize,
    /// Batch-poll workers (default: 1).
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    /// Attempts per job including the first (default: 5).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Job retry backoff base in milliseconds (default: 1000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Lease length in seconds before a silent job counts as stalled
    /// (default: 60).
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
    /// How often the stall reaper runs, in seconds (default: 60).
    #[serde(default = "default_stalled_check_interval_secs")]
    pub stalled_check_interval_secs: u64,
    /// Stalls tolerated before a job fails (default: 3).
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,
    /// Completed jobs kept for inspection (default: 100).
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,
    /// Failed jobs kept for inspection (default: 50).
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,
}

/// Batch polling.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Remote page size (default: 100).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Entity types scanned by an `all` poll (default: contact, company).
    #[serde(default = "default_entity_types")]
    pub entity_types: Vec<EntityType>,
}

/// How newly detected conflicts are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoResolve {
    /// Leave conflicts pending for an operator.
    #[default]
    Manual,
    /// Resolve immediately in favour of the newer side.
    LastWriterWins,
}

/// Conflict handling.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConflictConfig {
    /// Resolution policy (default: manual).
    #[serde(default)]
    pub auto_resolve: AutoResolve,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
    /// Cleanup interval in seconds (default: 3600 = 1 hour).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Days a successful attempt log is kept (default: 30).
    #[serde(default = "default_success_log_retention_days")]
    pub success_log_retention_days: u32,
    /// Days a failed attempt log is kept (default: 90).
    #[serde(default = "default_failed_log_retention_days")]
    pub failed_log_retention_days: u32,
    /// Seconds finished jobs stay in queue history (default: 86400).
    #[serde(default = "default_completed_job_retention_secs")]
    pub completed_job_retention_secs: u64,
}

/// Record store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// SQLite database file.
    #[default]
    Sqlite,
    /// In-process maps, lost on restart.
    Memory,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file, or `:memory:`.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Backend (default: sqlite).
    #[serde(default)]
    pub backend: StorageBackend,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it
    /// (default: `crm_sync=info`).
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// Default value functions
fn default_max_tokens() -> u32 {
    100
}

fn default_refill_window_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    32_000
}

fn default_sync_concurrency() -> usize {
    5
}

fn default_batch_concurrency() -> usize {
    1
}

fn default_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_lock_duration_secs() -> u64 {
    60
}

fn default_stalled_check_interval_secs() -> u64 {
    60
}

fn default_max_stalled_count() -> u32 {
    3
}

fn default_keep_completed() -> usize {
    100
}

fn default_keep_failed() -> usize {
    50
}

fn default_page_size() -> usize {
    100
}

fn default_entity_types() -> Vec<EntityType> {
    EntityType::ALL.to_vec()
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    3600 // 1 hour
}

fn default_success_log_retention_days() -> u32 {
    30
}

fn default_failed_log_retention_days() -> u32 {
    90
}

fn default_completed_job_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_database_path() -> PathBuf {
    PathBuf::from("crm-sync.db")
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_log_filter() -> String {
    "crm_sync=info".to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_window_ms: default_refill_window_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            outbound_concurrency: default_sync_concurrency(),
            inbound_concurrency: default_sync_concurrency(),
            batch_concurrency: default_batch_concurrency(),
            attempts: default_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            lock_duration_secs: default_lock_duration_secs(),
            stalled_check_interval_secs: default_stalled_check_interval_secs(),
            max_stalled_count: default_max_stalled_count(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            entity_types: default_entity_types(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            interval_secs: default_cleanup_interval(),
            success_log_retention_days: default_success_log_retention_days(),
            failed_log_retention_days: default_failed_log_retention_days(),
            completed_job_retention_secs: default_completed_job_retention_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            backend: StorageBackend::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            queues: QueueConfig::default(),
            polling: PollingConfig::default(),
            conflicts: ConflictConfig::default(),
            cleanup: CleanupConfig::default(),
            storage: StorageConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// Refill window as a duration.
    pub fn refill_window(&self) -> Duration {
        Duration::from_millis(self.refill_window_ms)
    }
}

impl RetryConfig {
    /// Retry policy for the remote client.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl QueueConfig {
    /// Job buffer options shared by all three queues.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            lock_duration: Duration::from_secs(self.lock_duration_secs),
            max_stalled_count: self.max_stalled_count,
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
        }
    }

    /// Stall reaper interval.
    pub fn stalled_check_interval(&self) -> Duration {
        Duration::from_secs(self.stalled_check_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// The loaded configuration is validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queues;
        if q.outbound_concurrency == 0 || q.inbound_concurrency == 0 || q.batch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "queue concurrency must be at least 1".into(),
            ));
        }
        if q.attempts == 0 {
            return Err(ConfigError::Invalid("queues.attempts must be at least 1".into()));
        }
        if q.lock_duration_secs == 0 || q.stalled_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "queue lock duration and stall check interval must be positive".into(),
            ));
        }
        if self.rate_limit.max_tokens == 0 {
            return Err(ConfigError::Invalid("rate_limit.max_tokens must be positive".into()));
        }
        if self.rate_limit.refill_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.refill_window_ms must be positive".into(),
            ));
        }
        if self.polling.page_size == 0 {
            return Err(ConfigError::Invalid("polling.page_size must be positive".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(ConfigError::Invalid("cleanup.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Parsed configuration is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
