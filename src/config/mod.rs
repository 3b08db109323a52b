//! Configuration loading for the media downloads service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `MEDIA_DOWNLOADS_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "MEDIA_DOWNLOADS_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `MEDIA_DOWNLOADS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default)]
    pub downloads: DownloadsConfig,
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Download execution parameters: storage locations and concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DownloadsConfig {
    /// Root directory for completed downloads; each job owns `<storage_dir>/<job_id>/`.
    ///
    /// Environment variable: `MEDIA_DOWNLOADS_STORAGE_DIR`
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Staging directory for in-flight transfers (default: `<storage_dir>/.partial`).
    ///
    /// Must live on the same filesystem as `storage_dir` so the final rename is atomic.
    ///
    /// Environment variable: `MEDIA_DOWNLOADS_PARTIAL_DIR`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_dir: Option<PathBuf>,

    /// Maximum number of jobs in `DOWNLOADING` across all users (default: 4)
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Maximum number of jobs in `DOWNLOADING` for a single user (default: 2)
    #[serde(default = "default_max_concurrent_per_user")]
    pub max_concurrent_per_user: usize,

    /// Attempt ceiling for automatic retries (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Dispatcher polling interval in milliseconds (default: 1000)
    #[serde(default = "default_dispatch_tick_ms")]
    pub dispatch_tick_ms: u64,

    /// Minimum time between two progress writes for one job (default: 500)
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Byte delta that forces a progress write regardless of interval (default: 8 MiB)
    #[serde(default = "default_progress_bytes_delta")]
    pub progress_bytes_delta: u64,

    /// How long a delete waits for a cancelled worker to acknowledge (default: 5000)
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Free space required on the staging filesystem before admitting a job (default: 256 MiB)
    #[serde(default = "default_min_free_space_bytes")]
    pub min_free_space_bytes: u64,
}

/// Backoff parameters for automatic retries of transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryPolicyConfig {
    /// Base retry interval in seconds (default: 5)
    ///
    /// Subsequent retries use exponential backoff: base_seconds * 2^attempt.
    ///
    /// Environment variable: `MEDIA_DOWNLOADS_RETRY_BASE_SECONDS`
    #[serde(default = "default_retry_base_seconds")]
    pub base_seconds: u64,

    /// Maximum retry interval in seconds (default: 900). Must be >= base_seconds.
    ///
    /// Environment variable: `MEDIA_DOWNLOADS_RETRY_MAX_SECONDS`
    #[serde(default = "default_retry_max_seconds")]
    pub max_seconds: u64,

    /// Jitter factor (default: 0.1, range: 0.0-1.0)
    ///
    /// Environment variable: `MEDIA_DOWNLOADS_RETRY_JITTER_FACTOR`
    #[serde(default = "default_retry_jitter_factor")]
    pub jitter_factor: f64,
}

/// Periodic sweep of expired jobs and orphaned files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    /// Age past the last update after which terminal jobs are removed.
    #[serde(default = "default_cleanup_retention_seconds")]
    pub retention_seconds: u64,
    /// Minimum age of an orphaned staging entry before it is removed.
    #[serde(default = "default_cleanup_orphan_grace_seconds")]
    pub orphan_grace_seconds: u64,
}

/// Remote media library connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RemoteConfig {
    #[serde(default = "default_remote_base_url")]
    pub base_url: String,
    /// Sent as the `ApiKey` header on every remote request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_remote_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// Idle timeout between two body chunks.
    #[serde(default = "default_remote_read_timeout_seconds")]
    pub read_timeout_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            downloads: DownloadsConfig::default(),
            retry_policy: RetryPolicyConfig::default(),
            cleanup: CleanupConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            partial_dir: None,
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_concurrent_per_user: default_max_concurrent_per_user(),
            max_attempts: default_max_attempts(),
            dispatch_tick_ms: default_dispatch_tick_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            progress_bytes_delta: default_progress_bytes_delta(),
            cancel_grace_ms: default_cancel_grace_ms(),
            min_free_space_bytes: default_min_free_space_bytes(),
        }
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_retry_base_seconds(),
            max_seconds: default_retry_max_seconds(),
            jitter_factor: default_retry_jitter_factor(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_cleanup_tick_interval_seconds(),
            retention_seconds: default_cleanup_retention_seconds(),
            orphan_grace_seconds: default_cleanup_orphan_grace_seconds(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_remote_base_url(),
            api_key: None,
            connect_timeout_seconds: default_remote_connect_timeout_seconds(),
            read_timeout_seconds: default_remote_read_timeout_seconds(),
        }
    }
}

impl DownloadsConfig {
    /// Staging directory, falling back to `<storage_dir>/.partial`.
    pub fn partial_dir(&self) -> PathBuf {
        self.partial_dir
            .clone()
            .unwrap_or_else(|| self.storage_dir.join(".partial"))
    }

    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Validate concurrency and timing bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingStorageDir);
        }

        if self.max_concurrent_downloads == 0 || self.max_concurrent_downloads > 256 {
            return Err(ConfigError::InvalidMaxConcurrentDownloads {
                value: self.max_concurrent_downloads,
            });
        }

        if self.max_concurrent_per_user == 0
            || self.max_concurrent_per_user > self.max_concurrent_downloads
        {
            return Err(ConfigError::InvalidMaxConcurrentPerUser {
                value: self.max_concurrent_per_user,
                global: self.max_concurrent_downloads,
            });
        }

        if self.max_attempts < 1 || self.max_attempts > 100 {
            return Err(ConfigError::InvalidMaxAttempts {
                value: self.max_attempts,
            });
        }

        if self.dispatch_tick_ms < 10 || self.dispatch_tick_ms > 60_000 {
            return Err(ConfigError::InvalidDispatchTick {
                value: self.dispatch_tick_ms,
            });
        }

        if self.progress_bytes_delta == 0 {
            return Err(ConfigError::InvalidProgressBytesDelta);
        }

        Ok(())
    }
}

impl RetryPolicyConfig {
    /// Validate retry policy configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidRetryBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRetryJitter {
                value: self.jitter_factor,
            });
        }

        Ok(())
    }
}

impl CleanupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds < 1 || self.tick_interval_seconds > 86_400 {
            return Err(ConfigError::InvalidCleanupTickInterval {
                value: self.tick_interval_seconds,
            });
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.base_url).map_err(|source| ConfigError::InvalidRemoteBaseUrl {
            value: self.base_url.clone(),
            source,
        })?;

        if self.connect_timeout_seconds == 0 || self.read_timeout_seconds == 0 {
            return Err(ConfigError::InvalidRemoteTimeout);
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.remote.api_key.is_some() {
            config.remote.api_key = Some(REDACTED.to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.downloads.validate()?;
        self.retry_policy.validate()?;
        self.cleanup.validate()?;
        self.remote.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://media-downloads.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./data/downloads")
}

fn default_max_concurrent_downloads() -> usize {
    4
}

fn default_max_concurrent_per_user() -> usize {
    2
}

fn default_max_attempts() -> i32 {
    3
}

fn default_dispatch_tick_ms() -> u64 {
    1000 // 1 second
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_progress_bytes_delta() -> u64 {
    8 * 1024 * 1024 // 8 MiB
}

fn default_cancel_grace_ms() -> u64 {
    5000 // 5 seconds
}

fn default_min_free_space_bytes() -> u64 {
    256 * 1024 * 1024 // 256 MiB
}

fn default_retry_base_seconds() -> u64 {
    5 // 5 seconds
}

fn default_retry_max_seconds() -> u64 {
    900 // 15 minutes
}

fn default_retry_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_cleanup_tick_interval_seconds() -> u64 {
    300 // 5 minutes
}

fn default_cleanup_retention_seconds() -> u64 {
    30 * 86_400 // 30 days
}

fn default_cleanup_orphan_grace_seconds() -> u64 {
    3600 // 1 hour
}

fn default_remote_base_url() -> String {
    "http://localhost:9999".to_string()
}

fn default_remote_connect_timeout_seconds() -> u64 {
    10
}

fn default_remote_read_timeout_seconds() -> u64 {
    60
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set MEDIA_DOWNLOADS_OPERATOR_TOKEN or MEDIA_DOWNLOADS_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("invalid numeric value for {key}: '{value}'")]
    InvalidNumber { key: String, value: String },
    #[error("storage directory must not be empty")]
    MissingStorageDir,
    #[error("max concurrent downloads must be between 1 and 256, got {value}")]
    InvalidMaxConcurrentDownloads { value: usize },
    #[error(
        "max concurrent downloads per user must be between 1 and the global limit ({global}), got {value}"
    )]
    InvalidMaxConcurrentPerUser { value: usize, global: usize },
    #[error("max attempts must be between 1 and 100, got {value}")]
    InvalidMaxAttempts { value: i32 },
    #[error("dispatch tick must be between 10 and 60000 milliseconds, got {value}")]
    InvalidDispatchTick { value: u64 },
    #[error("progress byte delta must be positive")]
    InvalidProgressBytesDelta,
    #[error("retry base seconds ({base}) cannot be greater than max seconds ({max})")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("retry jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRetryJitter { value: f64 },
    #[error("cleanup tick interval must be between 1 and 86400 seconds, got {value}")]
    InvalidCleanupTickInterval { value: u64 },
    #[error("invalid remote base url '{value}': {source}")]
    InvalidRemoteBaseUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("remote timeouts must be positive")]
    InvalidRemoteTimeout,
}

/// Loads configuration using layered `.env` files and `MEDIA_DOWNLOADS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration. Process environment wins over files.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Support both a single token and a comma-separated list
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens)
        } else if let Some(token) = take_string(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let downloads = DownloadsConfig {
            storage_dir: take_string(&mut layered, "STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_storage_dir),
            partial_dir: take_string(&mut layered, "PARTIAL_DIR").map(PathBuf::from),
            max_concurrent_downloads: take_parsed(&mut layered, "MAX_CONCURRENT_DOWNLOADS")?
                .unwrap_or_else(default_max_concurrent_downloads),
            max_concurrent_per_user: take_parsed(&mut layered, "MAX_CONCURRENT_PER_USER")?
                .unwrap_or_else(default_max_concurrent_per_user),
            max_attempts: take_parsed(&mut layered, "MAX_ATTEMPTS")?
                .unwrap_or_else(default_max_attempts),
            dispatch_tick_ms: take_parsed(&mut layered, "DISPATCH_TICK_MS")?
                .unwrap_or_else(default_dispatch_tick_ms),
            progress_interval_ms: take_parsed(&mut layered, "PROGRESS_INTERVAL_MS")?
                .unwrap_or_else(default_progress_interval_ms),
            progress_bytes_delta: take_parsed(&mut layered, "PROGRESS_BYTES_DELTA")?
                .unwrap_or_else(default_progress_bytes_delta),
            cancel_grace_ms: take_parsed(&mut layered, "CANCEL_GRACE_MS")?
                .unwrap_or_else(default_cancel_grace_ms),
            min_free_space_bytes: take_parsed(&mut layered, "MIN_FREE_SPACE_BYTES")?
                .unwrap_or_else(default_min_free_space_bytes),
        };

        let retry_policy = RetryPolicyConfig {
            base_seconds: take_parsed(&mut layered, "RETRY_BASE_SECONDS")?
                .unwrap_or_else(default_retry_base_seconds),
            max_seconds: take_parsed(&mut layered, "RETRY_MAX_SECONDS")?
                .unwrap_or_else(default_retry_max_seconds),
            jitter_factor: take_parsed(&mut layered, "RETRY_JITTER_FACTOR")?
                .unwrap_or_else(default_retry_jitter_factor),
        };

        let cleanup = CleanupConfig {
            tick_interval_seconds: take_parsed(&mut layered, "CLEANUP_TICK_INTERVAL_SECONDS")?
                .unwrap_or_else(default_cleanup_tick_interval_seconds),
            retention_seconds: take_parsed(&mut layered, "CLEANUP_RETENTION_SECONDS")?
                .unwrap_or_else(default_cleanup_retention_seconds),
            orphan_grace_seconds: take_parsed(&mut layered, "CLEANUP_ORPHAN_GRACE_SECONDS")?
                .unwrap_or_else(default_cleanup_orphan_grace_seconds),
        };

        let remote = RemoteConfig {
            base_url: take_string(&mut layered, "REMOTE_BASE_URL")
                .unwrap_or_else(default_remote_base_url),
            api_key: take_string(&mut layered, "REMOTE_API_KEY"),
            connect_timeout_seconds: take_parsed(&mut layered, "REMOTE_CONNECT_TIMEOUT_SECONDS")?
                .unwrap_or_else(default_remote_connect_timeout_seconds),
            read_timeout_seconds: take_parsed(&mut layered, "REMOTE_READ_TIMEOUT_SECONDS")?
                .unwrap_or_else(default_remote_read_timeout_seconds),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            downloads,
            retry_policy,
            cleanup,
            remote,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match take_string(layered, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber {
                key: format!("{ENV_PREFIX}{key}"),
                value: raw,
            }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
