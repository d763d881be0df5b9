//! Configuration loading for the issue mirror service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `ISSUE_MIRROR_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "ISSUE_MIRROR_";

/// Application configuration derived from `ISSUE_MIRROR_*` environment variables.
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
    #[serde(default = "default_http_request_timeout_seconds")]
    pub http_request_timeout_seconds: u64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub issue_sync: IssueSyncSettings,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub attachments: AttachmentConfig,
}

/// Scheduler tick, stale-job watchdog and shutdown parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    /// Jobs left `pending`/`running` longer than this are failed by the watchdog
    #[serde(default = "default_scheduler_stale_job_timeout_minutes")]
    pub stale_job_timeout_minutes: u64,
    /// Delay before a config blocked by a bidirectional conflict is retried
    #[serde(default = "default_scheduler_conflict_retry_seconds")]
    pub conflict_retry_seconds: u64,
    /// How long shutdown waits for in-flight jobs before cancelling them
    #[serde(default = "default_scheduler_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    /// How long cancelled jobs get to finish their current issue before abort
    #[serde(default = "default_scheduler_cancel_grace_seconds")]
    pub cancel_grace_seconds: u64,
    #[serde(default = "default_scheduler_max_configs_per_tick")]
    pub max_configs_per_tick: u64,
    #[serde(default = "default_sync_interval_min_minutes")]
    pub sync_interval_min_minutes: u32,
    #[serde(default = "default_sync_interval_max_minutes")]
    pub sync_interval_max_minutes: u32,
}

/// Batch and pagination caps for one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct IssueSyncSettings {
    /// Issues processed between two progress checkpoints
    #[serde(default = "default_sync_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sync_per_page")]
    pub per_page: u32,
    #[serde(default = "default_sync_max_pages_per_request")]
    pub max_pages_per_request: u32,
    #[serde(default = "default_sync_max_issues_per_sync")]
    pub max_issues_per_sync: usize,
}

/// Fixed inter-call delay and retry policy for rate-limited calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_rate_limit_max_retries")]
    pub max_retries: u32,
    /// Backoff for attempt `n` is `backoff_base_ms * 2^n`
    #[serde(default = "default_rate_limit_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

/// Per-instance circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_circuit_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: u64,
    #[serde(default = "default_circuit_success_threshold")]
    pub success_threshold: u32,
}

/// Attachment download limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AttachmentConfig {
    #[serde(default = "default_attachment_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_attachment_download_timeout_seconds")]
    pub download_timeout_seconds: u64,
    #[serde(default = "default_attachment_max_redirects")]
    pub max_redirects: u32,
    /// Hosts exempt from private-address rejection, e.g. an internal GitLab
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_hosts: Vec<String>,
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
            http_request_timeout_seconds: default_http_request_timeout_seconds(),
            scheduler: SchedulerConfig::default(),
            issue_sync: IssueSyncSettings::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            attachments: AttachmentConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_scheduler_tick_interval_seconds(),
            stale_job_timeout_minutes: default_scheduler_stale_job_timeout_minutes(),
            conflict_retry_seconds: default_scheduler_conflict_retry_seconds(),
            shutdown_timeout_seconds: default_scheduler_shutdown_timeout_seconds(),
            cancel_grace_seconds: default_scheduler_cancel_grace_seconds(),
            max_configs_per_tick: default_scheduler_max_configs_per_tick(),
            sync_interval_min_minutes: default_sync_interval_min_minutes(),
            sync_interval_max_minutes: default_sync_interval_max_minutes(),
        }
    }
}

impl Default for IssueSyncSettings {
    fn default() -> Self {
        Self {
            batch_size: default_sync_batch_size(),
            per_page: default_sync_per_page(),
            max_pages_per_request: default_sync_max_pages_per_request(),
            max_issues_per_sync: default_sync_max_issues_per_sync(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_rate_limit_delay_ms(),
            max_retries: default_rate_limit_max_retries(),
            backoff_base_ms: default_rate_limit_backoff_base_ms(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_circuit_failure_threshold(),
            recovery_timeout_seconds: default_circuit_recovery_timeout_seconds(),
            success_threshold: default_circuit_success_threshold(),
        }
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_attachment_max_size_bytes(),
            download_timeout_seconds: default_attachment_download_timeout_seconds(),
            max_redirects: default_attachment_max_redirects(),
            allowed_hosts: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a JSON representation with database credentials redacted.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if let Ok(mut url) = Url::parse(&config.database_url)
            && url.password().is_some()
            && url.set_password(Some("[REDACTED]")).is_ok()
        {
            config.database_url = url.to_string();
        }
        serde_json::to_string_pretty(&config)
    }

    pub fn http_request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_request_timeout_seconds)
    }

    /// Validate every configuration group.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }
        if self.http_request_timeout_seconds == 0 || self.http_request_timeout_seconds > 600 {
            return Err(ConfigError::InvalidHttpTimeout {
                value: self.http_request_timeout_seconds,
            });
        }
        self.scheduler.validate()?;
        self.issue_sync.validate()?;
        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        self.attachments.validate()?;
        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds == 0 || self.tick_interval_seconds > 3600 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }
        if self.stale_job_timeout_minutes == 0 {
            return Err(ConfigError::InvalidStaleJobTimeout {
                value: self.stale_job_timeout_minutes,
            });
        }
        if self.max_configs_per_tick == 0 {
            return Err(ConfigError::InvalidMaxConfigsPerTick {
                value: self.max_configs_per_tick,
            });
        }
        if self.sync_interval_min_minutes == 0
            || self.sync_interval_min_minutes > self.sync_interval_max_minutes
        {
            return Err(ConfigError::InvalidSyncIntervalBounds {
                min: self.sync_interval_min_minutes,
                max: self.sync_interval_max_minutes,
            });
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }

    /// Clamp a config's interval into the allowed range.
    pub fn clamp_interval_minutes(&self, minutes: i32) -> i64 {
        let minutes = i64::from(minutes.max(0));
        minutes.clamp(
            i64::from(self.sync_interval_min_minutes),
            i64::from(self.sync_interval_max_minutes),
        )
    }
}

impl IssueSyncSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize {
                value: self.batch_size,
            });
        }
        // GitLab caps per_page at 100
        if self.per_page == 0 || self.per_page > 100 {
            return Err(ConfigError::InvalidPerPage {
                value: self.per_page,
            });
        }
        if self.max_pages_per_request == 0 || self.max_issues_per_sync == 0 {
            return Err(ConfigError::InvalidPaginationCaps {
                max_pages: self.max_pages_per_request,
                max_issues: self.max_issues_per_sync,
            });
        }
        Ok(())
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries > 10 {
            return Err(ConfigError::InvalidRateLimitRetries {
                value: self.max_retries,
            });
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ConfigError::InvalidCircuitThresholds {
                failure: self.failure_threshold,
                success: self.success_threshold,
            });
        }
        Ok(())
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }
}

impl AttachmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size_bytes == 0 {
            return Err(ConfigError::InvalidAttachmentMaxSize {
                value: self.max_size_bytes,
            });
        }
        if self.download_timeout_seconds == 0 {
            return Err(ConfigError::InvalidAttachmentTimeout {
                value: self.download_timeout_seconds,
            });
        }
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
    "sqlite://issue_mirror.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_http_request_timeout_seconds() -> u64 {
    30
}

fn default_scheduler_tick_interval_seconds() -> u64 {
    60
}

fn default_scheduler_stale_job_timeout_minutes() -> u64 {
    120
}

fn default_scheduler_conflict_retry_seconds() -> u64 {
    60
}

fn default_scheduler_shutdown_timeout_seconds() -> u64 {
    30
}

fn default_scheduler_cancel_grace_seconds() -> u64 {
    5
}

fn default_scheduler_max_configs_per_tick() -> u64 {
    100
}

fn default_sync_interval_min_minutes() -> u32 {
    5
}

fn default_sync_interval_max_minutes() -> u32 {
    1440
}

fn default_sync_batch_size() -> usize {
    20
}

fn default_sync_per_page() -> u32 {
    100
}

fn default_sync_max_pages_per_request() -> u32 {
    10
}

fn default_sync_max_issues_per_sync() -> usize {
    500
}

fn default_rate_limit_delay_ms() -> u64 {
    200
}

fn default_rate_limit_max_retries() -> u32 {
    3
}

fn default_rate_limit_backoff_base_ms() -> u64 {
    1000
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_recovery_timeout_seconds() -> u64 {
    60
}

fn default_circuit_success_threshold() -> u32 {
    2
}

fn default_attachment_max_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_attachment_download_timeout_seconds() -> u64 {
    30
}

fn default_attachment_max_redirects() -> u32 {
    10
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
    #[error("database max connections must be positive, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("http request timeout must be between 1 and 600 seconds, got {value}")]
    InvalidHttpTimeout { value: u64 },
    #[error("scheduler tick interval must be between 1 and 3600 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("stale job timeout must be at least one minute, got {value}")]
    InvalidStaleJobTimeout { value: u64 },
    #[error("scheduler must evaluate at least one config per tick, got {value}")]
    InvalidMaxConfigsPerTick { value: u64 },
    #[error("sync interval bounds are invalid (min: {min}, max: {max})")]
    InvalidSyncIntervalBounds { min: u32, max: u32 },
    #[error("sync batch size must be positive, got {value}")]
    InvalidBatchSize { value: usize },
    #[error("sync page size must be between 1 and 100, got {value}")]
    InvalidPerPage { value: u32 },
    #[error("pagination caps must be positive (max pages: {max_pages}, max issues: {max_issues})")]
    InvalidPaginationCaps { max_pages: u32, max_issues: usize },
    #[error("rate limit max retries must not exceed 10, got {value}")]
    InvalidRateLimitRetries { value: u32 },
    #[error("circuit breaker thresholds must be positive (failure: {failure}, success: {success})")]
    InvalidCircuitThresholds { failure: u32, success: u32 },
    #[error("attachment size limit must be positive, got {value}")]
    InvalidAttachmentMaxSize { value: u64 },
    #[error("attachment download timeout must be positive, got {value}")]
    InvalidAttachmentTimeout { value: u64 },
}

/// Loads configuration using layered `.env` files and `ISSUE_MIRROR_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = take_string(&mut layered, "API_BIND_ADDR", default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL", default_log_level);
        let log_format = take_string(&mut layered, "LOG_FORMAT", default_log_format);
        let database_url = take_string(&mut layered, "DATABASE_URL", default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let http_request_timeout_seconds = layered
            .remove("HTTP_REQUEST_TIMEOUT_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_http_request_timeout_seconds);

        let scheduler = SchedulerConfig {
            tick_interval_seconds: layered
                .remove("SCHEDULER_TICK_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_tick_interval_seconds),
            stale_job_timeout_minutes: layered
                .remove("SCHEDULER_STALE_JOB_TIMEOUT_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_stale_job_timeout_minutes),
            conflict_retry_seconds: layered
                .remove("SCHEDULER_CONFLICT_RETRY_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_conflict_retry_seconds),
            shutdown_timeout_seconds: layered
                .remove("SCHEDULER_SHUTDOWN_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_shutdown_timeout_seconds),
            cancel_grace_seconds: layered
                .remove("SCHEDULER_CANCEL_GRACE_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_cancel_grace_seconds),
            max_configs_per_tick: layered
                .remove("SCHEDULER_MAX_CONFIGS_PER_TICK")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_max_configs_per_tick),
            sync_interval_min_minutes: layered
                .remove("SYNC_INTERVAL_MIN_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_interval_min_minutes),
            sync_interval_max_minutes: layered
                .remove("SYNC_INTERVAL_MAX_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_interval_max_minutes),
        };

        let issue_sync = IssueSyncSettings {
            batch_size: layered
                .remove("SYNC_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_batch_size),
            per_page: layered
                .remove("SYNC_PER_PAGE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_per_page),
            max_pages_per_request: layered
                .remove("SYNC_MAX_PAGES_PER_REQUEST")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_max_pages_per_request),
            max_issues_per_sync: layered
                .remove("SYNC_MAX_ISSUES_PER_SYNC")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_max_issues_per_sync),
        };

        let rate_limit = RateLimitConfig {
            delay_ms: layered
                .remove("RATE_LIMIT_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rate_limit_delay_ms),
            max_retries: layered
                .remove("RATE_LIMIT_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rate_limit_max_retries),
            backoff_base_ms: layered
                .remove("RATE_LIMIT_BACKOFF_BASE_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rate_limit_backoff_base_ms),
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: layered
                .remove("CIRCUIT_FAILURE_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_circuit_failure_threshold),
            recovery_timeout_seconds: layered
                .remove("CIRCUIT_RECOVERY_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_circuit_recovery_timeout_seconds),
            success_threshold: layered
                .remove("CIRCUIT_SUCCESS_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_circuit_success_threshold),
        };

        let attachments = AttachmentConfig {
            max_size_bytes: layered
                .remove("ATTACHMENT_MAX_SIZE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_attachment_max_size_bytes),
            download_timeout_seconds: layered
                .remove("ATTACHMENT_DOWNLOAD_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_attachment_download_timeout_seconds),
            max_redirects: layered
                .remove("ATTACHMENT_MAX_REDIRECTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_attachment_max_redirects),
            allowed_hosts: layered
                .remove("ATTACHMENT_ALLOWED_HOSTS")
                .map(|hosts| {
                    hosts
                        .split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            http_request_timeout_seconds,
            scheduler,
            issue_sync,
            rate_limit,
            circuit_breaker,
            attachments,
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

fn take_string(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> String,
) -> String {
    layered
        .remove(key)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn interval_bounds_must_be_ordered() {
        let scheduler = SchedulerConfig {
            sync_interval_min_minutes: 60,
            sync_interval_max_minutes: 30,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            scheduler.validate(),
            Err(ConfigError::InvalidSyncIntervalBounds { min: 60, max: 30 })
        ));
    }

    #[test]
    fn clamp_interval_respects_bounds() {
        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.clamp_interval_minutes(1), 5);
        assert_eq!(scheduler.clamp_interval_minutes(15), 15);
        assert_eq!(scheduler.clamp_interval_minutes(100_000), 1440);
        assert_eq!(scheduler.clamp_interval_minutes(-3), 5);
    }

    #[test]
    fn per_page_above_gitlab_limit_rejected() {
        let settings = IssueSyncSettings {
            per_page: 250,
            ..IssueSyncSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidPerPage { value: 250 })
        ));
    }

    #[test]
    fn zero_circuit_thresholds_rejected() {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(breaker.validate().is_err());
    }

    #[test]
    fn redacted_json_hides_database_password() {
        let config = AppConfig {
            database_url: "postgres://mirror:hunter2@db:5432/mirror".to_string(),
            ..AppConfig::default()
        };
        let json = config.redacted_json().expect("serializes");
        assert!(!json.contains("hunter2"));
        assert!(json.contains("REDACTED"));
    }
}
