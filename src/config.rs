use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 5.5 GiB, the default upper bound of a consolidated pack.
pub const DEFAULT_REPACK_MAX_SIZE: u64 = 5_905_580_032;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Repository
    pub repository: String,
    pub storage_backend: StorageBackend,
    pub local_storage_root: PathBuf,

    // S3 Storage
    pub s3_bucket: Option<String>,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_prefix: String,

    // Scratch space
    pub work_dir: PathBuf,

    // Post source
    pub post_source_url: String,
    pub post_page_size: usize,

    // Crawl pacing
    pub crash_cooldown: Duration,
    pub post_timespan: Duration,
    pub drive_wait: Duration,

    // Repack
    pub repack_max_size: u64,
    pub commit_retry_interval: Duration,

    // HTTP
    pub http_timeout: Duration,
    pub http_max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Directory tree on the local filesystem
    Local,
    /// S3-compatible object storage
    S3,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Repository
            repository: required_env("REMOTE_REPOSITORY")?,
            storage_backend: parse_storage_backend(&env_or_default("STORAGE_BACKEND", "local"))?,
            local_storage_root: PathBuf::from(env_or_default("LOCAL_STORAGE_ROOT", "./data/repos")),

            // S3 Storage
            s3_bucket: optional_env("S3_BUCKET"),
            s3_region: env_or_default("S3_REGION", "us-east-1"),
            s3_endpoint: optional_env("S3_ENDPOINT"),
            s3_prefix: env_or_default("S3_PREFIX", "datasets/"),

            // Scratch space
            work_dir: PathBuf::from(env_or_default("WORK_DIR", "./data/tmp")),

            // Post source
            post_source_url: env_or_default("POST_SOURCE_URL", "https://skeb.jp"),
            post_page_size: parse_env_usize("POST_PAGE_SIZE", 90)?,

            // Crawl pacing
            crash_cooldown: Duration::from_secs(parse_env_u64("CRASH_COOLDOWN_SECS", 10)?),
            post_timespan: Duration::from_secs(parse_env_u64("POST_TIMESPAN_SECS", 4)?),
            drive_wait: Duration::from_secs(parse_env_u64("DRIVE_WAIT_SECS", 5)?),

            // Repack
            repack_max_size: parse_env_u64("REPACK_MAX_SIZE_BYTES", DEFAULT_REPACK_MAX_SIZE)?,
            commit_retry_interval: Duration::from_secs(parse_env_u64(
                "COMMIT_RETRY_INTERVAL_SECS",
                30,
            )?),

            // HTTP
            http_timeout: Duration::from_secs(parse_env_u64("HTTP_TIMEOUT_SECS", 60)?),
            http_max_retries: parse_env_u32("HTTP_MAX_RETRIES", 5)?,
        })
    }

    /// Configuration for tests: local storage, no pacing delays.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            repository: "test/archive".to_string(),
            storage_backend: StorageBackend::Local,
            local_storage_root: PathBuf::from("./data/test-repos"),
            s3_bucket: None,
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            s3_prefix: "datasets/".to_string(),
            work_dir: std::env::temp_dir().join("commission-archiver-test"),
            post_source_url: "http://127.0.0.1:1".to_string(),
            post_page_size: 90,
            crash_cooldown: Duration::ZERO,
            post_timespan: Duration::ZERO,
            drive_wait: Duration::ZERO,
            repack_max_size: DEFAULT_REPACK_MAX_SIZE,
            commit_retry_interval: Duration::ZERO,
            http_timeout: Duration::from_secs(5),
            http_max_retries: 1,
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.trim_matches('/').is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "REMOTE_REPOSITORY".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if self.storage_backend == StorageBackend::S3 && self.s3_bucket.is_none() {
            return Err(ConfigError::MissingEnvVar("S3_BUCKET".to_string()));
        }
        if self.post_page_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "POST_PAGE_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.repack_max_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "REPACK_MAX_SIZE_BYTES".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.http_max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                name: "HTTP_MAX_RETRIES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    optional_env(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    optional_env(name).unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_storage_backend(value: &str) -> Result<StorageBackend, ConfigError> {
    match value.to_lowercase().as_str() {
        "local" => Ok(StorageBackend::Local),
        "s3" => Ok(StorageBackend::S3),
        _ => Err(ConfigError::InvalidValue {
            name: "STORAGE_BACKEND".to_string(),
            message: format!("must be 'local' or 's3', got '{value}'"),
        }),
    }
}
