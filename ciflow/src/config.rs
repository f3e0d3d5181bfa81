//! Engine configuration.

use crate::errors::EngineError;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the work dir.
pub const ENV_WORK_DIR: &str = "CI_ENGINE_WORK_DIR";
/// Environment variable overriding the temp dir used for cache archives.
pub const ENV_TMP_DIR: &str = "CI_ENGINE_TMP_DIR";
/// Environment variable holding the delegate service endpoint.
pub const ENV_DELEGATE_ENDPOINT: &str = "DELEGATE_SERVICE_ENDPOINT";
/// Environment variable holding the account id.
pub const ENV_ACCOUNT_ID: &str = "ACCOUNT_ID";
/// Environment variable enabling debug mode.
pub const ENV_DEBUG: &str = "CI_ENGINE_DEBUG";
/// Environment variable enabling gzip on cache archives.
pub const ENV_CACHE_COMPRESS: &str = "CI_ENGINE_CACHE_COMPRESS";

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory steps run in; cache paths are relative to it.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Directory for per-step cache archives.
    #[serde(default = "std::env::temp_dir")]
    pub tmp_dir: PathBuf,
    /// Delegate service endpoint step statuses are sent to.
    #[serde(default)]
    pub delegate_endpoint: Option<String>,
    /// Account the stage runs under.
    #[serde(default)]
    pub account_id: String,
    /// Keep the stage alive after completion for inspection.
    #[serde(default)]
    pub debug: bool,
    /// Cache subsystem settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Retry policy for status delivery.
    #[serde(default)]
    pub status_retry: RetryConfig,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/harness")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            tmp_dir: std::env::temp_dir(),
            delegate_endpoint: None,
            account_id: String::new(),
            debug: false,
            cache: CacheConfig::default(),
            status_retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds a configuration from defaults overlaid with the environment.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_WORK_DIR) {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_TMP_DIR) {
            self.tmp_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = lookup(ENV_DELEGATE_ENDPOINT) {
            self.delegate_endpoint = Some(endpoint);
        }
        if let Some(account) = lookup(ENV_ACCOUNT_ID) {
            self.account_id = account;
        }
        if let Some(flag) = lookup(ENV_DEBUG) {
            self.debug = parse_flag(ENV_DEBUG, &flag)?;
        }
        if let Some(flag) = lookup(ENV_CACHE_COMPRESS) {
            self.cache.compress = parse_flag(ENV_CACHE_COMPRESS, &flag)?;
        }
        Ok(self)
    }

    /// Sets the work dir.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Sets the temp dir.
    #[must_use]
    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    /// Sets the delegate endpoint.
    #[must_use]
    pub fn with_delegate_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.delegate_endpoint = Some(endpoint.into());
        self
    }

    /// Sets the account id.
    #[must_use]
    pub fn with_account_id(mut self, account: impl Into<String>) -> Self {
        self.account_id = account.into();
        self
    }

    /// Enables or disables debug mode.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Replaces the cache settings.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Replaces the status retry policy.
    #[must_use]
    pub fn with_status_retry(mut self, retry: RetryConfig) -> Self {
        self.status_retry = retry;
        self
    }

    /// Returns the delegate endpoint or a configuration error.
    pub fn require_delegate_endpoint(&self) -> Result<&str, EngineError> {
        self.delegate_endpoint
            .as_deref()
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or_else(|| EngineError::Config(format!("{ENV_DELEGATE_ENDPOINT} is not set")))
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, EngineError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Ok(true),
        "0" | "f" | "false" | "no" | "" => Ok(false),
        other => Err(EngineError::Config(format!("invalid boolean for {name}: {other}"))),
    }
}

/// Cache subsystem settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Retry policy for upload and download.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Multipart upload part size in bytes.
    #[serde(default = "default_part_size")]
    pub upload_part_size: u64,
    /// Upload with the standard storage class.
    #[serde(default = "default_standard_redundancy")]
    pub standard_redundancy: bool,
    /// Wrap archives in gzip.
    #[serde(default)]
    pub compress: bool,
}

fn default_part_size() -> u64 {
    32 * 1024 * 1024 // 32MB
}

fn default_standard_redundancy() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            upload_part_size: default_part_size(),
            standard_redundancy: default_standard_redundancy(),
            compress: false,
        }
    }
}

impl CacheConfig {
    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables gzip compression.
    #[must_use]
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}
