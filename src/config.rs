//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{BucketConfig, DEFAULT_NAMESPACE};

/// Prefix for environment overrides, e.g. `TOLLGATE__LIMITER__RATE=20`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Token bucket configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Response header names
    #[serde(default)]
    pub headers: HeaderConfig,

    /// How denials are reported
    #[serde(default)]
    pub denial: DenialConfig,

    /// Bucket store selection
    #[serde(default)]
    pub store: StoreConfig,

    /// What to do when the store cannot be reached
    #[serde(default)]
    pub on_store_failure: FailurePolicy,
}

/// Token bucket configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Maximum tokens per bucket
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Prefix for every bucket key
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
            namespace: default_namespace(),
        }
    }
}

fn default_rate() -> f64 {
    10.0
}

fn default_capacity() -> f64 {
    100.0
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Names of the headers that expose the bucket to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderConfig {
    #[serde(default = "default_rate_header")]
    pub rate: String,

    #[serde(default = "default_tokens_header")]
    pub tokens: String,

    #[serde(default = "default_capacity_header")]
    pub capacity: String,

    /// Do not emit any rate limit headers
    #[serde(default, alias = "disable_header")]
    pub disabled: bool,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            rate: default_rate_header(),
            tokens: default_tokens_header(),
            capacity: default_capacity_header(),
            disabled: false,
        }
    }
}

fn default_rate_header() -> String {
    "X-RateLimit-Rate".to_string()
}

fn default_tokens_header() -> String {
    "X-RateLimit-Tokens".to_string()
}

fn default_capacity_header() -> String {
    "X-RateLimit-Capacity".to_string()
}

/// How a rate limit denial is reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenialConfig {
    /// Status code for rate limited requests
    #[serde(default = "default_status")]
    pub status: u16,

    /// Body for rate limited requests
    #[serde(default = "default_message", alias = "error_message")]
    pub message: String,

    /// Return denials as errors instead of writing them to the response
    #[serde(default, alias = "throw")]
    pub raise_as_error: bool,
}

impl Default for DenialConfig {
    fn default() -> Self {
        Self {
            status: default_status(),
            message: default_message(),
            raise_as_error: false,
        }
    }
}

fn default_status() -> u16 {
    429
}

fn default_message() -> String {
    "Rate limit exceeded.".to_string()
}

/// Which bucket store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    /// Process-local map
    #[default]
    Memory,
    /// Redis server
    Redis,
}

/// Bucket store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub driver: StoreDriver,

    /// Connection URL for networked drivers
    #[serde(default)]
    pub url: Option<String>,

    /// Bound for a single store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Compare-and-swap attempts before a contended check is denied
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            driver: StoreDriver::default(),
            url: None,
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    5
}

/// Behaviour when the bucket store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Deny the request
    #[default]
    FailClosed,
    /// Let the request through unmetered
    FailOpen,
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with
    /// `TOLLGATE__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        BucketConfig::new(self.limiter.rate, self.limiter.capacity)?;

        if self.store.max_attempts == 0 {
            return Err(TollgateError::Config(
                "store.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.driver == StoreDriver::Redis && self.store.url.is_none() {
            return Err(TollgateError::Config(
                "store.url is required for the redis driver".to_string(),
            ));
        }
        if !(100..=599).contains(&self.denial.status) {
            return Err(TollgateError::Config(format!(
                "denial.status {} is not an HTTP status code",
                self.denial.status
            )));
        }
        Ok(())
    }
}
