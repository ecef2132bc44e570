//! Process-wide pipeline configuration.
//!
//! A [`PipelineConfig`] is built once at process start (from TOML, the
//! environment, or defaults) and passed by reference to everything that
//! needs it. Nothing reads settings from globals.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::retry::RetryPolicy;

/// Environment variable overriding [`DatabaseConfig::url`].
pub const ENV_DATABASE_URL: &str = "FILINGFLOW_DATABASE_URL";
/// Environment variable overriding [`RetryConfig::max_retries`].
pub const ENV_MAX_RETRIES: &str = "FILINGFLOW_MAX_RETRIES";
/// Environment variable overriding [`RetryConfig::base_delay_secs`].
pub const ENV_RETRY_BASE_SECS: &str = "FILINGFLOW_RETRY_BASE_SECS";
/// Environment variable overriding [`RetryConfig::max_delay_secs`].
pub const ENV_RETRY_MAX_SECS: &str = "FILINGFLOW_RETRY_MAX_SECS";
/// Environment variable overriding [`WorkerConfig::concurrency`].
pub const ENV_WORKER_CONCURRENCY: &str = "FILINGFLOW_WORKER_CONCURRENCY";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retry budget and backoff.
    #[serde(default)]
    pub retry: RetryConfig,
    /// OCR fallback thresholds.
    #[serde(default)]
    pub ocr: OcrConfig,
    /// Dead-letter store bounds.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    /// Database connection.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Worker pool sizing.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Retry budget and backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts allowed before a transient error is escalated.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Upper bound on any retry delay, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// OCR fallback settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Extracted text shorter than this triggers the OCR fallback.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    /// Page limit handed to the OCR collaborator.
    #[serde(default = "default_ocr_max_pages")]
    pub max_pages: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            min_text_chars: default_min_text_chars(),
            max_pages: default_ocr_max_pages(),
        }
    }
}

/// Dead-letter store bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Stored error messages are truncated to this many characters.
    #[serde(default = "default_max_error_chars")]
    pub max_error_chars: usize,
    /// Hard cap on listing size.
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_error_chars: default_max_error_chars(),
            list_limit: default_list_limit(),
        }
    }
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Tasks executed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Seconds between sweeps that dispatch due requeued dead letters.
    #[serde(default = "default_requeue_sweep_secs")]
    pub requeue_sweep_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            requeue_sweep_secs: default_requeue_sweep_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    4
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_max_delay_secs() -> u64 {
    600
}

fn default_min_text_chars() -> usize {
    200
}

fn default_ocr_max_pages() -> u32 {
    20
}

fn default_max_error_chars() -> usize {
    4000
}

fn default_list_limit() -> usize {
    500
}

fn default_database_url() -> String {
    "sqlite://filingflow.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_concurrency() -> usize {
    4
}

fn default_requeue_sweep_secs() -> u64 {
    60
}

impl PipelineConfig {
    /// Parses configuration from a TOML document. Missing keys take defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Reads and parses a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Applies `FILINGFLOW_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database.url = url;
        }
        if let Some(value) = lookup(ENV_MAX_RETRIES) {
            self.retry.max_retries = parse_env(ENV_MAX_RETRIES, &value)?;
        }
        if let Some(value) = lookup(ENV_RETRY_BASE_SECS) {
            self.retry.base_delay_secs = parse_env(ENV_RETRY_BASE_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_RETRY_MAX_SECS) {
            self.retry.max_delay_secs = parse_env(ENV_RETRY_MAX_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_WORKER_CONCURRENCY) {
            self.worker.concurrency = parse_env(ENV_WORKER_CONCURRENCY, &value)?;
        }
        Ok(self)
    }

    /// The retry policy the failure classifier applies.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_secs(self.retry.base_delay_secs),
            Duration::from_secs(self.retry.max_delay_secs),
        )
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.base_delay_secs, 30);
        assert_eq!(config.retry.max_delay_secs, 600);
        assert_eq!(config.dead_letter.max_error_chars, 4000);
        assert_eq!(config.dead_letter.list_limit, 500);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [retry]
            max_retries = 2

            [ocr]
            min_text_chars = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay_secs, 30);
        assert_eq!(config.ocr.min_text_chars, 50);
        assert_eq!(config.ocr.max_pages, 20);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.requeue_sweep_secs, 60);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        let err = PipelineConfig::from_toml_str("[retry]\nmax_retries = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\nurl = \"sqlite::memory:\"").unwrap();
        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::from_file("/nonexistent/filingflow.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_RETRIES, "6"),
            (ENV_RETRY_BASE_SECS, "5"),
            (ENV_DATABASE_URL, "sqlite::memory:"),
        ]
        .into_iter()
        .collect();
        let config = PipelineConfig::default()
            .with_overrides_from(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.retry.max_retries, 6);
        assert_eq!(config.retry.base_delay_secs, 5);
        assert_eq!(config.retry.max_delay_secs, 600);
        assert_eq!(config.database.url, "sqlite::memory:");
    }

    #[test]
    fn test_bad_override() {
        let err = PipelineConfig::default()
            .with_overrides_from(|key| (key == ENV_WORKER_CONCURRENCY).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = PipelineConfig::default().retry_policy();
        assert_eq!(policy.max_retries(), 4);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
    }
}
