use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "reportportal.toml";

/// Prefix for environment overrides, e.g. `REPORTPORTAL_SERVER__PORT=8080`
pub const ENV_PREFIX: &str = "REPORTPORTAL_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Configuration for the report portal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub metadata: MetadataConfig,
    pub storage: StorageConfig,
    pub execution: ExecutionConfig,
    pub staging: StagingConfig,
    pub portal: PortalConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8501,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    Json,
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub backend: MetadataBackend,
    /// Document path for the `json` backend
    pub path: PathBuf,
    /// Connection string for the `postgres` backend
    pub connection_string: Option<String>,
    pub table: String,
    pub max_connections: u32,
    pub auto_migrate: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: MetadataBackend::Json,
            path: PathBuf::from("reports.json"),
            connection_string: None,
            table: "reports".to_string(),
            max_connections: 5,
            auto_migrate: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Bucket directory for the `fs` backend
    pub root: PathBuf,
    /// Base URL of the S3-compatible endpoint for the `s3` backend
    pub endpoint: Option<String>,
    pub bucket: String,
    pub bearer_token: Option<String>,
    pub entry_file: String,
    pub config_file: String,
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub max_object_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            root: PathBuf::from("bucket"),
            endpoint: None,
            bucket: "reports".to_string(),
            bearer_token: None,
            entry_file: "main.js".to_string(),
            config_file: "config.toml".to_string(),
            max_attempts: 3,
            base_backoff_ms: 120,
            max_object_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_ms: u64,
    pub memory_limit_mb: usize,
    /// Show script stack traces in the render area
    pub debug_traces: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            memory_limit_mb: 64,
            debug_traces: false,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub dir: PathBuf,
    pub stale_after_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("tmp"),
            stale_after_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub title: String,
    /// Absolute base used for shareable report links; relative links when unset
    pub public_base_url: Option<String>,
    pub logo_url: Option<String>,
    pub logo_target: Option<String>,
    /// Enables `/?path=dev` and `POST /dev/run`
    pub dev_sandbox: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            title: "Report Portal".to_string(),
            public_base_url: None,
            logo_url: None,
            logo_target: None,
            dev_sandbox: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment.
    ///
    /// When `path` is `None`, `reportportal.toml` in the working directory is
    /// merged if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Configuration used by tests: in-memory metadata, ephemeral port.
    pub fn test_config_with_port(port: u16) -> Self {
        let mut config = Self::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = port;
        config.metadata.backend = MetadataBackend::Memory;
        config.execution.timeout_ms = 5000;
        config.portal.dev_sandbox = true;
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::invalid("server.host", "must not be empty"));
        }
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server.port", "must be a fixed port"));
        }
        if self.metadata.backend == MetadataBackend::Postgres
            && self.metadata.connection_string.is_none()
        {
            return Err(ConfigError::invalid(
                "metadata.connection_string",
                "required for the postgres backend",
            ));
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.endpoint.is_none() {
            return Err(ConfigError::invalid(
                "storage.endpoint",
                "required for the s3 backend",
            ));
        }
        if self.storage.entry_file.trim().is_empty() || self.storage.entry_file.contains('/') {
            return Err(ConfigError::invalid(
                "storage.entry_file",
                "must be a plain file name",
            ));
        }
        if self.storage.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "storage.max_attempts",
                "must be at least 1",
            ));
        }
        if self.execution.timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "execution.timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.execution.memory_limit_mb == 0 {
            return Err(ConfigError::invalid(
                "execution.memory_limit_mb",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.entry_file, "main.js");
        assert_eq!(config.staging.stale_after_secs, 3600);
        assert_eq!(config.server_addr(), "0.0.0.0:8501");
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let toml = r#"
            [server]
            port = 9000

            [storage]
            backend = "s3"
            endpoint = "https://objects.example.com"
            bucket = "dashboards"

            [execution]
            debug_traces = true
        "#;

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
            .expect("config should parse");

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.bucket, "dashboards");
        assert_eq!(config.storage.max_attempts, 3);
        assert!(config.execution.debug_traces);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.metadata.backend = MetadataBackend::Postgres;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "metadata.connection_string"
        ));

        let mut config = Config::default();
        config.storage.entry_file = "nested/main.js".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.execution.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.port = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "server.port"
        ));
    }

    #[test]
    fn test_test_config() {
        let config = Config::test_config_with_port(0);
        assert_eq!(config.server.port, 0);
        assert_eq!(config.metadata.backend, MetadataBackend::Memory);
        assert!(config.portal.dev_sandbox);
        // ephemeral ports are only for state built directly around test stores
        assert!(config.validate().is_err());
        assert!(Config::test_config_with_port(8080).validate().is_ok());
    }
}
