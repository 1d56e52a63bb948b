//! Configuration management for the bagframes routine.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/bagframes.{toml,yaml,json}` (optional)
//! 3. `/etc/bagframes/bagframes.{toml,yaml,json}` (optional)
//! 4. Environment variables, e.g. `BAGFRAMES__SOURCE__BUCKET`

use bagframes_extractor::{ExtractionSettings, TimeWindow};
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Main configuration for the routine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bucket the bag files are downloaded from
    pub source: StoreConfig,

    /// Bucket the extracted images are published to
    pub destination: StoreConfig,

    /// Local working directories
    #[serde(default)]
    pub staging: StagingConfig,

    /// Topics, image types and time window
    #[serde(default)]
    pub extraction: ExtractionSettings,

    /// Download/upload settings
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,

    /// Append log lines to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Object store bucket configuration.
#[derive(Clone, Deserialize)]
pub struct StoreConfig {
    /// Bucket name
    pub bucket: String,

    /// Key prefix to list (only used for the source)
    #[serde(default)]
    pub prefix: String,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (for MinIO, Ceph, LocalStack, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,

    /// Static access key; the default AWS credential chain is used when unset
    #[serde(default)]
    pub access_key: Option<String>,

    /// Static secret key
    #[serde(default)]
    pub secret_key: Option<String>,
}

/// Local working directories.
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Downloaded bags land here, keyed by their object key
    #[serde(default = "default_bag_dir")]
    pub bag_dir: PathBuf,

    /// Root of the produced image tree
    #[serde(default = "default_pictures_dir")]
    pub pictures_dir: PathBuf,
}

/// Transfer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Maximum concurrent downloads or uploads
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

// Default value functions
fn default_service_name() -> String {
    "bagframes".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_bag_dir() -> PathBuf {
    PathBuf::from("data/bags")
}
fn default_pictures_dir() -> PathBuf {
    PathBuf::from("data/pictures")
}
fn default_concurrency() -> usize {
    8
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
            file: None,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            bag_dir: default_bag_dir(),
            pictures_dir: default_pictures_dir(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("force_path_style", &self.force_path_style)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Config {
    /// Load configuration from config files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self::defaults()?
            .add_source(File::with_name("config/bagframes").required(false))
            .add_source(File::with_name("/etc/bagframes/bagframes").required(false))
            // BAGFRAMES__SOURCE__BUCKET -> source.bucket
            // BAGFRAMES__EXTRACTION__TOPICS=/a,/b -> extraction.topics
            .add_source(
                Environment::with_prefix("BAGFRAMES")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("extraction.topics")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Builder pre-populated with the default values.
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.format", default_log_format())?
            .set_default("transfer.concurrency", default_concurrency() as u64)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        for (section, store) in [("source", &self.source), ("destination", &self.destination)] {
            if store.bucket.is_empty() {
                return Err(ConfigValidationError::MissingField(format!(
                    "{}.bucket",
                    section
                )));
            }
            if store.access_key.is_some() != store.secret_key.is_some() {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("{}.access_key/secret_key", section),
                    message: "Access key and secret key must be set together".to_string(),
                });
            }
        }

        if self.staging.bag_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "staging.bag_dir".to_string(),
            ));
        }
        if self.staging.pictures_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "staging.pictures_dir".to_string(),
            ));
        }

        if self.transfer.concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "transfer.concurrency".to_string(),
                message: "Concurrency must be greater than 0".to_string(),
            });
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::InvalidValue {
                field: "logging.format".to_string(),
                message: "Format must be json or pretty".to_string(),
            });
        }

        self.window().map_err(|e| ConfigValidationError::InvalidValue {
            field: "extraction.min_filter_time/max_filter_time".to_string(),
            message: e.to_string(),
        })?;

        Ok(())
    }

    /// Extraction window from `min_filter_time`/`max_filter_time`.
    pub fn window(&self) -> bagframes_extractor::error::Result<TimeWindow> {
        TimeWindow::parse(
            self.extraction.min_filter_time.as_deref(),
            self.extraction.max_filter_time.as_deref(),
        )
    }

    /// Directory the extractor reads: the bag directory joined with the source prefix.
    pub fn input_dir(&self) -> PathBuf {
        self.staging
            .bag_dir
            .join(self.source.prefix.trim_start_matches('/'))
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
