//! Configuration for flurry.
//!
//! # Example
//!
//! ```yaml
//! source_location: s3://landing/nyc-taxi
//! glob_pattern: "yellow_tripdata_*.csv"
//! destination_table: yellow_trips
//! destination:
//!   table_uri: s3://lake/yellow_trips
//!   storage_options:
//!     aws_region: us-east-1
//!     aws_access_key_id: ${AWS_ACCESS_KEY_ID}
//!     aws_secret_access_key: ${AWS_SECRET_ACCESS_KEY}
//!     aws_s3_allow_unsafe_rename: "true"
//!   auth:
//!     token_url: https://catalog.example.com/api/catalog/v1/oauth/tokens
//!     client_id: ${CATALOG_CLIENT_ID}
//!     client_secret: ${CATALOG_CLIENT_SECRET}
//!     scope: PRINCIPAL_ROLE:ALL
//! chunk_size: 5000
//! max_parallel_objects: 4
//! metrics:
//!   address: 0.0.0.0:9090
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use snafu::prelude::*;

pub use flurry_core::config::{MetricsConfig, interpolate};

use crate::commit::RetryPolicy;
use crate::error::ConfigError;
use crate::schema::SchemaEvolutionMode;
use crate::sink::{Credentials, OAuth2Config};
use crate::source::ReaderConfig;
use flurry_core::error::{EmptyFieldSnafu, InvalidValueSnafu, ReadFileSnafu, YamlParseSnafu};

/// Directory holding the manifest, relative to the table, by default.
pub const DEFAULT_MANIFEST_DIR: &str = "_flurry";

fn default_glob_pattern() -> String {
    "*.csv".to_string()
}

fn default_chunk_size() -> usize {
    1000
}

fn default_max_parallel_objects() -> usize {
    2
}

fn default_retry_ceiling() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_delimiter() -> char {
    ','
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Where and how rows are written.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    /// Location of the Delta table.
    pub table_uri: String,
    /// Object store options for the table and the manifest.
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    /// OAuth2 client credentials. Without them a local token is used.
    #[serde(default)]
    pub auth: Option<OAuth2Config>,
}

/// Backoff between retries.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Location the source objects are listed from.
    pub source_location: String,
    /// Glob matched against keys relative to `source_location`.
    #[serde(default = "default_glob_pattern")]
    pub glob_pattern: String,
    /// Maximum rows per batch.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Objects ingested concurrently.
    #[serde(default = "default_max_parallel_objects")]
    pub max_parallel_objects: usize,
    /// Attempts per call, and reads per object, before giving up.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Fail an object on malformed rows instead of skipping them.
    #[serde(default = "default_true")]
    pub strict_parsing: bool,
    /// Destination table name.
    pub destination_table: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub schema_evolution: SchemaEvolutionMode,
    /// Object store options for the source location.
    #[serde(default)]
    pub source_storage_options: HashMap<String, String>,
    pub destination: DestinationConfig,
    /// Where the manifest is kept; defaults to `{table_uri}/_flurry`.
    #[serde(default)]
    pub manifest_location: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Deadline for each catalog, manifest and token request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let text = interpolate(contents)?;
        let config: Config = serde_yaml::from_str(&text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("source_location", &self.source_location),
            ("glob_pattern", &self.glob_pattern),
            ("destination_table", &self.destination_table),
            ("destination.table_uri", &self.destination.table_uri),
        ] {
            ensure!(!value.trim().is_empty(), EmptyFieldSnafu { field });
        }

        for (field, value) in [
            ("chunk_size", self.chunk_size as u64),
            ("max_parallel_objects", self.max_parallel_objects as u64),
            ("retry_ceiling", u64::from(self.retry_ceiling)),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            ensure!(
                value > 0,
                InvalidValueSnafu {
                    field,
                    message: "must be greater than 0",
                }
            );
        }

        ensure!(
            self.delimiter.is_ascii() && self.delimiter != '\n' && self.delimiter != '"',
            InvalidValueSnafu {
                field: "delimiter",
                message: format!("'{}' is not a single-byte field separator", self.delimiter),
            }
        );
        ensure!(
            self.retry.base_delay_ms <= self.retry.max_delay_ms,
            InvalidValueSnafu {
                field: "retry.base_delay_ms",
                message: "must not exceed retry.max_delay_ms",
            }
        );

        if let Some(auth) = &self.destination.auth {
            for (field, value) in [
                ("destination.auth.token_url", &auth.token_url),
                ("destination.auth.client_id", &auth.client_id),
            ] {
                ensure!(!value.trim().is_empty(), EmptyFieldSnafu { field });
            }
        }

        Ok(())
    }

    /// Manifest location, defaulting to a directory inside the table.
    pub fn manifest_location(&self) -> String {
        match &self.manifest_location {
            Some(location) => location.clone(),
            None => format!(
                "{}/{DEFAULT_MANIFEST_DIR}",
                self.destination.table_uri.trim_end_matches('/')
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            chunk_size: self.chunk_size,
            strict_parsing: self.strict_parsing,
            delimiter: self.delimiter as u8,
            target: self.destination_table.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_ceiling,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            request_timeout: self.request_timeout(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        match &self.destination.auth {
            Some(auth) => Credentials::ClientCredentials(auth.clone()),
            None => Credentials::None,
        }
    }
}
