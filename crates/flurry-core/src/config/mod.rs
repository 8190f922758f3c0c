//! Configuration helpers shared by flurry binaries.

mod path;
mod vars;

pub use path::{CliArgs, is_yaml_file};
pub use vars::{interpolate, interpolate_with};

use serde::{Deserialize, Serialize};

/// Metrics configuration for the Prometheus endpoint.
///
/// The exporter is only started when an address is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP listener, e.g. "0.0.0.0:9090".
    #[serde(default)]
    pub address: Option<String>,
}
