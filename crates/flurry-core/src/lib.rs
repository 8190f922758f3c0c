//! Shared plumbing for flurry: object storage access, configuration
//! helpers, metrics events, tracing setup and signal handling.

pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod storage;
pub mod tracing;

pub use error::{ConfigError, MetricsError, StorageError};
pub use crate::metrics::init_global as init_metrics;
pub use signal::shutdown_signal;
pub use storage::{BackendConfig, StorageProvider, StorageProviderRef};
pub use crate::tracing::init_tracing;
