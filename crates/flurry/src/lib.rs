//! Flurry: incremental, exactly-once ingestion of CSV objects into Delta Lake.
//!
//! This crate handles:
//! - Detecting new and modified objects against a durable manifest
//! - Streaming objects as bounded row batches
//! - Reconciling batch schemas with the destination, widening it when allowed
//! - Appending rows idempotently and recording each committed object

pub mod commit;
pub mod config;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod pipeline;
pub mod schema;
pub mod sink;
pub mod source;

// Re-export commonly used items
pub use commit::{CommitCoordinator, CommitOutcome, CommitSettings, RetryPolicy};
pub use config::Config;
pub use error::{CommitError, RunError, SetupError};
pub use manifest::{
    ManifestEntry, ManifestStatus, ManifestStore, MemoryManifestStore, StorageManifestStore,
};
pub use pipeline::{ConnectivityReport, RunOrchestrator, RunState, RunStatus, RunSummary};
pub use schema::{SchemaEvolutionMode, SchemaReconciler, TableSchema};
pub use sink::{Credentials, DeltaCatalog, MemoryCatalog, TableCatalog};
pub use source::{
    BatchReader, DeltaDetector, KeyFilter, MemorySource, ObjectSource, ReaderConfig,
    SourceObject, StorageSource,
};

pub use flurry_core::config::CliArgs;
pub use flurry_core::{
    StorageProvider, StorageProviderRef, init_metrics, init_tracing, shutdown_signal,
};
