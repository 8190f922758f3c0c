//! Error types for the ingestion engine.
//!
//! Errors scoped to one object (parse, schema, catalog and manifest
//! failures) are recorded against that object and never abort sibling
//! objects. Only [`RunError`] ends a run.

use std::time::Duration;

use snafu::prelude::*;

pub use flurry_core::error::{ConfigError, MetricsError, StorageError};

use crate::schema::ColumnType;

/// How a failed operation should be handled by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, throttling, network failures, commit conflicts.
    Transient,
    /// The access token is no longer accepted; re-authenticate and retry.
    AuthExpired,
    /// Retrying cannot help.
    Permanent,
}

/// Classification of errors for the retry loop.
pub trait Retryable {
    fn class(&self) -> ErrorClass;

    /// Error reported when an attempt does not finish in time.
    fn timed_out(operation: &'static str, after: Duration) -> Self;
}

// ============ Source Errors ============

/// Errors raised while listing or opening source objects.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The object store request failed.
    #[snafu(display("Source storage error: {source}"))]
    SourceStorage { source: StorageError },

    /// The glob pattern does not compile.
    #[snafu(display("Invalid glob pattern '{pattern}': {source}"))]
    InvalidGlob {
        pattern: String,
        source: globset::Error,
    },

    /// The object disappeared between listing and reading.
    #[snafu(display("Source object '{key}' does not exist"))]
    ObjectMissing { key: String },

    /// A source request did not finish within the request timeout.
    #[snafu(display("{operation} timed out after {}ms", after.as_millis()))]
    SourceTimeout {
        operation: &'static str,
        after: Duration,
    },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::SourceStorage { source } => source.is_transient(),
            SourceError::SourceTimeout { .. } => true,
            SourceError::InvalidGlob { .. } | SourceError::ObjectMissing { .. } => false,
        }
    }
}

impl Retryable for SourceError {
    fn class(&self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }

    fn timed_out(operation: &'static str, after: Duration) -> Self {
        SourceError::SourceTimeout { operation, after }
    }
}

// ============ Reader Errors ============

/// Errors raised while turning an object into row batches.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReaderError {
    /// The object could not be opened.
    #[snafu(display("Failed to open '{key}': {source}"))]
    OpenStream { key: String, source: SourceError },

    /// The byte stream broke off mid-read.
    #[snafu(display("I/O error while reading '{key}': {source}"))]
    StreamIo { key: String, source: std::io::Error },

    /// The header row could not be decoded.
    #[snafu(display("Failed to read header of '{key}': {source}"))]
    CsvHeader { key: String, source: csv_async::Error },

    /// Two header fields share a name.
    #[snafu(display("Duplicate column '{column}' in header of '{key}'"))]
    DuplicateColumn { key: String, column: String },

    /// A record does not match the header (strict parsing only).
    #[snafu(display("Malformed row {offset} in '{key}': {message}"))]
    MalformedRow {
        key: String,
        offset: u64,
        message: String,
    },

    /// A field does not parse as the type inferred for its column.
    #[snafu(display(
        "Row {offset} in '{key}': value '{value}' in column '{column}' is not {expected}"
    ))]
    ValueTypeConflict {
        key: String,
        offset: u64,
        column: String,
        expected: ColumnType,
        value: String,
    },
}

impl ReaderError {
    /// Whether re-reading the object from the start may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ReaderError::OpenStream { source, .. } => source.is_transient(),
            ReaderError::StreamIo { .. } => true,
            ReaderError::CsvHeader { source, .. } => source.is_io_error(),
            _ => false,
        }
    }
}

// ============ Schema Errors ============

/// Batch columns that cannot be reconciled with the destination.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    /// Same column name, incompatible types.
    #[snafu(display("Column '{column}' is {batch} in the batch but {destination} in the table"))]
    TypeConflict {
        column: String,
        destination: ColumnType,
        batch: ColumnType,
    },

    /// The batch adds a column while schema evolution is strict.
    #[snafu(display("Column '{column}' is not in the table and schema evolution is strict"))]
    UnexpectedColumn { column: String },

    /// The batch uses a name reserved for idempotency columns.
    #[snafu(display("Column '{column}' is reserved"))]
    ReservedColumn { column: String },
}

/// Errors from resolving a batch schema against the destination.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReconcileError {
    /// The batch conflicts with the table schema.
    #[snafu(display("Schema conflict: {source}"))]
    Conflict { source: SchemaError },

    /// The catalog rejected or failed a widening request.
    #[snafu(display("Schema widening failed: {source}"))]
    WidenFailed { source: CatalogError },
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Conflict { .. } => ErrorClass::Permanent,
            ReconcileError::WidenFailed { source } => source.class(),
        }
    }
}

// ============ Catalog Errors ============

/// Errors returned by the destination catalog.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    /// Throttling, timeouts, network failures, commit conflicts.
    #[snafu(display("Transient catalog error: {message}"))]
    Transient { message: String },

    /// The presented token has expired.
    #[snafu(display("Access token expired"))]
    AuthExpired,

    /// The credentials were rejected.
    #[snafu(display("Unauthorized: {message}"))]
    Unauthorized { message: String },

    /// The table does not exist in this catalog.
    #[snafu(display("Unknown table '{table}'"))]
    UnknownTable { table: String },

    /// Any other failure that retrying cannot fix.
    #[snafu(display("Catalog error: {message}"))]
    Permanent { message: String },
}

impl CatalogError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CatalogError::Transient { .. } => ErrorClass::Transient,
            CatalogError::AuthExpired => ErrorClass::AuthExpired,
            _ => ErrorClass::Permanent,
        }
    }
}

// ============ Manifest Errors ============

/// Errors from the manifest store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ManifestError {
    /// Persisting the manifest failed; the prior state is unchanged.
    #[snafu(display("Failed to write manifest: {source}"))]
    ManifestWrite { source: StorageError },

    /// Loading the manifest failed.
    #[snafu(display("Failed to read manifest: {source}"))]
    ManifestRead { source: StorageError },

    /// The version was already committed; committed entries are final.
    #[snafu(display("'{key}@{marker}' is already committed"))]
    AlreadyCommitted { key: String, marker: String },

    /// A persisted record does not decode.
    #[snafu(display("Corrupt manifest record in '{location}' on line {line}: {source}"))]
    ManifestDecode {
        location: String,
        line: usize,
        source: serde_json::Error,
    },

    /// An entry could not be serialized.
    #[snafu(display("Failed to encode manifest entry: {source}"))]
    ManifestEncode { source: serde_json::Error },
}

impl ManifestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ManifestError::ManifestWrite { source } | ManifestError::ManifestRead { source }
                if source.is_transient() =>
            {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        }
    }
}

// ============ Commit Errors ============

/// Errors that fail an object's ingestion.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CommitError {
    /// Reading or parsing the source object failed.
    #[snafu(display("{source}"))]
    Read { source: ReaderError },

    /// The batch schema could not be reconciled.
    #[snafu(display("{source}"))]
    Reconcile { source: ReconcileError },

    /// A catalog call failed.
    #[snafu(display("{source}"))]
    Catalog { source: CatalogError },

    /// A manifest call failed.
    #[snafu(display("{source}"))]
    Manifest { source: ManifestError },

    /// An attempt did not finish within the request timeout.
    #[snafu(display("{operation} timed out after {}ms", after.as_millis()))]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl Retryable for CommitError {
    fn class(&self) -> ErrorClass {
        match self {
            CommitError::Read { source } if source.is_transient() => ErrorClass::Transient,
            CommitError::Read { .. } => ErrorClass::Permanent,
            CommitError::Reconcile { source } => source.class(),
            CommitError::Catalog { source } => source.class(),
            CommitError::Manifest { source } => source.class(),
            CommitError::Timeout { .. } => ErrorClass::Transient,
        }
    }

    fn timed_out(operation: &'static str, after: Duration) -> Self {
        CommitError::Timeout { operation, after }
    }
}

// ============ Run Errors ============

/// Errors from change detection.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DetectError {
    /// The source location could not be listed.
    #[snafu(display("Failed to list source: {source}"))]
    Listing { source: SourceError },

    /// The manifest could not be consulted.
    #[snafu(display("Failed to read manifest: {source}"))]
    ManifestLookup { source: ManifestError },
}

/// Errors that end a run before its objects are processed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RunError {
    /// Another run is still active on this orchestrator.
    #[snafu(display("A run is already in progress"))]
    RunInProgress,

    /// Change detection failed.
    #[snafu(display("{source}"))]
    Detect { source: DetectError },

    /// The destination catalog could not be reached before ingestion.
    #[snafu(display("Destination catalog unavailable: {source}"))]
    CatalogUnavailable { source: CommitError },
}

// ============ Setup Errors ============

/// Errors while building the ingestion components from configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SetupError {
    /// A storage location could not be configured.
    #[snafu(display("Storage error for '{location}': {source}"))]
    Storage {
        location: String,
        source: StorageError,
    },

    /// The source filter could not be built.
    #[snafu(display("Source error: {source}"))]
    SourceSetup { source: SourceError },

    /// The manifest could not be loaded.
    #[snafu(display("Manifest error: {source}"))]
    ManifestSetup { source: ManifestError },

    /// The catalog client could not be built.
    #[snafu(display("Catalog error: {source}"))]
    CatalogSetup { source: CatalogError },
}
