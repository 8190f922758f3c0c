//! Destination table catalogs.
//!
//! A [`TableCatalog`] owns the destination table: it authenticates, reports
//! and widens the table schema, and appends reconciled rows. Appends are
//! idempotent on each row's [`IdempotencyKey`]: rows already present in the
//! table are dropped and reported as deduplicated.

pub mod auth;
pub mod delta;
mod memory;

pub use auth::{AccessToken, Credentials, OAuth2Client, OAuth2Config, TokenCache};
pub use delta::DeltaCatalog;
pub use memory::{InjectedFailure, MemoryCatalog};

use std::fmt;

use async_trait::async_trait;

use crate::error::CatalogError;
use crate::schema::{Column, TableSchema, Value};
use crate::source::ObjectVersion;

/// Uniquely identifies one source row across all objects and runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey {
    pub object: ObjectVersion,
    pub offset: u64,
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.object, self.offset)
    }
}

/// A row projected onto the destination schema.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRow {
    pub offset: u64,
    pub values: Vec<Value>,
}

/// Rows of one object ready to append, in destination column order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledBatch {
    pub object: ObjectVersion,
    pub schema: TableSchema,
    pub rows: Vec<KeyedRow>,
}

impl ReconciledBatch {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn key(&self, row: &KeyedRow) -> IdempotencyKey {
        IdempotencyKey {
            object: self.object.clone(),
            offset: row.offset,
        }
    }

    pub fn first_offset(&self) -> Option<u64> {
        self.rows.first().map(|row| row.offset)
    }

    pub fn last_offset(&self) -> Option<u64> {
        self.rows.last().map(|row| row.offset)
    }
}

/// Result of an append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub rows_written: u64,
    /// Rows dropped because their idempotency key was already committed.
    pub rows_deduplicated: u64,
}

/// Destination table service.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Exchange credentials for an access token.
    async fn authenticate(&self, credentials: &Credentials) -> Result<AccessToken, CatalogError>;

    /// Current schema of `table`, or `None` if it does not exist yet.
    async fn get_schema(
        &self,
        token: &AccessToken,
        table: &str,
    ) -> Result<Option<TableSchema>, CatalogError>;

    /// Add `columns` as nullable columns, creating the table if needed.
    ///
    /// Columns the table already has are left untouched. Returns the
    /// resulting schema.
    async fn widen_schema(
        &self,
        token: &AccessToken,
        table: &str,
        columns: &[Column],
    ) -> Result<TableSchema, CatalogError>;

    /// Append rows; rows whose idempotency key is already present are dropped.
    async fn append_rows(
        &self,
        token: &AccessToken,
        table: &str,
        batch: &ReconciledBatch,
    ) -> Result<AppendOutcome, CatalogError>;
}
