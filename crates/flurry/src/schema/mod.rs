//! Schema handling: column types, reconciliation of batch schemas against
//! the destination table, and the shared schema cache that serializes
//! widening.

mod reconcile;
mod reconciler;
mod types;

pub use reconcile::{Reconciliation, reconcile};
pub use reconciler::SchemaReconciler;
pub use types::{
    Column, ColumnType, RESERVED_COLUMNS, SOURCE_KEY_COLUMN, SOURCE_MARKER_COLUMN,
    SOURCE_OFFSET_COLUMN, TableSchema, Value,
};

use serde::{Deserialize, Serialize};

/// How batch columns missing from the destination are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaEvolutionMode {
    /// New columns fail the object.
    Strict,
    /// New columns are added to the table as nullable columns.
    #[default]
    Merge,
}
