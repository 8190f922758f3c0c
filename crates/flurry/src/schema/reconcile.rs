//! Pure schema reconciliation.

use tracing::trace;

use super::{Column, ColumnType, RESERVED_COLUMNS, SchemaEvolutionMode, TableSchema, Value};
use crate::error::SchemaError;
use crate::sink::{KeyedRow, ReconciledBatch};
use crate::source::{ObjectVersion, RowBatch};

/// How a batch maps onto the destination table.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    target: TableSchema,
    new_columns: Vec<Column>,
    creates_table: bool,
    /// For each target column, the batch column feeding it.
    mapping: Vec<Option<usize>>,
}

impl Reconciliation {
    /// The destination schema once this reconciliation is applied.
    pub fn target(&self) -> &TableSchema {
        &self.target
    }

    /// Columns the destination must gain before the batch can be written.
    pub fn new_columns(&self) -> &[Column] {
        &self.new_columns
    }

    /// Whether the destination must be created or widened first.
    pub fn needs_widening(&self) -> bool {
        self.creates_table || !self.new_columns.is_empty()
    }

    /// Project the batch onto the target schema.
    ///
    /// Columns absent from the batch are null; values are coerced to the
    /// target column type. Text columns take the field as it was read.
    pub fn apply(&self, object: &ObjectVersion, batch: RowBatch) -> ReconciledBatch {
        let rows = batch
            .rows
            .into_iter()
            .map(|row| {
                let mut values: Vec<Option<Value>> = row.values.into_iter().map(Some).collect();
                let mut raw = row.raw;
                let projected = self
                    .target
                    .columns()
                    .iter()
                    .zip(&self.mapping)
                    .map(|(column, source)| {
                        let Some(index) = *source else {
                            return Value::Null;
                        };
                        match values.get_mut(index).and_then(Option::take) {
                            None | Some(Value::Null) => Value::Null,
                            Some(value) if column.column_type == ColumnType::Text => {
                                match raw.get_mut(index) {
                                    Some(text) => Value::Text(std::mem::take(text)),
                                    None => Value::Text(value.to_string()),
                                }
                            }
                            Some(value) => value.coerce(column.column_type).unwrap_or(Value::Null),
                        }
                    })
                    .collect();
                KeyedRow {
                    offset: row.offset,
                    values: projected,
                }
            })
            .collect();

        ReconciledBatch {
            object: object.clone(),
            schema: self.target.clone(),
            rows,
        }
    }
}

/// Reconcile a batch schema against the destination schema.
///
/// `destination` is `None` when the table does not exist yet, in which case
/// the batch defines it regardless of `mode`. Existing columns keep their
/// type and position; new columns are appended. A new column whose type is
/// still `Null` is added as `Text`.
pub fn reconcile(
    batch: &TableSchema,
    destination: Option<&TableSchema>,
    mode: SchemaEvolutionMode,
) -> Result<Reconciliation, SchemaError> {
    let empty = TableSchema::default();
    let current = destination.unwrap_or(&empty);
    let mut new_columns = Vec::new();

    for column in batch.columns() {
        if RESERVED_COLUMNS.contains(&column.name.as_str()) {
            return Err(SchemaError::ReservedColumn {
                column: column.name.clone(),
            });
        }

        match current.get(&column.name) {
            Some(existing) if existing.column_type.accepts(column.column_type) => {}
            Some(existing) => {
                return Err(SchemaError::TypeConflict {
                    column: column.name.clone(),
                    destination: existing.column_type,
                    batch: column.column_type,
                });
            }
            None if destination.is_some() && mode == SchemaEvolutionMode::Strict => {
                return Err(SchemaError::UnexpectedColumn {
                    column: column.name.clone(),
                });
            }
            None if column.column_type == ColumnType::Null => {
                trace!(column = %column.name, "Adding column with no values yet as text");
                new_columns.push(Column::new(column.name.clone(), ColumnType::Text));
            }
            None => new_columns.push(column.clone()),
        }
    }

    let target = current.widened(&new_columns);
    let mapping = target
        .columns()
        .iter()
        .map(|column| batch.position(&column.name))
        .collect();

    Ok(Reconciliation {
        target,
        new_columns,
        creates_table: destination.is_none(),
        mapping,
    })
}
