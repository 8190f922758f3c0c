//! Conversion between table schemas, Arrow and Parquet.

use std::sync::Arc;

use deltalake::arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use deltalake::arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use deltalake::arrow::record_batch::RecordBatch;
use deltalake::parquet::arrow::ArrowWriter;

use crate::error::CatalogError;
use crate::schema::{
    Column, ColumnType, RESERVED_COLUMNS, SOURCE_KEY_COLUMN, SOURCE_MARKER_COLUMN,
    SOURCE_OFFSET_COLUMN, TableSchema, Value,
};
use crate::sink::KeyedRow;
use crate::source::ObjectVersion;

const UTC: &str = "UTC";

static NULL: Value = Value::Null;

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into()))
}

/// Arrow type used to store a column type.
pub fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Timestamp => timestamp_type(),
        ColumnType::Null | ColumnType::Text => DataType::Utf8,
    }
}

/// Column type for an Arrow type found in an existing table.
pub fn column_type(data_type: &DataType) -> Option<ColumnType> {
    match data_type {
        DataType::Boolean => Some(ColumnType::Boolean),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => Some(ColumnType::Integer),
        DataType::Float16 | DataType::Float32 | DataType::Float64 => Some(ColumnType::Float),
        DataType::Timestamp(_, _) => Some(ColumnType::Timestamp),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => Some(ColumnType::Text),
        _ => None,
    }
}

/// The idempotency columns every data file starts with.
pub fn internal_fields() -> Vec<Field> {
    vec![
        Field::new(SOURCE_KEY_COLUMN, DataType::Utf8, false),
        Field::new(SOURCE_MARKER_COLUMN, timestamp_type(), false),
        Field::new(SOURCE_OFFSET_COLUMN, DataType::Int64, false),
    ]
}

/// Arrow field for a user column; user columns are always nullable.
pub fn user_field(column: &Column) -> Field {
    Field::new(&column.name, arrow_type(column.column_type), true)
}

/// Full Arrow schema for data files holding `schema`.
pub fn arrow_schema(schema: &TableSchema) -> Schema {
    let mut fields = internal_fields();
    fields.extend(schema.columns().iter().map(user_field));
    Schema::new(fields)
}

/// Table schema of an existing Delta table, without the idempotency columns.
pub fn table_schema(schema: &Schema) -> Result<TableSchema, CatalogError> {
    schema
        .fields()
        .iter()
        .filter(|field| !RESERVED_COLUMNS.contains(&field.name().as_str()))
        .map(|field| {
            let column_type =
                column_type(field.data_type()).ok_or_else(|| CatalogError::Permanent {
                    message: format!(
                        "column '{}' has unsupported type {}",
                        field.name(),
                        field.data_type()
                    ),
                })?;
            Ok(Column::new(field.name().clone(), column_type))
        })
        .collect::<Result<Vec<_>, CatalogError>>()
        .map(TableSchema::new)
}

fn mismatch(column: &Column, value: &Value) -> CatalogError {
    CatalogError::Permanent {
        message: format!(
            "value of type {} in {} column '{}'",
            value.column_type(),
            column.column_type,
            column.name
        ),
    }
}

fn column_array(
    index: usize,
    column: &Column,
    rows: &[&KeyedRow],
) -> Result<ArrayRef, CatalogError> {
    let values = rows
        .iter()
        .map(|row| row.values.get(index).unwrap_or(&NULL));

    let array: ArrayRef = match column.column_type {
        ColumnType::Boolean => Arc::new(
            values
                .map(|value| match value {
                    Value::Boolean(v) => Ok(Some(*v)),
                    Value::Null => Ok(None),
                    other => Err(mismatch(column, other)),
                })
                .collect::<Result<BooleanArray, _>>()?,
        ),
        ColumnType::Integer => Arc::new(
            values
                .map(|value| match value {
                    Value::Integer(v) => Ok(Some(*v)),
                    Value::Null => Ok(None),
                    other => Err(mismatch(column, other)),
                })
                .collect::<Result<Int64Array, _>>()?,
        ),
        ColumnType::Float => Arc::new(
            values
                .map(|value| match value {
                    Value::Float(v) => Ok(Some(*v)),
                    Value::Integer(v) => Ok(Some(*v as f64)),
                    Value::Null => Ok(None),
                    other => Err(mismatch(column, other)),
                })
                .collect::<Result<Float64Array, _>>()?,
        ),
        ColumnType::Timestamp => Arc::new(
            values
                .map(|value| match value {
                    Value::Timestamp(v) => Ok(Some(v.timestamp_micros())),
                    Value::Null => Ok(None),
                    other => Err(mismatch(column, other)),
                })
                .collect::<Result<TimestampMicrosecondArray, _>>()?
                .with_timezone(UTC),
        ),
        ColumnType::Null | ColumnType::Text => Arc::new(
            values
                .map(|value| match value {
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect::<StringArray>(),
        ),
    };
    Ok(array)
}

/// Build a record batch for `rows`, prefixed with their idempotency columns.
pub fn record_batch(
    object: &ObjectVersion,
    schema: &TableSchema,
    rows: &[&KeyedRow],
) -> Result<RecordBatch, CatalogError> {
    let marker = object.marker.as_datetime().timestamp_micros();
    let offsets = rows
        .iter()
        .map(|row| i64::try_from(row.offset).unwrap_or(i64::MAX))
        .collect::<Int64Array>();

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec![object.key.as_str(); rows.len()])),
        Arc::new(TimestampMicrosecondArray::from(vec![marker; rows.len()]).with_timezone(UTC)),
        Arc::new(offsets),
    ];
    for (index, column) in schema.columns().iter().enumerate() {
        columns.push(column_array(index, column, rows)?);
    }

    RecordBatch::try_new(Arc::new(arrow_schema(schema)), columns).map_err(|e| {
        CatalogError::Permanent {
            message: format!("failed to build record batch: {e}"),
        }
    })
}

/// Encode a record batch as a Parquet file.
pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, CatalogError> {
    let parquet_error = |e: deltalake::parquet::errors::ParquetError| CatalogError::Permanent {
        message: format!("failed to encode parquet: {e}"),
    };

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None).map_err(parquet_error)?;
    writer.write(batch).map_err(parquet_error)?;
    writer.close().map_err(parquet_error)?;
    Ok(buffer)
}
