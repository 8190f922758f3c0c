//! Bounded CSV batch reader.
//!
//! Streams one source object and yields batches of at most `chunk_size`
//! rows, never holding more than one batch in memory. Column types are
//! inferred from the first batch; later batches must conform to them.
//! Columns whose type could not be inferred yet (all values empty) are
//! resolved by the first batch that contains a value.

use std::collections::HashSet;

use bytes::Bytes;
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use snafu::prelude::*;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use flurry_core::emit;

use super::{ByteStream, ObjectSource, SourceObject};
use crate::error::{
    CsvHeaderSnafu, DuplicateColumnSnafu, MalformedRowSnafu, OpenStreamSnafu, ReaderError,
    StreamIoSnafu, ValueTypeConflictSnafu,
};
use crate::metrics::events::RowsSkipped;
use crate::schema::{Column, ColumnType, TableSchema, Value};

/// Reader settings.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Maximum rows per batch.
    pub chunk_size: usize,
    /// Fail on malformed rows instead of skipping them.
    pub strict_parsing: bool,
    /// Field delimiter.
    pub delimiter: u8,
    /// Label for logs and metrics.
    pub target: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            strict_parsing: true,
            delimiter: b',',
            target: String::new(),
        }
    }
}

/// One data record and its position in the object.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Zero-based index among the object's data records. Skipped records
    /// still consume an offset, so offsets are stable across re-reads.
    pub offset: u64,
    pub values: Vec<Value>,
    /// Field text as read. A value written to a text column keeps this
    /// spelling rather than the formatting of its parsed form.
    pub raw: Vec<String>,
}

/// A bounded slice of an object's rows with the columns observed so far.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

impl RowBatch {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

type CsvStream = AsyncReader<StreamReader<ByteStream, Bytes>>;

/// Streams a single CSV object as [`RowBatch`]es.
///
/// The reader is not restartable; to re-read an object, open a new one.
pub struct BatchReader {
    object: SourceObject,
    config: ReaderConfig,
    csv: CsvStream,
    headers: Vec<String>,
    column_types: Option<Vec<ColumnType>>,
    next_offset: u64,
    skipped_rows: u64,
    finished: bool,
}

impl std::fmt::Debug for BatchReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchReader")
            .field("key", &self.object.key)
            .field("next_offset", &self.next_offset)
            .field("finished", &self.finished)
            .finish()
    }
}

impl BatchReader {
    /// Open `object` and read its header row.
    pub async fn open(
        source: &dyn ObjectSource,
        object: &SourceObject,
        config: ReaderConfig,
    ) -> Result<Self, ReaderError> {
        let key = object.key.as_str();
        let stream = source
            .open_stream(key)
            .await
            .context(OpenStreamSnafu { key })?;

        let mut csv = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(config.delimiter)
            .create_reader(StreamReader::new(stream));

        let header = csv.headers().await.context(CsvHeaderSnafu { key })?;
        let headers = normalize_headers(header, key)?;

        debug!(
            target = %config.target,
            key,
            columns = headers.len(),
            "Opened source object"
        );

        Ok(Self {
            object: object.clone(),
            finished: headers.is_empty(),
            config,
            csv,
            headers,
            column_types: None,
            next_offset: 0,
            skipped_rows: 0,
        })
    }

    pub fn object(&self) -> &SourceObject {
        &self.object
    }

    /// Rows skipped as malformed so far (lenient parsing only).
    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows
    }

    /// Release the underlying stream.
    pub fn close(self) {
        debug!(
            target = %self.config.target,
            key = %self.object.key,
            rows_read = self.next_offset,
            "Closed source object"
        );
    }

    /// Read the next batch, or `None` once the object is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>, ReaderError> {
        if self.finished {
            return Ok(None);
        }

        let mut records: Vec<(u64, StringRecord)> = Vec::with_capacity(self.config.chunk_size);
        let mut record = StringRecord::new();

        while records.len() < self.config.chunk_size {
            let offset = self.next_offset;
            match self.csv.read_record(&mut record).await {
                Ok(false) => {
                    self.finished = true;
                    break;
                }
                Ok(true) => {
                    self.next_offset += 1;
                    if record.len() == self.headers.len() {
                        records.push((offset, record.clone()));
                    } else {
                        let message = format!(
                            "expected {} fields, found {}",
                            self.headers.len(),
                            record.len()
                        );
                        self.malformed(offset, message)?;
                    }
                }
                Err(err) if err.is_io_error() => {
                    let key = self.object.key.as_str();
                    let source = match err.into_kind() {
                        csv_async::ErrorKind::Io(source) => source,
                        other => std::io::Error::other(format!("{other:?}")),
                    };
                    return Err(source).context(StreamIoSnafu { key });
                }
                Err(err) => {
                    self.next_offset += 1;
                    self.malformed(offset, err.to_string())?;
                }
            }
        }

        if records.is_empty() {
            return Ok(None);
        }

        let batch = self.build_batch(records)?;
        Ok(Some(batch))
    }

    fn malformed(&mut self, offset: u64, message: String) -> Result<(), ReaderError> {
        let key = self.object.key.as_str();
        ensure!(
            !self.config.strict_parsing,
            MalformedRowSnafu {
                key,
                offset,
                message,
            }
        );

        warn!(
            target = %self.config.target,
            key,
            offset,
            reason = %message,
            "Skipping malformed row"
        );
        self.skipped_rows += 1;
        emit!(RowsSkipped {
            count: 1,
            target: self.config.target.clone(),
        });
        Ok(())
    }

    fn build_batch(&mut self, records: Vec<(u64, StringRecord)>) -> Result<RowBatch, ReaderError> {
        let column_types = self.resolve_types(&records);

        let mut rows = Vec::with_capacity(records.len());
        for (offset, record) in &records {
            let mut values = Vec::with_capacity(column_types.len());
            for (index, raw) in record.iter().enumerate() {
                let expected = column_types[index];
                let value = Value::parse_as(raw, expected).context(ValueTypeConflictSnafu {
                    key: self.object.key.as_str(),
                    offset: *offset,
                    column: self.headers[index].as_str(),
                    expected,
                    value: raw,
                })?;
                values.push(value);
            }
            rows.push(Row {
                offset: *offset,
                values,
                raw: record.iter().map(str::to_string).collect(),
            });
        }

        let schema = self
            .headers
            .iter()
            .zip(&column_types)
            .map(|(name, column_type)| Column::new(name.clone(), *column_type))
            .collect();

        Ok(RowBatch { schema, rows })
    }

    /// Column types for a batch: inferred on the first batch, fixed after,
    /// except that still-null columns take the type of this batch's values.
    fn resolve_types(&mut self, records: &[(u64, StringRecord)]) -> Vec<ColumnType> {
        let observed = |index: usize| {
            records
                .iter()
                .filter_map(|(_, record)| record.get(index))
                .map(|raw| Value::infer(raw).column_type())
                .fold(ColumnType::Null, ColumnType::unify)
        };

        let types = match self.column_types.take() {
            None => (0..self.headers.len()).map(observed).collect(),
            Some(types) => types
                .into_iter()
                .enumerate()
                .map(|(index, current)| match current {
                    ColumnType::Null => observed(index),
                    resolved => resolved,
                })
                .collect::<Vec<_>>(),
        };

        self.column_types = Some(types.clone());
        types
    }
}

fn normalize_headers(header: &StringRecord, key: &str) -> Result<Vec<String>, ReaderError> {
    let mut seen = HashSet::new();
    let mut headers = Vec::with_capacity(header.len());
    for (index, name) in header.iter().enumerate() {
        let name = match name.trim() {
            "" => format!("column_{}", index + 1),
            trimmed => trimmed.to_string(),
        };
        ensure!(
            seen.insert(name.clone()),
            DuplicateColumnSnafu { key, column: name }
        );
        headers.push(name);
    }
    Ok(headers)
}
