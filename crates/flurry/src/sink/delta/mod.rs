//! Delta Lake table catalog.
//!
//! Every append writes one Parquet file and commits it together with a
//! `Txn` action in a single Delta commit. The `Txn` version is the highest
//! row offset in the file, so after a crash the log tells exactly which
//! rows of an object are already in the table; replayed rows at or below
//! that offset are dropped.
//!
//! Appends to one table are serialized within the process. Commits racing
//! with another process surface as transient errors and are retried after
//! rescanning the log.
//!
//! Table data is reached through the storage provider and its own storage
//! options. A catalog token is never forwarded to storage: when client
//! credentials are configured, a token from the endpoint only gates access,
//! and an expired one is rejected so the caller re-authenticates.

mod actions;
mod convert;
mod table;

pub use actions::{TXN_APP_ID_PREFIX, data_file_name, object_id, txn_app_id};

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use deltalake::DeltaTable;
use deltalake::arrow::datatypes::Schema;
use object_store::PutPayload;
use object_store::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use flurry_core::{StorageError, StorageProviderRef, emit};

use self::actions::{CommittedOffsets, create_add_action, create_txn_action};
use super::{
    AccessToken, AppendOutcome, Credentials, KeyedRow, OAuth2Client, ReconciledBatch, TableCatalog,
};
use crate::error::CatalogError;
use crate::metrics::events::DeltaCommitCompleted;
use crate::schema::{Column, TableSchema};

/// Token issued when no token endpoint is configured.
const LOCAL_TOKEN: &str = "local";

struct TableState {
    table: Option<DeltaTable>,
    committed: CommittedOffsets,
}

/// Table catalog for a single Delta Lake table.
pub struct DeltaCatalog {
    table_name: String,
    storage: StorageProviderRef,
    oauth: OAuth2Client,
    state: Mutex<TableState>,
}

impl std::fmt::Debug for DeltaCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaCatalog")
            .field("table_name", &self.table_name)
            .field("location", &self.storage.canonical_url())
            .finish_non_exhaustive()
    }
}

fn storage_error(err: StorageError) -> CatalogError {
    let message = err.to_string();
    if err.is_transient() {
        CatalogError::Transient { message }
    } else {
        CatalogError::Permanent { message }
    }
}

impl DeltaCatalog {
    /// Catalog for the table stored at `storage`.
    ///
    /// `request_timeout` bounds token endpoint requests.
    pub fn new(
        table_name: impl Into<String>,
        storage: StorageProviderRef,
        request_timeout: Duration,
    ) -> Result<Self, CatalogError> {
        Ok(Self {
            table_name: table_name.into(),
            storage,
            oauth: OAuth2Client::new(request_timeout)?,
            state: Mutex::new(TableState {
                table: None,
                committed: CommittedOffsets::new(),
            }),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Reject calls for another table or with an expired token.
    fn check_request(&self, token: &AccessToken, table: &str) -> Result<(), CatalogError> {
        if table != self.table_name {
            return Err(CatalogError::UnknownTable {
                table: table.to_string(),
            });
        }
        if token.expires_within(Duration::ZERO) {
            return Err(CatalogError::AuthExpired);
        }
        Ok(())
    }

    /// Open the table if needed and bring the snapshot up to date.
    async fn refresh(&self, state: &mut TableState) -> Result<(), CatalogError> {
        match state.table.as_mut() {
            Some(table) => table.load().await.map_err(table::classify)?,
            None => state.table = table::try_open_table(&self.storage, &self.table_name).await?,
        }
        Ok(())
    }

    /// URIs of the data files in the current snapshot.
    pub async fn file_uris(&self) -> Result<Vec<String>, CatalogError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        match &state.table {
            Some(table) => Ok(table.get_file_uris().map_err(table::classify)?.collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn write_data_file(
        &self,
        batch: &ReconciledBatch,
        rows: &[&KeyedRow],
        first: u64,
        last: u64,
    ) -> Result<(String, usize), CatalogError> {
        let record_batch = convert::record_batch(&batch.object, &batch.schema, rows)?;
        let parquet = convert::encode_parquet(&record_batch)?;
        let size = parquet.len();

        let file_name = data_file_name(&batch.object, first, last);
        self.storage
            .put_parquet(
                &Path::from(file_name.as_str()),
                PutPayload::from(Bytes::from(parquet)),
            )
            .await
            .map_err(storage_error)?;

        debug!(target = %self.table_name, file = %file_name, size, "Wrote data file");
        Ok((file_name, size))
    }
}

#[async_trait]
impl TableCatalog for DeltaCatalog {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AccessToken, CatalogError> {
        match credentials {
            Credentials::None => Ok(AccessToken::non_expiring(LOCAL_TOKEN)),
            Credentials::ClientCredentials(config) => self.oauth.fetch_token(config).await,
        }
    }

    async fn get_schema(
        &self,
        token: &AccessToken,
        table: &str,
    ) -> Result<Option<TableSchema>, CatalogError> {
        self.check_request(token, table)?;

        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        match &state.table {
            Some(table) => Ok(Some(convert::table_schema(&table::table_arrow_schema(
                table,
            )?)?)),
            None => Ok(None),
        }
    }

    async fn widen_schema(
        &self,
        token: &AccessToken,
        table: &str,
        columns: &[Column],
    ) -> Result<TableSchema, CatalogError> {
        self.check_request(token, table)?;

        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;

        let schema = match state.table.as_mut() {
            None => {
                let schema = TableSchema::default().widened(columns);
                let created =
                    table::create_table(&self.storage, &convert::arrow_schema(&schema), table)
                        .await?;
                state.table = Some(created);
                schema
            }
            Some(delta_table) => {
                let current = table::table_arrow_schema(delta_table)?;
                let existing = convert::table_schema(&current)?;
                let missing: Vec<Column> = columns
                    .iter()
                    .filter(|column| existing.get(&column.name).is_none())
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    return Ok(existing);
                }

                let mut fields: Vec<_> = current.fields().iter().map(|f| f.as_ref().clone()).collect();
                fields.extend(missing.iter().map(convert::user_field));
                table::evolve_schema(delta_table, &Schema::new(fields), table).await?;
                existing.widened(&missing)
            }
        };

        Ok(schema)
    }

    async fn append_rows(
        &self,
        token: &AccessToken,
        table: &str,
        batch: &ReconciledBatch,
    ) -> Result<AppendOutcome, CatalogError> {
        self.check_request(token, table)?;
        let start = Instant::now();

        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        let TableState {
            table: delta_table,
            committed,
        } = &mut *state;
        let Some(delta_table) = delta_table.as_mut() else {
            return Err(CatalogError::UnknownTable {
                table: table.to_string(),
            });
        };
        committed.scan(delta_table).await?;

        let app_id = txn_app_id(&batch.object);
        let watermark = committed.get(&app_id);
        let rows: Vec<&KeyedRow> = batch
            .rows
            .iter()
            .filter(|row| {
                watermark.is_none_or(|w| i64::try_from(row.offset).unwrap_or(i64::MAX) > w)
            })
            .collect();
        let rows_deduplicated = (batch.rows.len() - rows.len()) as u64;

        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            debug!(
                target = %self.table_name,
                object = %batch.object,
                rows_deduplicated,
                "Every row already committed"
            );
            return Ok(AppendOutcome {
                rows_written: 0,
                rows_deduplicated,
            });
        };
        let (first, last) = (first.offset, last.offset);

        let (file_name, size) = self.write_data_file(batch, &rows, first, last).await?;
        let last_offset = i64::try_from(last).unwrap_or(i64::MAX);
        let actions = vec![
            create_txn_action(app_id.clone(), last_offset),
            create_add_action(&file_name, size),
        ];
        let version = table::commit_append(delta_table, actions).await?;
        committed.record(app_id, last_offset);

        info!(
            target = %self.table_name,
            object = %batch.object,
            rows = rows.len(),
            rows_deduplicated,
            version,
            "Committed rows to Delta table"
        );
        emit!(DeltaCommitCompleted {
            duration: start.elapsed(),
            target: self.table_name.clone(),
        });

        Ok(AppendOutcome {
            rows_written: rows.len() as u64,
            rows_deduplicated,
        })
    }
}
