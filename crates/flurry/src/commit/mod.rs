//! Commit coordination: moves one source object into the destination table.
//!
//! An object is committed batch by batch. Each batch is reconciled against
//! the destination schema and appended with its rows' idempotency keys.
//! Only after the last batch is appended does the manifest record the
//! object as committed, so a crash at any point leaves the object pending
//! and the replay deduplicates whatever was already appended.

mod retry;

pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use snafu::prelude::*;
use tracing::{debug, info, warn};

use flurry_core::emit;

use crate::error::{
    CatalogSnafu, CommitError, ErrorClass, ManifestError, ManifestSnafu, ReadSnafu,
    ReaderError, ReconcileSnafu, Retryable, StreamIoSnafu,
};
use crate::manifest::{ManifestEntry, ManifestStore};
use crate::metrics::events::{BatchAppended, RetryAttempted, RowsDeduplicated, RowsWritten};
use crate::schema::{SchemaEvolutionMode, SchemaReconciler, TableSchema};
use crate::sink::{AccessToken, AppendOutcome, Credentials, ReconciledBatch, TableCatalog, TokenCache};
use crate::source::{BatchReader, ObjectSource, ObjectVersion, ReaderConfig, RowBatch, SourceObject};

/// Settings for a [`CommitCoordinator`].
#[derive(Debug, Clone)]
pub struct CommitSettings {
    /// Destination table name.
    pub table: String,
    pub reader: ReaderConfig,
    pub retry: RetryPolicy,
    pub schema_evolution: SchemaEvolutionMode,
}

/// What committing one object did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub rows_written: u64,
    pub rows_deduplicated: u64,
    pub batches: usize,
    /// Malformed rows skipped under lenient parsing.
    pub skipped_rows: u64,
}

impl CommitOutcome {
    fn add(&mut self, appended: AppendOutcome) {
        self.rows_written += appended.rows_written;
        self.rows_deduplicated += appended.rows_deduplicated;
        self.batches += 1;
    }
}

fn is_already_committed(err: &CommitError) -> bool {
    matches!(
        err,
        CommitError::Manifest {
            source: ManifestError::AlreadyCommitted { .. }
        }
    )
}

/// Writes objects to the destination and advances the manifest.
///
/// Shared by all workers of a run: the access token and the destination
/// schema are cached once for all of them.
pub struct CommitCoordinator {
    source: Arc<dyn ObjectSource>,
    catalog: Arc<dyn TableCatalog>,
    manifest: Arc<dyn ManifestStore>,
    tokens: TokenCache,
    schema: SchemaReconciler,
    settings: CommitSettings,
}

impl std::fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("table", &self.settings.table)
            .field("retry", &self.settings.retry)
            .finish_non_exhaustive()
    }
}

impl CommitCoordinator {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        catalog: Arc<dyn TableCatalog>,
        manifest: Arc<dyn ManifestStore>,
        settings: CommitSettings,
        credentials: Credentials,
    ) -> Self {
        let tokens = TokenCache::new(catalog.clone(), credentials, settings.table.clone());
        let schema = SchemaReconciler::new(
            catalog.clone(),
            settings.table.clone(),
            settings.schema_evolution,
        );
        Self {
            source,
            catalog,
            manifest,
            tokens,
            schema,
            settings,
        }
    }

    pub fn table(&self) -> &str {
        &self.settings.table
    }

    /// Authenticate and load the destination schema.
    ///
    /// Called once before ingestion starts; a failure here means no object
    /// can be committed.
    pub async fn prepare(&self) -> Result<Option<TableSchema>, CommitError> {
        let schema = &self.schema;
        let loaded = self
            .with_token("get_schema", move |token| async move {
                schema.load(&token).await.context(CatalogSnafu)
            })
            .await?;

        info!(
            target = %self.settings.table,
            exists = loaded.is_some(),
            columns = loaded.as_ref().map_or(0, |s| s.columns().len()),
            "Loaded destination schema"
        );
        Ok(loaded)
    }

    /// Obtain an access token through the cache, under the retry policy.
    pub async fn authenticate(&self) -> Result<AccessToken, CommitError> {
        let tokens = &self.tokens;
        self.settings
            .retry
            .run("authenticate", &self.settings.table, move || async move {
                tokens.token().await.context(CatalogSnafu)
            })
            .await
    }

    /// Ingest one object end to end.
    ///
    /// Records a pending entry, commits every batch, then records the
    /// object as committed. On failure a failed entry carrying the error is
    /// recorded. A transient failure while reading the object restarts it
    /// from its first batch, within the retry ceiling.
    pub async fn ingest(&self, object: &SourceObject) -> Result<CommitOutcome, CommitError> {
        let attempt = match self.begin(object).await {
            Ok(attempt) => attempt,
            Err(err) if is_already_committed(&err) => {
                info!(target = %self.settings.table, key = %object.key, "Object already committed");
                return Ok(CommitOutcome::default());
            }
            Err(err) => return Err(err),
        };

        let max_reads = self.settings.retry.max_attempts.max(1);
        let mut reads = 0;
        let result = loop {
            reads += 1;
            match self.read_and_commit(object, attempt).await {
                Err(err)
                    if matches!(err, CommitError::Read { .. })
                        && err.class() == ErrorClass::Transient
                        && reads < max_reads =>
                {
                    let delay = self.settings.retry.backoff(reads);
                    warn!(
                        target = %self.settings.table,
                        key = %object.key,
                        read = reads,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Source read failed, restarting object"
                    );
                    emit!(RetryAttempted {
                        operation: "read_source",
                        reason: "transient",
                        target: self.settings.table.clone(),
                    });
                    tokio::time::sleep(delay).await;
                }
                result => break result,
            }
        };

        if let Err(err) = &result
            && let Err(record_err) = self.fail(object, attempt, err).await
        {
            warn!(
                target = %self.settings.table,
                key = %object.key,
                error = %record_err,
                "Failed to record object failure"
            );
        }
        result
    }

    /// Record a pending entry for a new attempt and return its number.
    pub async fn begin(&self, object: &SourceObject) -> Result<u32, CommitError> {
        let version = object.version();
        let manifest = self.manifest.as_ref();
        let previous = {
            let version = &version;
            self.settings
                .retry
                .run("manifest_lookup", &self.settings.table, move || async move {
                    manifest.get_version(version).await.context(ManifestSnafu)
                })
                .await?
        };

        let attempt = previous.map_or(0, |entry| entry.attempt_count) + 1;
        self.record(ManifestEntry::pending(&version, attempt)).await?;
        debug!(target = %self.settings.table, key = %object.key, attempt, "Started object");
        Ok(attempt)
    }

    /// Append every batch from `reader`, then record the object committed.
    pub async fn commit(
        &self,
        object: &SourceObject,
        reader: &mut BatchReader,
        attempt: u32,
    ) -> Result<CommitOutcome, CommitError> {
        let version = object.version();
        let mut outcome = CommitOutcome::default();

        while let Some(batch) = self.read(&object.key, reader.next_batch()).await? {
            let appended = self.commit_batch(&version, batch).await?;
            outcome.add(appended);
        }
        outcome.skipped_rows = reader.skipped_rows();

        match self.record(ManifestEntry::committed(&version, attempt)).await {
            Ok(()) => {}
            Err(err) if is_already_committed(&err) => {
                debug!(target = %self.settings.table, key = %object.key, "Committed concurrently");
            }
            Err(err) => return Err(err),
        }

        info!(
            target = %self.settings.table,
            key = %object.key,
            marker = %object.modification_marker,
            attempt,
            batches = outcome.batches,
            rows_written = outcome.rows_written,
            rows_deduplicated = outcome.rows_deduplicated,
            rows_skipped = outcome.skipped_rows,
            "Committed object"
        );
        Ok(outcome)
    }

    /// Record a failed entry for `attempt`.
    pub async fn fail(
        &self,
        object: &SourceObject,
        attempt: u32,
        error: &CommitError,
    ) -> Result<(), CommitError> {
        warn!(
            target = %self.settings.table,
            key = %object.key,
            marker = %object.modification_marker,
            attempt,
            error = %error,
            "Object failed"
        );
        self.record(ManifestEntry::failed(
            &object.version(),
            attempt,
            error.to_string(),
        ))
        .await
    }

    async fn read_and_commit(
        &self,
        object: &SourceObject,
        attempt: u32,
    ) -> Result<CommitOutcome, CommitError> {
        let open = BatchReader::open(self.source.as_ref(), object, self.settings.reader.clone());
        let mut reader = self.read(&object.key, open).await?;
        let result = self.commit(object, &mut reader, attempt).await;
        reader.close();
        result
    }

    /// Await a source read, bounded by the request timeout.
    ///
    /// A read that stalls counts as a broken stream, so the object is
    /// restarted like after any other transient read failure.
    async fn read<T>(
        &self,
        key: &str,
        read: impl Future<Output = Result<T, ReaderError>>,
    ) -> Result<T, CommitError> {
        let after = self.settings.retry.request_timeout;
        match tokio::time::timeout(after, read).await {
            Ok(result) => result.context(ReadSnafu),
            Err(_) => Err::<T, _>(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("read timed out after {}ms", after.as_millis()),
            ))
            .context(StreamIoSnafu { key })
            .context(ReadSnafu),
        }
    }

    async fn commit_batch(
        &self,
        object: &ObjectVersion,
        batch: RowBatch,
    ) -> Result<AppendOutcome, CommitError> {
        let start = Instant::now();

        let schema = &self.schema;
        let batch_schema = &batch.schema;
        let plan = self
            .with_token("resolve_schema", move |token| async move {
                schema
                    .resolve(batch_schema, &token)
                    .await
                    .context(ReconcileSnafu)
            })
            .await?;
        let reconciled = plan.apply(object, batch);

        let appended = self.append(&reconciled).await?;

        emit!(BatchAppended {
            rows: reconciled.row_count(),
            duration: start.elapsed(),
            target: self.settings.table.clone(),
        });
        emit!(RowsWritten {
            count: appended.rows_written,
            target: self.settings.table.clone(),
        });
        if appended.rows_deduplicated > 0 {
            debug!(
                target = %self.settings.table,
                key = %object.key,
                rows = appended.rows_deduplicated,
                "Dropped rows already in the table"
            );
            emit!(RowsDeduplicated {
                count: appended.rows_deduplicated,
                target: self.settings.table.clone(),
            });
        }
        Ok(appended)
    }

    async fn append(&self, batch: &ReconciledBatch) -> Result<AppendOutcome, CommitError> {
        let catalog = self.catalog.as_ref();
        let table = self.settings.table.as_str();
        self.with_token("append_rows", move |token| async move {
            catalog
                .append_rows(&token, table, batch)
                .await
                .context(CatalogSnafu)
        })
        .await
    }

    /// Record a manifest entry, retrying transient write failures.
    async fn record(&self, entry: ManifestEntry) -> Result<(), CommitError> {
        let manifest = self.manifest.as_ref();
        let entry = &entry;
        self.settings
            .retry
            .run("manifest_record", &self.settings.table, move || async move {
                manifest.record(entry.clone()).await.context(ManifestSnafu)
            })
            .await
    }

    /// Run a catalog call with a cached token, under the retry policy.
    ///
    /// An expired token is dropped from the cache so the retry
    /// re-authenticates.
    async fn with_token<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, CommitError>
    where
        F: Fn(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, CommitError>>,
    {
        let call = &call;
        let tokens = &self.tokens;
        self.settings
            .retry
            .run(operation, &self.settings.table, move || async move {
                let token = tokens.token().await.context(CatalogSnafu)?;
                let result = call(token.clone()).await;
                if let Err(err) = &result
                    && err.class() == ErrorClass::AuthExpired
                {
                    tokens.invalidate(&token).await;
                }
                result
            })
            .await
    }
}
