//! Run orchestration.
//!
//! A run detects pending objects, ingests them through a bounded worker
//! pool and summarizes the outcome. Only one run may be active per
//! orchestrator. Objects fail independently; only failing to list the
//! source or to reach the catalog before ingestion ends a run early.

mod check;
mod summary;

pub use check::{CheckResult, ConnectivityReport};
pub use summary::{ObjectFailure, RunStatus, RunSummary};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use snafu::prelude::*;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flurry_core::{StorageProvider, emit};

use crate::commit::{CommitCoordinator, CommitOutcome, CommitSettings};
use crate::config::Config;
use crate::error::{
    CatalogSetupSnafu, CatalogUnavailableSnafu, CommitError, DetectSnafu, ManifestSetupSnafu, RunError,
    RunInProgressSnafu, SetupError, SourceSetupSnafu, StorageSnafu,
};
use crate::manifest::StorageManifestStore;
use crate::metrics::events::{ObjectProcessed, ObjectStatus, RunCompleted};
use crate::sink::DeltaCatalog;
use crate::source::{DeltaDetector, KeyFilter, SourceObject, StorageSource};

/// Phase of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Detecting,
    Ingesting,
    Summarizing,
}

/// Holds the orchestrator out of `Idle` for the duration of a run.
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
}

impl<'a> RunGuard<'a> {
    fn acquire(state: &'a Mutex<RunState>) -> Result<Self, RunError> {
        let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
        ensure!(*current == RunState::Idle, RunInProgressSnafu);
        *current = RunState::Detecting;
        Ok(Self { state })
    }

    fn set(&self, next: RunState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.set(RunState::Idle);
    }
}

type TaskOutput = (SourceObject, Duration, Result<CommitOutcome, CommitError>);

/// Sequences detection, ingestion and summarizing for one destination.
pub struct RunOrchestrator {
    detector: DeltaDetector,
    coordinator: Arc<CommitCoordinator>,
    max_parallel: usize,
    shutdown: CancellationToken,
    state: Mutex<RunState>,
}

impl std::fmt::Debug for RunOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("table", &self.coordinator.table())
            .field("max_parallel", &self.max_parallel)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RunOrchestrator {
    pub fn new(
        detector: DeltaDetector,
        coordinator: Arc<CommitCoordinator>,
        max_parallel: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            detector,
            coordinator,
            max_parallel: max_parallel.max(1),
            shutdown,
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Build the storage-backed components described by `config`.
    pub async fn from_config(
        config: &Config,
        shutdown: CancellationToken,
    ) -> Result<Self, SetupError> {
        let table = config.destination_table.clone();

        let source_storage = StorageProvider::for_url_with_options(
            &config.source_location,
            config.source_storage_options.clone(),
        )
        .await
        .context(StorageSnafu {
            location: config.source_location.clone(),
        })?;
        let source = Arc::new(StorageSource::new(Arc::new(source_storage)));

        let table_uri = &config.destination.table_uri;
        let table_storage = StorageProvider::for_url_with_options(
            table_uri,
            config.destination.storage_options.clone(),
        )
        .await
        .context(StorageSnafu {
            location: table_uri.clone(),
        })?;
        let catalog = Arc::new(
            DeltaCatalog::new(table.clone(), Arc::new(table_storage), config.request_timeout())
                .context(CatalogSetupSnafu)?,
        );

        let manifest_location = config.manifest_location();
        let manifest_storage = StorageProvider::for_url_with_options(
            &manifest_location,
            config.destination.storage_options.clone(),
        )
        .await
        .context(StorageSnafu {
            location: manifest_location.clone(),
        })?;
        let manifest = Arc::new(
            StorageManifestStore::open(Arc::new(manifest_storage))
                .await
                .context(ManifestSetupSnafu)?,
        );

        let filter = KeyFilter::new(&config.glob_pattern).context(SourceSetupSnafu)?;
        let retry = config.retry_policy();
        let detector = DeltaDetector::new(source.clone(), manifest.clone(), filter, table.clone())
            .with_retry(retry.clone());

        let settings = CommitSettings {
            table: table.clone(),
            reader: config.reader_config(),
            retry,
            schema_evolution: config.schema_evolution,
        };
        let coordinator = Arc::new(CommitCoordinator::new(
            source,
            catalog,
            manifest,
            settings,
            config.credentials(),
        ));

        info!(
            target = %table,
            source = %config.source_location,
            destination = %table_uri,
            manifest = %manifest_location,
            max_parallel = config.max_parallel_objects,
            "Initialized ingestion"
        );

        Ok(Self::new(
            detector,
            coordinator,
            config.max_parallel_objects,
            shutdown,
        ))
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Detect pending objects without ingesting them.
    pub async fn detect_only(&self) -> Result<Vec<SourceObject>, RunError> {
        let _guard = RunGuard::acquire(&self.state)?;
        self.detector.detect().await.context(DetectSnafu)
    }

    /// Check that the source, the token endpoint and the destination table
    /// are reachable, without ingesting anything.
    ///
    /// Every check runs even if an earlier one fails, except that the
    /// destination is only queried with a token.
    pub async fn check(&self) -> ConnectivityReport {
        let mut report = ConnectivityReport::default();
        let table = self.coordinator.table().to_string();

        let listed = self.detector.list_source().await.map(|objects| {
            format!(
                "{} object(s) match '{}'",
                objects.len(),
                self.detector.pattern()
            )
        });
        report.push("source", listed.map_err(|e| e.to_string()));

        let token = self.coordinator.authenticate().await;
        let authenticated = token.is_ok();
        report.push(
            "token",
            token
                .map(|token| match token.expires_at() {
                    Some(expires_at) => format!("token valid until {}", expires_at.to_rfc3339()),
                    None => "token does not expire".to_string(),
                })
                .map_err(|e| e.to_string()),
        );

        let destination = if authenticated {
            self.coordinator
                .prepare()
                .await
                .map(|schema| match schema {
                    Some(schema) => format!("table '{table}' has {} column(s)", schema.len()),
                    None => format!("table '{table}' does not exist yet and will be created"),
                })
                .map_err(|e| e.to_string())
        } else {
            Err("skipped without a token".to_string())
        };
        report.push("destination", destination);

        for check in &report.checks {
            match &check.outcome {
                Ok(detail) => info!(target = %table, check = check.name, %detail, "Check passed"),
                Err(reason) => error!(target = %table, check = check.name, %reason, "Check failed"),
            }
        }
        report
    }

    /// Run one ingestion pass.
    ///
    /// Fails with `RunInProgress` if another run is active; the active run
    /// is not affected.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let guard = RunGuard::acquire(&self.state)?;
        let start = Instant::now();
        let table = self.coordinator.table().to_string();

        let result = self.run_phases(&guard).await;

        let status = match &result {
            Ok(summary) => summary.status().as_str(),
            Err(_) => "error",
        };
        emit!(RunCompleted {
            status,
            duration: start.elapsed(),
            target: table.clone(),
        });
        match &result {
            Ok(summary) => info!(
                target = %table,
                status,
                scanned = summary.objects_scanned,
                committed = summary.objects_committed,
                failed = summary.objects_failed,
                skipped = summary.objects_skipped,
                rows_written = summary.rows_written,
                rows_deduplicated = summary.rows_deduplicated,
                duration_ms = start.elapsed().as_millis(),
                "Run finished"
            ),
            Err(err) => error!(target = %table, error = %err, "Run aborted"),
        }
        result
    }

    async fn run_phases(&self, guard: &RunGuard<'_>) -> Result<RunSummary, RunError> {
        let objects = self.detector.detect().await.context(DetectSnafu)?;
        let mut summary = RunSummary::new(objects.len());

        if !objects.is_empty() {
            guard.set(RunState::Ingesting);
            self.coordinator
                .prepare()
                .await
                .context(CatalogUnavailableSnafu)?;
            self.ingest(objects, &mut summary).await;
        }

        guard.set(RunState::Summarizing);
        Ok(summary)
    }

    async fn ingest(&self, objects: Vec<SourceObject>, summary: &mut RunSummary) {
        let table = self.coordinator.table().to_string();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, SourceObject> = HashMap::new();

        let mut queue = objects.into_iter();
        while let Some(object) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let skipped = 1 + queue.len();
                warn!(target = %table, skipped, "Shutdown requested, not dispatching remaining objects");
                summary.objects_skipped = skipped;
                for _ in 0..skipped {
                    emit!(ObjectProcessed {
                        status: ObjectStatus::Skipped,
                        duration: Duration::ZERO,
                        target: table.clone(),
                    });
                }
                break;
            };

            let coordinator = self.coordinator.clone();
            let task_object = object.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let start = Instant::now();
                let result = coordinator.ingest(&task_object).await;
                (task_object, start.elapsed(), result)
            });
            in_flight.insert(handle.id(), object);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, (object, duration, result))) => {
                    in_flight.remove(&id);
                    self.record(summary, &table, &object, duration, result);
                }
                Err(err) => {
                    let Some(object) = in_flight.remove(&err.id()) else {
                        error!(target = %table, error = %err, "Ingestion task failed");
                        continue;
                    };
                    error!(target = %table, key = %object.key, error = %err, "Ingestion task panicked");
                    summary.record_failure(&object, format!("ingestion task failed: {err}"));
                    emit!(ObjectProcessed {
                        status: ObjectStatus::Failed,
                        duration: Duration::ZERO,
                        target: table.clone(),
                    });
                }
            }
        }
    }

    fn record(
        &self,
        summary: &mut RunSummary,
        table: &str,
        object: &SourceObject,
        duration: Duration,
        result: Result<CommitOutcome, CommitError>,
    ) {
        let status = match result {
            Ok(outcome) => {
                summary.record_commit(&outcome);
                ObjectStatus::Committed
            }
            Err(err) => {
                summary.record_failure(object, &err);
                ObjectStatus::Failed
            }
        };
        emit!(ObjectProcessed {
            status,
            duration,
            target: table.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::RetryPolicy;
    use crate::manifest::MemoryManifestStore;
    use crate::schema::SchemaEvolutionMode;
    use crate::sink::{Credentials, MemoryCatalog};
    use crate::source::{MemorySource, ReaderConfig};
    use chrono::{TimeZone, Utc};

    fn orchestrator(
        source: &Arc<MemorySource>,
        catalog: &Arc<MemoryCatalog>,
        shutdown: CancellationToken,
    ) -> RunOrchestrator {
        let manifest = Arc::new(MemoryManifestStore::new());
        let detector = DeltaDetector::new(
            source.clone(),
            manifest.clone(),
            KeyFilter::new("*.csv").unwrap(),
            "trips",
        );
        let coordinator = CommitCoordinator::new(
            source.clone(),
            catalog.clone(),
            manifest,
            CommitSettings {
                table: "trips".to_string(),
                reader: ReaderConfig::default(),
                retry: RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    request_timeout: Duration::from_secs(5),
                },
                schema_evolution: SchemaEvolutionMode::Merge,
            },
            Credentials::None,
        );
        RunOrchestrator::new(detector, Arc::new(coordinator), 2, shutdown)
    }

    #[tokio::test]
    async fn test_empty_run_does_not_touch_catalog() {
        let source = Arc::new(MemorySource::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let orchestrator = orchestrator(&source, &catalog, CancellationToken::new());

        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary, RunSummary::default());
        assert_eq!(catalog.auth_calls(), 0);
        assert_eq!(orchestrator.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_objects() {
        let source = Arc::new(MemorySource::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let marker = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        source.put("a.csv", marker, "id\n1\n");
        source.put("b.csv", marker, "id\n2\n");
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let orchestrator = orchestrator(&source, &catalog, shutdown);

        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.objects_scanned, 2);
        assert_eq!(summary.objects_skipped, 2);
        assert_eq!(summary.objects_committed, 0);
        assert_eq!(catalog.append_calls(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_catalog_is_fatal() {
        let source = Arc::new(MemorySource::new());
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.reject_credentials(true);
        source.put(
            "a.csv",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            "id\n1\n",
        );
        let orchestrator = orchestrator(&source, &catalog, CancellationToken::new());

        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, RunError::CatalogUnavailable { .. }));
        assert_eq!(orchestrator.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_detect_only_reports_pending_objects() {
        let source = Arc::new(MemorySource::new());
        let catalog = Arc::new(MemoryCatalog::new());
        source.put(
            "a.csv",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            "id\n1\n",
        );
        let orchestrator = orchestrator(&source, &catalog, CancellationToken::new());

        let pending = orchestrator.detect_only().await.unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(catalog.append_calls(), 0);
    }
}
