//! Shared fixtures for ingestion tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use flurry::source::ModificationMarker;
use flurry::{
    CommitCoordinator, CommitSettings, Credentials, DeltaDetector, KeyFilter, MemoryCatalog,
    MemoryManifestStore, MemorySource, ReaderConfig, RetryPolicy, RunOrchestrator,
    SchemaEvolutionMode,
};

pub const TABLE: &str = "trips";

/// Knobs for building an orchestrator over in-memory components.
#[derive(Debug, Clone)]
pub struct Options {
    pub chunk_size: usize,
    pub retry_ceiling: u32,
    pub max_parallel: usize,
    pub strict_parsing: bool,
    pub schema_evolution: SchemaEvolutionMode,
    pub request_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            retry_ceiling: 3,
            max_parallel: 2,
            strict_parsing: true,
            schema_evolution: SchemaEvolutionMode::Merge,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// In-memory source, catalog and manifest plus an orchestrator over them.
pub struct Harness {
    pub source: Arc<MemorySource>,
    pub catalog: Arc<MemoryCatalog>,
    pub manifest: Arc<MemoryManifestStore>,
    pub orchestrator: Arc<RunOrchestrator>,
    options: Options,
}

impl Harness {
    pub fn new(options: Options) -> Self {
        Self::with_catalog(MemoryCatalog::new(), options)
    }

    pub fn with_catalog(catalog: MemoryCatalog, options: Options) -> Self {
        let source = Arc::new(MemorySource::new());
        let catalog = Arc::new(catalog);
        let manifest = Arc::new(MemoryManifestStore::new());
        let orchestrator = build(&source, &catalog, &manifest, &options);
        Self {
            source,
            catalog,
            manifest,
            orchestrator,
            options,
        }
    }

    /// Replace the orchestrator as if the process restarted; source,
    /// catalog and manifest keep their state.
    pub fn restart(&mut self, options: Options) {
        self.orchestrator = build(&self.source, &self.catalog, &self.manifest, &options);
        self.options = options;
    }

    pub fn put(&self, key: &str, marker: ModificationMarker, content: &str) {
        self.source.put(key, marker, content.to_string());
    }

    pub fn rows(&self) -> usize {
        self.catalog.row_count(TABLE)
    }
}

fn build(
    source: &Arc<MemorySource>,
    catalog: &Arc<MemoryCatalog>,
    manifest: &Arc<MemoryManifestStore>,
    options: &Options,
) -> Arc<RunOrchestrator> {
    let retry = RetryPolicy {
        max_attempts: options.retry_ceiling,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        request_timeout: options.request_timeout,
    };
    let detector = DeltaDetector::new(
        source.clone(),
        manifest.clone(),
        KeyFilter::new("**/*.csv").unwrap(),
        TABLE,
    )
    .with_retry(retry.clone());
    let settings = CommitSettings {
        table: TABLE.to_string(),
        reader: ReaderConfig {
            chunk_size: options.chunk_size,
            strict_parsing: options.strict_parsing,
            target: TABLE.to_string(),
            ..Default::default()
        },
        retry,
        schema_evolution: options.schema_evolution,
    };
    let coordinator = CommitCoordinator::new(
        source.clone(),
        catalog.clone(),
        manifest.clone(),
        settings,
        Credentials::None,
    );
    Arc::new(RunOrchestrator::new(
        detector,
        Arc::new(coordinator),
        options.max_parallel,
        CancellationToken::new(),
    ))
}

/// Marker at the given hour of 2024-01-01.
pub fn marker(hour: u32) -> ModificationMarker {
    ModificationMarker(Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap())
}

/// CSV trip data with `rows` rows, ids starting at `first_id`.
pub fn trips_csv(first_id: u64, rows: u64) -> String {
    let mut csv = String::from("trip_id,passenger_count,fare_amount,pickup_at\n");
    for id in first_id..first_id + rows {
        csv.push_str(&format!(
            "{id},{},{}.50,2024-01-01T{:02}:15:00Z\n",
            id % 4 + 1,
            id % 40 + 5,
            id % 24
        ));
    }
    csv
}
