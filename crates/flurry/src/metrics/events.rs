//! Internal events for ingestion metrics.
//!
//! Every event carries a `target` label naming the destination table.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tracing::trace;

use flurry_core::metrics::events::InternalEvent;

// ============================================================================
// Detection events
// ============================================================================

/// Event emitted when change detection selects objects for ingestion.
pub struct ObjectsDiscovered {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for ObjectsDiscovered {
    fn emit(self) {
        trace!(target = %self.target, count = self.count, "Objects discovered");
        counter!("flurry_objects_discovered_total", "target" => self.target.clone())
            .increment(self.count as u64);
        gauge!("flurry_objects_pending", "target" => self.target).set(self.count as f64);
    }
}

// ============================================================================
// Object events
// ============================================================================

/// Final state of one object in a run.
#[derive(Debug, Clone, Copy)]
pub enum ObjectStatus {
    Committed,
    Failed,
    Skipped,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Committed => "committed",
            ObjectStatus::Failed => "failed",
            ObjectStatus::Skipped => "skipped",
        }
    }
}

/// Event emitted when an object reaches its final state in a run.
pub struct ObjectProcessed {
    pub status: ObjectStatus,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for ObjectProcessed {
    fn emit(self) {
        trace!(
            target = %self.target,
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Object processed"
        );
        counter!(
            "flurry_objects_total",
            "target" => self.target.clone(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!("flurry_object_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Row events
// ============================================================================

/// Event emitted when rows are appended to the destination.
pub struct RowsWritten {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RowsWritten {
    fn emit(self) {
        trace!(target = %self.target, count = self.count, "Rows written");
        counter!("flurry_rows_written_total", "target" => self.target).increment(self.count);
    }
}

/// Event emitted when replayed rows are dropped as already committed.
pub struct RowsDeduplicated {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RowsDeduplicated {
    fn emit(self) {
        trace!(target = %self.target, count = self.count, "Rows deduplicated");
        counter!("flurry_rows_deduplicated_total", "target" => self.target).increment(self.count);
    }
}

/// Event emitted when a malformed row is skipped.
pub struct RowsSkipped {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RowsSkipped {
    fn emit(self) {
        trace!(target = %self.target, count = self.count, "Rows skipped");
        counter!("flurry_rows_skipped_total", "target" => self.target).increment(self.count);
    }
}

// ============================================================================
// Commit events
// ============================================================================

/// Event emitted when a batch append completes.
pub struct BatchAppended {
    pub rows: usize,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for BatchAppended {
    fn emit(self) {
        trace!(
            target = %self.target,
            rows = self.rows,
            duration_ms = self.duration.as_millis(),
            "Batch appended"
        );
        counter!("flurry_batches_appended_total", "target" => self.target.clone()).increment(1);
        histogram!("flurry_batch_append_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a Delta Lake commit completes.
pub struct DeltaCommitCompleted {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for DeltaCommitCompleted {
    fn emit(self) {
        trace!(
            target = %self.target,
            duration_ms = self.duration.as_millis(),
            "Delta commit completed"
        );
        histogram!("flurry_delta_commit_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted before an operation is retried.
pub struct RetryAttempted {
    pub operation: &'static str,
    /// `transient` or `auth_expired`.
    pub reason: &'static str,
    pub target: String,
}

impl InternalEvent for RetryAttempted {
    fn emit(self) {
        trace!(
            target = %self.target,
            operation = self.operation,
            reason = self.reason,
            "Retry attempted"
        );
        counter!(
            "flurry_retries_total",
            "target" => self.target,
            "operation" => self.operation,
            "reason" => self.reason
        )
        .increment(1);
    }
}

/// Event emitted when a catalog token is obtained.
pub struct TokenRefreshed {
    pub target: String,
}

impl InternalEvent for TokenRefreshed {
    fn emit(self) {
        trace!(target = %self.target, "Token refreshed");
        counter!("flurry_token_refreshes_total", "target" => self.target).increment(1);
    }
}

/// Event emitted when the destination schema gains columns.
pub struct SchemaWidened {
    pub columns: usize,
    pub target: String,
}

impl InternalEvent for SchemaWidened {
    fn emit(self) {
        trace!(target = %self.target, columns = self.columns, "Schema widened");
        counter!("flurry_schema_widenings_total", "target" => self.target.clone()).increment(1);
        counter!("flurry_schema_columns_added_total", "target" => self.target)
            .increment(self.columns as u64);
    }
}

// ============================================================================
// Run events
// ============================================================================

/// Event emitted when a run finishes.
pub struct RunCompleted {
    /// `success`, `partial_failure` or `error`.
    pub status: &'static str,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for RunCompleted {
    fn emit(self) {
        trace!(
            target = %self.target,
            status = self.status,
            duration_ms = self.duration.as_millis(),
            "Run completed"
        );
        counter!(
            "flurry_runs_total",
            "target" => self.target.clone(),
            "status" => self.status
        )
        .increment(1);
        histogram!("flurry_run_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}
