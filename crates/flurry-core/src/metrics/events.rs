//! The `InternalEvent` trait and the storage request event.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// A measurable occurrence that records its own metrics when emitted.
pub trait InternalEvent {
    fn emit(self);
}

/// Object store call being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    List,
    Get,
    Put,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::List => "list",
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
        }
    }
}

/// How an object store call ended.
///
/// Missing objects are expected (an empty manifest, a table not created
/// yet) and are counted apart from real failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    NotFound,
    Error,
}

impl RequestStatus {
    pub fn from_result<T>(result: &Result<T, object_store::Error>) -> Self {
        match result {
            Ok(_) => RequestStatus::Success,
            Err(object_store::Error::NotFound { .. }) => RequestStatus::NotFound,
            Err(_) => RequestStatus::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::NotFound => "not_found",
            RequestStatus::Error => "error",
        }
    }
}

/// An object store call completed.
pub struct StorageRequestCompleted {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestCompleted {
    fn emit(self) {
        let operation = self.operation.as_str();
        let status = self.status.as_str();
        trace!(
            operation,
            status,
            duration_ms = self.duration.as_millis(),
            "Storage request completed"
        );
        counter!(
            "flurry_storage_requests_total",
            "operation" => operation,
            "status" => status
        )
        .increment(1);
        histogram!(
            "flurry_storage_request_duration_seconds",
            "operation" => operation
        )
        .record(self.duration.as_secs_f64());
    }
}
