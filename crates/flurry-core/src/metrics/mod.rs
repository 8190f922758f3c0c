//! Metrics plumbing.
//!
//! - `events`: the `InternalEvent` trait and the storage request event
//! - `server`: optional Prometheus exporter

pub mod events;
pub mod server;

pub use server::init_global;

/// Emit a metric event.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding counter, gauge or histogram.
///
/// ```ignore
/// use flurry_core::emit;
/// use flurry_core::metrics::events::{RequestStatus, StorageOperation, StorageRequestCompleted};
///
/// emit!(StorageRequestCompleted {
///     operation: StorageOperation::Get,
///     status: RequestStatus::Success,
///     duration: Duration::from_millis(12),
/// });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use crate::emit;
