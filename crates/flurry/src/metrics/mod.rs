//! Metrics for ingestion runs.
//!
//! Events implement [`flurry_core::metrics::events::InternalEvent`] and are
//! recorded with [`flurry_core::emit!`].

pub mod events;
