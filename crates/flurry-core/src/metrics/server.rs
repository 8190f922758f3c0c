//! Prometheus exporter initialization.

use metrics_exporter_prometheus::PrometheusBuilder;
use snafu::prelude::*;
use std::net::SocketAddr;
use tracing::info;

use crate::error::{AddressParseSnafu, MetricsError, PrometheusInitSnafu};

/// Histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

/// Install the global recorder and serve `/metrics` on `address`.
///
/// Must be called from within a Tokio runtime. Without a call to this
/// function every emitted event is a no-op.
pub fn init_global(address: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = address.parse().context(AddressParseSnafu { address })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install()
        .context(PrometheusInitSnafu)?;

    info!(%addr, "Metrics exporter started");
    Ok(())
}
