//! Prometheus metrics for the gateway.
//!
//! Counters are recorded through the `metrics` facade everywhere in the
//! crate; without an installed recorder they are no-ops, which is what tests
//! rely on.
//!
//! | name | labels |
//! |------|--------|
//! | `gateway_events_received_total` | |
//! | `gateway_events_filtered_total` | `reason` = severity, age, type |
//! | `gateway_events_malformed_total` | |
//! | `gateway_events_dispatched_total` | |
//! | `gateway_events_dropped_total` | `reason` = no_provider, error |
//! | `gateway_sink_failures_total` | `sink` |
//! | `gateway_stream_restarts_total` | |

use metrics::describe_counter;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Install the Prometheus recorder with its HTTP listener on `addr`.
///
/// Must be called from within the Tokio runtime.
pub fn install(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    log::info!("Metrics listening on http://{addr}/metrics");
    Ok(())
}

fn describe() {
    describe_counter!(
        "gateway_events_received_total",
        "Non-blank lines read from data feeds"
    );
    describe_counter!(
        "gateway_events_filtered_total",
        "Events dropped at ingest by the local relevance filters"
    );
    describe_counter!(
        "gateway_events_malformed_total",
        "Feed lines that could not be parsed as events"
    );
    describe_counter!(
        "gateway_events_dispatched_total",
        "Events routed through the sink registry"
    );
    describe_counter!(
        "gateway_events_dropped_total",
        "Dequeued events that were not routed"
    );
    describe_counter!(
        "gateway_sink_failures_total",
        "Sink invocations that returned an error or panicked"
    );
    describe_counter!(
        "gateway_stream_restarts_total",
        "Stream generations torn down and rediscovered"
    );
}
