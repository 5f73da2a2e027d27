//! Prometheus metrics infrastructure

use std::net::SocketAddr;

use metrics::{describe_counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use super::config::MetricsConfig;

/// Install the Prometheus recorder and its scrape listener.
///
/// Returns the bound address, or `None` when metrics are disabled or the
/// exporter could not be installed (the engine runs without metrics then).
pub fn init_metrics(config: &MetricsConfig) -> Option<SocketAddr> {
    if !config.enabled {
        tracing::info!("Prometheus metrics disabled");
        return None;
    }

    let addr: SocketAddr = match config.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(listen = %config.listen, error = %e, "Invalid metrics listen address");
            return None;
        }
    };

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            register_default_metrics();
            tracing::info!("Prometheus metrics listening on {}", addr);
            Some(addr)
        }
        Err(e) => {
            tracing::error!("Failed to initialize Prometheus metrics: {}", e);
            None
        }
    }
}

fn register_default_metrics() {
    gauge!("flow_engine_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    describe_counter!("flow_instances_started_total", "Process instances started");
    describe_counter!("flow_instances_completed_total", "Process instances that reached END");
    describe_counter!("flow_activations_total", "Node activations by node type");
    describe_counter!("flow_script_fallbacks_total", "SCRIPT nodes that fell back to their default decision");
    describe_counter!("flow_revokes_total", "Accepted revokes");
    describe_counter!("flow_messages_total", "Handled bus messages by kind and outcome");
    describe_counter!("flow_redeliveries_total", "Messages scheduled for redelivery");
    describe_counter!("flow_dead_letters_total", "Messages dead-lettered after exhausting redeliveries");
    describe_counter!("flow_stale_locks_total", "Instance locks force-released by the sweeper");
}
