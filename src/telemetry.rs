use std::sync::OnceLock;

use metrics::{Unit, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub(crate) const TELEMETRY_COUNTER_AUTHENTICATIONS_TOTAL: &str = "portcullis_authentications_total";
pub(crate) const TELEMETRY_COUNTER_TUNNEL_UPGRADES_TOTAL: &str = "portcullis_tunnel_upgrades_total";
pub(crate) const TELEMETRY_COUNTER_FALLBACK_REQUESTS_TOTAL: &str =
    "portcullis_fallback_requests_total";
pub(crate) const TELEMETRY_COUNTER_TUNNELS_TOTAL: &str = "portcullis_tunnels_total";

pub(crate) const TELEMETRY_KEY_OUTCOME: &str = "outcome";
pub(crate) const TELEMETRY_KEY_KIND: &str = "kind";

pub(crate) const TELEMETRY_OUTCOME_OPEN: &str = "open";
pub(crate) const TELEMETRY_OUTCOME_GRANTED: &str = "granted";
pub(crate) const TELEMETRY_OUTCOME_DENIED: &str = "denied";

// The global recorder can only be installed once per process.
static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

// Handle for rendering metrics, installing the recorder on first use.
pub(crate) fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get_or_init(install_prometheus).clone()
}

// Install a Prometheus recorder as the global recorder, returning a handle for rendering.
fn install_prometheus() -> Option<PrometheusHandle> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    match metrics::set_global_recorder(recorder) {
        Ok(_) => {
            describe_counter!(
                TELEMETRY_COUNTER_AUTHENTICATIONS_TOTAL,
                Unit::Count,
                "Password authentication attempts, by outcome."
            );
            describe_counter!(
                TELEMETRY_COUNTER_TUNNEL_UPGRADES_TOTAL,
                Unit::Count,
                "Connections upgraded to the tunnel protocol."
            );
            describe_counter!(
                TELEMETRY_COUNTER_FALLBACK_REQUESTS_TOTAL,
                Unit::Count,
                "Plain HTTP requests handled by the fallback, by outcome."
            );
            describe_counter!(
                TELEMETRY_COUNTER_TUNNELS_TOTAL,
                Unit::Count,
                "Tunnels handed to the multiplexer, by kind."
            );
            Some(handle)
        }
        Err(error) => {
            #[cfg(not(coverage_nightly))]
            tracing::error!(%error, "Failed to install telemetry.");
            None
        }
    }
}
