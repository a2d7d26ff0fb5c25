use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

pub const STREAM_SUBSCRIBERS: &str = "bingo_stream_subscribers";
pub const CLAIMS_TOTAL: &str = "bingo_claims_total";
pub const STORE_CONFLICTS_TOTAL: &str = "bingo_store_conflicts_total";

/// Installs the global recorder. Only the binary calls this; tests run without one.
pub fn install() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "failed to install prometheus recorder");
            None
        }
    }
}

pub fn stream_subscribed() {
    ::metrics::increment_gauge!(STREAM_SUBSCRIBERS, 1.0);
}

pub fn stream_unsubscribed() {
    ::metrics::decrement_gauge!(STREAM_SUBSCRIBERS, 1.0);
}

pub fn claim_outcome(accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    ::metrics::increment_counter!(CLAIMS_TOTAL, "outcome" => outcome);
}

pub fn store_conflict() {
    ::metrics::increment_counter!(STORE_CONFLICTS_TOTAL);
}
