use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Histogram bucket boundaries for body sizes (bytes).
const SIZE_BUCKETS: &[f64] = &[
    100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0, 500000.0, 1000000.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_size_bytes".to_string()),
                SIZE_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "proxy_requests_total",
            Unit::Count,
            "Flows handled, labelled by source classification"
        );
        describe_counter!(
            "proxy_http_errors_total",
            Unit::Count,
            "Error responses returned to clients"
        );
        describe_histogram!(
            "proxy_request_duration_seconds",
            Unit::Seconds,
            "Total flow duration from the client's perspective"
        );
        describe_histogram!(
            "proxy_upstream_duration_seconds",
            Unit::Seconds,
            "Time spent waiting on the upstream"
        );
        describe_histogram!(
            "proxy_response_size_bytes",
            Unit::Bytes,
            "Response body size forwarded to clients"
        );

        // rewrites
        describe_counter!(
            "proxy_rewrites_applied_total",
            Unit::Count,
            "Rule applications recorded on log entries"
        );

        // tls
        describe_counter!(
            "proxy_certificates_issued_total",
            Unit::Count,
            "Leaf certificates issued by the MITM authority"
        );

        // websocket
        describe_counter!(
            "proxy_ws_messages_total",
            Unit::Count,
            "WebSocket messages relayed, labelled by direction"
        );

        // connections
        describe_gauge!(
            "proxy_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "proxy_connections_total",
            Unit::Count,
            "Connections accepted"
        );

        // log store
        describe_gauge!(
            "proxy_log_entries",
            Unit::Count,
            "Entries currently held in the log ring"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
