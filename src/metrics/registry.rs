use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
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
                metrics_exporter_prometheus::Matcher::Full("gateway_ttft_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total requests processed, by capability/status/upstream"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from the client's perspective"
        );
        describe_histogram!(
            "gateway_upstream_request_duration_seconds",
            Unit::Seconds,
            "Time spent waiting on upstream attempts"
        );
        describe_histogram!(
            "gateway_ttft_seconds",
            Unit::Seconds,
            "Time to first response byte for streamed requests"
        );
        describe_gauge!(
            "gateway_http_requests_in_flight",
            Unit::Count,
            "Requests currently being processed"
        );
        describe_counter!(
            "gateway_auth_failures_total",
            Unit::Count,
            "Requests rejected at credential verification"
        );
        describe_counter!(
            "gateway_client_disconnects_total",
            Unit::Count,
            "Requests aborted by the client"
        );
        describe_counter!(
            "gateway_stream_errors_total",
            Unit::Count,
            "Streams that broke after the first flushed byte"
        );

        // routing
        describe_counter!(
            "gateway_failover_attempts_total",
            Unit::Count,
            "Failed attempts that triggered failover, by reason"
        );
        describe_counter!(
            "gateway_upstream_pin_total",
            Unit::Count,
            "Requests routed via the X-Upstream-Name pin header"
        );

        // affinity
        describe_counter!(
            "gateway_affinity_hits_total",
            Unit::Count,
            "Selections that followed a live session affinity"
        );
        describe_counter!(
            "gateway_affinity_migrations_total",
            Unit::Count,
            "Affinity hits migrated to a preferred tier"
        );
        describe_counter!(
            "gateway_affinity_evictions_total",
            Unit::Count,
            "Affinity entries evicted by capacity pressure"
        );
        describe_gauge!(
            "gateway_affinity_entries",
            Unit::Count,
            "Live affinity entries"
        );

        // usage & billing
        describe_counter!(
            "gateway_usage_tokens_total",
            Unit::Count,
            "Tokens metered from upstream responses, by direction"
        );

        // control plane & sinks
        describe_counter!(
            "gateway_control_reloads_total",
            Unit::Count,
            "Control-plane snapshot reloads"
        );
        describe_counter!(
            "gateway_request_log_dropped_total",
            Unit::Count,
            "Request log records dropped by the bounded sink"
        );

        // connections
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
