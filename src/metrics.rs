use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Initialize the Prometheus recorder and register series descriptions.
    pub fn init() -> Self {
        // Default buckets to avoid API differences across crate versions.
        let builder = PrometheusBuilder::new();

        let handle = builder
            .install_recorder()
            .expect("prometheus: install recorder");

        describe_pipeline_metrics();

        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time metrics registration (so series show up on /metrics).
pub fn describe_pipeline_metrics() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "submissions_accepted_total",
            "Conversations accepted into the queue."
        );
        describe_counter!(
            "submissions_rate_limited_total",
            "Submissions refused by the inbound gate."
        );
        describe_counter!(
            "submissions_invalid_total",
            "Submissions rejected as empty/invalid."
        );
        describe_counter!("batch_cycles_total", "Batch worker cycles started.");
        describe_counter!(
            "batch_claimed_total",
            "Conversations claimed for processing."
        );
        describe_counter!(
            "batch_completed_total",
            "Conversations committed as completed."
        );
        describe_counter!("batch_failed_total", "Conversations committed as failed.");
        describe_counter!(
            "batch_cycle_errors_total",
            "Cycle-level failures (claim/mark/commit)."
        );
        describe_counter!("analyzer_retries_total", "Analysis attempts retried.");
        describe_counter!(
            "analyzer_rate_limit_waits_total",
            "External rate-limit signals honored."
        );
        describe_counter!(
            "analyzer_parse_fallbacks_total",
            "Analyses degraded to the neutral fallback."
        );
        describe_histogram!("analyzer_call_ms", "External analysis call time in ms.");
        describe_gauge!(
            "pipeline_last_cycle_ts",
            "Unix ts when a batch last committed."
        );
    });
}
