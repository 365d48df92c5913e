//! Prometheus metrics wiring built on the `metrics`/`metrics-exporter-prometheus` crates.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install prometheus recorder: {e}"))?;

    metrics::describe_counter!("banditserve_requests_total", "HTTP requests by route and status");
    metrics::describe_histogram!("banditserve_request_duration_ms", "Request latency in milliseconds");
    metrics::describe_gauge!("banditserve_active_experiments", "Count of currently active experiments");
    metrics::describe_counter!("banditserve_guardrail_rollbacks_total", "Guardrail-triggered rollbacks");
    metrics::describe_counter!("banditserve_decisions_total", "Decisions recorded, by type");

    Ok(handle)
}

pub fn record_request(route: &str, status: u16, duration_ms: f64) {
    metrics::counter!("banditserve_requests_total", "route" => route.to_string(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!("banditserve_request_duration_ms", "route" => route.to_string()).record(duration_ms);
}

pub fn record_decision(decision: &str) {
    metrics::counter!("banditserve_decisions_total", "decision" => decision.to_string()).increment(1);
}

pub fn record_rollback() {
    metrics::counter!("banditserve_guardrail_rollbacks_total").increment(1);
}

pub fn record_active_experiments(count: u64) {
    metrics::gauge!("banditserve_active_experiments").set(count as f64);
}
