//! HTTP surface. Axum router + handlers, using `Query`/`Json` extractors, shared
//! `AppState`, and a `Result<Json<T>, Error>` return convention throughout.

mod analytics;
mod experiments;
mod select;
mod tracking;

use crate::analytics::AnalyticsQueryLayer;
use crate::config::Config;
use crate::decisions::DecisionEngine;
use crate::events::EventLog;
use crate::experiments::ExperimentManager;
use crate::guardrails::GuardrailsEngine;
use crate::policy_state::PolicyStateStore;
use crate::rewards::RewardCalculator;
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub events: EventLog,
    pub policy_store: PolicyStateStore,
    pub experiments: ExperimentManager,
    pub reward_calculator: RewardCalculator,
    pub guardrails: GuardrailsEngine,
    pub decisions: DecisionEngine,
    pub analytics: AnalyticsQueryLayer,
    pub config: Arc<Config>,
    pub prometheus: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/experiments", post(experiments::create).get(experiments::list))
        .route(
            "/experiments/:id",
            get(experiments::get).patch(experiments::update),
        )
        .route("/experiments/:id/stop", post(experiments::stop))
        .route("/experiments/:id/assign", post(experiments::assign))
        .route("/experiments/:id/assignments", get(experiments::assignments))
        .route("/experiments/:id/validate", get(experiments::validate))
        .route("/experiments/:id/summary", get(analytics::summary))
        .route("/experiments/:id/timeseries", get(analytics::timeseries))
        .route("/experiments/:id/arms", get(analytics::arms))
        .route("/experiments/:id/cohorts", get(analytics::cohorts))
        .route("/experiments/:id/events", get(analytics::events))
        .route("/experiments/:id/export", get(analytics::export))
        .route("/experiments/:id/guardrails", get(analytics::guardrails))
        .route("/experiments/:id/decisions", get(analytics::decisions))
        .route("/select", post(select::select))
        .route("/track/click", post(tracking::click))
        .route("/track/rating", post(tracking::rating))
        .route("/track/thumbs-up", post(tracking::thumbs_up))
        .route("/track/thumbs-down", post(tracking::thumbs_down))
        .route("/track/favorite", post(tracking::favorite))
        .route("/track/watchlist", post(tracking::watchlist))
        .layer(axum::middleware::from_fn(crate::middleware::request_logging_simple))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(axum::extract::State(state): axum::extract::State<AppState>) -> String {
    state.prometheus.render()
}
