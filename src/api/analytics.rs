use super::AppState;
use crate::analytics::{CohortBreakdown, Granularity, Metric, Summary, TimeseriesPoint};
use crate::decisions::DecisionResult;
use crate::error::{Error, Result};
use crate::events::RecommendationEvent;
use crate::guardrails::GuardrailSummary;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

pub async fn summary(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Summary>> {
    Ok(Json(state.analytics.summary(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesQuery {
    pub metric: String,
    #[serde(default = "default_granularity")]
    pub granularity: String,
    pub policy: Option<String>,
}

fn default_granularity() -> String {
    "hour".to_string()
}

pub async fn timeseries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TimeseriesQuery>,
) -> Result<Json<Vec<TimeseriesPoint>>> {
    let metric = parse_metric(&q.metric)?;
    let granularity = match q.granularity.as_str() {
        "hour" => Granularity::Hour,
        "day" => Granularity::Day,
        other => return Err(Error::InvalidArgument(format!("unknown granularity: {other}"))),
    };
    Ok(Json(
        state
            .analytics
            .timeseries(&id, metric, granularity, q.policy.as_deref())
            .await?,
    ))
}

fn parse_metric(raw: &str) -> Result<Metric> {
    match raw {
        "reward" => Ok(Metric::Reward),
        "ctr" => Ok(Metric::Ctr),
        "latency_p95" => Ok(Metric::LatencyP95),
        "serves" => Ok(Metric::Serves),
        other => Err(Error::InvalidArgument(format!("unknown metric: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct PolicyQuery {
    pub policy: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub policy: Option<String>,
    #[serde(default = "default_export_format")]
    pub format: String,
}

fn default_export_format() -> String {
    "csv".to_string()
}

pub async fn arms(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<PolicyQuery>,
) -> Result<Json<Vec<crate::analytics::ArmStats>>> {
    Ok(Json(state.analytics.arms(&id, q.policy.as_deref()).await?))
}

#[derive(Debug, Deserialize)]
pub struct CohortsQuery {
    #[serde(default = "default_cohort_breakdown")]
    pub breakdown: String,
}

fn default_cohort_breakdown() -> String {
    "user_type".to_string()
}

pub async fn cohorts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<CohortsQuery>,
) -> Result<Json<std::collections::HashMap<String, std::collections::HashMap<String, f64>>>> {
    let breakdown = match q.breakdown.as_str() {
        "user_type" => CohortBreakdown::UserType,
        "time_period" => CohortBreakdown::TimePeriod,
        other => return Err(Error::InvalidArgument(format!("unknown breakdown: {other}"))),
    };
    Ok(Json(state.analytics.cohorts(&id, breakdown).await?))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub policy: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Vec<RecommendationEvent>>> {
    Ok(Json(
        state
            .analytics
            .events(&id, q.policy.as_deref(), q.limit, q.offset)
            .await?,
    ))
}

pub async fn export(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ExportQuery>,
) -> Result<axum::response::Response> {
    match q.format.as_str() {
        "json" => {
            let events = state.analytics.export_all(&id, q.policy.as_deref()).await?;
            Ok(Json(events).into_response())
        }
        "csv" => {
            let mut buf = Vec::new();
            state.analytics.export_csv(&id, q.policy.as_deref(), &mut buf).await?;
            Ok(([(header::CONTENT_TYPE, "text/csv")], buf).into_response())
        }
        other => Err(Error::InvalidArgument(format!("unknown export format: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct GuardrailsQuery {
    #[serde(default)]
    pub error_rate: f64,
}

pub async fn guardrails(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<GuardrailsQuery>,
) -> Result<Json<GuardrailSummary>> {
    Ok(Json(state.guardrails.check(&id, q.error_rate).await?))
}

#[derive(Debug, Deserialize)]
pub struct DecisionsQuery {
    #[serde(default = "default_decisions_limit")]
    pub limit: i64,
}

fn default_decisions_limit() -> i64 {
    50
}

pub async fn decisions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<DecisionsQuery>,
) -> Result<Json<Vec<DecisionResult>>> {
    Ok(Json(state.decisions.history(&id, q.limit).await?))
}
