use super::AppState;
use crate::error::{Error, Result};
use crate::experiments::{Experiment, ExperimentStatus, NewExperiment, Validation};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub traffic_pct: f64,
    pub default_policy: String,
    pub policies: Vec<String>,
    pub notes: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateExperimentRequest>,
) -> Result<(StatusCode, Json<Experiment>)> {
    let experiment = state
        .experiments
        .create(NewExperiment {
            name: req.name,
            start_at: req.start_at,
            end_at: req.end_at,
            traffic_pct: req.traffic_pct,
            default_policy: req.default_policy,
            policies: req.policies,
            notes: req.notes,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(experiment)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Experiment>>> {
    let status = match q.status.as_deref() {
        Some("active") => Some(ExperimentStatus::Active),
        Some("scheduled") => Some(ExperimentStatus::Scheduled),
        Some("ended") => Some(ExperimentStatus::Ended),
        Some(other) => return Err(Error::InvalidArgument(format!("unknown status: {other}"))),
        None => None,
    };
    Ok(Json(state.experiments.list(status).await?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>> {
    Ok(Json(state.experiments.get(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateExperimentRequest {
    pub name: Option<String>,
    pub end_at: Option<DateTime<Utc>>,
    pub traffic_pct: Option<f64>,
    pub notes: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateExperimentRequest>,
) -> Result<Json<Experiment>> {
    Ok(Json(
        state
            .experiments
            .update(&id, req.name, req.end_at, req.traffic_pct, req.notes)
            .await?,
    ))
}

pub async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>> {
    Ok(Json(state.experiments.end(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct AssignResponse {
    pub policy: String,
    pub bucket: i32,
}

pub async fn assign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<AssignResponse>> {
    let (policy, bucket) = state.experiments.assign(&id, req.user_id).await?;
    Ok(Json(AssignResponse { policy, bucket }))
}

#[derive(Debug, Deserialize)]
pub struct AssignmentsQuery {
    pub policy: Option<String>,
}

pub async fn assignments(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<AssignmentsQuery>,
) -> Result<Json<HashMap<String, i64>>> {
    match q.policy {
        Some(p) => {
            let count = state.experiments.assignment_count(&id, Some(&p)).await?;
            let mut map = HashMap::new();
            map.insert(p, count);
            Ok(Json(map))
        }
        None => Ok(Json(state.experiments.assignment_counts_by_policy(&id).await?)),
    }
}

pub async fn validate(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Validation>> {
    Ok(Json(state.experiments.validate(&id).await?))
}
