//! `/select`: assigns the user to a policy (C4), asks that policy for an arm (C3),
//! and appends the serve as a recommendation event (C1) — one call per recommendation
//! request.

use super::AppState;
use crate::context::Context;
use crate::events::NewEvent;
use crate::error::Result;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub experiment_id: String,
    pub user_id: i64,
    pub movie_id: Option<i64>,
    pub arms: Vec<String>,
    #[serde(default)]
    pub context: Context,
    pub position: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct SelectResponse {
    pub event_id: i64,
    pub policy: String,
    pub arm_id: String,
    pub p_score: Option<f64>,
    pub confidence: f64,
}

pub async fn select(
    State(state): State<AppState>,
    Json(req): Json<SelectRequest>,
) -> Result<Json<SelectResponse>> {
    let start = Instant::now();
    let (policy_name, _bucket) = state.experiments.assign(&req.experiment_id, req.user_id).await?;

    let ctx_key = req.context.hash_key();
    let policy_impl = crate::policy::build(&policy_name, state.policy_store.clone(), &state.config)?;
    let selection = policy_impl.select(&ctx_key, &req.arms).await?;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    let event_id = state
        .events
        .append(NewEvent {
            user_id: req.user_id,
            movie_id: req.movie_id,
            algorithm: policy_name.clone(),
            position: req.position,
            score: Some(selection.confidence),
            context: Some(req.context),
            experiment_id: Some(req.experiment_id),
            policy: Some(policy_name.clone()),
            arm_id: Some(selection.arm_id.clone()),
            p_score: selection.p_score,
            latency_ms: Some(latency_ms),
            served_at: Utc::now(),
        })
        .await?;

    Ok(Json(SelectResponse {
        event_id,
        policy: policy_name,
        arm_id: selection.arm_id,
        p_score: selection.p_score,
        confidence: selection.confidence,
    }))
}
