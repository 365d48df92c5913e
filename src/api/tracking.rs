//! `/track/*`: attaches a late-arriving interaction to the most recent serve for
//! `(user_id, movie_id)`. Reward computation itself happens asynchronously on the reward
//! worker's ticks, not inline here.

use super::AppState;
use crate::error::{Error, Result};
use crate::events::InteractionKind;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct TrackRequest {
    pub user_id: i64,
    pub movie_id: i64,
    pub rating_value: Option<f64>,
    pub watched_fraction: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct TrackResponse {
    pub event_id: i64,
}

async fn track(state: &AppState, req: TrackRequest, kind: InteractionKind) -> Result<TrackResponse> {
    let event = state
        .events
        .most_recent_for_item(req.user_id, req.movie_id)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "no recommendation event found for user {} / movie {}",
                req.user_id, req.movie_id
            ))
        })?;

    state
        .events
        .mark_interaction(event.id, kind, req.rating_value, req.watched_fraction, Utc::now())
        .await?;

    Ok(TrackResponse { event_id: event.id })
}

pub async fn click(State(state): State<AppState>, Json(req): Json<TrackRequest>) -> Result<Json<TrackResponse>> {
    Ok(Json(track(&state, req, InteractionKind::Click).await?))
}

pub async fn rating(State(state): State<AppState>, Json(req): Json<TrackRequest>) -> Result<Json<TrackResponse>> {
    if req.rating_value.is_none() {
        return Err(Error::InvalidArgument("rating_value is required".to_string()));
    }
    Ok(Json(track(&state, req, InteractionKind::Rating).await?))
}

pub async fn thumbs_up(State(state): State<AppState>, Json(req): Json<TrackRequest>) -> Result<Json<TrackResponse>> {
    Ok(Json(track(&state, req, InteractionKind::ThumbsUp).await?))
}

pub async fn thumbs_down(
    State(state): State<AppState>,
    Json(req): Json<TrackRequest>,
) -> Result<Json<TrackResponse>> {
    Ok(Json(track(&state, req, InteractionKind::ThumbsDown).await?))
}

pub async fn favorite(State(state): State<AppState>, Json(req): Json<TrackRequest>) -> Result<Json<TrackResponse>> {
    Ok(Json(track(&state, req, InteractionKind::Favorite).await?))
}

pub async fn watchlist(
    State(state): State<AppState>,
    Json(req): Json<TrackRequest>,
) -> Result<Json<TrackResponse>> {
    Ok(Json(track(&state, req, InteractionKind::Watchlist).await?))
}
