//! C1: Event Log. Append-only record of arm selections and observed rewards, with the query
//! shapes a reward pipeline needs: pending events, per-user interaction windows.

use crate::context::Context;
use crate::db::Db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Click,
    Rating,
    ThumbsUp,
    ThumbsDown,
    Favorite,
    Watchlist,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub user_id: i64,
    pub movie_id: Option<i64>,
    pub algorithm: String,
    pub position: Option<i32>,
    pub score: Option<f64>,
    pub context: Option<Context>,
    pub experiment_id: Option<String>,
    pub policy: Option<String>,
    pub arm_id: Option<String>,
    pub p_score: Option<f64>,
    pub latency_ms: Option<f64>,
    pub served_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationEvent {
    pub id: i64,
    pub user_id: i64,
    pub movie_id: Option<i64>,
    pub algorithm: String,
    pub position: Option<i32>,
    pub score: Option<f64>,
    pub clicked: bool,
    pub clicked_at: Option<DateTime<Utc>>,
    pub rated: bool,
    pub rated_at: Option<DateTime<Utc>>,
    pub rating_value: Option<f64>,
    pub thumbs_up: bool,
    pub thumbs_up_at: Option<DateTime<Utc>>,
    pub thumbs_down: bool,
    pub thumbs_down_at: Option<DateTime<Utc>>,
    pub added_to_watchlist: bool,
    pub added_to_watchlist_at: Option<DateTime<Utc>>,
    pub added_to_favorites: bool,
    pub added_to_favorites_at: Option<DateTime<Utc>>,
    pub watched_fraction: Option<f64>,
    pub experiment_id: Option<String>,
    pub policy: Option<String>,
    pub arm_id: Option<String>,
    pub p_score: Option<f64>,
    pub latency_ms: Option<f64>,
    pub reward: Option<f64>,
    pub served_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub context: Option<Context>,
}

fn row_to_event(row: &Row) -> rusqlite::Result<RecommendationEvent> {
    let context_json: Option<String> = row.get("context_json")?;
    let context = context_json.and_then(|s| serde_json::from_str(&s).ok());
    Ok(RecommendationEvent {
        context,
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        movie_id: row.get("movie_id")?,
        algorithm: row.get("algorithm")?,
        position: row.get("position")?,
        score: row.get("score")?,
        clicked: row.get::<_, i64>("clicked")? != 0,
        clicked_at: parse_opt_dt(row, "clicked_at")?,
        rated: row.get::<_, i64>("rated")? != 0,
        rated_at: parse_opt_dt(row, "rated_at")?,
        rating_value: row.get("rating_value")?,
        thumbs_up: row.get::<_, i64>("thumbs_up")? != 0,
        thumbs_up_at: parse_opt_dt(row, "thumbs_up_at")?,
        thumbs_down: row.get::<_, i64>("thumbs_down")? != 0,
        thumbs_down_at: parse_opt_dt(row, "thumbs_down_at")?,
        added_to_watchlist: row.get::<_, i64>("added_to_watchlist")? != 0,
        added_to_watchlist_at: parse_opt_dt(row, "added_to_watchlist_at")?,
        added_to_favorites: row.get::<_, i64>("added_to_favorites")? != 0,
        added_to_favorites_at: parse_opt_dt(row, "added_to_favorites_at")?,
        watched_fraction: row.get("watched_fraction")?,
        experiment_id: row.get("experiment_id")?,
        policy: row.get("policy")?,
        arm_id: row.get("arm_id")?,
        p_score: row.get("p_score")?,
        latency_ms: row.get("latency_ms")?,
        reward: row.get("reward")?,
        served_at: parse_dt(row, "served_at")?,
        created_at: parse_dt(row, "created_at")?,
    })
}

fn parse_dt(row: &Row, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_dt(row: &Row, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            }),
    }
}

const EVENT_COLUMNS: &str = "id, user_id, movie_id, algorithm, position, score, clicked, clicked_at, \
    rated, rated_at, rating_value, thumbs_up, thumbs_up_at, thumbs_down, thumbs_down_at, \
    added_to_watchlist, added_to_watchlist_at, added_to_favorites, added_to_favorites_at, \
    watched_fraction, experiment_id, policy, arm_id, p_score, latency_ms, reward, served_at, created_at, \
    context_json";

#[derive(Clone)]
pub struct EventLog {
    db: Db,
}

impl EventLog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Appends one event, returning its assigned id. Total ordering is by `served_at`,
    /// ties broken by this autoincrement id.
    pub async fn append(&self, event: NewEvent) -> Result<i64> {
        let now = Utc::now();
        let context_json = event
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO recommendation_events
                (user_id, movie_id, algorithm, position, score, context_json,
                 experiment_id, policy, arm_id, p_score, latency_ms, served_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.user_id,
                event.movie_id,
                event.algorithm,
                event.position,
                event.score,
                context_json,
                event.experiment_id,
                event.policy,
                event.arm_id,
                event.p_score,
                event.latency_ms,
                event.served_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(Error::from)?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<RecommendationEvent> {
        let conn = self.db.conn.lock().await;
        let sql = format!("SELECT {EVENT_COLUMNS} FROM recommendation_events WHERE id = ?1");
        conn.query_row(&sql, params![id], row_to_event)
            .map_err(Error::from)
    }

    /// Finds the most recent event for `(user_id, movie_id)`, used by the tracking
    /// endpoints to attach a late interaction to the event that produced it.
    pub async fn most_recent_for_item(
        &self,
        user_id: i64,
        movie_id: i64,
    ) -> Result<Option<RecommendationEvent>> {
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM recommendation_events \
             WHERE user_id = ?1 AND movie_id = ?2 ORDER BY served_at DESC LIMIT 1"
        );
        conn.query_row(&sql, params![user_id, movie_id], row_to_event)
            .optional()
            .map_err(Error::from)
    }

    /// Idempotent setter for an interaction flag; a second call with the same
    /// `(event_id, kind)` overwrites the timestamp/value but is never an error.
    pub async fn mark_interaction(
        &self,
        event_id: i64,
        kind: InteractionKind,
        rating_value: Option<f64>,
        watched_fraction: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.conn.lock().await;
        let at = at.to_rfc3339();
        let affected = match kind {
            InteractionKind::Click => conn.execute(
                "UPDATE recommendation_events SET clicked = 1, clicked_at = ?2 \
                 WHERE id = ?1 AND clicked = 0",
                params![event_id, at],
            ),
            InteractionKind::Rating => conn.execute(
                "UPDATE recommendation_events SET rated = 1, rated_at = ?2, rating_value = ?3 \
                 WHERE id = ?1 AND rated = 0",
                params![event_id, at, rating_value],
            ),
            InteractionKind::ThumbsUp => conn.execute(
                "UPDATE recommendation_events SET thumbs_up = 1, thumbs_up_at = ?2 \
                 WHERE id = ?1 AND thumbs_up = 0",
                params![event_id, at],
            ),
            InteractionKind::ThumbsDown => conn.execute(
                "UPDATE recommendation_events SET thumbs_down = 1, thumbs_down_at = ?2 \
                 WHERE id = ?1 AND thumbs_down = 0",
                params![event_id, at],
            ),
            InteractionKind::Favorite => conn.execute(
                "UPDATE recommendation_events SET added_to_favorites = 1, added_to_favorites_at = ?2 \
                 WHERE id = ?1 AND added_to_favorites = 0",
                params![event_id, at],
            ),
            InteractionKind::Watchlist => conn.execute(
                "UPDATE recommendation_events SET added_to_watchlist = 1, added_to_watchlist_at = ?2 \
                 WHERE id = ?1 AND added_to_watchlist = 0",
                params![event_id, at],
            ),
        }
        .map_err(Error::from)?;
        if affected > 0 {
            if let Some(wf) = watched_fraction {
                conn.execute(
                    "UPDATE recommendation_events SET watched_fraction = ?2 \
                     WHERE id = ?1 AND watched_fraction IS NULL",
                    params![event_id, wf],
                )
                .map_err(Error::from)?;
            }
        }
        Ok(())
    }

    /// Sets `reward` iff currently unset; returns whether it mutated.
    pub async fn set_reward(&self, event_id: i64, reward: f64) -> Result<bool> {
        let conn = self.db.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE recommendation_events SET reward = ?2 WHERE id = ?1 AND reward IS NULL",
                params![event_id, reward],
            )
            .map_err(Error::from)?;
        Ok(affected > 0)
    }

    /// Events with `reward IS NULL` served within the last `lookback_hours`, for the
    /// 5-minute reward tick.
    pub async fn pending_events(&self, lookback_hours: i64) -> Result<Vec<RecommendationEvent>> {
        let cutoff = (Utc::now() - chrono::Duration::hours(lookback_hours)).to_rfc3339();
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM recommendation_events \
             WHERE reward IS NULL AND served_at >= ?1"
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(Error::from)?;
        let rows = stmt
            .query_map(params![cutoff], row_to_event)
            .map_err(Error::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Events with `reward IS NULL` older than `older_than_minutes`, for the 15-minute
    /// retry tick.
    pub async fn pending_events_older_than(
        &self,
        older_than_minutes: i64,
    ) -> Result<Vec<RecommendationEvent>> {
        let cutoff = (Utc::now() - chrono::Duration::minutes(older_than_minutes)).to_rfc3339();
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM recommendation_events \
             WHERE reward IS NULL AND served_at < ?1"
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(Error::from)?;
        let rows = stmt
            .query_map(params![cutoff], row_to_event)
            .map_err(Error::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Terminal sweep: sets `reward = 0.0` on events with no interaction older than
    /// `max_age_days`.
    pub async fn sweep_stale_unrewarded(&self, max_age_days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(max_age_days)).to_rfc3339();
        let conn = self.db.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE recommendation_events SET reward = 0.0 \
                 WHERE reward IS NULL AND served_at < ?1",
                params![cutoff],
            )
            .map_err(Error::from)?;
        Ok(affected as u64)
    }

    /// All interactions by `user_id` on `movie_id` observed within `[from, to]`, used by
    /// the Reward Calculator.
    pub async fn interactions_in_window(
        &self,
        user_id: i64,
        movie_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RecommendationEvent>> {
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM recommendation_events \
             WHERE user_id = ?1 AND movie_id = ?2 AND served_at >= ?3 AND served_at <= ?4"
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(Error::from)?;
        let rows = stmt
            .query_map(
                params![user_id, movie_id, from.to_rfc3339(), to.to_rfc3339()],
                row_to_event,
            )
            .map_err(Error::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Events for one experiment within `[from, to]`, optionally filtered by policy or
    /// arm — the shared query surface behind analytics, guardrails, and the raw export
    /// endpoint.
    pub async fn events_for_experiment(
        &self,
        experiment_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        policy: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RecommendationEvent>> {
        let conn = self.db.conn.lock().await;
        let mut sql = format!(
            "SELECT {EVENT_COLUMNS} FROM recommendation_events \
             WHERE experiment_id = ?1 AND served_at >= ?2 AND served_at <= ?3"
        );
        if policy.is_some() {
            sql.push_str(" AND policy = ?4");
        }
        sql.push_str(" ORDER BY served_at ASC LIMIT ?5 OFFSET ?6");

        let mut stmt = conn.prepare_cached(&sql).map_err(Error::from)?;
        let rows = if let Some(p) = policy {
            stmt.query_map(
                params![
                    experiment_id,
                    from.to_rfc3339(),
                    to.to_rfc3339(),
                    p,
                    limit,
                    offset
                ],
                row_to_event,
            )
        } else {
            stmt.query_map(
                params![
                    experiment_id,
                    from.to_rfc3339(),
                    to.to_rfc3339(),
                    limit,
                    offset
                ],
                row_to_event,
            )
        }
        .map_err(Error::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        // leak the tempdir for the duration of the test process; fine in unit tests.
        std::mem::forget(dir);
        Db::open(path.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn append_and_get_roundtrip() {
        let log = EventLog::new(test_db().await);
        let id = log
            .append(NewEvent {
                user_id: 1,
                movie_id: Some(42),
                algorithm: "thompson".to_string(),
                position: Some(0),
                score: Some(0.9),
                context: None,
                experiment_id: Some("exp1".to_string()),
                policy: Some("thompson".to_string()),
                arm_id: Some("arm_a".to_string()),
                p_score: Some(0.5),
                latency_ms: Some(12.0),
                served_at: Utc::now(),
            })
            .await
            .unwrap();

        let event = log.get(id).await.unwrap();
        assert_eq!(event.user_id, 1);
        assert_eq!(event.movie_id, Some(42));
        assert!(event.reward.is_none());
    }

    #[tokio::test]
    async fn set_reward_is_idempotent() {
        let log = EventLog::new(test_db().await);
        let id = log
            .append(NewEvent {
                user_id: 1,
                movie_id: Some(1),
                algorithm: "egreedy".to_string(),
                position: None,
                score: None,
                context: None,
                experiment_id: None,
                policy: None,
                arm_id: None,
                p_score: None,
                latency_ms: None,
                served_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(log.set_reward(id, 1.0).await.unwrap());
        assert!(!log.set_reward(id, 0.0).await.unwrap());
        let event = log.get(id).await.unwrap();
        assert_eq!(event.reward, Some(1.0));
    }

    #[tokio::test]
    async fn mark_interaction_is_idempotent() {
        let log = EventLog::new(test_db().await);
        let id = log
            .append(NewEvent {
                user_id: 1,
                movie_id: Some(1),
                algorithm: "ucb1".to_string(),
                position: None,
                score: None,
                context: None,
                experiment_id: None,
                policy: None,
                arm_id: None,
                p_score: None,
                latency_ms: None,
                served_at: Utc::now(),
            })
            .await
            .unwrap();

        let first_at = Utc::now();
        log.mark_interaction(id, InteractionKind::Click, None, None, first_at)
            .await
            .unwrap();
        let first = log.get(id).await.unwrap();

        let second_at = first_at + chrono::Duration::seconds(30);
        log.mark_interaction(id, InteractionKind::Click, None, None, second_at)
            .await
            .unwrap();
        let second = log.get(id).await.unwrap();

        assert!(second.clicked);
        assert_eq!(first.clicked_at, second.clicked_at);
    }

    #[tokio::test]
    async fn mark_interaction_rating_is_idempotent() {
        let log = EventLog::new(test_db().await);
        let id = log
            .append(NewEvent {
                user_id: 1,
                movie_id: Some(1),
                algorithm: "ucb1".to_string(),
                position: None,
                score: None,
                context: None,
                experiment_id: None,
                policy: None,
                arm_id: None,
                p_score: None,
                latency_ms: None,
                served_at: Utc::now(),
            })
            .await
            .unwrap();

        log.mark_interaction(id, InteractionKind::Rating, Some(5.0), None, Utc::now())
            .await
            .unwrap();
        log.mark_interaction(id, InteractionKind::Rating, Some(1.0), None, Utc::now())
            .await
            .unwrap();
        let event = log.get(id).await.unwrap();
        assert_eq!(event.rating_value, Some(5.0));
    }
}
