//! Shared SQLite connection and schema bootstrap.
//!
//! WAL mode, idempotent `CREATE TABLE IF NOT EXISTS`, wrapped in
//! `Arc<tokio::sync::Mutex<Connection>>` so async handlers can await the lock without blocking
//! the runtime thread.

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Db {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::from)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(Error::from)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(Error::from)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS experiments (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                start_at        TEXT NOT NULL,
                end_at          TEXT,
                traffic_pct     REAL NOT NULL,
                default_policy  TEXT NOT NULL,
                policies_json   TEXT NOT NULL,
                notes           TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS policy_assignments (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id   TEXT NOT NULL,
                user_id         INTEGER NOT NULL,
                policy          TEXT NOT NULL,
                bucket          INTEGER NOT NULL CHECK (bucket >= 0 AND bucket <= 99),
                assigned_at     TEXT NOT NULL,
                UNIQUE(experiment_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_assignments_experiment
                ON policy_assignments(experiment_id);

            CREATE TABLE IF NOT EXISTS arm_catalog (
                arm_id      TEXT PRIMARY KEY,
                title       TEXT NOT NULL,
                metadata    TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS policy_states (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                policy            TEXT NOT NULL,
                arm_id            TEXT NOT NULL,
                context_key       TEXT NOT NULL,
                count             INTEGER NOT NULL DEFAULT 0,
                sum_reward        REAL NOT NULL DEFAULT 0,
                mean_reward       REAL NOT NULL DEFAULT 0,
                alpha             REAL NOT NULL DEFAULT 1,
                beta              REAL NOT NULL DEFAULT 1,
                last_selected_at  TEXT,
                updated_at        TEXT NOT NULL,
                UNIQUE(policy, arm_id, context_key)
            );

            CREATE TABLE IF NOT EXISTS recommendation_events (
                id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id                 INTEGER NOT NULL,
                movie_id                INTEGER,
                algorithm               TEXT NOT NULL,
                position                INTEGER,
                score                   REAL,
                clicked                 INTEGER NOT NULL DEFAULT 0,
                clicked_at              TEXT,
                rated                   INTEGER NOT NULL DEFAULT 0,
                rated_at                TEXT,
                rating_value            REAL,
                thumbs_up               INTEGER NOT NULL DEFAULT 0,
                thumbs_up_at            TEXT,
                thumbs_down             INTEGER NOT NULL DEFAULT 0,
                thumbs_down_at          TEXT,
                added_to_watchlist      INTEGER NOT NULL DEFAULT 0,
                added_to_watchlist_at   TEXT,
                added_to_favorites      INTEGER NOT NULL DEFAULT 0,
                added_to_favorites_at   TEXT,
                watched_fraction        REAL,
                context_json            TEXT,
                experiment_id           TEXT,
                policy                  TEXT,
                arm_id                  TEXT,
                p_score                 REAL,
                latency_ms              REAL,
                reward                  REAL,
                served_at               TEXT NOT NULL,
                created_at              TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_experiment
                ON recommendation_events(experiment_id);
            CREATE INDEX IF NOT EXISTS idx_events_policy
                ON recommendation_events(policy);
            CREATE INDEX IF NOT EXISTS idx_events_arm
                ON recommendation_events(arm_id);
            CREATE INDEX IF NOT EXISTS idx_events_served_at
                ON recommendation_events(served_at);
            CREATE INDEX IF NOT EXISTS idx_events_user_movie
                ON recommendation_events(user_id, movie_id);

            CREATE TABLE IF NOT EXISTS decision_records (
                id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id           TEXT NOT NULL,
                decision                TEXT NOT NULL,
                confidence              REAL NOT NULL,
                window_days             INTEGER NOT NULL,
                best_policy             TEXT,
                uplift_vs_control       REAL,
                significant             INTEGER NOT NULL,
                reasoning               TEXT NOT NULL,
                recommendations_json    TEXT NOT NULL,
                analyzed_at             TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_experiment
                ON decision_records(experiment_id);

            CREATE TABLE IF NOT EXISTS guardrail_checks (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id       TEXT NOT NULL,
                checked_at          TEXT NOT NULL,
                overall_status      TEXT NOT NULL,
                checks_json         TEXT NOT NULL,
                should_rollback     INTEGER NOT NULL,
                rollback_triggered  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_guardrail_checks_experiment
                ON guardrail_checks(experiment_id);
            "#,
        )
        .map_err(Error::from)
    }
}
