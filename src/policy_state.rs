//! C2: Policy State Store. Per-(policy, arm, context-key) counters and Beta parameters,
//! with a read-through cache (an in-process TTL map, standing in for the Redis layer a
//! distributed deployment of this would use).

use crate::context::ContextKey;
use crate::db::Db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyState {
    pub policy: String,
    pub arm_id: String,
    pub context_key: String,
    pub count: i64,
    pub sum_reward: f64,
    pub mean_reward: f64,
    pub alpha: f64,
    pub beta: f64,
    pub last_selected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PolicyState {
    fn default_for(policy: &str, arm_id: &str, context_key: &ContextKey) -> Self {
        let now = Utc::now();
        Self {
            policy: policy.to_string(),
            arm_id: arm_id.to_string(),
            context_key: context_key.as_str().to_string(),
            count: 0,
            sum_reward: 0.0,
            mean_reward: 0.0,
            alpha: 1.0,
            beta: 1.0,
            last_selected_at: None,
            updated_at: now,
        }
    }
}

/// Additive delta applied to a `PolicyState`. All fields are commutative under
/// concurrent application, so replay order across concurrent updates does not matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateDelta {
    pub delta_count: i64,
    pub delta_sum_reward: f64,
    pub delta_alpha: f64,
    pub delta_beta: f64,
    pub selected_at: Option<DateTime<Utc>>,
}

struct CacheEntry {
    state: PolicyState,
    inserted_at: Instant,
}

#[derive(Clone)]
pub struct PolicyStateStore {
    db: Db,
    cache: Arc<RwLock<HashMap<(String, String, String), CacheEntry>>>,
    ttl: Duration,
}

impl PolicyStateStore {
    pub fn new(db: Db, ttl: Duration) -> Self {
        Self {
            db,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn cache_key(policy: &str, arm_id: &str, context_key: &ContextKey) -> (String, String, String) {
        (
            policy.to_string(),
            arm_id.to_string(),
            context_key.as_str().to_string(),
        )
    }

    /// Always returns a well-formed state, creating defaults lazily. Cache misses
    /// and failures fall through to a direct read rather than blocking.
    pub async fn get(
        &self,
        policy: &str,
        arm_id: &str,
        context_key: &ContextKey,
    ) -> Result<PolicyState> {
        let key = Self::cache_key(policy, arm_id, context_key);
        if let Some(entry) = self.cache.read().get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Ok(entry.state.clone());
            }
        }

        let conn = self.db.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT count, sum_reward, mean_reward, alpha, beta, last_selected_at, updated_at
                 FROM policy_states WHERE policy = ?1 AND arm_id = ?2 AND context_key = ?3",
                params![policy, arm_id, context_key.as_str()],
                |row| {
                    let last_selected_raw: Option<String> = row.get(5)?;
                    let updated_raw: String = row.get(6)?;
                    Ok(PolicyState {
                        policy: policy.to_string(),
                        arm_id: arm_id.to_string(),
                        context_key: context_key.as_str().to_string(),
                        count: row.get(0)?,
                        sum_reward: row.get(1)?,
                        mean_reward: row.get(2)?,
                        alpha: row.get(3)?,
                        beta: row.get(4)?,
                        last_selected_at: last_selected_raw
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|d| d.with_timezone(&Utc)),
                        updated_at: DateTime::parse_from_rfc3339(&updated_raw)
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or(Utc::now()),
                    })
                },
            )
            .optional_default(|| PolicyState::default_for(policy, arm_id, context_key))
            .map_err(Error::from)?;

        drop(conn);
        self.cache.write().insert(
            key,
            CacheEntry {
                state: row.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(row)
    }

    /// Atomic read-modify-write; `mean_reward` is re-derived, never stored independently
    /// of `count`/`sum_reward`. Invalidates the cache entry for this key.
    pub async fn update(
        &self,
        policy: &str,
        arm_id: &str,
        context_key: &ContextKey,
        delta: StateDelta,
    ) -> Result<PolicyState> {
        let key = Self::cache_key(policy, arm_id, context_key);
        let conn = self.db.conn.lock().await;

        // Serialize this (policy, arm, context_key) triple through SQLite's own locking:
        // a transaction that reads-then-writes the row is equivalent to SELECT ... FOR
        // UPDATE under WAL since writers serialize on the single connection mutex.
        let existing = conn
            .query_row(
                "SELECT count, sum_reward, alpha, beta FROM policy_states
                 WHERE policy = ?1 AND arm_id = ?2 AND context_key = ?3",
                params![policy, arm_id, context_key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(Error::from)?;

        let (count, sum_reward, alpha, beta) = existing.unwrap_or((0, 0.0, 1.0, 1.0));
        let new_count = count + delta.delta_count;
        let new_sum = sum_reward + delta.delta_sum_reward;
        let new_alpha = alpha + delta.delta_alpha;
        let new_beta = beta + delta.delta_beta;
        let new_mean = if new_count > 0 {
            new_sum / new_count as f64
        } else {
            0.0
        };
        let now = Utc::now();
        let last_selected = delta.selected_at.map(|d| d.to_rfc3339());

        conn.execute(
            "INSERT INTO policy_states
                (policy, arm_id, context_key, count, sum_reward, mean_reward, alpha, beta,
                 last_selected_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(policy, arm_id, context_key) DO UPDATE SET
                count = excluded.count,
                sum_reward = excluded.sum_reward,
                mean_reward = excluded.mean_reward,
                alpha = excluded.alpha,
                beta = excluded.beta,
                last_selected_at = COALESCE(excluded.last_selected_at, policy_states.last_selected_at),
                updated_at = excluded.updated_at",
            params![
                policy,
                arm_id,
                context_key.as_str(),
                new_count,
                new_sum,
                new_mean,
                new_alpha,
                new_beta,
                last_selected,
                now.to_rfc3339(),
            ],
        )
        .map_err(Error::from)?;
        drop(conn);

        self.cache.write().remove(&key);

        Ok(PolicyState {
            policy: policy.to_string(),
            arm_id: arm_id.to_string(),
            context_key: context_key.as_str().to_string(),
            count: new_count,
            sum_reward: new_sum,
            mean_reward: new_mean,
            alpha: new_alpha,
            beta: new_beta,
            last_selected_at: delta.selected_at,
            updated_at: now,
        })
    }

    /// All states for a policy (used by UCB1's `N = sum of counts` and by analytics).
    pub async fn states_for_policy(&self, policy: &str) -> Result<Vec<PolicyState>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT arm_id, context_key, count, sum_reward, mean_reward, alpha, beta, \
                 last_selected_at, updated_at FROM policy_states WHERE policy = ?1",
            )
            .map_err(Error::from)?;
        let rows = stmt
            .query_map(params![policy], |row| {
                let last_selected_raw: Option<String> = row.get(7)?;
                let updated_raw: String = row.get(8)?;
                Ok(PolicyState {
                    policy: policy.to_string(),
                    arm_id: row.get(0)?,
                    context_key: row.get(1)?,
                    count: row.get(2)?,
                    sum_reward: row.get(3)?,
                    mean_reward: row.get(4)?,
                    alpha: row.get(5)?,
                    beta: row.get(6)?,
                    last_selected_at: last_selected_raw
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|d| d.with_timezone(&Utc)),
                    updated_at: DateTime::parse_from_rfc3339(&updated_raw)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or(Utc::now()),
                })
            })
            .map_err(Error::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }
}

/// Small helper trait so `query_row`'s `QueryReturnedNoRows` becomes "construct a
/// lazily-created default" instead of an error, mirroring the source's lazy-creation
/// semantics without a second round trip for the common warm-cache case.
trait OptionalOrDefault<T> {
    fn optional_default(self, default: impl FnOnce() -> T) -> rusqlite::Result<T>;
}

impl<T> OptionalOrDefault<T> for rusqlite::Result<T> {
    fn optional_default(self, default: impl FnOnce() -> T) -> rusqlite::Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(default()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    async fn test_store() -> PolicyStateStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        let db = Db::open(path.to_str().unwrap()).unwrap();
        PolicyStateStore::new(db, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn get_creates_lazy_default() {
        let store = test_store().await;
        let ctx = Context::default().hash_key();
        let state = store.get("thompson", "arm_a", &ctx).await.unwrap();
        assert_eq!(state.count, 0);
        assert_eq!(state.alpha, 1.0);
        assert_eq!(state.beta, 1.0);
    }

    #[tokio::test]
    async fn update_is_monotonic_and_consistent() {
        let store = test_store().await;
        let ctx = Context::default().hash_key();

        for reward in [1.0, 0.0, 1.0, 1.0, 0.0] {
            store
                .update(
                    "thompson",
                    "arm_a",
                    &ctx,
                    StateDelta {
                        delta_count: 1,
                        delta_sum_reward: reward,
                        delta_alpha: reward,
                        delta_beta: 1.0 - reward,
                        selected_at: Some(Utc::now()),
                    },
                )
                .await
                .unwrap();
        }

        let state = store.get("thompson", "arm_a", &ctx).await.unwrap();
        assert_eq!(state.count, 5);
        assert_eq!(state.sum_reward, 3.0);
        assert!((state.mean_reward - 0.6).abs() < 1e-9);
        assert_eq!(state.alpha, 4.0);
        assert_eq!(state.beta, 3.0);
    }
}
