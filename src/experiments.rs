//! C4: Experiment Manager. Sticky user-to-policy assignment and experiment lifecycle.

use crate::db::Db;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub traffic_pct: f64,
    pub default_policy: String,
    pub policies: Vec<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Scheduled,
    Active,
    Ended,
}

impl Experiment {
    pub fn status(&self) -> ExperimentStatus {
        let now = Utc::now();
        if now < self.start_at {
            ExperimentStatus::Scheduled
        } else if self.end_at.map(|e| now >= e).unwrap_or(false) {
            ExperimentStatus::Ended
        } else {
            ExperimentStatus::Active
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExperiment {
    pub name: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub traffic_pct: f64,
    pub default_policy: String,
    pub policies: Vec<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub assignment_count: i64,
    pub status: ExperimentStatus,
}

struct CacheEntry {
    policy: String,
    bucket: i32,
    inserted_at: Instant,
}

#[derive(Clone)]
pub struct ExperimentManager {
    db: Db,
    assignment_cache: Arc<RwLock<HashMap<(String, i64), CacheEntry>>>,
    ttl: Duration,
}

impl ExperimentManager {
    pub fn new(db: Db, ttl: Duration) -> Self {
        Self {
            db,
            assignment_cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn create(&self, new: NewExperiment) -> Result<Experiment> {
        if !(0.0..=1.0).contains(&new.traffic_pct) {
            return Err(Error::InvalidArgument(format!(
                "traffic_pct must be between 0 and 1, got {}",
                new.traffic_pct
            )));
        }
        if let Some(end_at) = new.end_at {
            if end_at < new.start_at {
                return Err(Error::InvalidArgument(
                    "end_at must not precede start_at".to_string(),
                ));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let policies_json = serde_json::to_string(&new.policies)?;

        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO experiments
                (id, name, start_at, end_at, traffic_pct, default_policy, policies_json, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                new.name,
                new.start_at.to_rfc3339(),
                new.end_at.map(|d| d.to_rfc3339()),
                new.traffic_pct,
                new.default_policy,
                policies_json,
                new.notes,
                now.to_rfc3339(),
            ],
        )
        .map_err(Error::from)?;

        Ok(Experiment {
            id,
            name: new.name,
            start_at: new.start_at,
            end_at: new.end_at,
            traffic_pct: new.traffic_pct,
            default_policy: new.default_policy,
            policies: new.policies,
            notes: new.notes,
            created_at: now,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Experiment> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT id, name, start_at, end_at, traffic_pct, default_policy, policies_json, notes, created_at
             FROM experiments WHERE id = ?1",
            params![id],
            row_to_experiment,
        )
        .optional()
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound(format!("experiment {id} not found")))
    }

    pub async fn list(&self, status_filter: Option<ExperimentStatus>) -> Result<Vec<Experiment>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, name, start_at, end_at, traffic_pct, default_policy, policies_json, notes, created_at
                 FROM experiments ORDER BY created_at DESC",
            )
            .map_err(Error::from)?;
        let rows = stmt
            .query_map(params![], row_to_experiment)
            .map_err(Error::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)?;
        Ok(match status_filter {
            Some(s) => rows.into_iter().filter(|e| e.status() == s).collect(),
            None => rows,
        })
    }

    pub async fn update(
        &self,
        id: &str,
        name: Option<String>,
        end_at: Option<DateTime<Utc>>,
        traffic_pct: Option<f64>,
        notes: Option<String>,
    ) -> Result<Experiment> {
        let existing = self.get(id).await?;
        if existing.status() == ExperimentStatus::Ended {
            return Err(Error::Conflict(format!("experiment {id} has already ended")));
        }
        if let Some(pct) = traffic_pct {
            if !(0.0..=1.0).contains(&pct) {
                return Err(Error::InvalidArgument(format!(
                    "traffic_pct must be between 0 and 1, got {pct}"
                )));
            }
        }

        let new_name = name.unwrap_or(existing.name.clone());
        let new_end_at = end_at.or(existing.end_at);
        let new_traffic = traffic_pct.unwrap_or(existing.traffic_pct);
        let new_notes = notes.or(existing.notes.clone());

        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE experiments SET name = ?2, end_at = ?3, traffic_pct = ?4, notes = ?5 WHERE id = ?1",
            params![
                id,
                new_name,
                new_end_at.map(|d| d.to_rfc3339()),
                new_traffic,
                new_notes,
            ],
        )
        .map_err(Error::from)?;
        drop(conn);

        self.get(id).await
    }

    /// Sets `end_at = now` (rollback/stop). Terminal: experiments are never physically
    /// deleted.
    pub async fn end(&self, id: &str) -> Result<Experiment> {
        let now = Utc::now();
        let conn = self.db.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE experiments SET end_at = ?2 WHERE id = ?1",
                params![id, now.to_rfc3339()],
            )
            .map_err(Error::from)?;
        drop(conn);
        if affected == 0 {
            return Err(Error::NotFound(format!("experiment {id} not found")));
        }
        self.clear_cache_for(id);
        self.get(id).await
    }

    /// Deterministic sticky assignment: a cached or persisted assignment always wins, and a
    /// new assignment is derived from a stable hash of `(experiment_id, user_id)`.
    pub async fn assign(&self, experiment_id: &str, user_id: i64) -> Result<(String, i32)> {
        // 1. Existing assignment wins (stickiness).
        if let Some(cached) = self.cached_assignment(experiment_id, user_id) {
            return Ok(cached);
        }
        if let Some((policy, bucket)) = self.load_assignment(experiment_id, user_id).await? {
            self.cache_assignment(experiment_id, user_id, &policy, bucket);
            return Ok((policy, bucket));
        }

        // 2. Load experiment, check it is active.
        let experiment = self.get(experiment_id).await?;
        let now = Utc::now();
        if now < experiment.start_at || experiment.end_at.map(|e| now >= e).unwrap_or(false) {
            return Ok((experiment.default_policy, 0));
        }

        // 3. Deterministic hash of experiment_id ++ user_id.
        let mut hasher = Sha256::new();
        hasher.update(format!("{experiment_id}:{user_id}").as_bytes());
        let digest = hasher.finalize();
        let hash_value = u128::from_be_bytes(digest[..16].try_into().unwrap());

        // 4. Traffic gate.
        let bucket = (hash_value % 100) as i32;
        let traffic_threshold = (experiment.traffic_pct * 100.0).floor() as i32;
        if bucket >= traffic_threshold {
            return Ok((experiment.default_policy, bucket));
        }

        // 5. Assign to a policy by hash, persist.
        let policy_index = (hash_value % experiment.policies.len() as u128) as usize;
        let assigned_policy = experiment.policies[policy_index].clone();

        let conn = self.db.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO policy_assignments (experiment_id, user_id, policy, bucket, assigned_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(experiment_id, user_id) DO NOTHING",
            params![
                experiment_id,
                user_id,
                assigned_policy,
                bucket,
                Utc::now().to_rfc3339(),
            ],
        );
        drop(conn);
        result.map_err(Error::from)?;

        // Concurrent first-time assignments collapse to one row via the UNIQUE
        // constraint; read back whichever one actually won.
        let (final_policy, final_bucket) = self
            .load_assignment(experiment_id, user_id)
            .await?
            .unwrap_or((assigned_policy, bucket));

        self.cache_assignment(experiment_id, user_id, &final_policy, final_bucket);
        Ok((final_policy, final_bucket))
    }

    async fn load_assignment(
        &self,
        experiment_id: &str,
        user_id: i64,
    ) -> Result<Option<(String, i32)>> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT policy, bucket FROM policy_assignments WHERE experiment_id = ?1 AND user_id = ?2",
            params![experiment_id, user_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?)),
        )
        .optional()
        .map_err(Error::from)
    }

    fn cached_assignment(&self, experiment_id: &str, user_id: i64) -> Option<(String, i32)> {
        let key = (experiment_id.to_string(), user_id);
        let cache = self.assignment_cache.read();
        cache.get(&key).and_then(|e| {
            if e.inserted_at.elapsed() < self.ttl {
                Some((e.policy.clone(), e.bucket))
            } else {
                None
            }
        })
    }

    fn cache_assignment(&self, experiment_id: &str, user_id: i64, policy: &str, bucket: i32) {
        let key = (experiment_id.to_string(), user_id);
        self.assignment_cache.write().insert(
            key,
            CacheEntry {
                policy: policy.to_string(),
                bucket,
                inserted_at: Instant::now(),
            },
        );
    }

    fn clear_cache_for(&self, experiment_id: &str) {
        self.assignment_cache
            .write()
            .retain(|(exp, _), _| exp != experiment_id);
    }

    pub async fn assignment_count(&self, experiment_id: &str, policy: Option<&str>) -> Result<i64> {
        let conn = self.db.conn.lock().await;
        match policy {
            Some(p) => conn
                .query_row(
                    "SELECT COUNT(*) FROM policy_assignments WHERE experiment_id = ?1 AND policy = ?2",
                    params![experiment_id, p],
                    |row| row.get(0),
                )
                .map_err(Error::from),
            None => conn
                .query_row(
                    "SELECT COUNT(*) FROM policy_assignments WHERE experiment_id = ?1",
                    params![experiment_id],
                    |row| row.get(0),
                )
                .map_err(Error::from),
        }
    }

    pub async fn assignment_counts_by_policy(&self, experiment_id: &str) -> Result<HashMap<String, i64>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT policy, COUNT(*) FROM policy_assignments WHERE experiment_id = ?1 GROUP BY policy",
            )
            .map_err(Error::from)?;
        let rows = stmt
            .query_map(params![experiment_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(Error::from)?;
        let mut map = HashMap::new();
        for row in rows {
            let (policy, count) = row.map_err(Error::from)?;
            map.insert(policy, count);
        }
        Ok(map)
    }

    /// Issues/warnings about timing, traffic, and assignment health.
    pub async fn validate(&self, experiment_id: &str) -> Result<Validation> {
        let experiment = self.get(experiment_id).await?;
        let now = Utc::now();
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if experiment.start_at > now + chrono::Duration::days(30) {
            warnings.push("Experiment starts more than 30 days in the future".to_string());
        }
        if let Some(end_at) = experiment.end_at {
            if end_at < experiment.start_at {
                issues.push("End date is before start date".to_string());
            }
        }
        if experiment.traffic_pct <= 0.0 {
            issues.push("Traffic percentage must be positive".to_string());
        } else if experiment.traffic_pct > 1.0 {
            issues.push("Traffic percentage cannot exceed 100%".to_string());
        }

        let assignment_count = self.assignment_count(experiment_id, None).await?;
        if assignment_count == 0 && now >= experiment.start_at {
            warnings.push("No user assignments found for active experiment".to_string());
        }

        Ok(Validation {
            valid: issues.is_empty(),
            issues,
            warnings,
            assignment_count,
            status: experiment.status(),
        })
    }
}

fn row_to_experiment(row: &rusqlite::Row) -> rusqlite::Result<Experiment> {
    let end_at_raw: Option<String> = row.get(3)?;
    let policies_json: String = row.get(6)?;
    let policies: Vec<String> = serde_json::from_str(&policies_json).unwrap_or_default();
    let start_raw: String = row.get(2)?;
    let created_raw: String = row.get(8)?;
    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        start_at: DateTime::parse_from_rfc3339(&start_raw)
            .unwrap()
            .with_timezone(&Utc),
        end_at: end_at_raw.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
        traffic_pct: row.get(4)?,
        default_policy: row.get(5)?,
        policies,
        notes: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created_raw)
            .unwrap()
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_manager() -> ExperimentManager {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        let db = Db::open(path.to_str().unwrap()).unwrap();
        ExperimentManager::new(db, Duration::from_secs(3600))
    }

    async fn active_experiment(mgr: &ExperimentManager, traffic_pct: f64) -> Experiment {
        mgr.create(NewExperiment {
            name: "exp".to_string(),
            start_at: Utc::now() - chrono::Duration::hours(1),
            end_at: None,
            traffic_pct,
            default_policy: "control".to_string(),
            policies: vec!["thompson".to_string(), "egreedy".to_string(), "ucb".to_string()],
            notes: None,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn assignment_is_sticky() {
        let mgr = test_manager().await;
        let exp = active_experiment(&mgr, 1.0).await;
        let (p1, b1) = mgr.assign(&exp.id, 12345).await.unwrap();
        let (p2, b2) = mgr.assign(&exp.id, 12345).await.unwrap();
        assert_eq!((p1, b1), (p2, b2));
        assert_eq!(mgr.assignment_count(&exp.id, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn out_of_traffic_user_is_not_persisted() {
        let mgr = test_manager().await;
        let exp = active_experiment(&mgr, 0.0).await;
        let (policy, _bucket) = mgr.assign(&exp.id, 99999).await.unwrap();
        assert_eq!(policy, "control");
        assert_eq!(mgr.assignment_count(&exp.id, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn traffic_gating_converges_to_traffic_pct() {
        let mgr = test_manager().await;
        let exp = active_experiment(&mgr, 0.3).await;
        let mut assigned = 0;
        let trials = 5000;
        for user_id in 0..trials {
            let (policy, _) = mgr.assign(&exp.id, user_id).await.unwrap();
            if policy != "control" {
                assigned += 1;
            }
        }
        let rate = assigned as f64 / trials as f64;
        assert!((rate - 0.3).abs() < 0.03, "rate = {rate}");
    }

    #[tokio::test]
    async fn validate_flags_traffic_and_timing_issues() {
        let mgr = test_manager().await;
        let exp = mgr
            .create(NewExperiment {
                name: "bad".to_string(),
                start_at: Utc::now(),
                end_at: Some(Utc::now() - chrono::Duration::hours(1)),
                traffic_pct: 1.0,
                default_policy: "control".to_string(),
                policies: vec!["thompson".to_string()],
                notes: None,
            })
            .await;
        assert!(exp.is_err());
    }
}
