//! C9: Analytics Query Layer. Pure, stateless, idempotent aggregations over the event log
//! and guardrail history.

use crate::config::Config;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::experiments::ExperimentManager;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Reward,
    Ctr,
    LatencyP95,
    Serves,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub experiment_id: String,
    pub traffic_split: HashMap<String, i64>,
    pub active_users_24h: i64,
    pub active_users_7d: i64,
    pub total_serves: i64,
    pub mean_reward_24h: Option<f64>,
    pub mean_reward_7d: Option<f64>,
    pub current_regret: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeseriesPoint {
    pub bucket: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmStats {
    pub arm_id: String,
    pub serves: i64,
    pub reward_rate: Option<f64>,
    pub mean_latency_ms: Option<f64>,
    pub unique_users: i64,
    pub regret_vs_best: Option<f64>,
}

#[derive(Clone)]
pub struct AnalyticsQueryLayer {
    db: Db,
    events: EventLog,
    experiments: ExperimentManager,
    config: Arc<Config>,
}

impl AnalyticsQueryLayer {
    pub fn new(db: Db, events: EventLog, experiments: ExperimentManager, config: Arc<Config>) -> Self {
        Self {
            db,
            events,
            experiments,
            config,
        }
    }

    pub async fn summary(&self, experiment_id: &str) -> Result<Summary> {
        let traffic_split = self.experiments.assignment_counts_by_policy(experiment_id).await?;

        let now = Utc::now();
        let day_ago = now - chrono::Duration::hours(24);
        let week_ago = now - chrono::Duration::days(7);

        let conn = self.db.conn.lock().await;
        let active_users_24h: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT user_id) FROM recommendation_events
                 WHERE experiment_id = ?1 AND served_at >= ?2",
                params![experiment_id, day_ago.to_rfc3339()],
                |r| r.get(0),
            )
            .map_err(Error::from)?;
        let active_users_7d: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT user_id) FROM recommendation_events
                 WHERE experiment_id = ?1 AND served_at >= ?2",
                params![experiment_id, week_ago.to_rfc3339()],
                |r| r.get(0),
            )
            .map_err(Error::from)?;
        let total_serves: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM recommendation_events WHERE experiment_id = ?1",
                params![experiment_id],
                |r| r.get(0),
            )
            .map_err(Error::from)?;
        let mean_reward_24h: Option<f64> = conn
            .query_row(
                "SELECT AVG(reward) FROM recommendation_events
                 WHERE experiment_id = ?1 AND served_at >= ?2 AND reward IS NOT NULL",
                params![experiment_id, day_ago.to_rfc3339()],
                |r| r.get(0),
            )
            .map_err(Error::from)?;
        let mean_reward_7d: Option<f64> = conn
            .query_row(
                "SELECT AVG(reward) FROM recommendation_events
                 WHERE experiment_id = ?1 AND served_at >= ?2 AND reward IS NOT NULL",
                params![experiment_id, week_ago.to_rfc3339()],
                |r| r.get(0),
            )
            .map_err(Error::from)?;
        drop(conn);

        // Current regret: best-policy mean minus this experiment's 7d mean, gated on
        // min_events_per_policy per DESIGN.md Open Question decision #3.
        let event_count_7d: i64 = self
            .db
            .conn
            .lock()
            .await
            .query_row(
                "SELECT COUNT(*) FROM recommendation_events
                 WHERE experiment_id = ?1 AND served_at >= ?2 AND reward IS NOT NULL",
                params![experiment_id, week_ago.to_rfc3339()],
                |r| r.get(0),
            )
            .map_err(Error::from)?;
        let current_regret = if event_count_7d >= self.config.decision_min_events_per_policy {
            self.best_policy_mean(experiment_id, week_ago)
                .await?
                .zip(mean_reward_7d)
                .map(|(best, mine)| best - mine)
        } else {
            None
        };

        Ok(Summary {
            experiment_id: experiment_id.to_string(),
            traffic_split,
            active_users_24h,
            active_users_7d,
            total_serves,
            mean_reward_24h,
            mean_reward_7d,
            current_regret,
        })
    }

    async fn best_policy_mean(&self, experiment_id: &str, since: DateTime<Utc>) -> Result<Option<f64>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT policy, AVG(reward) FROM recommendation_events
                 WHERE experiment_id = ?1 AND served_at >= ?2 AND reward IS NOT NULL AND policy IS NOT NULL
                 GROUP BY policy",
            )
            .map_err(Error::from)?;
        let rows = stmt
            .query_map(params![experiment_id, since.to_rfc3339()], |row| {
                row.get::<_, f64>(1)
            })
            .map_err(Error::from)?;
        let means: Vec<f64> = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)?;
        Ok(means.into_iter().fold(None, |acc, m| match acc {
            None => Some(m),
            Some(a) => Some(a.max(m)),
        }))
    }

    pub async fn timeseries(
        &self,
        experiment_id: &str,
        metric: Metric,
        granularity: Granularity,
        policy: Option<&str>,
    ) -> Result<Vec<TimeseriesPoint>> {
        let events = self
            .events
            .events_for_experiment(experiment_id, Utc.timestamp_opt(0, 0).unwrap(), Utc::now(), policy, 1_000_000, 0)
            .await?;

        let bucket_fmt = match granularity {
            Granularity::Hour => "%Y-%m-%dT%H:00:00Z",
            Granularity::Day => "%Y-%m-%dT00:00:00Z",
        };

        let mut buckets: HashMap<String, Vec<f64>> = HashMap::new();
        for event in &events {
            let key = event.served_at.format(bucket_fmt).to_string();
            let value = match metric {
                Metric::Reward => event.reward,
                Metric::Ctr => Some(if event.clicked { 1.0 } else { 0.0 }),
                Metric::LatencyP95 => event.latency_ms,
                Metric::Serves => Some(1.0),
            };
            if let Some(v) = value {
                buckets.entry(key).or_default().push(v);
            }
        }

        let mut points: Vec<TimeseriesPoint> = buckets
            .into_iter()
            .map(|(key, values)| {
                let value = match metric {
                    Metric::LatencyP95 => {
                        let mut v = values;
                        v.sort_by(|a, b| a.partial_cmp(b).unwrap());
                        let idx = ((v.len() - 1) as f64 * 0.95).round() as usize;
                        v[idx.min(v.len() - 1)]
                    }
                    Metric::Serves => values.iter().sum(),
                    _ => values.iter().sum::<f64>() / values.len() as f64,
                };
                TimeseriesPoint {
                    bucket: DateTime::parse_from_rfc3339(&key).unwrap().with_timezone(&Utc),
                    value,
                }
            })
            .collect();
        points.sort_by_key(|p| p.bucket);
        Ok(points)
    }

    pub async fn arms(&self, experiment_id: &str, policy: Option<&str>) -> Result<Vec<ArmStats>> {
        let events = self
            .events
            .events_for_experiment(experiment_id, Utc.timestamp_opt(0, 0).unwrap(), Utc::now(), policy, 1_000_000, 0)
            .await?;

        let mut per_arm: HashMap<String, Vec<&crate::events::RecommendationEvent>> = HashMap::new();
        for event in &events {
            if let Some(arm) = &event.arm_id {
                per_arm.entry(arm.clone()).or_default().push(event);
            }
        }

        let means: HashMap<String, f64> = per_arm
            .iter()
            .map(|(arm, evs)| {
                let rewards: Vec<f64> = evs.iter().filter_map(|e| e.reward).collect();
                let mean = if rewards.is_empty() {
                    0.0
                } else {
                    rewards.iter().sum::<f64>() / rewards.len() as f64
                };
                (arm.clone(), mean)
            })
            .collect();
        let best_mean = means.values().cloned().fold(f64::MIN, f64::max);

        let mut stats: Vec<ArmStats> = per_arm
            .into_iter()
            .map(|(arm, evs)| {
                let serves = evs.len() as i64;
                let rewards: Vec<f64> = evs.iter().filter_map(|e| e.reward).collect();
                let reward_rate = if rewards.is_empty() {
                    None
                } else {
                    Some(rewards.iter().sum::<f64>() / rewards.len() as f64)
                };
                let latencies: Vec<f64> = evs.iter().filter_map(|e| e.latency_ms).collect();
                let mean_latency_ms = if latencies.is_empty() {
                    None
                } else {
                    Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
                };
                let unique_users = {
                    let set: std::collections::HashSet<i64> = evs.iter().map(|e| e.user_id).collect();
                    set.len() as i64
                };
                let regret_vs_best = reward_rate.map(|r| best_mean - r);
                ArmStats {
                    arm_id: arm,
                    serves,
                    reward_rate,
                    mean_latency_ms,
                    unique_users,
                    regret_vs_best,
                }
            })
            .collect();
        stats.sort_by(|a, b| b.serves.cmp(&a.serves));
        Ok(stats)
    }

    /// Policy x cohort matrix, cohort in `{user_type, time_period}`. Reads the
    /// context blob recorded with each event rather than a denormalized column, since
    /// cohort membership is a context field, not a first-class event attribute.
    pub async fn cohorts(
        &self,
        experiment_id: &str,
        breakdown: CohortBreakdown,
    ) -> Result<HashMap<String, HashMap<String, f64>>> {
        let events = self
            .events
            .events_for_experiment(experiment_id, Utc.timestamp_opt(0, 0).unwrap(), Utc::now(), None, 1_000_000, 0)
            .await?;

        let mut matrix: HashMap<String, HashMap<String, Vec<f64>>> = HashMap::new();
        for event in &events {
            let Some(policy) = &event.policy else { continue };
            let Some(reward) = event.reward else { continue };
            let cohort = event
                .context
                .as_ref()
                .and_then(|c| match breakdown {
                    CohortBreakdown::UserType => c.user_type.map(|t| format!("{:?}", t)),
                    CohortBreakdown::TimePeriod => c.time_period.map(|t| format!("{:?}", t)),
                })
                .unwrap_or_else(|| "unknown".to_string());
            matrix
                .entry(policy.clone())
                .or_default()
                .entry(cohort)
                .or_default()
                .push(reward);
        }

        Ok(matrix
            .into_iter()
            .map(|(policy, cohorts)| {
                let means = cohorts
                    .into_iter()
                    .map(|(cohort, rewards)| {
                        let mean = rewards.iter().sum::<f64>() / rewards.len() as f64;
                        (cohort, mean)
                    })
                    .collect();
                (policy, means)
            })
            .collect())
    }

    /// Paginated raw event log, optionally filtered by policy.
    pub async fn events(
        &self,
        experiment_id: &str,
        policy: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<crate::events::RecommendationEvent>> {
        self.events
            .events_for_experiment(experiment_id, Utc.timestamp_opt(0, 0).unwrap(), Utc::now(), policy, limit, offset)
            .await
    }

    /// CSV export; streams row-by-row into the writer rather than buffering the full
    /// result set in memory.
    pub async fn export_csv(
        &self,
        experiment_id: &str,
        policy: Option<&str>,
        writer: &mut impl std::io::Write,
    ) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record([
            "id", "user_id", "movie_id", "policy", "arm_id", "p_score", "reward", "served_at",
        ])
        .map_err(|e| Error::Internal(e.to_string()))?;

        let page_size = 1000;
        let mut offset = 0;
        loop {
            let batch = self
                .events(experiment_id, policy, page_size, offset)
                .await?;
            if batch.is_empty() {
                break;
            }
            for event in &batch {
                wtr.write_record([
                    event.id.to_string(),
                    event.user_id.to_string(),
                    event.movie_id.map(|m| m.to_string()).unwrap_or_default(),
                    event.policy.clone().unwrap_or_default(),
                    event.arm_id.clone().unwrap_or_default(),
                    event.p_score.map(|p| p.to_string()).unwrap_or_default(),
                    event.reward.map(|r| r.to_string()).unwrap_or_default(),
                    event.served_at.to_rfc3339(),
                ])
                .map_err(|e| Error::Internal(e.to_string()))?;
            }
            offset += page_size;
        }
        wtr.flush().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    /// Full (unpaginated) event list for an experiment, for the JSON export format.
    pub async fn export_all(
        &self,
        experiment_id: &str,
        policy: Option<&str>,
    ) -> Result<Vec<crate::events::RecommendationEvent>> {
        let page_size = 1000;
        let mut offset = 0;
        let mut all = Vec::new();
        loop {
            let batch = self.events(experiment_id, policy, page_size, offset).await?;
            if batch.is_empty() {
                break;
            }
            all.extend(batch);
            offset += page_size;
        }
        Ok(all)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortBreakdown {
    UserType,
    TimePeriod,
}

