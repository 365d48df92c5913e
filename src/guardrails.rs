//! C7: Guardrails Engine. Rolling-window safety checks with auto-rollback.

use crate::db::Db;
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::experiments::ExperimentManager;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailStatus {
    Pass,
    Warning,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub check: String,
    pub value: f64,
    pub threshold: f64,
    pub status: GuardrailStatus,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailSummary {
    pub experiment_id: String,
    pub checked_at: DateTime<Utc>,
    pub overall_status: GuardrailStatus,
    pub checks: Vec<GuardrailResult>,
    pub should_rollback: bool,
    pub rollback_triggered: bool,
}

#[derive(Debug, Clone)]
pub struct GuardrailThresholds {
    pub error_rate: f64,
    pub latency_p95_ms: f64,
    pub arm_concentration: f64,
    pub reward_drop: f64,
    pub window_minutes: i64,
    pub critical_checks: Vec<String>,
    pub cooldown_hours: i64,
    pub max_rollback_attempts: u32,
}

impl GuardrailThresholds {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            error_rate: config.guardrail_error_rate_threshold,
            latency_p95_ms: config.guardrail_latency_p95_threshold_ms,
            arm_concentration: config.guardrail_arm_concentration_threshold,
            reward_drop: config.guardrail_reward_drop_threshold,
            window_minutes: config.guardrail_window_minutes,
            critical_checks: vec!["error_rate".to_string(), "latency_p95".to_string()],
            cooldown_hours: config.guardrail_cooldown_hours,
            max_rollback_attempts: config.guardrail_max_rollback_attempts,
        }
    }
}

struct RollbackState {
    attempts: u32,
    last_rollback_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct GuardrailsEngine {
    db: Db,
    events: EventLog,
    experiments: ExperimentManager,
    thresholds: Arc<RwLock<GuardrailThresholds>>,
    rollback_state: Arc<RwLock<HashMap<String, RollbackState>>>,
}

impl GuardrailsEngine {
    pub fn new(
        db: Db,
        events: EventLog,
        experiments: ExperimentManager,
        thresholds: GuardrailThresholds,
    ) -> Self {
        Self {
            db,
            events,
            experiments,
            thresholds: Arc::new(RwLock::new(thresholds)),
            rollback_state: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn thresholds(&self) -> GuardrailThresholds {
        self.thresholds.read().clone()
    }

    pub fn update_thresholds(&self, thresholds: GuardrailThresholds) {
        *self.thresholds.write() = thresholds;
    }

    /// Evaluates all four checks over a rolling window for one experiment.
    /// `error_rate` is supplied by the caller since the event log does not itself carry
    /// a failed-serve signal (DESIGN.md Open Question decision #2).
    pub async fn check(&self, experiment_id: &str, error_rate_sample: f64) -> Result<GuardrailSummary> {
        let thresholds = self.thresholds();
        let now = Utc::now();
        let window_start = now - chrono::Duration::minutes(thresholds.window_minutes);

        let events = self
            .events
            .events_for_experiment(experiment_id, window_start, now, None, 100_000, 0)
            .await
            .unwrap_or_default();

        let mut checks = Vec::new();
        checks.push(self.check_error_rate(error_rate_sample, &thresholds));
        checks.push(self.check_latency_p95(&events, &thresholds));
        checks.push(self.check_arm_concentration(&events, &thresholds));
        checks.push(self.check_reward_drop(&events, &thresholds));

        let overall_status = Self::determine_overall_status(&checks);
        let fail_count = checks.iter().filter(|c| c.status == GuardrailStatus::Fail).count();
        let critical_fail = checks.iter().any(|c| {
            c.status == GuardrailStatus::Fail && thresholds.critical_checks.contains(&c.check)
        });
        let should_rollback = fail_count >= 2 || critical_fail;

        let rollback_triggered = if should_rollback {
            self.maybe_rollback(experiment_id, &thresholds).await
        } else {
            false
        };

        let summary = GuardrailSummary {
            experiment_id: experiment_id.to_string(),
            checked_at: now,
            overall_status,
            checks,
            should_rollback,
            rollback_triggered,
        };

        self.record(&summary).await?;
        Ok(summary)
    }

    fn check_error_rate(&self, sample: f64, thresholds: &GuardrailThresholds) -> GuardrailResult {
        GuardrailResult {
            check: "error_rate".to_string(),
            value: sample,
            threshold: thresholds.error_rate,
            status: if sample >= thresholds.error_rate {
                GuardrailStatus::Fail
            } else {
                GuardrailStatus::Pass
            },
            note: None,
        }
    }

    fn check_latency_p95(
        &self,
        events: &[crate::events::RecommendationEvent],
        thresholds: &GuardrailThresholds,
    ) -> GuardrailResult {
        let mut latencies: Vec<f64> = events.iter().filter_map(|e| e.latency_ms).collect();
        let p95 = percentile(&mut latencies, 0.95);
        GuardrailResult {
            check: "latency_p95".to_string(),
            value: p95,
            threshold: thresholds.latency_p95_ms,
            status: if p95 >= thresholds.latency_p95_ms {
                GuardrailStatus::Fail
            } else {
                GuardrailStatus::Pass
            },
            note: None,
        }
    }

    fn check_arm_concentration(
        &self,
        events: &[crate::events::RecommendationEvent],
        thresholds: &GuardrailThresholds,
    ) -> GuardrailResult {
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for e in events {
            if let Some(arm) = &e.arm_id {
                *counts.entry(arm.as_str()).or_insert(0) += 1;
            }
        }
        let total: u64 = counts.values().sum();
        let max = counts.values().cloned().max().unwrap_or(0);
        let share = if total > 0 { max as f64 / total as f64 } else { 0.0 };
        GuardrailResult {
            check: "arm_concentration".to_string(),
            value: share,
            threshold: thresholds.arm_concentration,
            status: if share >= thresholds.arm_concentration {
                GuardrailStatus::Warning
            } else {
                GuardrailStatus::Pass
            },
            note: None,
        }
    }

    fn check_reward_drop(
        &self,
        events: &[crate::events::RecommendationEvent],
        thresholds: &GuardrailThresholds,
    ) -> GuardrailResult {
        let control_rewards: Vec<f64> = events
            .iter()
            .filter(|e| e.policy.as_deref() == Some("control"))
            .filter_map(|e| e.reward)
            .collect();
        let experiment_rewards: Vec<f64> = events
            .iter()
            .filter(|e| e.policy.as_deref().map(|p| p != "control").unwrap_or(false))
            .filter_map(|e| e.reward)
            .collect();

        if control_rewards.is_empty() {
            return GuardrailResult {
                check: "reward_drop".to_string(),
                value: 0.0,
                threshold: thresholds.reward_drop,
                status: GuardrailStatus::Pass,
                note: Some("no control data available".to_string()),
            };
        }

        let control_mean = mean(&control_rewards);
        let experiment_mean = mean(&experiment_rewards);
        let drop = if control_mean > 0.0 {
            (control_mean - experiment_mean) / control_mean
        } else {
            0.0
        };

        GuardrailResult {
            check: "reward_drop".to_string(),
            value: drop,
            threshold: thresholds.reward_drop,
            status: if drop >= thresholds.reward_drop {
                GuardrailStatus::Warning
            } else {
                GuardrailStatus::Pass
            },
            note: None,
        }
    }

    fn determine_overall_status(checks: &[GuardrailResult]) -> GuardrailStatus {
        if checks.iter().any(|c| c.status == GuardrailStatus::Fail) {
            GuardrailStatus::Fail
        } else if checks.iter().any(|c| c.status == GuardrailStatus::Warning) {
            GuardrailStatus::Warning
        } else {
            GuardrailStatus::Pass
        }
    }

    /// Applies cooldown and attempt-cap logic, then invokes `ExperimentManager::end`.
    async fn maybe_rollback(&self, experiment_id: &str, thresholds: &GuardrailThresholds) -> bool {
        {
            let mut state = self.rollback_state.write();
            let entry = state.entry(experiment_id.to_string()).or_insert(RollbackState {
                attempts: 0,
                last_rollback_at: None,
            });

            if let Some(last) = entry.last_rollback_at {
                if Utc::now() - last < chrono::Duration::hours(thresholds.cooldown_hours) {
                    info!(experiment_id, "guardrail rollback skipped: within cooldown");
                    return false;
                }
            }
            if entry.attempts >= thresholds.max_rollback_attempts {
                warn!(experiment_id, "guardrail rollback attempts exhausted, alerting instead");
                return false;
            }
            entry.attempts += 1;
            entry.last_rollback_at = Some(Utc::now());
        }

        match self.experiments.end(experiment_id).await {
            Ok(_) => {
                warn!(experiment_id, "experiment rolled back by guardrails");
                crate::metrics::record_rollback();
                true
            }
            Err(e) => {
                warn!(experiment_id, error = %e, "guardrail rollback failed to end experiment");
                false
            }
        }
    }

    async fn record(&self, summary: &GuardrailSummary) -> Result<()> {
        let checks_json = serde_json::to_string(&summary.checks)?;
        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO guardrail_checks
                (experiment_id, checked_at, overall_status, checks_json, should_rollback, rollback_triggered)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                summary.experiment_id,
                summary.checked_at.to_rfc3339(),
                format!("{:?}", summary.overall_status),
                checks_json,
                summary.should_rollback as i64,
                summary.rollback_triggered as i64,
            ],
        )
        .map_err(Error::from)?;
        Ok(())
    }

    /// Real guardrail check history, replacing the source's empty-list placeholder.
    pub async fn history(&self, experiment_id: &str, limit: i64) -> Result<Vec<GuardrailSummary>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT checked_at, overall_status, checks_json, should_rollback, rollback_triggered
                 FROM guardrail_checks WHERE experiment_id = ?1 ORDER BY checked_at DESC LIMIT ?2",
            )
            .map_err(Error::from)?;
        let rows = stmt
            .query_map(params![experiment_id, limit], |row| {
                let checked_raw: String = row.get(0)?;
                let status_raw: String = row.get(1)?;
                let checks_json: String = row.get(2)?;
                Ok(GuardrailSummary {
                    experiment_id: experiment_id.to_string(),
                    checked_at: DateTime::parse_from_rfc3339(&checked_raw)
                        .unwrap()
                        .with_timezone(&Utc),
                    overall_status: parse_status(&status_raw),
                    checks: serde_json::from_str(&checks_json).unwrap_or_default(),
                    should_rollback: row.get::<_, i64>(3)? != 0,
                    rollback_triggered: row.get::<_, i64>(4)? != 0,
                })
            })
            .map_err(Error::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }
}

fn parse_status(raw: &str) -> GuardrailStatus {
    match raw {
        "Fail" => GuardrailStatus::Fail,
        "Warning" => GuardrailStatus::Warning,
        _ => GuardrailStatus::Pass,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// SQLite has no native percentile aggregate (unlike the source's PostgreSQL
/// `PERCENTILE_CONT`), so this computes it in-process over the window's latencies.
fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((values.len() - 1) as f64 * p).round() as usize;
    values[idx.min(values.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_of_sorted_values() {
        let mut values = vec![10.0, 200.0, 50.0, 150.0, 100.0];
        let p95 = percentile(&mut values, 0.95);
        assert_eq!(p95, 200.0);
    }

    #[test]
    fn overall_status_escalates_to_fail() {
        let checks = vec![
            GuardrailResult {
                check: "a".to_string(),
                value: 0.0,
                threshold: 0.0,
                status: GuardrailStatus::Warning,
                note: None,
            },
            GuardrailResult {
                check: "b".to_string(),
                value: 0.0,
                threshold: 0.0,
                status: GuardrailStatus::Fail,
                note: None,
            },
        ];
        assert_eq!(GuardrailsEngine::determine_overall_status(&checks), GuardrailStatus::Fail);
    }
}
