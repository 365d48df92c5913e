//! C8: Decision Engine. Rolling-window statistical comparison producing ship/iterate/kill
//! calls.

use crate::config::Config;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::experiments::{Experiment, ExperimentManager, ExperimentStatus};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use tracing::warn;

pub const BANDIT_POLICIES: &[&str] = &["thompson", "egreedy", "ucb"];
pub const CONTROL_POLICY: &str = "control";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Ship,
    Iterate,
    Kill,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::Ship => "SHIP",
            DecisionType::Iterate => "ITERATE",
            DecisionType::Kill => "KILL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyPerformance {
    pub policy: String,
    pub count: i64,
    pub sum_reward: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub samples: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResult {
    pub experiment_id: String,
    pub decision: DecisionType,
    pub confidence: f64,
    pub window_days: i64,
    pub best_policy: Option<String>,
    pub uplift_vs_control: Option<f64>,
    pub statistically_significant: bool,
    pub reasoning: String,
    pub recommendations: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DecisionEngine {
    db: Db,
    events: EventLog,
    experiments: ExperimentManager,
    config: std::sync::Arc<Config>,
}

impl DecisionEngine {
    pub fn new(
        db: Db,
        events: EventLog,
        experiments: ExperimentManager,
        config: std::sync::Arc<Config>,
    ) -> Self {
        Self {
            db,
            events,
            experiments,
            config,
        }
    }

    /// Daily job: iterate all active experiments, log and continue on per-experiment
    /// failure.
    pub async fn make_daily_decisions(&self) -> Vec<DecisionResult> {
        let experiments = match self.experiments.list(Some(ExperimentStatus::Active)).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "decision engine: failed to list active experiments");
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        for experiment in experiments {
            match self.analyze(&experiment).await {
                Ok(decision) => {
                    if let Err(e) = self.record(&decision).await {
                        warn!(experiment_id = %experiment.id, error = %e, "failed to persist decision");
                    }
                    results.push(decision);
                }
                Err(e) => {
                    warn!(experiment_id = %experiment.id, error = %e, "decision analysis failed, continuing");
                }
            }
        }
        results
    }

    pub async fn analyze(&self, experiment: &Experiment) -> Result<DecisionResult> {
        let window_days = self.analysis_window(experiment);
        let window_start = Utc::now() - chrono::Duration::days(window_days);

        let mut performances = Vec::new();
        for policy in BANDIT_POLICIES.iter().chain(std::iter::once(&CONTROL_POLICY)) {
            if let Some(perf) = self.policy_performance(&experiment.id, policy, window_start).await? {
                performances.push(perf);
            }
        }

        let control = performances.iter().find(|p| p.policy == CONTROL_POLICY);
        let best = performances
            .iter()
            .filter(|p| p.policy != CONTROL_POLICY)
            .max_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap());

        let (uplift, p_value, best_policy) = match (control, best) {
            (Some(control), Some(best)) if control.mean > 0.0 => {
                let uplift = (best.mean - control.mean) / control.mean;
                let p_value = welch_t_test_p_value(&best.samples, &control.samples);
                (Some(uplift), Some(p_value), Some(best.policy.clone()))
            }
            _ => (None, None, best.map(|b| b.policy.clone())),
        };

        let decision = self.decide(window_days, uplift, p_value, best_policy.as_deref());

        Ok(DecisionResult {
            experiment_id: experiment.id.clone(),
            decision: decision.0,
            confidence: decision.1,
            window_days,
            best_policy,
            uplift_vs_control: uplift,
            statistically_significant: p_value.map(|p| p < self.config.decision_ship_p_value_threshold).unwrap_or(false),
            reasoning: decision.2,
            recommendations: decision.3,
            analyzed_at: Utc::now(),
        })
    }

    /// Clamp the analysis window to `[min, max]` days, bounded by experiment age.
    fn analysis_window(&self, experiment: &Experiment) -> i64 {
        let age_days = (Utc::now() - experiment.start_at).num_days().max(0);
        age_days.clamp(self.config.decision_min_window_days, self.config.decision_max_window_days)
    }

    async fn policy_performance(
        &self,
        experiment_id: &str,
        policy: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<PolicyPerformance>> {
        let events = self
            .events
            .events_for_experiment(experiment_id, window_start, Utc::now(), Some(policy), 100_000, 0)
            .await?;
        let samples: Vec<f64> = events.iter().filter_map(|e| e.reward).collect();

        if (samples.len() as i64) < self.config.decision_min_events_per_policy {
            return Ok(None);
        }

        let count = samples.len() as i64;
        let sum_reward: f64 = samples.iter().sum();
        let mean = sum_reward / count as f64;
        let variance = if count > 1 {
            samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (count - 1) as f64
        } else {
            0.0
        };
        let std_dev = variance.sqrt();
        let (ci_low, ci_high) = confidence_interval(mean, std_dev, count);

        Ok(Some(PolicyPerformance {
            policy: policy.to_string(),
            count,
            sum_reward,
            mean,
            std_dev,
            ci_low,
            ci_high,
            samples,
        }))
    }

    /// Ship/iterate/kill rules, checked in order of precedence.
    fn decide(
        &self,
        window_days: i64,
        uplift: Option<f64>,
        p_value: Option<f64>,
        best_policy: Option<&str>,
    ) -> (DecisionType, f64, String, Vec<String>) {
        let min_window = self.config.decision_min_window_days;
        let max_window = self.config.decision_max_window_days;
        let ship_uplift = self.config.decision_ship_uplift_threshold;
        let ship_p = self.config.decision_ship_p_value_threshold;
        let kill_uplift = self.config.decision_kill_uplift_threshold;

        if window_days < min_window {
            return (
                DecisionType::Iterate,
                0.0,
                format!("analysis window ({window_days}d) below minimum ({min_window}d)"),
                vec!["continue collecting data".to_string()],
            );
        }

        let significant = uplift.unwrap_or(0.0) >= ship_uplift
            && p_value.map(|p| p < ship_p).unwrap_or(false);
        let best_is_bandit = best_policy.map(|p| BANDIT_POLICIES.contains(&p)).unwrap_or(false);

        if window_days >= max_window {
            if significant {
                return (
                    DecisionType::Ship,
                    0.8,
                    "max window reached with significant uplift".to_string(),
                    vec!["ship winning policy".to_string()],
                );
            }
            return (
                DecisionType::Kill,
                0.9,
                "max window reached without significant uplift".to_string(),
                vec!["end experiment".to_string()],
            );
        }

        if significant && best_is_bandit {
            let confidence = (0.7 + 10.0 * (uplift.unwrap_or(0.0) - ship_uplift)).min(0.95);
            return (
                DecisionType::Ship,
                confidence,
                "uplift significant and exceeds threshold".to_string(),
                vec!["ship winning policy".to_string()],
            );
        }

        if uplift.map(|u| u <= kill_uplift).unwrap_or(false) {
            return (
                DecisionType::Kill,
                0.8,
                "uplift below kill threshold".to_string(),
                vec!["end experiment".to_string()],
            );
        }

        (
            DecisionType::Iterate,
            0.5,
            "inconclusive, continue collecting data".to_string(),
            vec!["continue collecting data".to_string()],
        )
    }

    async fn record(&self, decision: &DecisionResult) -> Result<()> {
        let recommendations_json = serde_json::to_string(&decision.recommendations)?;
        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO decision_records
                (experiment_id, decision, confidence, window_days, best_policy, uplift_vs_control,
                 significant, reasoning, recommendations_json, analyzed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                decision.experiment_id,
                decision.decision.as_str(),
                decision.confidence,
                decision.window_days,
                decision.best_policy,
                decision.uplift_vs_control,
                decision.statistically_significant as i64,
                decision.reasoning,
                recommendations_json,
                decision.analyzed_at.to_rfc3339(),
            ],
        )
        .map_err(Error::from)?;
        Ok(())
    }

    pub async fn history(&self, experiment_id: &str, limit: i64) -> Result<Vec<DecisionResult>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT decision, confidence, window_days, best_policy, uplift_vs_control,
                        significant, reasoning, recommendations_json, analyzed_at
                 FROM decision_records WHERE experiment_id = ?1 ORDER BY analyzed_at DESC LIMIT ?2",
            )
            .map_err(Error::from)?;
        let rows = stmt
            .query_map(params![experiment_id, limit], |row| {
                let decision_raw: String = row.get(0)?;
                let recommendations_json: String = row.get(7)?;
                let analyzed_raw: String = row.get(8)?;
                Ok(DecisionResult {
                    experiment_id: experiment_id.to_string(),
                    decision: parse_decision(&decision_raw),
                    confidence: row.get(1)?,
                    window_days: row.get(2)?,
                    best_policy: row.get(3)?,
                    uplift_vs_control: row.get(4)?,
                    statistically_significant: row.get::<_, i64>(5)? != 0,
                    reasoning: row.get(6)?,
                    recommendations: serde_json::from_str(&recommendations_json).unwrap_or_default(),
                    analyzed_at: DateTime::parse_from_rfc3339(&analyzed_raw)
                        .unwrap()
                        .with_timezone(&Utc),
                })
            })
            .map_err(Error::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }
}

fn parse_decision(raw: &str) -> DecisionType {
    match raw {
        "SHIP" => DecisionType::Ship,
        "KILL" => DecisionType::Kill,
        _ => DecisionType::Iterate,
    }
}

/// 95% CI: Student-t for `n < 30`, normal approximation otherwise.
fn confidence_interval(mean: f64, std_dev: f64, n: i64) -> (f64, f64) {
    if n < 2 {
        return (mean, mean);
    }
    let se = std_dev / (n as f64).sqrt();
    let critical = if n < 30 {
        StudentsT::new(0.0, 1.0, (n - 1) as f64)
            .map(|t| t.inverse_cdf(0.975))
            .unwrap_or(1.96)
    } else {
        Normal::new(0.0, 1.0)
            .map(|n| n.inverse_cdf(0.975))
            .unwrap_or(1.96)
    };
    (mean - critical * se, mean + critical * se)
}

/// Welch's t-test p-value (two-sided), bounding each sample set to 10,000 draws as the
/// source does before calling `scipy.stats.ttest_ind`.
fn welch_t_test_p_value(treatment: &[f64], control: &[f64]) -> f64 {
    let t = truncate(treatment, 10_000);
    let c = truncate(control, 10_000);
    if t.len() < 2 || c.len() < 2 {
        return 1.0;
    }

    let mean_t = t.iter().sum::<f64>() / t.len() as f64;
    let mean_c = c.iter().sum::<f64>() / c.len() as f64;
    let var_t = t.iter().map(|x| (x - mean_t).powi(2)).sum::<f64>() / (t.len() - 1) as f64;
    let var_c = c.iter().map(|x| (x - mean_c).powi(2)).sum::<f64>() / (c.len() - 1) as f64;

    let se = (var_t / t.len() as f64 + var_c / c.len() as f64).sqrt();
    if se == 0.0 {
        return 1.0;
    }
    let t_stat = (mean_t - mean_c) / se;

    let df_num = (var_t / t.len() as f64 + var_c / c.len() as f64).powi(2);
    let df_den = (var_t / t.len() as f64).powi(2) / (t.len() - 1) as f64
        + (var_c / c.len() as f64).powi(2) / (c.len() - 1) as f64;
    let df = if df_den > 0.0 { df_num / df_den } else { (t.len() + c.len() - 2) as f64 };

    match StudentsT::new(0.0, 1.0, df.max(1.0)) {
        Ok(dist) => 2.0 * (1.0 - dist.cdf(t_stat.abs())),
        Err(_) => 1.0,
    }
}

fn truncate(values: &[f64], max_len: usize) -> Vec<f64> {
    if values.len() <= max_len {
        values.to_vec()
    } else {
        values[..max_len].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_interval_uses_student_t_for_small_n() {
        let (low, high) = confidence_interval(0.5, 0.1, 10);
        assert!(low < 0.5 && high > 0.5);
    }

    #[test]
    fn identical_distributions_have_high_p_value() {
        let samples = vec![0.5; 50];
        let p = welch_t_test_p_value(&samples, &samples);
        assert!(p > 0.9);
    }

    #[test]
    fn clearly_different_distributions_have_low_p_value() {
        let treatment: Vec<f64> = (0..200).map(|_| 0.9).collect();
        let control: Vec<f64> = (0..200).map(|_| 0.1).collect();
        // add tiny noise so variance isn't exactly zero
        let treatment: Vec<f64> = treatment.iter().enumerate().map(|(i, v)| v + (i as f64 % 3.0) * 0.001).collect();
        let control: Vec<f64> = control.iter().enumerate().map(|(i, v)| v + (i as f64 % 3.0) * 0.001).collect();
        let p = welch_t_test_p_value(&treatment, &control);
        assert!(p < 0.01);
    }
}
