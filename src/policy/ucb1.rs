//! UCB1: upper-confidence-bound arm selection, optimistic under uncertainty.

use super::{pick_uniform_among_ties, require_arms, Policy, Selection};
use crate::context::ContextKey;
use crate::error::Result;
use crate::policy_state::{PolicyStateStore, StateDelta};
use async_trait::async_trait;

pub struct Ucb1 {
    store: PolicyStateStore,
    min_pulls: u64,
}

impl Ucb1 {
    pub fn new(store: PolicyStateStore, min_pulls: u64) -> Self {
        Self { store, min_pulls }
    }

    fn ucb_score(mean: f64, count: i64, total_pulls: i64, min_pulls: u64) -> f64 {
        if (count as u64) < min_pulls {
            return f64::INFINITY;
        }
        mean + ((2.0 * (total_pulls.max(1) as f64).ln()) / count as f64).sqrt()
    }
}

#[async_trait]
impl Policy for Ucb1 {
    fn name(&self) -> &'static str {
        "ucb1"
    }

    async fn select(&self, ctx_key: &ContextKey, arms: &[String]) -> Result<Selection> {
        require_arms(arms)?;

        let mut counts = Vec::with_capacity(arms.len());
        let mut means = Vec::with_capacity(arms.len());
        for arm in arms {
            let state = self.store.get(self.name(), arm, ctx_key).await?;
            counts.push(state.count);
            means.push(state.mean_reward);
        }
        let total_pulls: i64 = counts.iter().sum();

        let scores: Vec<f64> = counts
            .iter()
            .zip(means.iter())
            .map(|(&c, &m)| Self::ucb_score(m, c, total_pulls, self.min_pulls))
            .collect();

        let max_score = scores.iter().cloned().fold(f64::MIN, f64::max);
        let tied: Vec<&String> = arms
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                if max_score.is_infinite() {
                    scores[*i].is_infinite()
                } else {
                    (scores[*i] - max_score).abs() < f64::EPSILON
                }
            })
            .map(|(_, a)| a)
            .collect();
        let chosen = pick_uniform_among_ties(&tied);
        let chosen_idx = arms.iter().position(|a| a == chosen).unwrap();

        Ok(Selection {
            arm_id: chosen.clone(),
            // UCB1 admits no analytic propensity; a reimplementer must not fabricate one
            //.
            p_score: None,
            confidence: scores[chosen_idx],
            metadata: serde_json::json!({ "scores": scores, "total_pulls": total_pulls }),
        })
    }

    async fn update(&self, arm_id: &str, reward: f64, ctx_key: &ContextKey) -> Result<()> {
        self.store
            .update(
                self.name(),
                arm_id,
                ctx_key,
                StateDelta {
                    delta_count: 1,
                    delta_sum_reward: reward,
                    delta_alpha: 0.0,
                    delta_beta: 0.0,
                    selected_at: Some(chrono::Utc::now()),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::db::Db;
    use std::time::Duration;

    async fn test_policy(min_pulls: u64) -> Ucb1 {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        let db = Db::open(path.to_str().unwrap()).unwrap();
        let store = PolicyStateStore::new(db, Duration::from_secs(300));
        Ucb1::new(store, min_pulls)
    }

    #[tokio::test]
    async fn cold_arms_are_explored_first() {
        let policy = test_policy(1).await;
        let ctx = Context::default().hash_key();
        let arms = vec!["a".to_string(), "b".to_string()];
        policy.update("a", 0.5, &ctx).await.unwrap();
        // "b" has count 0 < min_pulls, so its UCB score is +inf and must win.
        let selection = policy.select(&ctx, &arms).await.unwrap();
        assert_eq!(selection.arm_id, "b");
        assert!(selection.p_score.is_none());
    }

    #[tokio::test]
    async fn ucb_gap_shrinks_as_total_pulls_grows_for_fixed_arm_pulls() {
        // Invariant 5: for fixed arm_pulls, UCB - mean is non-increasing in
        // total_pulls once arm_pulls > min_pulls.
        let gap_at = |total_pulls: i64, arm_pulls: i64| {
            Ucb1::ucb_score(0.0, arm_pulls, total_pulls, 1)
        };
        let gap_small = gap_at(10, 5);
        let gap_large = gap_at(100, 5);
        assert!(gap_large <= gap_small);
    }
}
