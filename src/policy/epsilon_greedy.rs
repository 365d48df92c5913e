//! ε-greedy policy: explore uniformly at random with probability ε, otherwise exploit the
//! best-known arm.

use super::{pick_uniform_among_ties, require_arms, Policy, Selection};
use crate::context::ContextKey;
use crate::error::Result;
use crate::policy_state::{PolicyStateStore, StateDelta};
use async_trait::async_trait;
use rand::Rng;

pub struct EpsilonGreedy {
    store: PolicyStateStore,
    epsilon: f64,
}

impl EpsilonGreedy {
    pub fn new(store: PolicyStateStore, epsilon: f64) -> Self {
        Self { store, epsilon }
    }
}

#[async_trait]
impl Policy for EpsilonGreedy {
    fn name(&self) -> &'static str {
        "egreedy"
    }

    async fn select(&self, ctx_key: &ContextKey, arms: &[String]) -> Result<Selection> {
        require_arms(arms)?;

        let mut means = Vec::with_capacity(arms.len());
        for arm in arms {
            let state = self.store.get(self.name(), arm, ctx_key).await?;
            means.push(state.mean_reward);
        }

        let max_mean = means.iter().cloned().fold(f64::MIN, f64::max);
        let tied: Vec<&String> = arms
            .iter()
            .enumerate()
            .filter(|(i, _)| (means[*i] - max_mean).abs() < f64::EPSILON)
            .map(|(_, a)| a)
            .collect();
        let k = tied.len() as f64;
        let n = arms.len() as f64;

        let mut rng = rand::thread_rng();
        let explore = rng.gen_bool(self.epsilon);

        let chosen = if explore {
            &arms[rng.gen_range(0..arms.len())]
        } else {
            pick_uniform_among_ties(&tied)
        };

        let is_best = tied.iter().any(|a| *a == chosen);
        let p_score = if is_best {
            ((1.0 - self.epsilon) + self.epsilon * k / n) / k
        } else {
            self.epsilon / n
        };

        Ok(Selection {
            arm_id: chosen.clone(),
            p_score: Some(p_score.clamp(f64::EPSILON, 1.0)),
            confidence: if is_best { max_mean } else { means[arms.iter().position(|a| a == chosen).unwrap()] },
            metadata: serde_json::json!({ "explored": explore, "means": means }),
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

    async fn test_policy(epsilon: f64) -> EpsilonGreedy {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        let db = Db::open(path.to_str().unwrap()).unwrap();
        let store = PolicyStateStore::new(db, Duration::from_secs(300));
        EpsilonGreedy::new(store, epsilon)
    }

    #[tokio::test]
    async fn exploitation_rate_matches_scenario_s4() {
        let policy = test_policy(0.1).await;
        let ctx = Context::default().hash_key();
        let arms = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        // Seed means: a=0.8, b=c=0.5, via many updates.
        for _ in 0..40 {
            policy.update("a", 0.8, &ctx).await.unwrap();
            policy.update("b", 0.5, &ctx).await.unwrap();
            policy.update("c", 0.5, &ctx).await.unwrap();
        }

        let mut counts = std::collections::HashMap::new();
        for _ in 0..10_000 {
            let selection = policy.select(&ctx, &arms).await.unwrap();
            *counts.entry(selection.arm_id).or_insert(0) += 1;
        }

        let p_a = *counts.get("a").unwrap_or(&0) as f64 / 10_000.0;
        assert!(p_a >= 0.85 && p_a <= 0.97, "P(a) = {p_a}");
    }

    #[tokio::test]
    async fn empty_arms_fails() {
        let policy = test_policy(0.1).await;
        let ctx = Context::default().hash_key();
        assert!(policy.select(&ctx, &[]).await.is_err());
    }
}
