//! Thompson Sampling: Beta-Bernoulli posterior sampling over per-arm success/failure counts.

use super::{pick_uniform_among_ties, require_arms, Policy, Selection};
use crate::context::ContextKey;
use crate::error::Result;
use crate::policy_state::{PolicyStateStore, StateDelta};
use async_trait::async_trait;
use rand_distr::{Beta, Distribution};

pub struct ThompsonSampling {
    store: PolicyStateStore,
}

impl ThompsonSampling {
    pub fn new(store: PolicyStateStore) -> Self {
        Self { store }
    }

    /// Propensity approximation: normalize each arm's posterior mean, clamp to
    /// `[0.01, 0.99]`. A crude but serviceable estimator; a higher-fidelity Monte-Carlo
    /// estimate over the Beta draws would work too, at more compute cost per selection.
    fn propensity(means: &[f64], chosen_idx: usize) -> f64 {
        let total: f64 = means.iter().sum();
        let raw = if total > 0.0 {
            means[chosen_idx] / total
        } else {
            1.0 / means.len() as f64
        };
        raw.clamp(0.01, 0.99)
    }
}

#[async_trait]
impl Policy for ThompsonSampling {
    fn name(&self) -> &'static str {
        "thompson"
    }

    async fn select(&self, ctx_key: &ContextKey, arms: &[String]) -> Result<Selection> {
        require_arms(arms)?;

        let mut draws = Vec::with_capacity(arms.len());
        let mut means = Vec::with_capacity(arms.len());
        let mut rng = rand::thread_rng();

        for arm in arms {
            let state = self.store.get(self.name(), arm, ctx_key).await?;
            let beta = Beta::new(state.alpha, state.beta)
                .expect("alpha and beta are always >= 1 and thus valid Beta parameters");
            draws.push(beta.sample(&mut rng));
            means.push(state.alpha / (state.alpha + state.beta));
        }

        let max_draw = draws.iter().cloned().fold(f64::MIN, f64::max);
        let tied: Vec<&String> = arms
            .iter()
            .enumerate()
            .filter(|(i, _)| (draws[*i] - max_draw).abs() < f64::EPSILON)
            .map(|(_, a)| a)
            .collect();
        let chosen = pick_uniform_among_ties(&tied);
        let chosen_idx = arms.iter().position(|a| a == chosen).unwrap();

        Ok(Selection {
            arm_id: chosen.clone(),
            p_score: Some(Self::propensity(&means, chosen_idx)),
            confidence: draws[chosen_idx],
            metadata: serde_json::json!({ "draws": draws }),
        })
    }

    async fn update(&self, arm_id: &str, reward: f64, ctx_key: &ContextKey) -> Result<()> {
        // Same unconditional alpha/beta update for binary and continuous rewards,
        // kept verbatim from the source ("moment matching" in name only) — see
        // DESIGN.md's Open Question decisions.
        self.store
            .update(
                self.name(),
                arm_id,
                ctx_key,
                StateDelta {
                    delta_count: 1,
                    delta_sum_reward: reward,
                    delta_alpha: reward,
                    delta_beta: 1.0 - reward,
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

    async fn test_policy() -> ThompsonSampling {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        let db = Db::open(path.to_str().unwrap()).unwrap();
        let store = PolicyStateStore::new(db, Duration::from_secs(300));
        ThompsonSampling::new(store)
    }

    #[tokio::test]
    async fn update_sequence_matches_scenario_s3() {
        let policy = test_policy().await;
        let ctx = Context::default().hash_key();
        for reward in [1.0, 0.0, 1.0, 1.0, 0.0] {
            policy.update("arm_a", reward, &ctx).await.unwrap();
        }
        let state = policy.store.get("thompson", "arm_a", &ctx).await.unwrap();
        assert_eq!(state.alpha, 4.0);
        assert_eq!(state.beta, 3.0);
        assert_eq!(state.count, 5);
        assert!((state.mean_reward - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn propensity_is_in_valid_range() {
        let policy = test_policy().await;
        let ctx = Context::default().hash_key();
        let arms = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let selection = policy.select(&ctx, &arms).await.unwrap();
        let p = selection.p_score.unwrap();
        assert!(p > 0.0 && p <= 1.0);
        assert!(p >= 0.01 && p <= 0.99);
    }

    #[tokio::test]
    async fn empty_arms_fails() {
        let policy = test_policy().await;
        let ctx = Context::default().hash_key();
        assert!(policy.select(&ctx, &[]).await.is_err());
    }
}
