//! C3: Policy Engine. Three concrete policies behind one capability set, dispatched by a
//! name-keyed registry instead of class inheritance.

mod epsilon_greedy;
mod thompson;
mod ucb1;

pub use epsilon_greedy::EpsilonGreedy;
pub use thompson::ThompsonSampling;
pub use ucb1::Ucb1;

use crate::context::ContextKey;
use crate::error::{Error, Result};
use crate::policy_state::{PolicyStateStore, StateDelta};
use async_trait::async_trait;

/// Outcome of a single `select` call.
#[derive(Debug, Clone)]
pub struct Selection {
    pub arm_id: String,
    pub p_score: Option<f64>,
    pub confidence: f64,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn select(&self, ctx_key: &ContextKey, arms: &[String]) -> Result<Selection>;

    async fn update(&self, arm_id: &str, reward: f64, ctx_key: &ContextKey) -> Result<()>;
}

/// Name-keyed registry, letting callers construct a policy on demand without the worker
/// depending on concrete policy types.
pub fn build(name: &str, store: PolicyStateStore, config: &crate::config::Config) -> Result<Box<dyn Policy>> {
    match name {
        "thompson" => Ok(Box::new(ThompsonSampling::new(store))),
        "egreedy" | "epsilon_greedy" => Ok(Box::new(EpsilonGreedy::new(
            store,
            config.epsilon_greedy_epsilon,
        ))),
        "ucb" | "ucb1" => Ok(Box::new(Ucb1::new(store, config.ucb1_min_pulls))),
        other => Err(Error::InvalidArgument(format!("unknown policy: {other}"))),
    }
}

pub(crate) fn require_arms(arms: &[String]) -> Result<()> {
    if arms.is_empty() {
        return Err(Error::InvalidArgument("arms list must not be empty".to_string()));
    }
    Ok(())
}

/// Ties in argmax selection are broken by uniform random choice over tied arms.
pub(crate) fn pick_uniform_among_ties<'a>(tied: &'a [&'a String]) -> &'a String {
    use rand::Rng;
    if tied.len() == 1 {
        return tied[0];
    }
    let idx = rand::thread_rng().gen_range(0..tied.len());
    tied[idx]
}
