//! C6: Reward Worker. Scheduled with the same `tokio::spawn(... interval ...)` pattern used
//! in `main.rs`.

use super::calculator::RewardCalculator;
use crate::config::Config;
use crate::context::Context;
use crate::events::EventLog;
use crate::policy::{self, Policy};
use crate::policy_state::PolicyStateStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct RewardWorker {
    events: EventLog,
    calculator: RewardCalculator,
    policy_store: PolicyStateStore,
    config: Arc<Config>,
}

impl RewardWorker {
    pub fn new(
        events: EventLog,
        calculator: RewardCalculator,
        policy_store: PolicyStateStore,
        config: Arc<Config>,
    ) -> Self {
        Self {
            events,
            calculator,
            policy_store,
            config,
        }
    }

    /// Every 5 minutes: compute rewards for events served within the last 24h that are
    /// still unrewarded, then fan policy updates grouped by `(policy, arm, ctx_key)`.
    /// One group's failure must not abort the others.
    pub async fn tick_reward(&self) {
        let pending = match self.events.pending_events(self.config.reward_window_hours).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "reward tick: failed to load pending events");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "reward tick: processing pending events");
        self.process_batch(pending).await;
    }

    /// Every 15 minutes: retry events past the retry delay that are still unrewarded.
    pub async fn tick_retry(&self) {
        let pending = match self
            .events
            .pending_events_older_than(self.config.reward_retry_delay_minutes)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "retry tick: failed to load pending events");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "retry tick: processing stale pending events");
        self.process_batch(pending).await;
    }

    /// Every hour: events older than the max age with no interaction get a terminal
    /// reward of 0.0 (no-interaction attribution).
    pub async fn tick_sweep(&self) {
        match self
            .events
            .sweep_stale_unrewarded(self.config.reward_sweep_max_age_days)
            .await
        {
            Ok(n) if n > 0 => info!(count = n, "sweep tick: closed out stale unrewarded events"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "sweep tick failed"),
        }
    }

    async fn process_batch(&self, pending: Vec<crate::events::RecommendationEvent>) {
        // batch_compute_rewards groups interactions lookups by user to avoid refetching
        // per event.
        let window = chrono::Duration::hours(self.config.reward_window_hours);

        let mut groups: HashMap<(String, String, String), Vec<f64>> = HashMap::new();

        for event in &pending {
            let movie_id = match event.movie_id {
                Some(m) => m,
                None => continue,
            };
            let interactions = match self
                .events
                .interactions_in_window(event.user_id, movie_id, event.served_at, event.served_at + window)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(event_id = event.id, error = %e, "failed to load interactions, leaving reward unset");
                    continue;
                }
            };

            let reward = self.calculator.compute(event, &interactions);
            if let Err(e) = self.events.set_reward(event.id, reward).await {
                warn!(event_id = event.id, error = %e, "failed to persist reward");
                continue;
            }

            if let (Some(policy), Some(arm_id)) = (&event.policy, &event.arm_id) {
                let ctx_key = event
                    .context
                    .clone()
                    .unwrap_or_default()
                    .hash_key();
                let key = (policy.clone(), arm_id.clone(), ctx_key.as_str().to_string());
                groups.entry(key).or_default().push(reward);
            }
        }

        // Policy updates are grouped by (policy, arm, ctx_key) and applied in order;
        // failure of one group must not abort others.
        for ((policy_name, arm_id, ctx_key), rewards) in groups {
            let policy_impl: Box<dyn Policy> =
                match policy::build(&policy_name, self.policy_store.clone(), &self.config) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(policy = %policy_name, error = %e, "skipping unknown policy during reward fan-out");
                        continue;
                    }
                };
            let ctx_key_typed = crate::context::ContextKey(ctx_key);
            for reward in rewards {
                if let Err(e) = policy_impl.update(&arm_id, reward, &ctx_key_typed).await {
                    warn!(policy = %policy_name, arm_id, error = %e, "policy update failed");
                }
            }
        }
    }
}
