//! Replays a synthetic MovieLens-1M-shaped stream of selections and rewards
//! against the bandit policies, writing events into the same table the live
//! server reads from, tagged under a single synthetic experiment id.
//!
//! This drives the Policy Engine and Event Log exactly as `/select` and the
//! reward worker do, but in a tight local loop instead of over HTTP, so large
//! offline evaluation runs don't pay request/response overhead.
//!
//! # Usage
//!
//! ```bash
//! offline_replay --users 500 --movies 200 --rounds 20000 --policy thompson
//! ```

use banditserve::config::Config;
use banditserve::context::Context;
use banditserve::db::Db;
use banditserve::events::{EventLog, NewEvent};
use banditserve::policy;
use banditserve::policy_state::PolicyStateStore;
use chrono::Utc;
use clap::Parser;
use rand::Rng;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "Replay a synthetic interaction stream against a bandit policy")]
struct Args {
    #[arg(long, default_value_t = 500)]
    users: u32,

    #[arg(long, default_value_t = 200)]
    movies: u32,

    #[arg(long, default_value_t = 20_000)]
    rounds: u64,

    #[arg(long, default_value = "thompson")]
    policy: String,

    #[arg(long, default_value_t = 10)]
    arms_per_round: u32,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error loading configuration: {e}");
            return std::process::ExitCode::from(2);
        }
    };
    let db = match Db::open(&config.database_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("error opening database: {e}");
            return std::process::ExitCode::from(2);
        }
    };

    let events = EventLog::new(db.clone());
    let policy_store = PolicyStateStore::new(db, Duration::from_secs(config.policy_state_cache_ttl_secs));
    let policy_impl = match policy::build(&args.policy, policy_store, &config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error building policy: {e}");
            return std::process::ExitCode::from(2);
        }
    };

    let experiment_id = format!("offline-ml1m-{}", Utc::now().format("%Y%m%dT%H%M%S"));
    let arm_catalog: Vec<String> = (0..args.movies).map(|m| format!("movie-{m}")).collect();

    let mut rng = rand::thread_rng();
    let mut rewarded = 0u64;
    for round in 0..args.rounds {
        let user_id = rng.gen_range(0..args.users) as i64;
        let n_arms = (args.arms_per_round as usize).min(arm_catalog.len()).max(1);
        let start = rng.gen_range(0..arm_catalog.len());
        let arms: Vec<String> = (0..n_arms)
            .map(|i| arm_catalog[(start + i) % arm_catalog.len()].clone())
            .collect();

        let context = Context::default();
        let ctx_key = context.hash_key();
        let selection = match policy_impl.select(&ctx_key, &arms).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("round {round}: selection failed: {e}");
                continue;
            }
        };

        // Synthetic reward: fixed per-arm click-through baseline plus noise, standing
        // in for the ratings MovieLens-1M would supply.
        let arm_bias = (selection.arm_id.as_bytes().iter().map(|b| *b as u64).sum::<u64>() % 100) as f64 / 100.0;
        let reward = if rng.gen::<f64>() < 0.1 + 0.2 * arm_bias { 1.0 } else { 0.0 };

        let event_id = match events
            .append(NewEvent {
                user_id,
                movie_id: selection.arm_id.strip_prefix("movie-").and_then(|s| s.parse().ok()),
                algorithm: args.policy.clone(),
                position: Some(0),
                score: Some(selection.confidence),
                context: Some(context),
                experiment_id: Some(experiment_id.clone()),
                policy: Some(args.policy.clone()),
                arm_id: Some(selection.arm_id.clone()),
                p_score: selection.p_score,
                latency_ms: Some(0.0),
                served_at: Utc::now(),
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                eprintln!("round {round}: append failed: {e}");
                continue;
            }
        };

        if let Err(e) = policy_impl.update(&selection.arm_id, reward, &ctx_key).await {
            eprintln!("round {round}: policy update failed: {e}");
        }
        if let Err(e) = events.set_reward(event_id, reward).await {
            eprintln!("round {round}: set_reward failed: {e}");
        }
        rewarded += 1;
    }

    println!("experiment_id={experiment_id}");
    println!("rounds_completed={rewarded}/{}", args.rounds);
    std::process::ExitCode::SUCCESS
}
