//! Reads back an experiment's recommendation events through the analytics
//! query layer (C9) and prints a per-arm and overall summary, the offline
//! counterpart to the `/experiments/{id}/analytics/*` endpoints.
//!
//! # Usage
//!
//! ```bash
//! offline_evaluator --experiment-id offline-ml1m-20260727T120000
//! ```

use banditserve::analytics::AnalyticsQueryLayer;
use banditserve::config::Config;
use banditserve::db::Db;
use banditserve::events::EventLog;
use banditserve::experiments::ExperimentManager;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "Summarize an experiment's recorded events")]
struct Args {
    #[arg(long)]
    experiment_id: String,

    #[arg(long)]
    policy: Option<String>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
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
    let experiments = ExperimentManager::new(db.clone(), Duration::from_secs(config.assignment_cache_ttl_secs));
    let analytics = AnalyticsQueryLayer::new(db, events, experiments, config);

    let summary = match analytics.summary(&args.experiment_id).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error computing summary: {e}");
            return std::process::ExitCode::from(2);
        }
    };
    let arms = match analytics.arms(&args.experiment_id, args.policy.as_deref()).await {
        Ok(a) => a,
        Err(e) => {
            eprintln!("error computing arm stats: {e}");
            return std::process::ExitCode::from(2);
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary).unwrap());
    println!("{}", serde_json::to_string_pretty(&arms).unwrap());

    if summary.total_serves == 0 {
        eprintln!("warning: experiment {} has no recorded serves", args.experiment_id);
        return std::process::ExitCode::from(1);
    }
    std::process::ExitCode::SUCCESS
}
