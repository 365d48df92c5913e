//! Launches (or reconfigures) an online experiment by calling the same
//! `ExperimentManager` the server uses, against the shared SQLite database.
//!
//! # Usage
//!
//! ```bash
//! launch_online_experiment --name "ranker-v2" \
//!     --default-policy control --policies thompson,egreedy,ucb \
//!     --traffic-pct 0.2
//! ```
//!
//! # Exit codes
//!
//! - 0: experiment created
//! - 2: argument or validation error

use banditserve::config::Config;
use banditserve::db::Db;
use banditserve::experiments::{ExperimentManager, NewExperiment};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "Create an online bandit experiment")]
struct Args {
    #[arg(long)]
    name: String,

    #[arg(long)]
    start_at: Option<DateTime<Utc>>,

    #[arg(long)]
    end_at: Option<DateTime<Utc>>,

    #[arg(long, default_value_t = 1.0)]
    traffic_pct: f64,

    #[arg(long)]
    default_policy: String,

    #[arg(long, value_delimiter = ',')]
    policies: Vec<String>,

    #[arg(long)]
    notes: Option<String>,
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
    let manager = ExperimentManager::new(db, Duration::from_secs(config.assignment_cache_ttl_secs));

    let experiment = manager
        .create(NewExperiment {
            name: args.name,
            start_at: args.start_at.unwrap_or_else(Utc::now),
            end_at: args.end_at,
            traffic_pct: args.traffic_pct,
            default_policy: args.default_policy,
            policies: args.policies,
            notes: args.notes,
        })
        .await;

    match experiment {
        Ok(experiment) => {
            println!("{}", serde_json::to_string_pretty(&experiment).unwrap());
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error creating experiment: {e}");
            std::process::ExitCode::from(2)
        }
    }
}
