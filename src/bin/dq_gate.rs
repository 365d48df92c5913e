//! Data-quality gate: schema and range checks on `recommendation_events`,
//! meant to run in CI or a pre-deploy hook against a snapshot of the database.
//!
//! Checks:
//! - required columns are present (schema drift)
//! - `p_score` is within `(0, 1]` where set (propensity scores are never zero)
//! - `reward` is within `[0, 1]` where set
//! - `served_at` parses as RFC3339 for every row
//!
//! # Exit codes
//!
//! - 0: all checks passed
//! - 1: one or more checks failed

use banditserve::config::Config;
use banditserve::db::Db;
use chrono::DateTime;
use clap::Parser;
use rusqlite::params;

#[derive(Parser, Debug)]
#[command(about = "Run data-quality checks against the recommendation event log")]
struct Args {
    #[arg(long)]
    experiment_id: Option<String>,
}

struct CheckResult {
    name: &'static str,
    passed: bool,
    detail: String,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error loading configuration: {e}");
            return std::process::ExitCode::from(1);
        }
    };
    let db = match Db::open(&config.database_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("error opening database: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    let conn = db.conn.lock().await;

    let schema_check = {
        let mut stmt = conn.prepare("PRAGMA table_info(recommendation_events)").unwrap();
        let cols: Vec<String> = stmt
            .query_map(params![], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        let required = ["id", "user_id", "algorithm", "served_at", "reward", "p_score"];
        let missing: Vec<&str> = required.iter().filter(|c| !cols.contains(&c.to_string())).copied().collect();
        CheckResult {
            name: "schema",
            passed: missing.is_empty(),
            detail: if missing.is_empty() {
                "all required columns present".to_string()
            } else {
                format!("missing columns: {missing:?}")
            },
        }
    };

    let filter_sql = if args.experiment_id.is_some() {
        "WHERE experiment_id = ?1"
    } else {
        ""
    };
    let filter_param: &[&dyn rusqlite::ToSql] = match &args.experiment_id {
        Some(id) => &[id],
        None => &[],
    };

    let p_score_violations: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM recommendation_events {filter_sql} \
                 {conj} p_score IS NOT NULL AND (p_score <= 0.0 OR p_score > 1.0)",
                conj = if filter_sql.is_empty() { "WHERE" } else { "AND" },
            ),
            filter_param,
            |row| row.get(0),
        )
        .unwrap_or(-1);
    let p_score_check = CheckResult {
        name: "p_score_range",
        passed: p_score_violations == 0,
        detail: format!("{p_score_violations} rows with p_score outside (0, 1]"),
    };

    let reward_violations: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM recommendation_events {filter_sql} \
                 {conj} reward IS NOT NULL AND (reward < 0.0 OR reward > 1.0)",
                conj = if filter_sql.is_empty() { "WHERE" } else { "AND" },
            ),
            filter_param,
            |row| row.get(0),
        )
        .unwrap_or(-1);
    let reward_check = CheckResult {
        name: "reward_range",
        passed: reward_violations == 0,
        detail: format!("{reward_violations} rows with reward outside [0, 1]"),
    };

    let served_at_check = {
        let mut stmt = conn
            .prepare(&format!("SELECT served_at FROM recommendation_events {filter_sql}"))
            .unwrap();
        let rows: Vec<String> = stmt
            .query_map(filter_param, |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        let bad = rows.iter().filter(|s| DateTime::parse_from_rfc3339(s).is_err()).count();
        CheckResult {
            name: "served_at_parseable",
            passed: bad == 0,
            detail: format!("{bad} rows with unparseable served_at"),
        }
    };
    drop(conn);

    let checks = [schema_check, p_score_check, reward_check, served_at_check];
    let mut all_passed = true;
    for check in &checks {
        println!(
            "[{}] {}: {}",
            if check.passed { "PASS" } else { "FAIL" },
            check.name,
            check.detail
        );
        all_passed &= check.passed;
    }

    if all_passed {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::from(1)
    }
}
