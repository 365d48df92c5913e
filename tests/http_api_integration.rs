//! End-to-end tests against the Axum router: create an experiment, select an
//! arm, track an interaction, and read back analytics, all through
//! `tower::ServiceExt::oneshot` against an in-process app backed by a
//! tempfile-backed SQLite database.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use banditserve::analytics::AnalyticsQueryLayer;
use banditserve::api::{self, AppState};
use banditserve::config::Config;
use banditserve::db::Db;
use banditserve::decisions::DecisionEngine;
use banditserve::events::EventLog;
use banditserve::experiments::ExperimentManager;
use banditserve::guardrails::{GuardrailThresholds, GuardrailsEngine};
use banditserve::policy_state::PolicyStateStore;
use banditserve::rewards::{RewardCalculator, RewardMode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_config() -> Config {
    // Matches Config::from_env()'s defaults; only database_path is overridden per test.
    Config {
        database_path: String::new(),
        bind_addr: "0.0.0.0".to_string(),
        port: 0,
        reward_window_hours: 24,
        binary_threshold: 0.5,
        rating_threshold_positive: 4.0,
        rating_threshold_negative: 2.0,
        reward_tick_interval_secs: 300,
        reward_retry_interval_secs: 900,
        reward_sweep_interval_secs: 3600,
        guardrails_tick_interval_secs: 300,
        decisions_tick_interval_secs: 86400,
        reward_sweep_max_age_days: 30,
        reward_retry_delay_minutes: 5,
        guardrail_error_rate_threshold: 0.01,
        guardrail_latency_p95_threshold_ms: 120.0,
        guardrail_arm_concentration_threshold: 0.5,
        guardrail_reward_drop_threshold: 0.05,
        guardrail_window_minutes: 30,
        guardrail_cooldown_hours: 1,
        guardrail_max_rollback_attempts: 3,
        decision_min_window_days: 7,
        decision_max_window_days: 14,
        decision_min_events_per_policy: 1000,
        decision_ship_uplift_threshold: 0.03,
        decision_ship_p_value_threshold: 0.05,
        decision_kill_uplift_threshold: -0.05,
        policy_state_cache_ttl_secs: 300,
        assignment_cache_ttl_secs: 3600,
        epsilon_greedy_epsilon: 0.1,
        ucb1_min_pulls: 1,
    }
}

fn test_app() -> axum::Router {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    std::mem::forget(dir);

    let mut config = test_config();
    config.database_path = path.to_str().unwrap().to_string();
    let config = Arc::new(config);

    let db = Db::open(&config.database_path).unwrap();
    let events = EventLog::new(db.clone());
    let policy_store = PolicyStateStore::new(db.clone(), Duration::from_secs(config.policy_state_cache_ttl_secs));
    let experiments = ExperimentManager::new(db.clone(), Duration::from_secs(config.assignment_cache_ttl_secs));
    let reward_calculator = RewardCalculator::new(RewardMode::Binary, 0.5, 4.0, 2.0);
    let guardrails = GuardrailsEngine::new(
        db.clone(),
        events.clone(),
        experiments.clone(),
        GuardrailThresholds::from_config(&config),
    );
    let decisions = DecisionEngine::new(db.clone(), events.clone(), experiments.clone(), config.clone());
    let analytics = AnalyticsQueryLayer::new(db, events.clone(), experiments.clone(), config.clone());
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();

    let state = AppState {
        events,
        policy_store,
        experiments,
        reward_calculator,
        guardrails,
        decisions,
        analytics,
        config,
        prometheus,
    };
    api::router(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_check_responds_ok() {
    let app = test_app();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_select_and_track_round_trip() {
    let app = test_app();

    let create_body = json!({
        "name": "ranker-v2",
        "start_at": "2026-01-01T00:00:00Z",
        "end_at": null,
        "traffic_pct": 1.0,
        "default_policy": "control",
        "policies": ["thompson", "egreedy", "ucb"],
        "notes": null,
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/experiments")
                .header("content-type", "application/json")
                .body(Body::from(create_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let experiment = body_json(response).await;
    let experiment_id = experiment["id"].as_str().unwrap().to_string();

    let select_body = json!({
        "experiment_id": experiment_id,
        "user_id": 42,
        "movie_id": 7,
        "arms": ["movie-1", "movie-2", "movie-3"],
        "context": {},
        "position": 0,
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/select")
                .header("content-type", "application/json")
                .body(Body::from(select_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let selection = body_json(response).await;
    assert!(selection["arm_id"].is_string());

    let track_body = json!({
        "user_id": 42,
        "movie_id": 7,
        "rating_value": null,
        "watched_fraction": null,
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/track/click")
                .header("content-type", "application/json")
                .body(Body::from(track_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/experiments/{experiment_id}/summary"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = body_json(response).await;
    assert_eq!(summary["total_serves"], 1);
}

#[tokio::test]
async fn assign_is_sticky_across_calls() {
    let app = test_app();

    let create_body = json!({
        "name": "sticky-test",
        "start_at": "2026-01-01T00:00:00Z",
        "end_at": null,
        "traffic_pct": 1.0,
        "default_policy": "control",
        "policies": ["thompson"],
        "notes": null,
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/experiments")
                .header("content-type", "application/json")
                .body(Body::from(create_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let experiment = body_json(response).await;
    let experiment_id = experiment["id"].as_str().unwrap().to_string();

    let assign_body = json!({ "user_id": 123 });
    let mut assignments = Vec::new();
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/experiments/{experiment_id}/assign"))
                    .header("content-type", "application/json")
                    .body(Body::from(assign_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assignments.push(body_json(response).await);
    }
    assert_eq!(assignments[0], assignments[1]);
    assert_eq!(assignments[1], assignments[2]);
}

#[tokio::test]
async fn get_unknown_experiment_is_not_found() {
    let app = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/experiments/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
