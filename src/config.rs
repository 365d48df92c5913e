//! Typed configuration loaded from the environment via a `Config::from_env()` constructor.

/// Application configuration for the bandit experimentation service.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub bind_addr: String,
    pub port: u16,

    /// Default reward attribution window, in hours.
    pub reward_window_hours: i64,
    /// Binary-mode thresholds.
    pub binary_threshold: f64,
    pub rating_threshold_positive: f64,
    pub rating_threshold_negative: f64,

    /// Scheduled-job intervals, in seconds.
    pub reward_tick_interval_secs: u64,
    pub reward_retry_interval_secs: u64,
    pub reward_sweep_interval_secs: u64,
    pub guardrails_tick_interval_secs: u64,
    pub decisions_tick_interval_secs: u64,
    /// Events older than this many days with no reward are swept to 0.0.
    pub reward_sweep_max_age_days: i64,
    /// Events older than this many minutes are eligible for the 15-min retry tick.
    pub reward_retry_delay_minutes: i64,

    /// Guardrail thresholds.
    pub guardrail_error_rate_threshold: f64,
    pub guardrail_latency_p95_threshold_ms: f64,
    pub guardrail_arm_concentration_threshold: f64,
    pub guardrail_reward_drop_threshold: f64,
    pub guardrail_window_minutes: i64,
    pub guardrail_cooldown_hours: i64,
    pub guardrail_max_rollback_attempts: u32,

    /// Decision Engine criteria.
    pub decision_min_window_days: i64,
    pub decision_max_window_days: i64,
    pub decision_min_events_per_policy: i64,
    pub decision_ship_uplift_threshold: f64,
    pub decision_ship_p_value_threshold: f64,
    pub decision_kill_uplift_threshold: f64,

    /// Cache TTLs, in seconds.
    pub policy_state_cache_ttl_secs: u64,
    pub assignment_cache_ttl_secs: u64,

    /// ε for the ε-greedy policy and min_pulls for UCB1.
    pub epsilon_greedy_epsilon: f64,
    pub ucb1_min_pulls: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./banditserve.db".to_string());

        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = parse_env_or("PORT", 8080u16)?;

        let reward_window_hours = parse_env_or("REWARD_WINDOW_HOURS", 24i64)?;
        let binary_threshold = parse_env_or("BINARY_THRESHOLD", 0.5f64)?;
        let rating_threshold_positive = parse_env_or("RATING_THRESHOLD_POSITIVE", 4.0f64)?;
        let rating_threshold_negative = parse_env_or("RATING_THRESHOLD_NEGATIVE", 2.0f64)?;

        let reward_tick_interval_secs = parse_env_or("REWARD_TICK_INTERVAL_SECS", 300u64)?;
        let reward_retry_interval_secs = parse_env_or("REWARD_RETRY_INTERVAL_SECS", 900u64)?;
        let reward_sweep_interval_secs = parse_env_or("REWARD_SWEEP_INTERVAL_SECS", 3600u64)?;
        let guardrails_tick_interval_secs = parse_env_or("GUARDRAILS_TICK_INTERVAL_SECS", 300u64)?;
        let decisions_tick_interval_secs =
            parse_env_or("DECISIONS_TICK_INTERVAL_SECS", 86400u64)?;
        let reward_sweep_max_age_days = parse_env_or("REWARD_SWEEP_MAX_AGE_DAYS", 30i64)?;
        let reward_retry_delay_minutes = parse_env_or("REWARD_RETRY_DELAY_MINUTES", 5i64)?;

        let guardrail_error_rate_threshold =
            parse_env_or("GUARDRAIL_ERROR_RATE_THRESHOLD", 0.01f64)?;
        let guardrail_latency_p95_threshold_ms =
            parse_env_or("GUARDRAIL_LATENCY_P95_THRESHOLD_MS", 120.0f64)?;
        let guardrail_arm_concentration_threshold =
            parse_env_or("GUARDRAIL_ARM_CONCENTRATION_THRESHOLD", 0.5f64)?;
        let guardrail_reward_drop_threshold =
            parse_env_or("GUARDRAIL_REWARD_DROP_THRESHOLD", 0.05f64)?;
        let guardrail_window_minutes = parse_env_or("GUARDRAIL_WINDOW_MINUTES", 30i64)?;
        let guardrail_cooldown_hours = parse_env_or("GUARDRAIL_COOLDOWN_HOURS", 1i64)?;
        let guardrail_max_rollback_attempts =
            parse_env_or("GUARDRAIL_MAX_ROLLBACK_ATTEMPTS", 3u32)?;

        let decision_min_window_days = parse_env_or("DECISION_MIN_WINDOW_DAYS", 7i64)?;
        let decision_max_window_days = parse_env_or("DECISION_MAX_WINDOW_DAYS", 14i64)?;
        let decision_min_events_per_policy =
            parse_env_or("DECISION_MIN_EVENTS_PER_POLICY", 1000i64)?;
        let decision_ship_uplift_threshold =
            parse_env_or("DECISION_SHIP_UPLIFT_THRESHOLD", 0.03f64)?;
        let decision_ship_p_value_threshold =
            parse_env_or("DECISION_SHIP_P_VALUE_THRESHOLD", 0.05f64)?;
        let decision_kill_uplift_threshold =
            parse_env_or("DECISION_KILL_UPLIFT_THRESHOLD", -0.05f64)?;

        let policy_state_cache_ttl_secs = parse_env_or("POLICY_STATE_CACHE_TTL_SECS", 300u64)?;
        let assignment_cache_ttl_secs = parse_env_or("ASSIGNMENT_CACHE_TTL_SECS", 3600u64)?;

        let epsilon_greedy_epsilon = parse_env_or("EPSILON_GREEDY_EPSILON", 0.1f64)?;
        let ucb1_min_pulls = parse_env_or("UCB1_MIN_PULLS", 1u64)?;

        Ok(Self {
            database_path,
            bind_addr,
            port,
            reward_window_hours,
            binary_threshold,
            rating_threshold_positive,
            rating_threshold_negative,
            reward_tick_interval_secs,
            reward_retry_interval_secs,
            reward_sweep_interval_secs,
            guardrails_tick_interval_secs,
            decisions_tick_interval_secs,
            reward_sweep_max_age_days,
            reward_retry_delay_minutes,
            guardrail_error_rate_threshold,
            guardrail_latency_p95_threshold_ms,
            guardrail_arm_concentration_threshold,
            guardrail_reward_drop_threshold,
            guardrail_window_minutes,
            guardrail_cooldown_hours,
            guardrail_max_rollback_attempts,
            decision_min_window_days,
            decision_max_window_days,
            decision_min_events_per_policy,
            decision_ship_uplift_threshold,
            decision_ship_p_value_threshold,
            decision_kill_uplift_threshold,
            policy_state_cache_ttl_secs,
            assignment_cache_ttl_secs,
            epsilon_greedy_epsilon,
            ucb1_min_pulls,
        })
    }
}

fn parse_env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}
