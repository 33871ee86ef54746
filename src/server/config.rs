use std::env;

// Signal-fusion weights and the decision threshold. The weights deliberately
// sum to 1.45, not 1.0: the 0.6 threshold was tuned against this exact scale,
// so renormalizing them would move the matched/unmatched boundary. Pinned by
// tests in search.rs.
pub const SCORE_WEIGHT_KEYWORD: f64 = 0.6;
pub const SCORE_WEIGHT_FUZZY: f64 = 0.25;
pub const SCORE_WEIGHT_SEMANTIC: f64 = 0.45;
pub const SCORE_WEIGHT_ACTIVITY: f64 = 0.1;
pub const SCORE_WEIGHT_PROXIMITY: f64 = 0.05;
pub const MATCH_THRESHOLD: f64 = 0.6;

/// Fuzzy sub-score granted on an approximate match, and the normalized
/// edit-distance ceiling that counts as one.
pub const FUZZY_SCORE: f64 = 0.8;
pub const FUZZY_DISTANCE_THRESHOLD: f64 = 0.4;
/// Flat proximity bonus for local-mode searches.
pub const PROXIMITY_SCORE: f64 = 0.5;

pub const MATCHED_RESULT_LIMIT: usize = 10;
pub const UNMATCHED_RESULT_LIMIT: usize = 5;
pub const CANDIDATE_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_clients: usize,
    pub enable_tls: bool,
    pub log_level: String,
    pub max_message_length: usize,
    /// Radius for local-mode and nearby retrieval, meters.
    pub search_radius_m: f64,
    /// Pod lifetime bounds, hours.
    pub pod_min_duration_hours: i64,
    pub pod_max_duration_hours: i64,
    /// Period of the expiry and icebreaker sweeps, seconds.
    pub sweep_interval_secs: u64,
    /// A populated room counts as idle after this much silence, seconds.
    pub idle_threshold_secs: i64,
    /// Minimum gap between two generated messages in one room, seconds.
    pub icebreaker_cooldown_secs: i64,
    /// Period of the community activity recompute, seconds.
    pub activity_recompute_secs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5000),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/huddle.db".to_string()),
            max_clients: env::var("MAX_CLIENTS").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            enable_tls: env::var("ENABLE_TLS").map(|v| v == "true" || v == "1").unwrap_or(false),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_message_length: env::var("MAX_MESSAGE_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(2048),
            search_radius_m: env::var("SEARCH_RADIUS_M").ok().and_then(|v| v.parse().ok()).unwrap_or(10_000.0),
            pod_min_duration_hours: env::var("POD_MIN_DURATION_HOURS").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
            pod_max_duration_hours: env::var("POD_MAX_DURATION_HOURS").ok().and_then(|v| v.parse().ok()).unwrap_or(24),
            sweep_interval_secs: env::var("SWEEP_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
            idle_threshold_secs: env::var("IDLE_THRESHOLD_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
            icebreaker_cooldown_secs: env::var("ICEBREAKER_COOLDOWN_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(600),
            activity_recompute_secs: env::var("ACTIVITY_RECOMPUTE_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3600),
        }
    }
}
