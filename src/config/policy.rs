use serde::{Deserialize, Serialize};

/// Admission-control and IP rate-limit policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Below this many healthy keys for a model, every unauthenticated request
    /// is rejected.
    /// TOML: `policy.low_threshold`. Default: `30`.
    #[serde(default = "default_low_threshold")]
    pub low_threshold: i64,

    /// At or above this many healthy keys, every request is accepted.
    /// TOML: `policy.high_threshold`. Default: `50`.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: i64,

    /// Linear rejection-probability coefficients: `p = slope * healthy + intercept`,
    /// clipped to [0, 1], applied between the two thresholds.
    /// TOML: `policy.slope` / `policy.intercept`. Defaults: `-0.05` / `2.5`.
    #[serde(default = "default_slope")]
    pub slope: f64,

    #[serde(default = "default_intercept")]
    pub intercept: f64,

    /// Requests allowed per IP per minute before 429.
    /// TOML: `policy.rate_limit_per_minute`. Default: `40`.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Requests per IP per hour beyond which the IP is permanently banned.
    /// TOML: `policy.rate_limit_per_hour_ban`. Default: `3600`.
    #[serde(default = "default_rate_limit_per_hour_ban")]
    pub rate_limit_per_hour_ban: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            low_threshold: default_low_threshold(),
            high_threshold: default_high_threshold(),
            slope: default_slope(),
            intercept: default_intercept(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_per_hour_ban: default_rate_limit_per_hour_ban(),
        }
    }
}

fn default_low_threshold() -> i64 {
    30
}

fn default_high_threshold() -> i64 {
    50
}

fn default_slope() -> f64 {
    -0.05
}

fn default_intercept() -> f64 {
    2.5
}

fn default_rate_limit_per_minute() -> u32 {
    40
}

fn default_rate_limit_per_hour_ban() -> usize {
    3600
}
