use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Probe and sync scheduling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Endpoint probed to exercise a (credential, model) pair. `{model_name}`
    /// is substituted before each probe.
    /// TOML: `health.probe_url_template`.
    #[serde(default = "default_probe_url_template")]
    pub probe_url_template: String,

    /// How often the prober wakes up, seconds.
    /// TOML: `health.probe_interval_secs`. Default: `300`.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Deadline for one probe request, seconds.
    /// TOML: `health.probe_timeout_secs`. Default: `15`.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// How often the key files are reconciled into the store, seconds.
    /// TOML: `health.sync_interval_secs`. Default: `300`.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Re-test delay after a 200 probe, hours.
    /// TOML: `health.interval_200_hours`. Default: `12`.
    #[serde(default = "default_interval_200_hours")]
    pub interval_200_hours: i64,

    /// Re-test delay after a 403, days.
    /// TOML: `health.interval_403_days`. Default: `10`.
    #[serde(default = "default_interval_403_days")]
    pub interval_403_days: i64,

    /// Re-test delay after another 4xx, days.
    /// TOML: `health.interval_4xx_days`. Default: `1`.
    #[serde(default = "default_interval_4xx_days")]
    pub interval_4xx_days: i64,

    /// Re-test delay after a 5xx, minutes.
    /// TOML: `health.interval_5xx_minutes`. Default: `10`.
    #[serde(default = "default_interval_5xx_minutes")]
    pub interval_5xx_minutes: i64,
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_url_template: default_probe_url_template(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            interval_200_hours: default_interval_200_hours(),
            interval_403_days: default_interval_403_days(),
            interval_4xx_days: default_interval_4xx_days(),
            interval_5xx_minutes: default_interval_5xx_minutes(),
        }
    }
}

fn default_probe_url_template() -> String {
    "https://generativelanguage.googleapis.com/v1beta/models/{model_name}:generateContent"
        .to_string()
}

fn default_probe_interval_secs() -> u64 {
    300
}

fn default_probe_timeout_secs() -> u64 {
    15
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_interval_200_hours() -> i64 {
    12
}

fn default_interval_403_days() -> i64 {
    10
}

fn default_interval_4xx_days() -> i64 {
    1
}

fn default_interval_5xx_minutes() -> i64 {
    10
}
