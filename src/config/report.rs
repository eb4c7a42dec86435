use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Status report and request-log retention configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Where the periodic model status report is appended.
    /// TOML: `report.status_file_path`. Default: `./status.txt`.
    #[serde(default = "default_status_file_path")]
    pub status_file_path: PathBuf,

    /// Status file is truncated before appending once it exceeds this size.
    /// TOML: `report.max_status_file_size_mb`. Default: `1`.
    #[serde(default = "default_max_status_file_size_mb")]
    pub max_status_file_size_mb: u64,

    /// How often the status report is written, seconds.
    /// TOML: `report.status_interval_secs`. Default: `1800`.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// How often old request logs are purged, seconds.
    /// TOML: `report.log_purge_interval_secs`. Default: `3600`.
    #[serde(default = "default_log_purge_interval_secs")]
    pub log_purge_interval_secs: u64,

    /// Request-log retention horizon, hours.
    /// TOML: `report.log_retention_hours`. Default: `24`.
    #[serde(default = "default_log_retention_hours")]
    pub log_retention_hours: i64,
}

impl ReportConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn log_purge_interval(&self) -> Duration {
        Duration::from_secs(self.log_purge_interval_secs)
    }

    pub fn max_status_file_size_bytes(&self) -> u64 {
        self.max_status_file_size_mb * 1024 * 1024
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            status_file_path: default_status_file_path(),
            max_status_file_size_mb: default_max_status_file_size_mb(),
            status_interval_secs: default_status_interval_secs(),
            log_purge_interval_secs: default_log_purge_interval_secs(),
            log_retention_hours: default_log_retention_hours(),
        }
    }
}

fn default_status_file_path() -> PathBuf {
    PathBuf::from("./status.txt")
}

fn default_max_status_file_size_mb() -> u64 {
    1
}

fn default_status_interval_secs() -> u64 {
    1800
}

fn default_log_purge_interval_secs() -> u64 {
    3600
}

fn default_log_retention_hours() -> i64 {
    24
}
