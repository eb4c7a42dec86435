mod basic;
mod health;
mod policy;
mod report;
mod upstream;

pub use basic::BasicConfig;
pub use health::HealthConfig;
pub use policy::PolicyConfig;
pub use report::ReportConfig;
pub use upstream::UpstreamConfig;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core server configuration (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Upstream routing and pool settings (see `upstream` table).
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Probe and sync scheduling (see `health` table).
    #[serde(default)]
    pub health: HealthConfig,

    /// Admission and IP rate-limit policy (see `policy` table).
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Status report and log retention (see `report` table).
    #[serde(default)]
    pub report: ReportConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding `upstream.gateway_url` at process start.
const GATEWAY_URL_ENV: &str = "AI_GATEWAY_URL";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration by merging defaults and `config.toml` if present.
    ///
    /// Does **not** validate; binaries should call `Config::from_toml()` instead.
    pub fn from_optional_toml() -> Self {
        let mut cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config.toml): {err}")
        });
        cfg.apply_env_overrides();
        cfg
    }

    /// Loads configuration from the TOML file (with defaults), applies environment
    /// overrides and validates. Startup configuration errors are fatal.
    pub fn from_toml() -> Self {
        if !PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            panic!("config file not found: {DEFAULT_CONFIG_FILE}");
        }
        let mut cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration from {DEFAULT_CONFIG_FILE}: {err}")
        });
        cfg.apply_env_overrides();
        cfg.validate();
        cfg
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(GATEWAY_URL_ENV) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                let parsed = url::Url::parse(trimmed)
                    .unwrap_or_else(|err| panic!("invalid {GATEWAY_URL_ENV}: {err}"));
                self.upstream.gateway_url = Some(parsed);
            }
        }
    }

    fn validate(&self) {
        if self.upstream.models.is_empty() {
            panic!("upstream.models must list at least one supported model");
        }
        if self.upstream.max_retries == 0 {
            panic!("upstream.max_retries must be at least 1");
        }
        if self.policy.low_threshold > self.policy.high_threshold {
            panic!("policy.low_threshold must not exceed policy.high_threshold");
        }
        if !self.health.probe_url_template.contains("{model_name}") {
            panic!("health.probe_url_template must contain a {{model_name}} placeholder");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate();
        assert!(cfg.basic.auth_key.is_empty());
        assert_eq!(cfg.upstream.max_retries, 5);
        assert!(cfg.upstream.models.contains(&"gemini-2.5-flash".to_string()));
    }

    #[test]
    fn default_admission_midpoint() {
        let cfg = Config::default();
        // slope/intercept place the 50% rejection point at 40 healthy keys.
        let p = cfg.policy.slope.mul_add(40.0, cfg.policy.intercept);
        assert!((p - 0.5).abs() < f64::EPSILON);
    }
}
