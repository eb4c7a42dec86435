use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Upstream routing and pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Base URL requests are forwarded to when no gateway is configured.
    /// TOML: `upstream.default_url`.
    #[serde(default = "default_upstream_url")]
    pub default_url: Url,

    /// Optional AI-gateway base URL. When set, requests are routed through
    /// `{gateway_url}/google-ai-studio/v1beta/models/{segment}` instead of the
    /// default upstream. Overridable via the `AI_GATEWAY_URL` environment variable.
    /// TOML: `upstream.gateway_url`. Default: unset.
    #[serde(default)]
    pub gateway_url: Option<Url>,

    /// Optional outbound proxy for all egress traffic (e.g. `socks5://127.0.0.1:1080`).
    /// TOML: `upstream.proxy`. Default: unset.
    #[serde(default)]
    pub proxy: Option<Url>,

    /// Closed set of supported model names; the sole source of truth for which
    /// paths are routable.
    /// TOML: `upstream.models`.
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    /// How many credentials one inbound request may burn through before giving up.
    /// TOML: `upstream.max_retries`. Default: `5`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// TCP connect timeout for the forwarding client, seconds.
    /// TOML: `upstream.connect_timeout_secs`. Default: `10`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Overall deadline for one forwarded request, seconds. Streaming responses
    /// must complete within this window.
    /// TOML: `upstream.request_timeout_secs`. Default: `600`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_url: default_upstream_url(),
            gateway_url: None,
            proxy: None,
            models: default_models(),
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_upstream_url() -> Url {
    Url::parse("https://generativelanguage.googleapis.com").expect("static url")
}

fn default_models() -> Vec<String> {
    [
        "gemini-2.5-flash-preview-04-17",
        "gemini-2.5-flash-preview-05-20",
        "gemini-2.5-flash-lite-preview-06-17",
        "gemini-2.0-flash-preview-image-generation",
        "gemini-2.5-flash",
        "gemini-2.0-flash",
        "gemini-2.0-flash-lite",
        "gemma-3n-e4b-it",
        "gemma-3-1b-it",
        "gemma-3-4b-it",
        "gemma-3-12b-it",
        "gemma-3-27b-it",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_max_retries() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    600
}
