use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Basic (core) configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicConfig {
    /// HTTP server listen address (e.g., "0.0.0.0", "127.0.0.1").
    /// TOML: `basic.listen_addr`. Default: `0.0.0.0`.
    #[serde(default = "default_listen_ip")]
    pub listen_addr: IpAddr,

    /// HTTP server listen port.
    /// TOML: `basic.listen_port`. Default: `55200`.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Database URL for SQLite.
    /// TOML: `basic.database_url`. Default: `sqlite://castor.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Log level for tracing subscriber initialization.
    /// TOML: `basic.loglevel`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Shared secret for inbound callers. Requests carrying it (via the `key`
    /// query parameter or the `x-goog-api-key` header) bypass the IP filter and
    /// the admission controller. Empty means every caller is trusted.
    /// TOML: `basic.auth_key`. Default: empty.
    #[serde(default)]
    pub auth_key: String,

    /// Directory scanned for API key files.
    /// TOML: `basic.keys_dir`. Default: `keys/`.
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_ip(),
            listen_port: default_listen_port(),
            database_url: default_database_url(),
            loglevel: default_loglevel(),
            auth_key: String::new(),
            keys_dir: default_keys_dir(),
        }
    }
}

fn default_listen_ip() -> IpAddr {
    Ipv4Addr::new(0, 0, 0, 0).into()
}

fn default_listen_port() -> u16 {
    55200
}

fn default_database_url() -> String {
    "sqlite://castor.db".to_string()
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("keys/")
}
