use std::path::PathBuf;
use std::time::Duration;

use crate::upstream::DEFAULT_API_URL;

#[derive(Debug, thiserror::Error)]
#[error("{name} must be a valid {expected}, got {value:?}")]
pub struct ConfigError {
    name: &'static str,
    expected: &'static str,
    value: String,
}

/// Service configuration loaded from environment variables.
///
/// | Env Var                      | Default                         |
/// |------------------------------|---------------------------------|
/// | `HTTP_HOST`                  | `127.0.0.1`                     |
/// | `HTTP_PORT`                  | `0` (ephemeral)                 |
/// | `PUBLIC_BASE_URL`            | `http://{host}:{bound port}`    |
/// | `FIREHYDRANT_API_URL`        | `https://api.firehydrant.io/v1` |
/// | `FIREHYDRANT_API_KEY`        | empty (setup disabled)          |
/// | `FIREHYDRANT_ACCOUNT`        | `default`                       |
/// | `FIREHYDRANT_WEBHOOK_SECRET` | empty (provider may issue one)  |
/// | `UPSTREAM_TIMEOUT_SECS`      | `10`                            |
/// | `DATA_DIR`                   | `.`                             |
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL the provider posts to.
    pub public_base_url: Option<String>,
    pub api_url: String,
    pub api_key: String,
    pub account: String,
    pub webhook_secret: String,
    pub upstream_timeout: Duration,
    pub data_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            public_base_url: None,
            api_url: DEFAULT_API_URL.into(),
            api_key: String::new(),
            account: "default".into(),
            webhook_secret: String::new(),
            upstream_timeout: Duration::from_secs(10),
            data_dir: PathBuf::from("."),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let port = match var("HTTP_PORT") {
            Some(v) => v.trim().parse().map_err(|_| ConfigError {
                name: "HTTP_PORT",
                expected: "u16",
                value: v,
            })?,
            None => defaults.port,
        };

        let upstream_timeout = match var("UPSTREAM_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(v.trim().parse().map_err(|_| ConfigError {
                name: "UPSTREAM_TIMEOUT_SECS",
                expected: "u64",
                value: v,
            })?),
            None => defaults.upstream_timeout,
        };

        Ok(Self {
            host: var("HTTP_HOST").unwrap_or(defaults.host),
            port,
            public_base_url: var("PUBLIC_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            api_url: var("FIREHYDRANT_API_URL").unwrap_or(defaults.api_url),
            api_key: var("FIREHYDRANT_API_KEY").unwrap_or_default(),
            account: var("FIREHYDRANT_ACCOUNT").unwrap_or(defaults.account),
            webhook_secret: var("FIREHYDRANT_WEBHOOK_SECRET").unwrap_or_default(),
            upstream_timeout,
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
        })
    }
}
