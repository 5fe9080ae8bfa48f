use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde_derive::Deserialize;
use url::Url;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub reconnect: Option<ReconnectConfig>,
    pub registry: Option<RegistryConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub secure: Option<bool>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ReconnectConfig {
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub attempt_cap: Option<u32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct RegistryConfig {
    pub pending_timeout_seconds: Option<u64>,
    pub snapshot_interval_seconds: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Config with every optional section left at its defaults.
    pub fn for_host(host: &str) -> Self {
        AppConfig {
            server: ServerConfig {
                host: host.to_string(),
                secure: None,
                request_timeout_seconds: None,
            },
            reconnect: None,
            registry: None,
        }
    }

    pub fn pending_timeout(&self) -> Duration {
        let secs = self
            .registry
            .as_ref()
            .and_then(|r| r.pending_timeout_seconds)
            .unwrap_or(30);
        Duration::from_secs(secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        let secs = self
            .registry
            .as_ref()
            .and_then(|r| r.snapshot_interval_seconds)
            .unwrap_or(60)
            .max(1);
        Duration::from_secs(secs)
    }
}

impl ServerConfig {
    fn is_secure(&self) -> bool {
        self.secure.unwrap_or(false)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.unwrap_or(10).max(1))
    }

    pub fn http_base(&self) -> Result<Url, url::ParseError> {
        let scheme = if self.is_secure() { "https" } else { "http" };
        Url::parse(&format!("{scheme}://{}/", self.host))
    }

    pub fn ws_url(&self) -> Result<Url, url::ParseError> {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        Url::parse(&format!("{scheme}://{}/ws", self.host))
    }
}
