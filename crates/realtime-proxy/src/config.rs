use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use ws_relay::listener::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_LISTEN_HOST, DEFAULT_LISTEN_PORT};
use ws_relay::upstream::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_CONTENT_TYPE, DEFAULT_UPSTREAM_URI};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_upstream_uri")]
    pub uri: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            uri: default_upstream_uri(),
            content_type: default_content_type(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.handshake_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_host() -> String {
    DEFAULT_LISTEN_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_upstream_uri() -> String {
    DEFAULT_UPSTREAM_URI.to_string()
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Where the loaded configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// The file did not exist; built-in defaults are in effect.
    Defaults,
}

/// Load configuration from a YAML file.
///
/// A missing file is not an error: the built-in defaults are returned with
/// [`ConfigSource::Defaults`] so the caller can warn once logging is up.
pub fn load(path: &Path) -> anyhow::Result<(Config, ConfigSource)> {
    if !path.exists() {
        return Ok((Config::default(), ConfigSource::Defaults));
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config = load_from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok((config, ConfigSource::File))
}

pub fn load_from_str(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yml::from_str(contents)?;
    if config.upstream.connect_timeout_secs == 0 {
        anyhow::bail!("upstream.connect_timeout_secs must be greater than zero");
    }
    if config.proxy.handshake_timeout_secs == 0 {
        anyhow::bail!("proxy.handshake_timeout_secs must be greater than zero");
    }
    Ok(config)
}
