use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "realtime-proxy",
    version,
    about = "WebSocket relay for the realtime speech API"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml", env = "RELAY_CONFIG")]
    pub config: PathBuf,

    /// Listen host (overrides config file setting)
    #[arg(long, env = "RELAY_HOST")]
    pub host: Option<String>,

    /// Listen port (overrides config file setting)
    #[arg(short, long, env = "RELAY_PORT")]
    pub port: Option<u16>,

    /// Upstream WebSocket URI (overrides config file setting)
    #[arg(long, env = "RELAY_UPSTREAM_URI")]
    pub upstream: Option<String>,

    /// Upstream connect timeout in seconds (overrides config file setting)
    #[arg(long, env = "RELAY_CONNECT_TIMEOUT_SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub connect_timeout: Option<u64>,

    /// Log level filter used when RUST_LOG is unset (overrides config file setting)
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,
}
