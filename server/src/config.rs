use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Command-line flags. Only flags the user actually passed are serialized,
/// so unset flags never mask TOML or env values.
#[derive(Parser, Serialize, Clone, Debug)]
#[command(name = "cnep-server", version, about = "CNEP realtime message relay")]
pub struct Cli {
    /// Port to listen on [default: 3000]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file [default: ./cnep.toml]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// Data directory for persistent state (message DB, JWT signing key) [default: ./data]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Print an access token for the given user id and exit
    #[arg(long, value_name = "USER_ID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_token: Option<u64>,
}

/// Effective server configuration after layering.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,

    pub bind_address: String,

    pub config: String,

    #[serde(default)]
    pub json_logs: bool,

    #[serde(default)]
    pub generate_config: bool,

    pub data_dir: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_token: Option<u64>,

    /// Relay tuning (loaded from [relay] section in TOML)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayConfig>,

    /// Token settings (loaded from [auth] section in TOML)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

/// Coordinator and per-connection writer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// How long a single outbound write may block before the receiver is
    /// dropped (default: 5000)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Frames queued per connection ahead of its socket (default: 32)
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl RelayConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_outbound_buffer() -> usize {
    32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Lifetime of tokens printed by --issue-token (default: 30 days)
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
        }
    }
}

fn default_token_ttl() -> u64 {
    30 * 24 * 60 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            bind_address: "0.0.0.0".to_string(),
            config: "./cnep.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            issue_token: None,
            relay: None,
            auth: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CNEP_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Cli::parse();
        Self::figment(cli).extract()
    }

    fn figment(cli: Cli) -> Figment {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| Config::default().config);

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CNEP_").split("__"))
            .merge(Serialized::defaults(cli))
    }

    pub fn relay(&self) -> RelayConfig {
        self.relay.unwrap_or_default()
    }

    pub fn auth(&self) -> AuthConfig {
        self.auth.clone().unwrap_or_default()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# CNEP Relay Server Configuration
# Place this file at ./cnep.toml or specify with --config <path>
# All settings can be overridden via environment variables (CNEP_PORT,
# CNEP_RELAY__WRITE_TIMEOUT_MS, etc.) or CLI flags (--port, etc.)

# Server port (default: 3000)
# port = 3000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite message store and JWT signing key
# data_dir = "./data"

# ---- Relay ----
# [relay]

# Max time one outbound write may wait before the receiver is dropped
# write_timeout_ms = 5000

# Frames buffered per connection between the relay and the socket
# outbound_buffer = 32

# ---- Auth ----
# [auth]

# Lifetime of tokens printed by --issue-token (default: 30 days)
# token_ttl_secs = 2592000
"#
    .to_string()
}
