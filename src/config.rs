//! Hub configuration loading.
//!
//! Defaults, then an optional TOML file, then `STAR_<OPTION>` environment
//! overrides. Unknown keys are rejected.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Environment variable prefix for option overrides.
const ENV_PREFIX: &str = "STAR";

/// The Hub's configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Gate upgrades on the installed authenticator.
    pub enable_auth: bool,
    /// Run envelope validation on inbound traffic (disabling is for tests).
    pub enable_validation: bool,
    /// Upgrade admission limit.
    pub max_connections: usize,
    /// Seconds between Hub heartbeats to each session.
    pub heartbeat_interval_s: u64,
    /// Seconds of silence before a session is evicted.
    pub session_timeout_s: u64,
    /// Upper bound on a single frame, in bytes.
    pub max_frame_bytes: usize,
    /// Per-session send queue depth.
    pub send_queue_depth: usize,
    /// Sink verbosity.
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            enable_auth: false,
            enable_validation: true,
            max_connections: 1000,
            heartbeat_interval_s: 30,
            session_timeout_s: 60,
            max_frame_bytes: 1024 * 1024,
            send_queue_depth: 1024,
            log_level: "INFO".to_string(),
        }
    }
}

impl HubConfig {
    /// Loads configuration from an optional TOML file with `STAR_*`
    /// environment overrides layered on top.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let defaults = HubConfig::default();
        let mut builder = Config::builder()
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("enable_auth", defaults.enable_auth)?
            .set_default("enable_validation", defaults.enable_validation)?
            .set_default("max_connections", defaults.max_connections as i64)?
            .set_default("heartbeat_interval_s", defaults.heartbeat_interval_s as i64)?
            .set_default("session_timeout_s", defaults.session_timeout_s as i64)?
            .set_default("max_frame_bytes", defaults.max_frame_bytes as i64)?
            .set_default("send_queue_depth", defaults.send_queue_depth as i64)?
            .set_default("log_level", defaults.log_level.clone())?;

        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let built = builder
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()
            .context("building configuration")?;

        built
            .try_deserialize()
            .context("deserializing configuration")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_s)
    }

    /// The socket address string the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
