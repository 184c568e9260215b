// src/config.rs

//! Manages server configuration: loading, resolving the bind address, and
//! validation.

use crate::core::protocol::ProtocolVersion;
use crate::session::KeepaliveConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9898
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    // The IANA-registered LLRP port.
    5084
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_open_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_protocol_version() -> ProtocolVersion {
    ProtocolVersion::V1_0_1
}

/// The top-level server configuration, loaded from a TOML file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Budget for confirming the listening endpoint on open.
    #[serde(with = "humantime_serde", default = "default_open_timeout")]
    pub open_timeout: Duration,
    /// Budget for tearing the session down on close.
    #[serde(with = "humantime_serde", default = "default_close_timeout")]
    pub close_timeout: Duration,
    /// The protocol version the session starts with, before any negotiation.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            open_timeout: default_open_timeout(),
            close_timeout: default_close_timeout(),
            protocol_version: default_protocol_version(),
            keepalive: KeepaliveConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the configured host/port pair to a concrete socket address.
    pub fn resolve_bind_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve bind address '{}:{}'", self.host, self.port))?
            .next()
            .ok_or_else(|| anyhow!("Bind address '{}:{}' resolved to nothing", self.host, self.port))
    }

    fn validate(&self) -> Result<()> {
        if self.open_timeout.is_zero() {
            return Err(anyhow!("'open_timeout' must be greater than zero"));
        }
        if self.close_timeout.is_zero() {
            return Err(anyhow!("'close_timeout' must be greater than zero"));
        }
        if self.keepalive.is_enabled() && self.keepalive.stop_timeout.is_zero() {
            return Err(anyhow!(
                "'keepalive.stop_timeout' must be greater than zero when keepalives are enabled"
            ));
        }
        if self.metrics.enabled && self.metrics.port == self.port {
            return Err(anyhow!(
                "The metrics port {} collides with the LLRP port",
                self.metrics.port
            ));
        }
        Ok(())
    }
}
