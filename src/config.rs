// src/config.rs

//! Manages node configuration: loading, defaulting and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// TCP keepalive knobs applied to every peer socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KeepaliveConfig {
    /// Seconds of idle before the first probe.
    #[serde(default = "default_keepalive_idle")]
    pub idle: u64,
    /// Seconds between probes.
    #[serde(default = "default_keepalive_interval")]
    pub interval: u64,
    /// Unanswered probes before the connection is declared dead.
    #[serde(default = "default_keepalive_count")]
    pub count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: default_keepalive_idle(),
            interval: default_keepalive_interval(),
            count: default_keepalive_count(),
        }
    }
}

fn default_keepalive_idle() -> u64 {
    60
}
fn default_keepalive_interval() -> u64 {
    10
}
fn default_keepalive_count() -> u32 {
    3
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

/// The node configuration. Every field has a default so a minimal file (or
/// none at all, via `Config::default()`) yields a runnable node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Reactor parallelism: worker threads of the I/O runtime.
    #[serde(default = "default_net_thread_num")]
    pub net_thread_num: usize,
    /// Workers of each blocking pool.
    #[serde(default = "default_io_thread_num")]
    pub io_thread_num: usize,
    /// Workers of each non-blocking pool.
    #[serde(default = "default_nonblocking_io_thread_num")]
    pub nonblocking_io_thread_num: usize,

    /// Seconds before an outstanding transaction times out.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: u64,
    /// Seconds between reconnect sweeps.
    #[serde(default = "default_check_timeout")]
    pub check_timeout: u64,
    /// Seconds a request may wait in a pool queue before it is failed
    /// without invoking the handler. Zero disables the check.
    #[serde(default)]
    pub queue_timeout: u64,
    /// Consecutive transaction timeouts before a connection is declared
    /// stalled and reset.
    #[serde(default = "default_stall_count")]
    pub stall_count: u32,
    /// Maximum frames written to one connection in a row before the writer
    /// yields to its peers. Zero means no cap.
    #[serde(default = "default_send_limit")]
    pub send_limit: u32,
    /// Pool queue bound. Zero means unbounded.
    #[serde(default)]
    pub queue_limit: usize,
    /// Maximum accepted payload size in bytes.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: u64,

    /// Whether this node joins the cluster as a storage peer (it then
    /// announces its backends to remotes on connect).
    #[serde(default)]
    pub join: bool,
    /// Shared secret verified during the AUTH exchange.
    #[serde(default)]
    pub auth_cookie: String,

    /// Addresses of remote nodes to connect to at startup.
    #[serde(default)]
    pub remotes: Vec<String>,
    /// How many recorded addresses one reconnect sweep attempts.
    #[serde(default = "default_reconnect_batch_size")]
    pub reconnect_batch_size: usize,
    /// Whether serving a statistics request also serves route-list
    /// downloads for that peer.
    #[serde(default = "default_route_list_on_stat")]
    pub route_list_on_stat: bool,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    1025
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_net_thread_num() -> usize {
    4
}
fn default_io_thread_num() -> usize {
    4
}
fn default_nonblocking_io_thread_num() -> usize {
    4
}
fn default_wait_timeout() -> u64 {
    5
}
fn default_check_timeout() -> u64 {
    10
}
fn default_stall_count() -> u32 {
    3
}
fn default_send_limit() -> u32 {
    64
}
fn default_max_payload_size() -> u64 {
    1024 * 1024 * 1024
}
fn default_reconnect_batch_size() -> usize {
    25
}
fn default_route_list_on_stat() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize via defaults")
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse configuration file '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.net_thread_num == 0 {
            return Err(anyhow!("net_thread_num must be at least 1"));
        }
        if self.io_thread_num == 0 || self.nonblocking_io_thread_num == 0 {
            return Err(anyhow!("worker pools need at least one thread each"));
        }
        if self.wait_timeout == 0 {
            return Err(anyhow!("wait_timeout must be at least 1 second"));
        }
        if self.max_payload_size == 0 {
            return Err(anyhow!("max_payload_size must be non-zero"));
        }
        Ok(())
    }
}
