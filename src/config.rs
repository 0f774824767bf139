//! Configuration of the long-running `serve` and `monitor` commands.
//!
//! The controller process does not read this file; it is configured through
//! its environment contract only.
//!
//! ```toml
//! listen = "0.0.0.0:3001"
//! self_container_name = "drydock"
//! ack_timeout_ms = 10000
//!
//! [monitor]
//! window_ms = 300000
//! interval_ms = 10000
//!
//! [store]
//! backups = "/store/backups.json"
//! audit_log = "/store/audit.jsonl"
//!
//! [self_update]
//! controller_command = ["drydock-guard", "self-update"]
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::self_update::env::{
    DEFAULT_HEALTH_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SELF_CONTAINER_NAME,
    DEFAULT_START_TIMEOUT_MS,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GuardConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_self_container_name")]
    pub self_container_name: String,
    /// How long connected clients get to acknowledge a self-update notice.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub self_update: SelfUpdateSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MonitorSection {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StoreSection {
    #[serde(default = "default_backups_path")]
    pub backups: PathBuf,
    #[serde(default = "default_audit_log_path")]
    pub audit_log: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SelfUpdateSection {
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_controller_command")]
    pub controller_command: Vec<String>,
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3001))
}

fn default_self_container_name() -> String {
    DEFAULT_SELF_CONTAINER_NAME.to_string()
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_window_ms() -> u64 {
    300_000
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_backups_path() -> PathBuf {
    PathBuf::from("/store/backups.json")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/store/audit.jsonl")
}

fn default_start_timeout_ms() -> u64 {
    DEFAULT_START_TIMEOUT_MS
}

fn default_health_timeout_ms() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_controller_command() -> Vec<String> {
    vec!["drydock-guard".to_string(), "self-update".to_string()]
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backups: default_backups_path(),
            audit_log: default_audit_log_path(),
        }
    }
}

impl Default for SelfUpdateSection {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            controller_command: default_controller_command(),
            docker_socket: default_docker_socket(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            self_container_name: default_self_container_name(),
            ack_timeout_ms: default_ack_timeout_ms(),
            monitor: MonitorSection::default(),
            store: StoreSection::default(),
            self_update: SelfUpdateSection::default(),
        }
    }
}

impl GuardConfig {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    /// Read the config file. A missing file means all defaults.
    pub async fn try_init(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::try_init_from_string(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config file at {path:?}, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(path.to_path_buf(), e)),
        }
    }
}
