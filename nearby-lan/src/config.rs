//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nearby_core::manager::DEFAULT_MAX_DISCOVERY_RETRIES;
use nearby_core::{ManagerSettings, SERVICE_ID};
use serde::Deserialize;
use tracing::warn;

use crate::bus::DEFAULT_EVENT_CAPACITY;
use crate::lan::LanSettings;
use crate::link::MAX_CHUNK_SIZE;

/// Daemon configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_ENDPOINT_NAME, NEARBY_SERVICE_ID, NEARBY_DISCOVERY_PORT,
/// NEARBY_TRANSPORT_PORT, NEARBY_DOWNLOAD_DIR, NEARBY_LOG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name advertised to peers (default "nearby-<pid>").
    #[serde(default = "default_endpoint_name")]
    pub endpoint_name: String,
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Multicast discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP port (default 0: ephemeral).
    #[serde(default)]
    pub transport_port: u16,
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Endpoints silent this long are reported lost.
    #[serde(default = "default_endpoint_timeout_ms")]
    pub endpoint_timeout_ms: u64,
    /// Payload chunk size in bytes, clamped to 1..=1 MiB.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_discovery_retries")]
    pub max_discovery_retries: u32,
    /// Per-subscriber buffer of the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Where incoming file payloads are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Default log filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_endpoint_name() -> String {
    format!("nearby-{}", std::process::id())
}
fn default_service_id() -> String {
    SERVICE_ID.to_owned()
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_beacon_interval_ms() -> u64 {
    2000
}
fn default_endpoint_timeout_ms() -> u64 {
    8000
}
fn default_chunk_size() -> usize {
    32 * 1024
}
fn default_max_discovery_retries() -> u32 {
    DEFAULT_MAX_DISCOVERY_RETRIES
}
fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}
fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("nearby")
}
fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_name: default_endpoint_name(),
            service_id: default_service_id(),
            discovery_port: default_discovery_port(),
            transport_port: 0,
            beacon_interval_ms: default_beacon_interval_ms(),
            endpoint_timeout_ms: default_endpoint_timeout_ms(),
            chunk_size: default_chunk_size(),
            max_discovery_retries: default_max_discovery_retries(),
            event_capacity: default_event_capacity(),
            download_dir: default_download_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            endpoint_name: self.endpoint_name.clone(),
            service_id: self.service_id.clone(),
            max_discovery_retries: self.max_discovery_retries,
        }
    }

    pub fn lan_settings(&self) -> LanSettings {
        LanSettings {
            discovery_port: self.discovery_port,
            transport_port: self.transport_port,
            beacon_interval: Duration::from_millis(self.beacon_interval_ms),
            endpoint_timeout: Duration::from_millis(self.endpoint_timeout_ms),
            chunk_size: self.chunk_size.clamp(1, MAX_CHUNK_SIZE),
            download_dir: self.download_dir.clone(),
        }
    }

    /// Apply overrides from `lookup` (the process environment in `load`).
    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("NEARBY_ENDPOINT_NAME") {
            self.endpoint_name = s;
        }
        if let Some(s) = lookup("NEARBY_SERVICE_ID") {
            self.service_id = s;
        }
        if let Some(s) = lookup("NEARBY_DISCOVERY_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.discovery_port = p,
                Err(_) => warn!(value = %s, "ignoring invalid NEARBY_DISCOVERY_PORT"),
            }
        }
        if let Some(s) = lookup("NEARBY_TRANSPORT_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.transport_port = p,
                Err(_) => warn!(value = %s, "ignoring invalid NEARBY_TRANSPORT_PORT"),
            }
        }
        if let Some(s) = lookup("NEARBY_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(s);
        }
        if let Some(s) = lookup("NEARBY_LOG") {
            self.log_level = s;
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> Config {
    let mut c = load_file(&config_paths()).unwrap_or_default();
    c.apply_env(|key| std::env::var(key).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

/// Parse the first existing file. An unreadable or invalid file is reported and skipped
/// in favour of defaults; later paths are not consulted.
fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let path = paths.iter().find(|p| p.exists())?;
    match parse_file(path) {
        Ok(c) => Some(c),
        Err(e) => {
            // Logging is not installed yet when config loads.
            eprintln!("nearby-lan: ignoring {}: {e}", path.display());
            None
        }
    }
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&s)?)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse failed: {0}")]
    Parse(#[from] toml::de::Error),
}
