//! Configuration management for clawhost.
//!
//! This module defines the structure of the optional `clawhost.toml` file and
//! provides functionality to load and parse it. Every setting can also be
//! given on the command line, which takes precedence.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// File name looked up in the working directory and the user config dir.
pub const CONFIG_FILE_NAME: &str = "clawhost.toml";

/// Top-level configuration structure corresponding to `clawhost.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Root for gateway state and logs (default: the platform data dir).
    pub user_data_dir: Option<PathBuf>,
    /// Gateway state directory (default: `<user_data_dir>/openclaw`).
    pub state_dir: Option<PathBuf>,
    /// Log directory (default: `<user_data_dir>/logs`).
    pub logs_dir: Option<PathBuf>,
    /// Gateway installation directory (default: the working directory).
    pub backend_dir: Option<PathBuf>,
    /// Runtime that executes the gateway (default: `node`).
    pub runtime_bin: Option<PathBuf>,
    /// Extra runtime arguments placed before the entry script.
    pub runtime_args: Option<String>,
    /// Gateway entry script, relative to `backend_dir` (default: `openclaw.mjs`).
    pub entry_script: Option<String>,
    /// Auxiliary tool whose directory is added to the gateway's `PATH`.
    pub aux_bin: Option<PathBuf>,
    /// Bind mode passed to the gateway (default: `loopback`).
    pub bind: Option<String>,
    /// Preferred gateway port.
    pub port: Option<u16>,
    /// Number of ports to try from `port` upward.
    pub port_span: Option<u16>,
    /// Time allowed for the gateway to open its port, in milliseconds.
    pub ready_timeout_ms: Option<u64>,
    /// Delay between readiness attempts, in milliseconds.
    pub probe_interval_ms: Option<u64>,
    /// Time allowed for a graceful stop before killing, in milliseconds.
    pub stop_grace_ms: Option<u64>,
    /// Characters of gateway stderr kept for failure reports.
    pub tail_capacity: Option<usize>,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: Option<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// First existing `clawhost.toml`: the working directory, then the user
/// config directory.
pub fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("clawhost").join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
}

/// Platform data directory for clawhost, e.g. `~/.local/share/clawhost`.
pub fn default_user_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("clawhost"))
}
