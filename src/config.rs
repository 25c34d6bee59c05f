//! Relay and daemon configuration.
//!
//! Both structs deserialize from JSON with every field optional; anything
//! missing takes its default. Environment variables override the file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::event::DisplayMode;

/// Socket filename
const SOCKET_NAME: &str = "membrane.sock";

/// How the relay's VBlank timer is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    /// A dedicated thread fires the pacer at its deadline.
    #[default]
    Thread,
    /// The owner calls `RelayDevice::tick` itself.
    Manual,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Wire protocol socket. `None` means `default_socket_path()`.
    pub socket_path: Option<PathBuf>,
    /// Mode the device reports until a consumer configures one.
    pub mode: DisplayMode,
    pub timer: TimerMode,
}

impl RelayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading relay config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing relay config {}", path.display()))
    }

    /// Apply `MEMBRANE_SOCKET` if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("MEMBRANE_SOCKET") {
            self.socket_path = Some(PathBuf::from(path));
        }
        self
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }
}

/// Get the relay socket path, using XDG_RUNTIME_DIR if available
pub fn default_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => Path::new(&dir).join(SOCKET_NAME),
        Err(_) => Path::new("/tmp").join(SOCKET_NAME),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Entries in the direct-mapped import cache.
    pub cache_slots: usize,
    /// Drive the backlight on power transitions.
    pub backlight: bool,
    /// Name under `/sys/class/backlight`; first entry when unset.
    pub backlight_name: Option<String>,
    /// Level restored on power-on when the saved level was 0.
    pub default_backlight_level: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cache_slots: 16,
            backlight: true,
            backlight_name: None,
            default_backlight_level: 5,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading daemon config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing daemon config {}", path.display()))
    }

    /// Apply `MEMBRANE_BACKLIGHT=0|1` if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("MEMBRANE_BACKLIGHT") {
            self.backlight = !matches!(value.as_str(), "0" | "false" | "no");
        }
        self
    }
}
