//! Client settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/notebook-client/settings.json
//! - Linux: ~/.config/notebook-client/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\notebook-client\settings.json
//!
//! Every field has a default, so partial files are fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionOptions, ReconnectPolicy};
use crate::session::SessionOptions;

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 30_000,
            jitter: 0.2,
        }
    }
}

/// Client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Kernel service address: `host:port`, or `unix:<path>` for a socket.
    pub endpoint: String,

    /// Path of the notebook document on the service side.
    pub notebook_path: String,

    pub connect_timeout_ms: u64,

    pub handshake_timeout_ms: u64,

    pub reconnect: ReconnectSettings,

    /// Fail a running cell after this many seconds. Unset means wait forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_timeout_secs: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:8000".to_string(),
            notebook_path: "untitled.ipynb".to_string(),
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            reconnect: ReconnectSettings::default(),
            execute_timeout_secs: None,
        }
    }
}

/// Where the kernel service listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl ClientSettings {
    pub fn endpoint(&self) -> Endpoint {
        match self.endpoint.strip_prefix("unix:") {
            Some(path) => Endpoint::Unix(PathBuf::from(path)),
            None => Endpoint::Tcp(self.endpoint.clone()),
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(self.reconnect.base_ms),
                max: Duration::from_millis(self.reconnect.max_ms),
                jitter: self.reconnect.jitter.clamp(0.0, 1.0),
            },
            ..ConnectionOptions::default()
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connection: self.connection_options(),
            execute_timeout: self.execute_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notebook-client")
        .join("settings.json")
}

/// Load settings, returning defaults if the file doesn't exist or can't be
/// parsed.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    if !path.exists() {
        return ClientSettings::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            log::warn!("[settings] Ignoring invalid {}: {}", path.display(), e);
            ClientSettings::default()
        }),
        Err(e) => {
            log::warn!("[settings] Could not read {}: {}", path.display(), e);
            ClientSettings::default()
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &ClientSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
