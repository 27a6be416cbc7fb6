//! Configuration types for Folio.
//!
//! This module provides the [`Config`] struct which stores the deployment mode
//! and server settings. Configuration is persisted as TOML (typically at
//! `~/.config/folio/config.toml` on Unix systems).
//!
//! # Key Configuration Fields
//!
//! - `sync_mode`: `local` or `server`, fixed at process start
//! - `websocket_url`: Base URL of the streaming transport (absent means local)
//! - `api_url`: Base URL of the project API
//! - `session_token`: Credential sent as the first frame of every handshake
//! - `data_dir`: Directory holding the durable document store
//!
//! # Example
//!
//! ```ignore
//! use folio_core::config::{Config, SyncMode};
//!
//! let mut config = Config::load()?;
//! config.sync_mode = SyncMode::Server;
//! config.websocket_url = Some("wss://sync.example.org".into());
//! assert_eq!(config.effective_sync_mode(), SyncMode::Server);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FolioError, Result};

/// Deployment mode selected at process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Local durable store only.
    #[default]
    Local,
    /// Local durable store plus the replication server.
    Server,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Local => write!(f, "local"),
            SyncMode::Server => write!(f, "server"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(SyncMode::Local),
            "server" => Ok(SyncMode::Server),
            _ => Err(format!("Unknown sync mode: {}", s)),
        }
    }
}

/// `Config` holds the parts of Folio that the user can configure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Requested sync mode. See [`Config::effective_sync_mode`].
    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Streaming transport base URL (e.g., "wss://sync.example.org")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,

    /// Project API base URL (e.g., "https://api.example.org")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Session token for authenticated sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    /// Account name; owner of projects created from this machine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Directory for the durable document store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Server mode needs a transport URL; without one the process runs local.
    pub fn effective_sync_mode(&self) -> SyncMode {
        match (self.sync_mode, self.websocket_url.as_deref()) {
            (SyncMode::Server, Some(url)) if !url.is_empty() => SyncMode::Server,
            _ => SyncMode::Local,
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to a specific path, creating the parent directory if needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Set a single field by its TOML name. An empty value clears optional fields.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = || (!value.is_empty()).then(|| value.to_string());
        match key {
            "sync_mode" => {
                self.sync_mode = value.parse().map_err(FolioError::InvalidConfig)?;
            }
            "websocket_url" => self.websocket_url = optional(),
            "api_url" => self.api_url = optional(),
            "session_token" => self.session_token = optional(),
            "username" => self.username = optional(),
            "data_dir" => self.data_dir = optional().map(PathBuf::from),
            other => {
                return Err(FolioError::InvalidConfig(format!(
                    "unknown key '{}'",
                    other
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Native-only implementation (not available in WASM)
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
impl Config {
    /// Get the config file path (~/.config/folio/config.toml)
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("folio").join("config.toml"))
    }

    /// Load config from default location, or return default if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::config_path()
            && path.exists()
        {
            return Self::load_from(&path);
        }

        Ok(Config::default())
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or(FolioError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Directory of the durable store: `data_dir`, else the platform data dir.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("folio"))
                .ok_or(FolioError::NoConfigDir),
        }
    }
}

/// Timers and limits used by the replication and background components.
///
/// Defaults are the production values; tests shrink them.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTimings {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Reconnect attempts for the project document channel.
    pub max_reconnect_attempts: u32,
    /// Reconnect attempts for the media notification channel.
    pub media_max_reconnect_attempts: u32,
    /// Wait for the `authenticated` reply after sending the credential.
    pub handshake_timeout: Duration,
    pub media_sync_period: Duration,
    pub media_debounce: Duration,
    /// Sleep between projects in the bulk sync queue.
    pub queue_pacing: Duration,
    pub worldbuilding_hydration_timeout: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            media_max_reconnect_attempts: 10,
            handshake_timeout: Duration::from_secs(10),
            media_sync_period: Duration::from_secs(60),
            media_debounce: Duration::from_secs(2),
            queue_pacing: Duration::from_millis(100),
            worldbuilding_hydration_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_mode_requires_url() {
        let mut config = Config {
            sync_mode: SyncMode::Server,
            ..Default::default()
        };
        assert_eq!(config.effective_sync_mode(), SyncMode::Local);

        config.websocket_url = Some(String::new());
        assert_eq!(config.effective_sync_mode(), SyncMode::Local);

        config.websocket_url = Some("ws://localhost:3030".to_string());
        assert_eq!(config.effective_sync_mode(), SyncMode::Server);

        config.sync_mode = SyncMode::Local;
        assert_eq!(config.effective_sync_mode(), SyncMode::Local);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            sync_mode: SyncMode::Server,
            websocket_url: Some("ws://localhost:3030".to_string()),
            api_url: Some("http://localhost:3030".to_string()),
            session_token: Some("secret".to_string()),
            username: Some("alice".to_string()),
            data_dir: Some(PathBuf::from("/tmp/folio")),
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_fields_default_to_local() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync_mode, SyncMode::Local);
        assert!(config.websocket_url.is_none());
    }

    #[test]
    fn test_set_field() {
        let mut config = Config::default();
        config.set_field("sync_mode", "server").unwrap();
        config.set_field("websocket_url", "ws://a").unwrap();
        assert_eq!(config.effective_sync_mode(), SyncMode::Server);

        config.set_field("websocket_url", "").unwrap();
        assert!(config.websocket_url.is_none());

        assert!(config.set_field("sync_mode", "cloud").is_err());
        assert!(config.set_field("editor", "vim").is_err());
    }

    #[test]
    fn test_default_timings() {
        let timings = SyncTimings::default();
        assert_eq!(timings.backoff_base, Duration::from_secs(1));
        assert_eq!(timings.backoff_cap, Duration::from_secs(30));
        assert_eq!(timings.max_reconnect_attempts, 5);
        assert_eq!(timings.media_max_reconnect_attempts, 10);
    }
}
