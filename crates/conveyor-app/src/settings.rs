//! Application configuration surface.
//!
//! Settings load from a TOML file (path from `CONVEYOR_CONFIG`, falling back
//! to `conveyor.toml`); a missing file yields the defaults so a bare binary
//! still boots. Every field has a default.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "CONVEYOR_CONFIG";
/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "conveyor.toml";

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Task queue settings.
    pub queue: QueueSettings,
    /// Cron scheduler settings.
    pub crontab: CrontabSettings,
    /// Downloader settings.
    pub downloader: DownloaderSettings,
}

/// `[queue]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Whether the queue engine starts at all.
    pub enable: bool,
    /// Diagnostics label for the queue.
    pub name: String,
    /// Fixed worker concurrency.
    pub worker_count: usize,
    /// Retries beyond the first attempt before a failure is terminal.
    pub max_retry: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enable: true,
            name: "conveyor".to_string(),
            worker_count: 1,
            max_retry: 3,
        }
    }
}

/// `[crontab]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrontabSettings {
    /// Whether the cron scheduler starts at all.
    pub enable: bool,
    /// Whether cron expressions carry a leading seconds field.
    pub with_seconds: bool,
}

impl Default for CrontabSettings {
    fn default() -> Self {
        Self {
            enable: true,
            with_seconds: false,
        }
    }
}

/// Supported downloader backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloaderKind {
    /// aria2 over JSON-RPC.
    Aria2,
    /// qBittorrent over the WebUI.
    Qbittorrent,
}

impl DownloaderKind {
    /// The registry name the backend is published under.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aria2 => "aria2",
            Self::Qbittorrent => "qbittorrent",
        }
    }
}

/// `[downloader]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloaderSettings {
    /// Whether any downloader is configured.
    pub enable: bool,
    /// Which backend to connect.
    pub kind: DownloaderKind,
    /// aria2 backend settings.
    pub aria2: Aria2Settings,
    /// qBittorrent backend settings.
    pub qbittorrent: QbitSettings,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            enable: false,
            kind: DownloaderKind::Aria2,
            aria2: Aria2Settings::default(),
            qbittorrent: QbitSettings::default(),
        }
    }
}

/// `[downloader.aria2]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Aria2Settings {
    /// RPC endpoint.
    pub server: String,
    /// RPC secret, when the daemon requires one.
    pub token: Option<String>,
    /// Root for per-task temp directories.
    pub temp_path: PathBuf,
    /// Extra aria2 options applied to every download.
    pub options: Value,
}

impl Default for Aria2Settings {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:6800/jsonrpc".to_string(),
            token: None,
            temp_path: std::env::temp_dir().join("conveyor").join("aria2"),
            options: Value::Null,
        }
    }
}

/// `[downloader.qbittorrent]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QbitSettings {
    /// WebUI base URL.
    pub server: String,
    /// WebUI account name.
    pub user: String,
    /// WebUI account password.
    pub password: String,
    /// Root for per-task save directories.
    pub temp_path: PathBuf,
    /// Extra `torrents/add` fields applied to every download.
    pub options: Value,
}

impl Default for QbitSettings {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8080".to_string(),
            user: "admin".to_string(),
            password: String::new(),
            temp_path: std::env::temp_dir().join("conveyor").join("qbittorrent"),
            options: Value::Null,
        }
    }
}

impl Settings {
    /// Load settings from the configured path, defaulting when the file does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> AppResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
        Self::load_from(&path)
    }

    /// Load settings from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| AppError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}
