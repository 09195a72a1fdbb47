#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Backend-agnostic downloader interfaces and DTOs shared across the
//! workspace.
//!
//! A downloader exposes exactly the five operations the remote-download task
//! needs: create, info, cancel, selective file download, and a connectivity
//! probe. Adapters (aria2, qBittorrent) implement [`Downloader`] and map
//! their backend's vocabulary onto the canonical [`DownloadState`] values.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod registry;

pub use error::{DownloadError, DownloadResult};
pub use registry::DownloaderRegistry;

/// Identifier for a remote download across `info`/`cancel` calls.
///
/// Backends differ in what they hand out: aria2 issues a numeric `gid`
/// (carried in `id`), qBittorrent identifies torrents by infohash. One of
/// the two may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHandle {
    /// Backend-assigned task id, when the backend issues one.
    pub id: Option<String>,
    /// Torrent infohash, when the backend addresses by hash.
    pub hash: Option<String>,
}

impl DownloadHandle {
    /// Handle addressed by a backend task id.
    #[must_use]
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            hash: None,
        }
    }

    /// Handle addressed by an infohash.
    #[must_use]
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self {
            id: None,
            hash: Some(hash.into()),
        }
    }

    /// Whether the handle identifies anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.hash.is_none()
    }
}

/// Canonical lifecycle state reported by every adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Payload bytes are still being fetched.
    Downloading,
    /// Download finished; the client is uploading to peers.
    Seeding,
    /// Download finished and verified.
    Completed,
    /// The backend reported a failure.
    Error,
    /// The backend reported a state with no canonical mapping.
    Unknown,
}

/// Individual file within a multi-file download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    /// File index within the download, as the backend numbers it.
    pub index: u32,
    /// Relative path of the file within the payload.
    pub path: String,
    /// Total size of the file in bytes.
    pub size: u64,
    /// Bytes downloaded so far for this file.
    pub completed: u64,
    /// Whether the file is selected for download.
    pub selected: bool,
}

/// Transient status snapshot returned by [`Downloader::info`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStatus {
    /// Canonical lifecycle state.
    pub state: DownloadState,
    /// Display name, once the backend knows it.
    pub name: Option<String>,
    /// Infohash associated with the download, when available.
    pub hash: Option<String>,
    /// Directory the backend is writing into.
    pub save_path: Option<String>,
    /// Total bytes expected.
    pub total: u64,
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Current download rate in bytes per second.
    pub download_speed: u64,
    /// Bytes uploaded to peers.
    pub uploaded: u64,
    /// Current upload rate in bytes per second.
    pub upload_speed: u64,
    /// Per-file breakdown, when the backend exposes one.
    pub files: Vec<RemoteFile>,
    /// Piece completion bitmap, when the backend exposes one.
    pub pieces: Vec<bool>,
    /// Failure detail accompanying [`DownloadState::Error`].
    pub error_message: Option<String>,
    /// Replacement handle when the backend swapped the task mid-lifetime
    /// (e.g. BitTorrent metadata resolving into the real torrent). Callers
    /// must adopt the new handle and keep polling.
    pub followed_by: Option<DownloadHandle>,
}

impl Default for DownloadStatus {
    fn default() -> Self {
        Self {
            state: DownloadState::Unknown,
            name: None,
            hash: None,
            save_path: None,
            total: 0,
            downloaded: 0,
            download_speed: 0,
            uploaded: 0,
            upload_speed: 0,
            files: Vec::new(),
            pieces: Vec::new(),
            error_message: None,
            followed_by: None,
        }
    }
}

/// Request payload for admitting a download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Source URL: HTTP(S), FTP, or a magnet link.
    pub url: String,
    /// Backend-specific options passed through verbatim.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl DownloadRequest {
    /// Request with no backend-specific options.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: serde_json::Value::Null,
        }
    }

    /// Attach backend-specific options.
    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

/// Per-file download toggle for multi-file torrents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FileSelection {
    /// File index within the download.
    pub index: u32,
    /// Whether the file should be downloaded.
    pub download: bool,
}

/// The five operations the remote-download task drives.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Admit a download and return the handle identifying it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the request or is
    /// unreachable.
    async fn create(&self, request: &DownloadRequest) -> DownloadResult<DownloadHandle>;

    /// Fetch a status snapshot for the download.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::TaskNotFound`] when the backend has evicted
    /// the task (callers treat this as cancellation), or a transport
    /// failure.
    async fn info(&self, handle: &DownloadHandle) -> DownloadResult<DownloadStatus>;

    /// Remove the download and its data; idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable.
    async fn cancel(&self, handle: &DownloadHandle) -> DownloadResult<()>;

    /// Enable or disable individual files of a multi-file torrent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the selection.
    async fn select_files(
        &self,
        handle: &DownloadHandle,
        selection: &[FileSelection],
    ) -> DownloadResult<()>;

    /// Connectivity probe; returns the backend version string.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or rejects
    /// credentials.
    async fn probe(&self) -> DownloadResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_constructors_and_emptiness() {
        assert!(DownloadHandle::default().is_empty());
        assert!(!DownloadHandle::from_id("gid-1").is_empty());
        assert!(!DownloadHandle::from_hash("abcd").is_empty());
    }

    #[test]
    fn download_state_serialises_snake_case() {
        let json = serde_json::to_string(&DownloadState::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
        let back: DownloadState = serde_json::from_str("\"seeding\"").unwrap();
        assert_eq!(back, DownloadState::Seeding);
    }

    #[test]
    fn request_round_trips_without_options() {
        let request = DownloadRequest::new("https://example.org/file.iso");
        let json = serde_json::to_string(&request).unwrap();
        let back: DownloadRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.url, request.url);
        assert!(back.options.is_null());
    }
}
