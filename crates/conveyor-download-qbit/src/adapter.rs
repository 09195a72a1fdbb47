//! The qBittorrent implementation of the downloader contract.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conveyor_download_core::{
    DownloadError, DownloadHandle, DownloadRequest, DownloadResult, DownloadStatus, Downloader,
    FileSelection,
};

use crate::model::{TorrentFileEntry, TorrentInfo, build_status};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `create` waits for a non-magnet torrent to surface under its
/// one-shot discovery tag.
const TAG_DISCOVERY_ATTEMPTS: usize = 10;
const TAG_DISCOVERY_INTERVAL: Duration = Duration::from_millis(500);

/// Settings for one qBittorrent WebUI endpoint.
#[derive(Debug, Clone)]
pub struct QbitConfig {
    /// WebUI base URL, e.g. `http://127.0.0.1:8080`.
    pub server: String,
    /// WebUI account name.
    pub user: String,
    /// WebUI account password.
    pub password: String,
    /// Root under which per-task save directories are created.
    pub temp_path: PathBuf,
    /// Extra `torrents/add` form fields applied to every created download.
    pub options: Value,
}

/// qBittorrent downloader adapter.
pub struct QbitDownloader {
    client: reqwest::Client,
    config: QbitConfig,
}

impl QbitDownloader {
    /// Connect and authenticate against the WebUI.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built, the WebUI is
    /// unreachable, or the credentials are rejected.
    pub async fn connect(config: QbitConfig) -> DownloadResult<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|err| DownloadError::transport("webui.client", err))?;
        let downloader = Self { client, config };
        downloader.login().await?;
        Ok(downloader)
    }

    async fn login(&self) -> DownloadResult<()> {
        let response = self
            .client
            .post(self.endpoint("/api/v2/auth/login"))
            .form(&[
                ("username", self.config.user.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|err| DownloadError::transport("auth.login", err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| DownloadError::transport("auth.login", err))?;
        // The WebUI answers 200 with a literal `Fails.` body on bad
        // credentials; the SID cookie lands in the client's jar on success.
        if !status.is_success() || body.trim() == "Fails." {
            return Err(DownloadError::Unauthorized);
        }
        debug!(server = %self.config.server, "qbittorrent session established");
        Ok(())
    }

    /// Send a request, re-authenticating once when the session cookie has
    /// expired.
    async fn send(&self, builder: reqwest::RequestBuilder) -> DownloadResult<reqwest::Response> {
        let retry = builder.try_clone();
        let response = builder
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|err| DownloadError::transport("webui.send", err))?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            self.login().await?;
            let Some(retry) = retry else {
                return Err(DownloadError::Unauthorized);
            };
            return retry
                .timeout(CALL_TIMEOUT)
                .send()
                .await
                .map_err(|err| DownloadError::transport("webui.send", err));
        }
        Ok(response)
    }

    async fn expect_ok(
        &self,
        builder: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> DownloadResult<String> {
        let response = self.send(builder).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| DownloadError::transport(operation, err))?;
        if !status.is_success() {
            return Err(DownloadError::UnexpectedStatus {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        Ok(body)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> DownloadResult<T> {
        let body = self.expect_ok(builder, operation).await?;
        serde_json::from_str(&body)
            .map_err(|err| DownloadError::protocol(format!("{operation}: malformed payload: {err}")))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.server.trim_end_matches('/'))
    }

    async fn torrent_info(&self, hash: &str) -> DownloadResult<TorrentInfo> {
        let builder = self
            .client
            .get(self.endpoint("/api/v2/torrents/info"))
            .query(&[("hashes", hash)]);
        let mut torrents: Vec<TorrentInfo> = self.fetch_json(builder, "torrents.info").await?;
        if torrents.is_empty() {
            return Err(DownloadError::TaskNotFound);
        }
        Ok(torrents.swap_remove(0))
    }

    async fn discover_hash_by_tag(&self, tag: &str) -> DownloadResult<String> {
        for _ in 0..TAG_DISCOVERY_ATTEMPTS {
            let builder = self
                .client
                .get(self.endpoint("/api/v2/torrents/info"))
                .query(&[("tag", tag)]);
            let torrents: Vec<TorrentInfo> = self.fetch_json(builder, "torrents.info").await?;
            if let Some(hash) = torrents.into_iter().find_map(|torrent| torrent.hash) {
                let builder = self
                    .client
                    .post(self.endpoint("/api/v2/torrents/removeTags"))
                    .form(&[("hashes", hash.as_str()), ("tags", tag)]);
                if let Err(err) = self.expect_ok(builder, "torrents.removeTags").await {
                    debug!(error = %err, tag, "failed to drop discovery tag");
                }
                return Ok(hash);
            }
            tokio::time::sleep(TAG_DISCOVERY_INTERVAL).await;
        }
        Err(DownloadError::protocol(
            "added torrent never surfaced under its discovery tag",
        ))
    }
}

#[async_trait]
impl Downloader for QbitDownloader {
    async fn create(&self, request: &DownloadRequest) -> DownloadResult<DownloadHandle> {
        let save_path = self
            .config
            .temp_path
            .join(Uuid::new_v4().to_string())
            .display()
            .to_string();

        let mut form: Vec<(String, String)> = vec![
            ("urls".to_string(), request.url.clone()),
            ("savepath".to_string(), save_path),
        ];
        merge_form(&mut form, &self.config.options);
        merge_form(&mut form, &request.options);

        // A magnet already names its infohash; anything else is found again
        // through a one-shot tag after the WebUI has admitted it.
        let source = match magnet_infohash(&request.url) {
            Some(hash) => HashSource::Known(hash),
            None => {
                let tag = format!("conveyor-{}", Uuid::new_v4());
                form.push(("tags".to_string(), tag.clone()));
                HashSource::Tagged(tag)
            }
        };

        let builder = self
            .client
            .post(self.endpoint("/api/v2/torrents/add"))
            .form(&form);
        let body = self.expect_ok(builder, "torrents.add").await?;
        if body.trim() == "Fails." {
            return Err(DownloadError::protocol("webui rejected the torrent"));
        }

        let hash = match source {
            HashSource::Known(hash) => hash,
            HashSource::Tagged(tag) => self.discover_hash_by_tag(&tag).await?,
        };
        info!(hash, url = %request.url, "qbittorrent download created");
        Ok(DownloadHandle::from_hash(hash))
    }

    async fn info(&self, handle: &DownloadHandle) -> DownloadResult<DownloadStatus> {
        let hash = require_hash(handle)?;
        let torrent = self.torrent_info(hash).await?;

        let files_builder = self
            .client
            .get(self.endpoint("/api/v2/torrents/files"))
            .query(&[("hash", hash)]);
        let files: Vec<TorrentFileEntry> = self
            .fetch_json(files_builder, "torrents.files")
            .await
            .unwrap_or_default();

        let pieces_builder = self
            .client
            .get(self.endpoint("/api/v2/torrents/pieceStates"))
            .query(&[("hash", hash)]);
        let pieces: Vec<u8> = self
            .fetch_json(pieces_builder, "torrents.pieceStates")
            .await
            .unwrap_or_default();

        Ok(build_status(&torrent, &files, &pieces))
    }

    async fn cancel(&self, handle: &DownloadHandle) -> DownloadResult<()> {
        let hash = require_hash(handle)?;
        let builder = self
            .client
            .post(self.endpoint("/api/v2/torrents/delete"))
            .form(&[("hashes", hash), ("deleteFiles", "true")]);
        self.expect_ok(builder, "torrents.delete").await?;
        Ok(())
    }

    async fn select_files(
        &self,
        handle: &DownloadHandle,
        selection: &[FileSelection],
    ) -> DownloadResult<()> {
        let hash = require_hash(handle)?;
        for (download, priority) in [(true, "1"), (false, "0")] {
            let ids = id_list(selection, download);
            if ids.is_empty() {
                continue;
            }
            let builder = self
                .client
                .post(self.endpoint("/api/v2/torrents/filePrio"))
                .form(&[("hash", hash), ("id", ids.as_str()), ("priority", priority)]);
            self.expect_ok(builder, "torrents.filePrio").await?;
        }
        Ok(())
    }

    async fn probe(&self) -> DownloadResult<String> {
        let builder = self.client.get(self.endpoint("/api/v2/app/version"));
        let version = self.expect_ok(builder, "app.version").await?;
        Ok(version.trim().to_string())
    }
}

enum HashSource {
    Known(String),
    Tagged(String),
}

fn require_hash(handle: &DownloadHandle) -> DownloadResult<&str> {
    handle
        .hash
        .as_deref()
        .ok_or_else(|| DownloadError::protocol("handle carries no torrent hash"))
}

fn merge_form(form: &mut Vec<(String, String)>, options: &Value) {
    let Value::Object(entries) = options else {
        return;
    };
    for (key, value) in entries {
        let rendered = match value {
            Value::String(text) => text.clone(),
            Value::Bool(flag) => flag.to_string(),
            Value::Number(number) => number.to_string(),
            other => {
                warn!(key = %key, value = %other, "skipping non-scalar webui option");
                continue;
            }
        };
        form.push((key.clone(), rendered));
    }
}

/// Extract the infohash from a magnet link's `xt=urn:btih:` parameter.
fn magnet_infohash(url: &str) -> Option<String> {
    if !url.starts_with("magnet:") {
        return None;
    }
    let start = url.find("xt=urn:btih:")? + "xt=urn:btih:".len();
    let rest = &url[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    let hash = &rest[..end];
    if hash.is_empty() {
        None
    } else {
        Some(hash.to_ascii_lowercase())
    }
}

fn id_list(selection: &[FileSelection], download: bool) -> String {
    selection
        .iter()
        .filter(|file| file.download == download)
        .map(|file| file.index.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn magnet_infohash_is_extracted_lowercase() {
        let url = "magnet:?xt=urn:btih:C12FE1C06BBA254A9DC9F519B335AA7C1367A88A&dn=ubuntu";
        assert_eq!(
            magnet_infohash(url).as_deref(),
            Some("c12fe1c06bba254a9dc9f519b335aa7c1367a88a")
        );
        assert!(magnet_infohash("https://example.org/a.torrent").is_none());
        assert!(magnet_infohash("magnet:?dn=no-hash").is_none());
    }

    #[test]
    fn form_merge_renders_scalars_only() {
        let mut form = Vec::new();
        merge_form(
            &mut form,
            &json!({ "category": "linux", "paused": false, "ratioLimit": 2, "nested": {"x": 1} }),
        );
        form.sort();
        assert_eq!(
            form,
            vec![
                ("category".to_string(), "linux".to_string()),
                ("paused".to_string(), "false".to_string()),
                ("ratioLimit".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn id_list_partitions_by_download_flag() {
        let selection = [
            FileSelection {
                index: 0,
                download: true,
            },
            FileSelection {
                index: 1,
                download: false,
            },
            FileSelection {
                index: 2,
                download: true,
            },
        ];
        assert_eq!(id_list(&selection, true), "0|2");
        assert_eq!(id_list(&selection, false), "1");
    }
}
