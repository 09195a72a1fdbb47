//! The aria2 implementation of the downloader contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use conveyor_download_core::{
    DownloadError, DownloadHandle, DownloadRequest, DownloadResult, DownloadStatus, Downloader,
    FileSelection,
};

use crate::notify::Aria2Notifier;
use crate::protocol::{Aria2Status, RpcRequest, map_status};
use crate::transport::{Transport, WsTransport};

/// How long after `cancel` the per-task temp directory is deleted. The
/// daemon may still hold file handles right after the remove call.
const TEMP_CLEANUP_DELAY: Duration = Duration::from_secs(120);

/// Settings for one aria2 endpoint.
#[derive(Debug, Clone)]
pub struct Aria2Config {
    /// RPC endpoint; `http(s)://` selects the POST transport, `ws(s)://`
    /// the WebSocket transport with push notifications.
    pub server: String,
    /// RPC secret, sent as the leading `token:<secret>` parameter.
    pub token: Option<String>,
    /// Root under which per-task temp directories are created.
    pub temp_path: PathBuf,
    /// Extra aria2 options merged into every created download.
    pub options: Value,
}

/// aria2 downloader adapter.
pub struct Aria2Downloader {
    transport: Transport,
    token: Option<String>,
    temp_root: PathBuf,
    extra_options: Value,
    next_id: AtomicU64,
    task_dirs: Mutex<HashMap<String, PathBuf>>,
}

impl Aria2Downloader {
    /// Connect to the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the WebSocket
    /// handshake fails.
    pub async fn connect(
        config: Aria2Config,
        notifier: Option<Arc<dyn Aria2Notifier>>,
    ) -> DownloadResult<Self> {
        let transport = if config.server.starts_with("ws://")
            || config.server.starts_with("wss://")
        {
            Transport::Ws(WsTransport::connect(&config.server, notifier).await?)
        } else {
            let client = reqwest::Client::builder()
                .build()
                .map_err(|err| DownloadError::transport("rpc.client", err))?;
            Transport::Http {
                client,
                endpoint: config.server,
            }
        };

        Ok(Self {
            transport,
            token: config.token,
            temp_root: config.temp_path,
            extra_options: config.options,
            next_id: AtomicU64::new(0),
            task_dirs: Mutex::new(HashMap::new()),
        })
    }

    async fn rpc(&self, method: &'static str, params: Vec<Value>) -> DownloadResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let params = with_auth(self.token.as_deref(), params);
        self.transport
            .call(RpcRequest::new(method, params, id))
            .await
    }

    async fn tell_status(&self, gid: &str) -> DownloadResult<Aria2Status> {
        let result = self.rpc("aria2.tellStatus", vec![json!(gid)]).await?;
        serde_json::from_value(result)
            .map_err(|err| DownloadError::protocol(format!("malformed tellStatus payload: {err}")))
    }

    fn remember_dir(&self, gid: &str, dir: PathBuf) {
        self.lock_dirs().insert(gid.to_string(), dir);
    }

    fn forget_dir(&self, gid: &str) -> Option<PathBuf> {
        self.lock_dirs().remove(gid)
    }

    fn lock_dirs(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        match self.task_dirs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("aria2 temp dir map poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }

    fn schedule_temp_cleanup(&self, gid: &str, dir: PathBuf) {
        if !dir.starts_with(&self.temp_root) {
            warn!(
                gid,
                dir = %dir.display(),
                "refusing to delete directory outside the temp root"
            );
            return;
        }
        let gid = gid.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(TEMP_CLEANUP_DELAY).await;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(gid, dir = %dir.display(), "removed aria2 temp directory"),
                Err(err) => debug!(
                    gid,
                    dir = %dir.display(),
                    error = %err,
                    "failed to remove aria2 temp directory"
                ),
            }
        });
    }
}

#[async_trait]
impl Downloader for Aria2Downloader {
    async fn create(&self, request: &DownloadRequest) -> DownloadResult<DownloadHandle> {
        let dir = self.temp_root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| DownloadError::transport("fs.create_dir", err))?;

        let (method, params) =
            build_create_invocation(&request.url, &request.options, &self.extra_options, &dir)?;
        let result = self.rpc(method, params).await?;
        let gid = extract_gid(method, &result)?;

        self.remember_dir(&gid, dir);
        info!(gid, url = %request.url, "aria2 download created");
        Ok(DownloadHandle::from_id(gid))
    }

    async fn info(&self, handle: &DownloadHandle) -> DownloadResult<DownloadStatus> {
        let gid = require_gid(handle)?;
        let raw = self.tell_status(gid).await?;
        map_status(&raw)
    }

    async fn cancel(&self, handle: &DownloadHandle) -> DownloadResult<()> {
        let gid = require_gid(handle)?;

        // The temp directory is known from `create`; after a process restart
        // it has to be recovered from the daemon before the task is removed.
        let dir = match self.forget_dir(gid) {
            Some(dir) => Some(dir),
            None => self
                .tell_status(gid)
                .await
                .ok()
                .and_then(|status| status.dir.map(PathBuf::from)),
        };

        match self.rpc("aria2.remove", vec![json!(gid)]).await {
            Ok(_) => {}
            Err(DownloadError::TaskNotFound) => {
                debug!(gid, "aria2 task already gone on cancel");
            }
            Err(err) => return Err(err),
        }

        if let Some(dir) = dir {
            self.schedule_temp_cleanup(gid, dir);
        }
        Ok(())
    }

    async fn select_files(
        &self,
        handle: &DownloadHandle,
        selection: &[FileSelection],
    ) -> DownloadResult<()> {
        let gid = require_gid(handle)?;
        let list = selection_list(selection);
        self.rpc(
            "aria2.changeOption",
            vec![json!(gid), json!({ "select-file": list })],
        )
        .await?;
        Ok(())
    }

    async fn probe(&self) -> DownloadResult<String> {
        let result = self.rpc("aria2.getVersion", Vec::new()).await?;
        result
            .get("version")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| DownloadError::protocol("getVersion payload carried no version"))
    }
}

fn require_gid(handle: &DownloadHandle) -> DownloadResult<&str> {
    handle
        .id
        .as_deref()
        .ok_or_else(|| DownloadError::protocol("handle carries no aria2 gid"))
}

fn with_auth(token: Option<&str>, mut params: Vec<Value>) -> Vec<Value> {
    if let Some(token) = token {
        params.insert(0, json!(format!("token:{token}")));
    }
    params
}

/// Choose the RPC method and parameters for a create request.
///
/// Plain URLs go through `addUri`. Callers may instead supply base64
/// metainfo under `options.torrent` or a base64 metalink document under
/// `options.metalink`; those keys are consumed here and never forwarded to
/// the daemon.
fn build_create_invocation(
    url: &str,
    request_options: &Value,
    extra_options: &Value,
    dir: &Path,
) -> DownloadResult<(&'static str, Vec<Value>)> {
    let mut options = Map::new();
    merge_options(&mut options, extra_options);
    merge_options(&mut options, request_options);
    let torrent = take_payload(&mut options, "torrent")?;
    let metalink = take_payload(&mut options, "metalink")?;

    options.insert("dir".to_string(), json!(dir.display().to_string()));
    options.insert("follow-torrent".to_string(), json!("mem"));
    let options = Value::Object(options);

    if let Some(torrent) = torrent {
        return Ok((
            "aria2.addTorrent",
            vec![json!(torrent), Value::Array(Vec::new()), options],
        ));
    }
    if let Some(metalink) = metalink {
        return Ok(("aria2.addMetalink", vec![json!(metalink), options]));
    }
    Ok(("aria2.addUri", vec![json!([url]), options]))
}

fn merge_options(target: &mut Map<String, Value>, source: &Value) {
    if let Value::Object(entries) = source {
        for (key, value) in entries {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn take_payload(options: &mut Map<String, Value>, key: &str) -> DownloadResult<Option<String>> {
    let Some(value) = options.remove(key) else {
        return Ok(None);
    };
    let Value::String(payload) = value else {
        return Err(DownloadError::protocol(format!(
            "option `{key}` must be a base64 string"
        )));
    };
    BASE64
        .decode(&payload)
        .map_err(|_| DownloadError::protocol(format!("option `{key}` is not valid base64")))?;
    Ok(Some(payload))
}

fn extract_gid(method: &'static str, result: &Value) -> DownloadResult<String> {
    let gid = match result {
        Value::String(gid) => Some(gid.clone()),
        // addMetalink answers with an array of created GIDs.
        Value::Array(gids) => gids.first().and_then(Value::as_str).map(ToString::to_string),
        _ => None,
    };
    gid.ok_or_else(|| DownloadError::protocol(format!("{method} returned no gid")))
}

fn selection_list(selection: &[FileSelection]) -> String {
    let mut indices: Vec<u32> = selection
        .iter()
        .filter(|file| file.download)
        .map(|file| file.index)
        .collect();
    indices.sort_unstable();
    indices
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
