//! JSON-RPC 2.0 envelope and aria2 status payload decoding.
//!
//! aria2 reports every numeric field as a decimal string; the helpers here
//! fold them back into integers and map aria2's download states onto the
//! canonical vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use conveyor_download_core::{
    DownloadError, DownloadHandle, DownloadResult, DownloadState, DownloadStatus, RemoteFile,
};

pub(crate) const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Vec<Value>,
    pub id: u64,
}

impl RpcRequest {
    pub(crate) fn new(method: &'static str, params: Vec<Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id,
        }
    }
}

/// A frame received from aria2: either a response (has `id`) or a push
/// notification (has `method`, no `id`).
#[derive(Debug, Deserialize)]
pub(crate) struct RpcFrame {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

impl RpcFrame {
    /// Responses carry an `id`; notification frames do not.
    pub(crate) const fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Fold the frame into the call result it answers.
    ///
    /// A `null` result deserialises to `Ok(None)`; the transport layer turns
    /// that into the distinct null-result error because only it knows which
    /// method was called.
    pub(crate) fn into_result(self) -> Result<Option<Value>, DownloadError> {
        if let Some(error) = self.error {
            // A missing GID surfaces as an RPC error, not a status.
            if error.message.contains("not found") {
                return Err(DownloadError::TaskNotFound);
            }
            return Err(DownloadError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result)
    }

    /// Extract the GID a notification refers to.
    pub(crate) fn notification_gid(&self) -> Option<&str> {
        self.params
            .as_ref()?
            .as_array()?
            .first()?
            .get("gid")?
            .as_str()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Aria2Status {
    pub status: String,
    #[serde(default)]
    pub total_length: String,
    #[serde(default)]
    pub completed_length: String,
    #[serde(default)]
    pub upload_length: String,
    #[serde(default)]
    pub download_speed: String,
    #[serde(default)]
    pub upload_speed: String,
    #[serde(default)]
    pub info_hash: Option<String>,
    #[serde(default)]
    pub bitfield: Option<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub followed_by: Option<Vec<String>>,
    #[serde(default)]
    pub bittorrent: Option<Aria2Bittorrent>,
    #[serde(default)]
    pub files: Vec<Aria2File>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Aria2Bittorrent {
    #[serde(default)]
    pub info: Option<Aria2BtInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Aria2BtInfo {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Aria2File {
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub length: String,
    #[serde(default)]
    pub completed_length: String,
    #[serde(default)]
    pub selected: String,
}

/// Map a raw aria2 status payload onto the canonical snapshot.
///
/// `removed` downloads surface as [`DownloadError::TaskNotFound`] so callers
/// can treat backend-side eviction as cancellation.
pub(crate) fn map_status(raw: &Aria2Status) -> DownloadResult<DownloadStatus> {
    let total = parse_decimal(&raw.total_length);
    let downloaded = parse_decimal(&raw.completed_length);
    let is_torrent = raw.bittorrent.is_some();

    let state = match raw.status.as_str() {
        "active" => {
            if is_torrent && total > 0 && downloaded == total {
                DownloadState::Seeding
            } else {
                DownloadState::Downloading
            }
        }
        "waiting" | "paused" => DownloadState::Downloading,
        "complete" => DownloadState::Completed,
        "error" => DownloadState::Error,
        "removed" => return Err(DownloadError::TaskNotFound),
        _ => DownloadState::Unknown,
    };

    let name = raw
        .bittorrent
        .as_ref()
        .and_then(|bt| bt.info.as_ref())
        .and_then(|info| info.name.clone())
        .or_else(|| {
            raw.files.first().map(|file| {
                file.path
                    .rsplit('/')
                    .next()
                    .unwrap_or(file.path.as_str())
                    .to_string()
            })
        });

    let files = raw
        .files
        .iter()
        .map(|file| RemoteFile {
            index: parse_decimal(&file.index).try_into().unwrap_or(u32::MAX),
            path: file.path.clone(),
            size: parse_decimal(&file.length),
            completed: parse_decimal(&file.completed_length),
            selected: file.selected == "true",
        })
        .collect();

    let followed_by = raw
        .followed_by
        .as_ref()
        .and_then(|gids| gids.first())
        .map(|gid| DownloadHandle::from_id(gid.clone()));

    Ok(DownloadStatus {
        state,
        name,
        hash: raw.info_hash.clone(),
        save_path: raw.dir.clone(),
        total,
        downloaded,
        download_speed: parse_decimal(&raw.download_speed),
        uploaded: parse_decimal(&raw.upload_length),
        upload_speed: parse_decimal(&raw.upload_speed),
        files,
        pieces: raw.bitfield.as_deref().map_or_else(Vec::new, decode_bitfield),
        error_message: raw.error_message.clone(),
        followed_by,
    })
}

fn parse_decimal(value: &str) -> u64 {
    value.parse().unwrap_or(0)
}

/// Expand aria2's hex piece bitfield into per-piece booleans.
pub(crate) fn decode_bitfield(bitfield: &str) -> Vec<bool> {
    let mut pieces = Vec::with_capacity(bitfield.len() * 4);
    for nibble in bitfield.chars() {
        let Some(value) = nibble.to_digit(16) else {
            continue;
        };
        for bit in (0..4).rev() {
            pieces.push(value & (1 << bit) != 0);
        }
    }
    pieces
}
