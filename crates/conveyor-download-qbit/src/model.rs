//! WebUI payload types and the mapping onto the canonical status snapshot.

use serde::Deserialize;

use conveyor_download_core::{DownloadState, DownloadStatus, RemoteFile};

/// Subset of `/api/v2/torrents/info` the adapter consumes.
#[derive(Debug, Deserialize)]
pub(crate) struct TorrentInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub save_path: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub completed: i64,
    #[serde(default)]
    pub dlspeed: i64,
    #[serde(default)]
    pub upspeed: i64,
    #[serde(default)]
    pub uploaded: i64,
    #[serde(default)]
    pub state: String,
}

/// Entry of `/api/v2/torrents/files`.
#[derive(Debug, Deserialize)]
pub(crate) struct TorrentFileEntry {
    /// Present since WebUI 4.4; older servers are covered by positional
    /// enumeration in [`build_status`].
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub priority: i64,
}

/// Map a WebUI state string onto the canonical vocabulary.
pub(crate) fn map_state(state: &str) -> DownloadState {
    match state {
        "error" | "missingFiles" => DownloadState::Error,
        "pausedUP" => DownloadState::Completed,
        "uploading" | "queuedUP" | "stalledUP" | "checkingUP" | "forcedUP" => {
            DownloadState::Seeding
        }
        "allocating" | "downloading" | "metaDL" | "pausedDL" | "queuedDL" | "stalledDL"
        | "checkingDL" | "forcedDL" | "checkingResumeData" | "moving" => {
            DownloadState::Downloading
        }
        _ => DownloadState::Unknown,
    }
}

/// Fold the three WebUI answers into one canonical snapshot.
pub(crate) fn build_status(
    info: &TorrentInfo,
    files: &[TorrentFileEntry],
    piece_states: &[u8],
) -> DownloadStatus {
    let files = files
        .iter()
        .enumerate()
        .map(|(position, file)| RemoteFile {
            index: file
                .index
                .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX)),
            path: file.name.clone(),
            size: clamp_u64(file.size),
            completed: completed_bytes(file.progress, file.size),
            selected: file.priority != 0,
        })
        .collect();

    DownloadStatus {
        state: map_state(&info.state),
        name: info.name.clone(),
        hash: info.hash.clone(),
        save_path: info.save_path.clone(),
        total: clamp_u64(info.size),
        downloaded: clamp_u64(info.completed),
        download_speed: clamp_u64(info.dlspeed),
        uploaded: clamp_u64(info.uploaded),
        upload_speed: clamp_u64(info.upspeed),
        files,
        // pieceStates: 0 = pending, 1 = downloading, 2 = downloaded.
        pieces: piece_states.iter().map(|state| *state == 2).collect(),
        error_message: None,
        followed_by: None,
    }
}

fn clamp_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn completed_bytes(progress: f64, size: i64) -> u64 {
    let size = clamp_u64(size);
    let progress = if progress.is_finite() {
        progress.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let completed = progress * precise(size);
    if completed >= precise(size) {
        size
    } else {
        // Bounded by `size`, so the cast cannot overflow.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            completed as u64
        }
    }
}

const fn precise(value: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        value as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(state: &str) -> TorrentInfo {
        serde_json::from_value(serde_json::json!({
            "name": "ubuntu.iso",
            "hash": "abcd1234",
            "save_path": "/downloads/tmp",
            "size": 1000,
            "completed": 400,
            "dlspeed": 100,
            "upspeed": 10,
            "uploaded": 50,
            "state": state,
        }))
        .unwrap()
    }

    #[test]
    fn webui_states_map_onto_canonical_values() {
        assert_eq!(map_state("downloading"), DownloadState::Downloading);
        assert_eq!(map_state("metaDL"), DownloadState::Downloading);
        assert_eq!(map_state("stalledUP"), DownloadState::Seeding);
        assert_eq!(map_state("uploading"), DownloadState::Seeding);
        assert_eq!(map_state("pausedUP"), DownloadState::Completed);
        assert_eq!(map_state("missingFiles"), DownloadState::Error);
        assert_eq!(map_state("somethingNew"), DownloadState::Unknown);
    }

    #[test]
    fn status_folds_files_and_pieces() {
        let files = vec![
            TorrentFileEntry {
                index: Some(0),
                name: "a.bin".to_string(),
                size: 600,
                progress: 0.5,
                priority: 1,
            },
            TorrentFileEntry {
                index: None,
                name: "b.bin".to_string(),
                size: 400,
                progress: 1.0,
                priority: 0,
            },
        ];
        let status = build_status(&info("downloading"), &files, &[2, 1, 0, 2]);

        assert_eq!(status.state, DownloadState::Downloading);
        assert_eq!(status.total, 1000);
        assert_eq!(status.downloaded, 400);
        assert_eq!(status.files[0].completed, 300);
        assert!(status.files[0].selected);
        assert_eq!(status.files[1].index, 1, "positional fallback");
        assert!(!status.files[1].selected);
        assert_eq!(status.pieces, vec![true, false, false, true]);
    }

    #[test]
    fn completed_bytes_is_clamped() {
        assert_eq!(completed_bytes(2.0, 100), 100);
        assert_eq!(completed_bytes(-0.5, 100), 0);
        assert_eq!(completed_bytes(0.0, 100), 0);
        assert_eq!(completed_bytes(1.0, 100), 100);
    }
}
