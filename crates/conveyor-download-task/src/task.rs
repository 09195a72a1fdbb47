//! Download orchestration as a resumable queue task.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conveyor_download_core::{
    DownloadError, DownloadHandle, DownloadRequest, DownloadState, DownloadStatus, Downloader,
    DownloaderRegistry,
};
use conveyor_queue::{
    FactoryError, ProgressChannel, StepContext, StepError, StepOutcome, Task,
    TaskFactoryRegistry, TaskRow, TaskStateError, TaskStatus, TaskSummary,
};

/// Kind tag under which remote downloads are persisted and resumed.
pub const REMOTE_DOWNLOAD_KIND: &str = "remote_download";

/// Cadence between status polls while a download is running.
const POLL_INTERVAL_SECS: i64 = 10;
/// Consecutive failed polls tolerated before the iteration reports an error.
const MAX_INFO_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DownloadPhase {
    NotStarted,
    Monitor,
    Seeding,
}

const fn phase_label(phase: DownloadPhase) -> &'static str {
    match phase {
        DownloadPhase::NotStarted => "not_started",
        DownloadPhase::Monitor => "monitor",
        DownloadPhase::Seeding => "seeding",
    }
}

/// Task-owned private state; serialised verbatim into the task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DownloadTaskState {
    url: String,
    downloader: String,
    #[serde(default)]
    handle: Option<DownloadHandle>,
    #[serde(default)]
    last_status: Option<DownloadStatus>,
    phase: DownloadPhase,
    #[serde(default)]
    info_failures: u32,
    #[serde(default)]
    info_succeeded: bool,
    #[serde(default)]
    options: serde_json::Value,
}

/// Resumable task driving one remote download.
pub struct RemoteDownloadTask {
    downloaders: Arc<DownloaderRegistry>,
    owner: Option<Uuid>,
    state: Mutex<DownloadTaskState>,
}

impl RemoteDownloadTask {
    /// Build a fresh download task for `url` on the named downloader.
    #[must_use]
    pub fn new(
        downloaders: Arc<DownloaderRegistry>,
        downloader: impl Into<String>,
        url: impl Into<String>,
        options: serde_json::Value,
        owner: Option<Uuid>,
    ) -> Self {
        Self {
            downloaders,
            owner,
            state: Mutex::new(DownloadTaskState {
                url: url.into(),
                downloader: downloader.into(),
                handle: None,
                last_status: None,
                phase: DownloadPhase::NotStarted,
                info_failures: 0,
                info_succeeded: false,
                options,
            }),
        }
    }

    /// Rebuild a task from its persisted row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row carries no private state or the state
    /// cannot be deserialised.
    pub fn from_row(
        downloaders: Arc<DownloaderRegistry>,
        row: &TaskRow,
    ) -> Result<Self, FactoryError> {
        let raw = row
            .private_state
            .as_deref()
            .ok_or_else(|| FactoryError::Rebuild {
                kind: row.kind.clone(),
                source: "task row carries no private state".into(),
            })?;
        let state: DownloadTaskState =
            serde_json::from_str(raw).map_err(|err| FactoryError::Rebuild {
                kind: row.kind.clone(),
                source: Box::new(err),
            })?;
        Ok(Self {
            downloaders,
            owner: row.owner_id,
            state: Mutex::new(state),
        })
    }

    async fn start(
        &self,
        downloader: &Arc<dyn Downloader>,
        url: String,
        options: serde_json::Value,
    ) -> Result<StepOutcome, StepError> {
        let request = DownloadRequest { url, options };
        match downloader.create(&request).await {
            Ok(handle) => {
                info!(url = %request.url, "remote download created");
                let mut state = self.lock_state();
                state.handle = Some(handle);
                state.phase = DownloadPhase::Monitor;
                // Resume immediately so the first poll happens right away.
                Ok(StepOutcome::Suspend {
                    resume_at: Utc::now(),
                })
            }
            Err(err @ (DownloadError::Configuration { .. } | DownloadError::Unauthorized)) => {
                Err(StepError::critical(format!(
                    "downloader rejected the request: {err}"
                )))
            }
            Err(err) => Err(StepError::retryable(format!(
                "failed to create remote download: {err}"
            ))),
        }
    }

    async fn poll(
        &self,
        downloader: &Arc<dyn Downloader>,
        handle: Option<DownloadHandle>,
    ) -> Result<StepOutcome, StepError> {
        let Some(handle) = handle else {
            return Err(StepError::critical("monitor phase entered without a handle"));
        };

        match downloader.info(&handle).await {
            Ok(status) => self.observe(&status),
            Err(DownloadError::TaskNotFound) if self.lock_state().info_succeeded => {
                info!("remote download disappeared from the backend; treating as cancelled");
                Ok(StepOutcome::Cancelled)
            }
            Err(err) => {
                let failures = {
                    let mut state = self.lock_state();
                    state.info_failures += 1;
                    state.info_failures
                };
                if failures >= MAX_INFO_FAILURES {
                    // Reset so a queue-level retry starts with a clean slate.
                    self.lock_state().info_failures = 0;
                    return Err(StepError::retryable(format!(
                        "download status unavailable after {failures} attempts: {err}"
                    )));
                }
                debug!(failures, error = %err, "download status poll failed; will retry");
                Ok(StepOutcome::Suspend {
                    resume_at: Utc::now() + ChronoDuration::seconds(POLL_INTERVAL_SECS),
                })
            }
        }
    }

    fn observe(&self, status: &DownloadStatus) -> Result<StepOutcome, StepError> {
        let mut state = self.lock_state();
        state.info_succeeded = true;
        state.info_failures = 0;

        if let Some(follow) = status.followed_by.clone()
            && !follow.is_empty()
        {
            debug!("backend replaced the download handle; adopting follow-up");
            state.handle = Some(follow);
            return Ok(StepOutcome::Suspend {
                resume_at: Utc::now(),
            });
        }

        state.last_status = Some(status.clone());
        match status.state {
            DownloadState::Completed => Ok(StepOutcome::Completed),
            DownloadState::Seeding => {
                state.phase = DownloadPhase::Seeding;
                Ok(StepOutcome::Suspend {
                    resume_at: Utc::now() + ChronoDuration::seconds(POLL_INTERVAL_SECS),
                })
            }
            DownloadState::Downloading => Ok(StepOutcome::Suspend {
                resume_at: Utc::now() + ChronoDuration::seconds(POLL_INTERVAL_SECS),
            }),
            DownloadState::Error | DownloadState::Unknown => {
                Err(StepError::critical(status.error_message.clone().unwrap_or_else(
                    || "backend reported a failed download".to_string(),
                )))
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DownloadTaskState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("download task state poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

#[async_trait]
impl Task for RemoteDownloadTask {
    fn kind(&self) -> &str {
        REMOTE_DOWNLOAD_KIND
    }

    fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    fn private_state(&self) -> Result<Option<String>, TaskStateError> {
        let state = self.lock_state();
        serde_json::to_string(&*state)
            .map(Some)
            .map_err(TaskStateError::new)
    }

    async fn step(&self, _cx: &StepContext) -> Result<StepOutcome, StepError> {
        let (downloader_name, phase, handle, url, options) = {
            let state = self.lock_state();
            (
                state.downloader.clone(),
                state.phase,
                state.handle.clone(),
                state.url.clone(),
                state.options.clone(),
            )
        };

        let Some(downloader) = self.downloaders.get(&downloader_name) else {
            return Err(StepError::critical(format!(
                "downloader `{downloader_name}` is not registered"
            )));
        };

        match phase {
            DownloadPhase::NotStarted => self.start(&downloader, url, options).await,
            DownloadPhase::Monitor | DownloadPhase::Seeding => {
                self.poll(&downloader, handle).await
            }
        }
    }

    async fn cleanup(&self, _cx: &StepContext, final_status: TaskStatus) {
        if !matches!(final_status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return;
        }
        let (downloader_name, handle) = {
            let state = self.lock_state();
            (state.downloader.clone(), state.handle.clone())
        };
        let Some(handle) = handle else {
            return;
        };
        let Some(downloader) = self.downloaders.get(&downloader_name) else {
            warn!(
                downloader = %downloader_name,
                "cannot cancel remote download: downloader is gone"
            );
            return;
        };
        match downloader.cancel(&handle).await {
            Ok(()) | Err(DownloadError::TaskNotFound) => {}
            Err(err) => warn!(error = %err, "failed to cancel remote download during cleanup"),
        }
    }

    fn progress(&self) -> BTreeMap<String, ProgressChannel> {
        let state = self.lock_state();
        let mut channels = BTreeMap::new();
        if let Some(status) = &state.last_status {
            channels.insert(
                "download".to_string(),
                ProgressChannel {
                    total: status.total,
                    current: status.downloaded,
                    identifier: status.name.clone().unwrap_or_default(),
                },
            );
        }
        channels
    }

    fn summarize(&self) -> Option<TaskSummary> {
        let state = self.lock_state();
        let mut props = json!({
            "url": state.url,
            "downloader": state.downloader,
        });
        if let Some(status) = &state.last_status {
            if let Ok(mut value) = serde_json::to_value(status) {
                if let Some(object) = value.as_object_mut() {
                    // The save path may reveal operator directories.
                    object.remove("save_path");
                }
                props["status"] = value;
            }
        }
        Some(TaskSummary {
            phase: phase_label(state.phase).to_string(),
            props,
        })
    }
}

/// Register the remote-download factory so queue resume-on-start can
/// reconstruct persisted downloads.
///
/// # Errors
///
/// Returns an error if the kind is already registered.
pub fn register_factory(
    factories: &TaskFactoryRegistry,
    downloaders: Arc<DownloaderRegistry>,
) -> Result<(), FactoryError> {
    factories.register(REMOTE_DOWNLOAD_KIND, move |row| {
        RemoteDownloadTask::from_row(Arc::clone(&downloaders), row)
            .map(|task| Arc::new(task) as Arc<dyn Task>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use conveyor_download_core::{DownloadResult, Downloader, FileSelection};
    use conveyor_queue::PublicState;

    #[derive(Default)]
    struct MockDownloader {
        info_script: Mutex<VecDeque<DownloadResult<DownloadStatus>>>,
        creates: AtomicU32,
        cancels: AtomicU32,
    }

    impl MockDownloader {
        fn scripted(script: Vec<DownloadResult<DownloadStatus>>) -> Arc<Self> {
            Arc::new(Self {
                info_script: Mutex::new(script.into()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl Downloader for MockDownloader {
        async fn create(&self, _request: &DownloadRequest) -> DownloadResult<DownloadHandle> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(DownloadHandle::from_id("gid-1"))
        }

        async fn info(&self, _handle: &DownloadHandle) -> DownloadResult<DownloadStatus> {
            self.info_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(downloading(50)))
        }

        async fn cancel(&self, _handle: &DownloadHandle) -> DownloadResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn select_files(
            &self,
            _handle: &DownloadHandle,
            _selection: &[FileSelection],
        ) -> DownloadResult<()> {
            Ok(())
        }

        async fn probe(&self) -> DownloadResult<String> {
            Ok("mock".to_string())
        }
    }

    fn downloading(downloaded: u64) -> DownloadStatus {
        DownloadStatus {
            state: DownloadState::Downloading,
            name: Some("payload.iso".to_string()),
            save_path: Some("/srv/secret/tmp".to_string()),
            total: 100,
            downloaded,
            ..DownloadStatus::default()
        }
    }

    fn completed() -> DownloadStatus {
        DownloadStatus {
            state: DownloadState::Completed,
            name: Some("payload.iso".to_string()),
            total: 100,
            downloaded: 100,
            ..DownloadStatus::default()
        }
    }

    fn registry_with(downloader: Arc<MockDownloader>) -> Arc<DownloaderRegistry> {
        let registry = Arc::new(DownloaderRegistry::new());
        registry.insert("mock", downloader);
        registry
    }

    fn cx() -> StepContext {
        StepContext {
            task_id: 1,
            correlation_id: Uuid::new_v4(),
            owner: None,
            attempt: 0,
        }
    }

    fn task(registry: Arc<DownloaderRegistry>) -> RemoteDownloadTask {
        RemoteDownloadTask::new(
            registry,
            "mock",
            "https://example.org/payload.iso",
            serde_json::Value::Null,
            None,
        )
    }

    #[tokio::test]
    async fn happy_path_walks_create_monitor_completed() {
        let downloader = MockDownloader::scripted(vec![
            Ok(downloading(10)),
            Ok(downloading(60)),
            Ok(completed()),
        ]);
        let task = task(registry_with(Arc::clone(&downloader)));
        let cx = cx();

        // Creation suspends with an immediate resume so the first poll runs
        // right away.
        match task.step(&cx).await.unwrap() {
            StepOutcome::Suspend { resume_at } => assert!(resume_at <= Utc::now()),
            other => panic!("expected suspend after create, got {other:?}"),
        }
        assert_eq!(downloader.creates.load(Ordering::SeqCst), 1);

        for _ in 0..2 {
            match task.step(&cx).await.unwrap() {
                StepOutcome::Suspend { resume_at } => assert!(resume_at > Utc::now()),
                other => panic!("expected poll suspension, got {other:?}"),
            }
        }

        assert_eq!(task.step(&cx).await.unwrap(), StepOutcome::Completed);
        let progress = task.progress();
        assert_eq!(progress["download"].current, 100);
        assert_eq!(progress["download"].identifier, "payload.iso");
    }

    #[tokio::test]
    async fn task_not_found_after_success_is_cancelled() {
        let downloader = MockDownloader::scripted(vec![
            Ok(downloading(10)),
            Err(DownloadError::TaskNotFound),
        ]);
        let task = task(registry_with(downloader));
        let cx = cx();

        task.step(&cx).await.unwrap();
        task.step(&cx).await.unwrap();
        assert_eq!(task.step(&cx).await.unwrap(), StepOutcome::Cancelled);
    }

    #[tokio::test]
    async fn transient_poll_failures_have_a_budget() {
        let failures = (0..5)
            .map(|_| Err(DownloadError::protocol("flaky backend")))
            .collect();
        let task = task(registry_with(MockDownloader::scripted(failures)));
        let cx = cx();

        task.step(&cx).await.unwrap();
        for _ in 0..4 {
            match task.step(&cx).await.unwrap() {
                StepOutcome::Suspend { .. } => {}
                other => panic!("expected suspension, got {other:?}"),
            }
        }
        let err = task.step(&cx).await.unwrap_err();
        assert!(!err.critical, "poll budget exhaustion is retryable");
        assert!(err.message.contains("5 attempts"));
    }

    #[tokio::test]
    async fn followed_by_handle_is_adopted() {
        let mut follow = downloading(0);
        follow.followed_by = Some(DownloadHandle::from_id("gid-2"));
        let downloader = MockDownloader::scripted(vec![Ok(follow), Ok(completed())]);
        let task = task(registry_with(downloader));
        let cx = cx();

        task.step(&cx).await.unwrap();
        match task.step(&cx).await.unwrap() {
            StepOutcome::Suspend { resume_at } => assert!(resume_at <= Utc::now()),
            other => panic!("expected immediate suspension, got {other:?}"),
        }
        assert_eq!(
            task.lock_state().handle,
            Some(DownloadHandle::from_id("gid-2"))
        );
        assert_eq!(task.step(&cx).await.unwrap(), StepOutcome::Completed);
    }

    #[tokio::test]
    async fn backend_error_state_is_critical() {
        let mut failed = downloading(10);
        failed.state = DownloadState::Error;
        failed.error_message = Some("disk full".to_string());
        let task = task(registry_with(MockDownloader::scripted(vec![Ok(failed)])));
        let cx = cx();

        task.step(&cx).await.unwrap();
        let err = task.step(&cx).await.unwrap_err();
        assert!(err.critical);
        assert_eq!(err.message, "disk full");
    }

    #[tokio::test]
    async fn missing_downloader_is_critical() {
        let task = task(Arc::new(DownloaderRegistry::new()));
        let err = task.step(&cx()).await.unwrap_err();
        assert!(err.critical);
        assert!(err.message.contains("not registered"));
    }

    #[tokio::test]
    async fn cleanup_cancels_failed_downloads() {
        let downloader = MockDownloader::scripted(Vec::new());
        let task = task(registry_with(Arc::clone(&downloader)));
        let cx = cx();

        task.step(&cx).await.unwrap();
        task.cleanup(&cx, TaskStatus::Failed).await;
        assert_eq!(downloader.cancels.load(Ordering::SeqCst), 1);

        // Completed downloads keep their data.
        task.cleanup(&cx, TaskStatus::Completed).await;
        assert_eq!(downloader.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn factory_round_trips_private_state() {
        let downloader = MockDownloader::scripted(vec![Ok(downloading(42))]);
        let registry = registry_with(Arc::clone(&downloader));
        let task = task(Arc::clone(&registry));
        let cx = cx();
        task.step(&cx).await.unwrap();
        task.step(&cx).await.unwrap();

        let factories = TaskFactoryRegistry::new();
        register_factory(&factories, Arc::clone(&registry)).unwrap();

        let row = TaskRow {
            id: 11,
            kind: REMOTE_DOWNLOAD_KIND.to_string(),
            status: TaskStatus::Suspending,
            correlation_id: Uuid::new_v4(),
            owner_id: None,
            private_state: task.private_state().unwrap(),
            public_state: PublicState::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let rebuilt = factories.build(&row).unwrap();
        assert_eq!(rebuilt.kind(), REMOTE_DOWNLOAD_KIND);

        let summary = rebuilt.summarize().unwrap();
        assert_eq!(summary.phase, "monitor");
        assert_eq!(summary.props["status"]["downloaded"], 42);
        assert!(
            summary.props["status"].get("save_path").is_none(),
            "save_path must be redacted"
        );
    }

    #[tokio::test]
    async fn queue_drives_download_to_completion() {
        use conveyor_queue::{MemoryTaskRepository, Queue, QueueConfig, TaskRepository};
        use std::time::Duration;

        let downloader = MockDownloader::scripted(vec![Ok(completed())]);
        let registry = registry_with(Arc::clone(&downloader));
        let factories = Arc::new(TaskFactoryRegistry::new());
        register_factory(&factories, Arc::clone(&registry)).unwrap();

        let repo = Arc::new(MemoryTaskRepository::new());
        let queue = Queue::new(
            QueueConfig {
                task_pull_interval: Duration::from_millis(5),
                ..QueueConfig::default()
            },
            Arc::clone(&repo) as Arc<dyn TaskRepository>,
            factories,
        );
        queue.start().await.unwrap();

        let id = queue
            .submit(Arc::new(task(Arc::clone(&registry))))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.metrics().succeeded == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("download task never completed");

        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed);
        let state: serde_json::Value =
            serde_json::from_str(row.private_state.as_deref().unwrap()).unwrap();
        assert_eq!(state["last_status"]["state"], "completed");
        assert_eq!(downloader.creates.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn summarize_redacts_save_path() {
        let downloader = MockDownloader::scripted(vec![Ok(downloading(10))]);
        let task = task(registry_with(downloader));
        let cx = cx();
        task.step(&cx).await.unwrap();
        task.step(&cx).await.unwrap();

        let summary = task.summarize().unwrap();
        assert!(summary.props["status"].get("save_path").is_none());
        assert_eq!(summary.props["url"], "https://example.org/payload.iso");
    }
}
