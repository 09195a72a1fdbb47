//! Service wiring: telemetry, persistence, queue, cron, and downloaders.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use uuid::Uuid;

use conveyor_cron::{CronConfig, CronScheduler};
use conveyor_data::PgTaskRepository;
use conveyor_download_aria2::{Aria2Config, Aria2Downloader};
use conveyor_download_core::{Downloader, DownloaderRegistry};
use conveyor_download_qbit::{QbitConfig, QbitDownloader};
use conveyor_download_task::{REMOTE_DOWNLOAD_KIND, RemoteDownloadTask, register_factory};
use conveyor_queue::{Queue, QueueConfig, TaskFactoryRegistry, TaskRepository};
use conveyor_telemetry::{LoggingConfig, init_logging};

use crate::error::{AppError, AppResult};
use crate::settings::{DownloaderKind, DownloaderSettings, Settings};

/// The wired application: queue, cron, and downloader registry.
pub struct App {
    settings: Settings,
    queue: Option<Queue>,
    cron: Option<Arc<CronScheduler>>,
    downloaders: Arc<DownloaderRegistry>,
}

impl App {
    /// Wire all services according to the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the database, a configured downloader, or the
    /// queue cannot be brought up.
    pub async fn bootstrap(settings: Settings) -> AppResult<Self> {
        let downloaders = Arc::new(DownloaderRegistry::new());
        if settings.downloader.enable {
            let name = settings.downloader.kind.as_str();
            let downloader = build_downloader(&settings.downloader).await?;
            match downloader.probe().await {
                Ok(version) => info!(downloader = name, version, "downloader connected"),
                Err(err) => warn!(
                    downloader = name,
                    error = %err,
                    "downloader connectivity probe failed"
                ),
            }
            downloaders.insert(name, downloader);
        }

        let factories = Arc::new(TaskFactoryRegistry::new());
        register_factory(&factories, Arc::clone(&downloaders))
            .map_err(|source| AppError::Factory { source })?;

        let queue = if settings.queue.enable {
            Some(start_queue(&settings, factories).await?)
        } else {
            None
        };

        let cron = if settings.crontab.enable {
            let scheduler = Arc::new(CronScheduler::new(CronConfig {
                with_seconds: settings.crontab.with_seconds,
            }));
            scheduler.start();
            Some(scheduler)
        } else {
            None
        };

        Ok(Self {
            settings,
            queue,
            cron,
            downloaders,
        })
    }

    /// The task queue, when enabled.
    #[must_use]
    pub const fn queue(&self) -> Option<&Queue> {
        self.queue.as_ref()
    }

    /// The cron scheduler, when enabled.
    #[must_use]
    pub fn cron(&self) -> Option<&Arc<CronScheduler>> {
        self.cron.as_ref()
    }

    /// The downloader registry.
    #[must_use]
    pub fn downloaders(&self) -> &Arc<DownloaderRegistry> {
        &self.downloaders
    }

    /// Enqueue a remote download on the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue or downloader is disabled, or when
    /// submission fails.
    pub async fn submit_download(
        &self,
        url: impl Into<String>,
        options: serde_json::Value,
        owner: Option<Uuid>,
    ) -> AppResult<i64> {
        let queue = self.queue.as_ref().ok_or(AppError::QueueDisabled)?;
        if !self.settings.downloader.enable {
            return Err(AppError::DownloaderDisabled);
        }
        let task = RemoteDownloadTask::new(
            Arc::clone(&self.downloaders),
            self.settings.downloader.kind.as_str(),
            url,
            options,
            owner,
        );
        queue
            .submit(Arc::new(task))
            .await
            .map_err(|source| AppError::queue("submit_download", source))
    }

    /// Stop the cron scheduler and drain the queue workers.
    pub async fn shutdown(&self) {
        if let Some(cron) = &self.cron {
            cron.stop().await;
        }
        if let Some(queue) = &self.queue {
            queue.shutdown().await;
        }
        info!("application shut down");
    }
}

async fn start_queue(
    settings: &Settings,
    factories: Arc<TaskFactoryRegistry>,
) -> AppResult<Queue> {
    let database_url = std::env::var("DATABASE_URL").map_err(|_| AppError::MissingEnv {
        name: "DATABASE_URL",
    })?;
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&database_url)
        .await
        .map_err(|source| AppError::database("pool.connect", source))?;
    let repo = PgTaskRepository::new(pool)
        .await
        .map_err(|source| AppError::data("task_repository.new", source))?;

    let config = QueueConfig {
        name: settings.queue.name.clone(),
        worker_count: settings.queue.worker_count,
        max_retry: settings.queue.max_retry,
        resume_kinds: vec![REMOTE_DOWNLOAD_KIND.to_string()],
        ..QueueConfig::default()
    };
    let queue = Queue::new(config, Arc::new(repo) as Arc<dyn TaskRepository>, factories);
    queue
        .start()
        .await
        .map_err(|source| AppError::queue("queue.start", source))?;
    Ok(queue)
}

async fn build_downloader(settings: &DownloaderSettings) -> AppResult<Arc<dyn Downloader>> {
    match settings.kind {
        DownloaderKind::Aria2 => {
            let config = Aria2Config {
                server: settings.aria2.server.clone(),
                token: settings.aria2.token.clone(),
                temp_path: settings.aria2.temp_path.clone(),
                options: settings.aria2.options.clone(),
            };
            let downloader = Aria2Downloader::connect(config, None)
                .await
                .map_err(|source| AppError::downloader("aria2.connect", source))?;
            Ok(Arc::new(downloader))
        }
        DownloaderKind::Qbittorrent => {
            let config = QbitConfig {
                server: settings.qbittorrent.server.clone(),
                user: settings.qbittorrent.user.clone(),
                password: settings.qbittorrent.password.clone(),
                temp_path: settings.qbittorrent.temp_path.clone(),
                options: settings.qbittorrent.options.clone(),
            };
            let downloader = QbitDownloader::connect(config)
                .await
                .map_err(|source| AppError::downloader("qbittorrent.connect", source))?;
            Ok(Arc::new(downloader))
        }
    }
}

/// Bootstrap the application and block until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if startup fails; signal-handler installation failures
/// surface as IO errors from tokio.
pub async fn run_app() -> anyhow::Result<()> {
    init_logging(&LoggingConfig::default())?;
    let settings = Settings::load()?;
    let app = App::bootstrap(settings).await?;
    info!("conveyor started; waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    app.shutdown().await;
    Ok(())
}
