//! # Design
//!
//! - Centralize application-level errors for bootstrap and orchestration.
//! - Keep error messages constant while carrying context fields for
//!   debugging.
//! - Preserve source errors without re-logging at call sites.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Environment configuration was missing.
    #[error("missing environment configuration")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: &'static str,
    },
    /// Reading the configuration file failed.
    #[error("failed to read configuration file")]
    ConfigRead {
        /// Path of the configuration file.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
    /// Parsing the configuration file failed.
    #[error("failed to parse configuration file")]
    ConfigParse {
        /// Path of the configuration file.
        path: PathBuf,
        /// Source parse error.
        source: toml::de::Error,
    },
    /// Connecting to the database failed.
    #[error("database connection failed")]
    Database {
        /// Operation identifier.
        operation: &'static str,
        /// Source SQL error.
        source: sqlx::Error,
    },
    /// Data layer initialisation failed.
    #[error("data layer initialisation failed")]
    Data {
        /// Operation identifier.
        operation: &'static str,
        /// Source data-layer error.
        source: conveyor_data::DataError,
    },
    /// Queue operations failed.
    #[error("queue operation failed")]
    Queue {
        /// Operation identifier.
        operation: &'static str,
        /// Source queue error.
        source: conveyor_queue::QueueError,
    },
    /// Task factory registration failed.
    #[error("task factory registration failed")]
    Factory {
        /// Source factory error.
        source: conveyor_queue::FactoryError,
    },
    /// Downloader initialisation failed.
    #[error("downloader initialisation failed")]
    Downloader {
        /// Operation identifier.
        operation: &'static str,
        /// Source downloader error.
        source: conveyor_download_core::DownloadError,
    },
    /// An operation required the queue but it is disabled.
    #[error("queue is disabled by configuration")]
    QueueDisabled,
    /// An operation required a downloader but none is configured.
    #[error("no downloader is configured")]
    DownloaderDisabled,
}

impl AppError {
    pub(crate) const fn database(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Database { operation, source }
    }

    pub(crate) const fn data(operation: &'static str, source: conveyor_data::DataError) -> Self {
        Self::Data { operation, source }
    }

    pub(crate) const fn queue(operation: &'static str, source: conveyor_queue::QueueError) -> Self {
        Self::Queue { operation, source }
    }

    pub(crate) const fn downloader(
        operation: &'static str,
        source: conveyor_download_core::DownloadError,
    ) -> Self {
        Self::Downloader { operation, source }
    }
}
