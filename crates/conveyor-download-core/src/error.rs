//! Error taxonomy shared by all downloader adapters.

use std::error::Error;

use thiserror::Error as ThisError;

/// Result alias for downloader operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors surfaced by downloader adapters.
#[derive(Debug, ThisError)]
pub enum DownloadError {
    /// The backend no longer knows the task; callers treat this as
    /// cancellation once a handle has previously resolved.
    #[error("download task not found")]
    TaskNotFound,
    /// The transport to the backend failed.
    #[error("downloader transport failed")]
    Transport {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying transport failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The backend answered with an RPC-level error object.
    #[error("downloader rpc failed")]
    Rpc {
        /// Backend error code.
        code: i64,
        /// Backend error message.
        message: String,
    },
    /// The backend answered a call with a null result.
    #[error("downloader rpc returned a null result")]
    NullResult {
        /// Method whose result was null.
        method: String,
    },
    /// The backend rejected the configured credentials.
    #[error("downloader rejected credentials")]
    Unauthorized,
    /// The backend answered with an unexpected HTTP status.
    #[error("downloader returned unexpected status")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body excerpt.
        body: String,
    },
    /// The backend's answer violated the expected protocol shape.
    #[error("downloader protocol violation")]
    Protocol {
        /// What was malformed.
        detail: String,
    },
    /// The adapter was constructed with unusable settings.
    #[error("downloader misconfigured")]
    Configuration {
        /// What was misconfigured.
        detail: String,
    },
}

impl DownloadError {
    /// Wrap a transport failure with operation context.
    #[must_use]
    pub fn transport(
        operation: &'static str,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            operation,
            source: Box::new(source),
        }
    }

    /// Shorthand for a protocol violation.
    #[must_use]
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }
}
