//! Process-local registry of configured downloader instances.
//!
//! The remote-download task persists only the *name* of the downloader it
//! uses; after a process restart it resolves the live instance through this
//! registry, which bootstrap populates from configuration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::error;

use crate::Downloader;

/// Thread-safe name-to-downloader map.
#[derive(Default)]
pub struct DownloaderRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Downloader>>>,
}

impl DownloaderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a downloader under `name`, replacing any previous entry.
    pub fn insert(&self, name: impl Into<String>, downloader: Arc<dyn Downloader>) {
        self.write_lock().insert(name.into(), downloader);
    }

    /// Resolve a downloader by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Downloader>> {
        self.read_lock().get(name).cloned()
    }

    /// Names of all registered downloaders, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Downloader>>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("downloader registry lock poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Downloader>>> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("downloader registry lock poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DownloadHandle, DownloadRequest, DownloadResult, DownloadStatus, FileSelection,
    };
    use async_trait::async_trait;

    struct StubDownloader;

    #[async_trait]
    impl Downloader for StubDownloader {
        async fn create(&self, _request: &DownloadRequest) -> DownloadResult<DownloadHandle> {
            Ok(DownloadHandle::from_id("stub"))
        }

        async fn info(&self, _handle: &DownloadHandle) -> DownloadResult<DownloadStatus> {
            Ok(DownloadStatus::default())
        }

        async fn cancel(&self, _handle: &DownloadHandle) -> DownloadResult<()> {
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
            Ok("stub-1.0".to_string())
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_name() {
        let registry = DownloaderRegistry::new();
        registry.insert("main", Arc::new(StubDownloader));

        let downloader = registry.get("main").expect("downloader registered");
        let version = downloader.probe().await.unwrap();
        assert_eq!(version, "stub-1.0");

        assert!(registry.get("other").is_none());
        assert_eq!(registry.names(), vec!["main".to_string()]);
    }
}
