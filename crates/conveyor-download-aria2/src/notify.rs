//! Push notifications delivered over the WebSocket transport.

/// Receiver for aria2 push notifications.
///
/// All hooks default to no-ops; implementors override the events they care
/// about. Hooks are invoked from the WebSocket read pump and must not block.
pub trait Aria2Notifier: Send + Sync {
    /// A download started.
    fn on_download_start(&self, gid: &str) {
        let _ = gid;
    }

    /// A download was paused.
    fn on_download_pause(&self, gid: &str) {
        let _ = gid;
    }

    /// A download was stopped.
    fn on_download_stop(&self, gid: &str) {
        let _ = gid;
    }

    /// A download completed.
    fn on_download_complete(&self, gid: &str) {
        let _ = gid;
    }

    /// A download failed.
    fn on_download_error(&self, gid: &str) {
        let _ = gid;
    }

    /// A BitTorrent download finished downloading (seeding may continue).
    fn on_bt_download_complete(&self, gid: &str) {
        let _ = gid;
    }
}

pub(crate) fn dispatch(notifier: &dyn Aria2Notifier, method: &str, gid: &str) {
    match method {
        "aria2.onDownloadStart" => notifier.on_download_start(gid),
        "aria2.onDownloadPause" => notifier.on_download_pause(gid),
        "aria2.onDownloadStop" => notifier.on_download_stop(gid),
        "aria2.onDownloadComplete" => notifier.on_download_complete(gid),
        "aria2.onDownloadError" => notifier.on_download_error(gid),
        "aria2.onBtDownloadComplete" => notifier.on_bt_download_complete(gid),
        other => {
            tracing::debug!(method = %other, "ignoring unknown aria2 notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(String, String)>>,
    }

    impl Aria2Notifier for RecordingNotifier {
        fn on_download_complete(&self, gid: &str) {
            self.events
                .lock()
                .unwrap()
                .push(("complete".to_string(), gid.to_string()));
        }

        fn on_download_error(&self, gid: &str) {
            self.events
                .lock()
                .unwrap()
                .push(("error".to_string(), gid.to_string()));
        }
    }

    #[test]
    fn dispatch_routes_known_methods() {
        let notifier = RecordingNotifier::default();
        dispatch(&notifier, "aria2.onDownloadComplete", "gid-1");
        dispatch(&notifier, "aria2.onDownloadError", "gid-2");
        dispatch(&notifier, "aria2.onDownloadStart", "gid-3");
        dispatch(&notifier, "aria2.onSomethingElse", "gid-4");

        let events = notifier.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                ("complete".to_string(), "gid-1".to_string()),
                ("error".to_string(), "gid-2".to_string()),
            ]
        );
    }
}
