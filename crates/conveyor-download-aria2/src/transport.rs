//! RPC transports: plain HTTP POST and the notification-capable WebSocket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use conveyor_download_core::{DownloadError, DownloadResult};

use crate::notify::{self, Aria2Notifier};
use crate::protocol::{RpcFrame, RpcRequest};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const OUTBOX_CAPACITY: usize = 32;

type CallResult = Result<Option<Value>, DownloadError>;
type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<CallResult>>>>;

pub(crate) enum Transport {
    Http {
        client: reqwest::Client,
        endpoint: String,
    },
    Ws(WsTransport),
}

impl Transport {
    pub(crate) async fn call(&self, request: RpcRequest) -> DownloadResult<Value> {
        let method = request.method;
        let result = match self {
            Self::Http { client, endpoint } => http_call(client, endpoint, &request).await?,
            Self::Ws(ws) => ws.call(request).await?,
        };
        result.ok_or_else(|| DownloadError::NullResult {
            method: method.to_string(),
        })
    }
}

async fn http_call(
    client: &reqwest::Client,
    endpoint: &str,
    request: &RpcRequest,
) -> CallResult {
    let response = client
        .post(endpoint)
        .json(request)
        .timeout(CALL_TIMEOUT)
        .send()
        .await
        .map_err(|err| DownloadError::transport("rpc.post", err))?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(DownloadError::Unauthorized);
    }
    let body = response
        .text()
        .await
        .map_err(|err| DownloadError::transport("rpc.read", err))?;

    // aria2 answers RPC-level failures with a JSON-RPC error body even on
    // non-2xx statuses, so the body is parsed before the status is judged.
    let frame: RpcFrame =
        serde_json::from_str(&body).map_err(|_| DownloadError::UnexpectedStatus {
            status: status.as_u16(),
            body: excerpt(&body),
        })?;
    frame.into_result()
}

/// WebSocket transport: one write pump serialising outgoing frames, one read
/// pump routing responses to waiters by request id and fanning notifications
/// out to the configured notifier.
pub(crate) struct WsTransport {
    sender: mpsc::Sender<Message>,
    pending: Waiters,
}

impl WsTransport {
    pub(crate) async fn connect(
        url: &str,
        notifier: Option<Arc<dyn Aria2Notifier>>,
    ) -> DownloadResult<Self> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| DownloadError::transport("ws.connect", err))?;
        let (mut write, mut read) = stream.split();
        let (sender, mut outbox) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
        let pending: Waiters = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                if let Err(err) = write.send(message).await {
                    warn!(error = %err, "aria2 websocket write failed");
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(incoming) = read.next().await {
                let message = match incoming {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(error = %err, "aria2 websocket read failed");
                        break;
                    }
                };
                let Message::Text(text) = message else {
                    continue;
                };
                let Ok(frame) = serde_json::from_str::<RpcFrame>(&text) else {
                    debug!("discarding unparseable aria2 frame");
                    continue;
                };

                if frame.is_notification() {
                    if let (Some(notifier), Some(method)) =
                        (notifier.as_deref(), frame.method.as_deref())
                        && let Some(gid) = frame.notification_gid()
                    {
                        notify::dispatch(notifier, method, gid);
                    }
                    continue;
                }

                let Some(id) = frame.id else {
                    continue;
                };
                let waiter = lock_waiters(&reader_pending).remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(frame.into_result());
                } else {
                    debug!(id, "aria2 response had no waiter");
                }
            }

            // Socket is gone; fail anything still waiting.
            let mut waiters = lock_waiters(&reader_pending);
            for (_, waiter) in waiters.drain() {
                let _ = waiter.send(Err(DownloadError::protocol("aria2 websocket closed")));
            }
        });

        Ok(Self { sender, pending })
    }

    async fn call(&self, request: RpcRequest) -> CallResult {
        let id = request.id;
        let (tx, rx) = oneshot::channel();
        lock_waiters(&self.pending).insert(id, tx);

        let payload = serde_json::to_string(&request)
            .map_err(|err| DownloadError::transport("ws.encode", err))?;
        if self.sender.send(Message::Text(payload.into())).await.is_err() {
            lock_waiters(&self.pending).remove(&id);
            return Err(DownloadError::protocol("aria2 websocket write pump is gone"));
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_dropped)) => Err(DownloadError::protocol(
                "aria2 websocket dropped the call",
            )),
            Err(_elapsed) => {
                lock_waiters(&self.pending).remove(&id);
                Err(DownloadError::protocol(
                    "timed out waiting for aria2 response",
                ))
            }
        }
    }
}

fn lock_waiters(waiters: &Waiters) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<CallResult>>> {
    match waiters.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("aria2 waiter map poisoned; continuing with recovered guard");
            poisoned.into_inner()
        }
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(200).collect()
}
