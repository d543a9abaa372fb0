//! Notification rendezvous channel.
//!
//! A Unix-domain socket through which the spawned session pushes short
//! status strings back to the controller. One-shot per connection: connect,
//! send one JSON request, read one JSON response, close. The accept loop
//! runs as a background task and never dies from a bad connection; received
//! messages cross into the supervisor's single-writer context through an
//! unbounded mpsc channel.
//!
//! Request:  `{"method": "log_message", "message": "<string>"}`
//! Response: `{"success": true, "message": "logged"}` or
//!           `{"success": false, "error": "<reason>"}`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Hard cap on a single request. Larger payloads are truncated and rejected.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// The one method the channel interprets.
pub const METHOD_LOG_MESSAGE: &str = "log_message";

/// Cap on how long one connection may take end to end, so a stalled sender
/// cannot wedge the accept loop's per-connection task.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
struct Request {
    method: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Response {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn ok() -> Self {
        Self {
            success: true,
            message: Some("logged".to_string()),
            error: None,
        }
    }

    fn err(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(reason.into()),
        }
    }
}

// ============================================================================
// Public types
// ============================================================================

/// An inbound status message, stamped at read time.
///
/// `received_at` drives deadline arithmetic (monotonic); `received_wall`
/// only appears in human-facing evidence.
#[derive(Debug, Clone)]
pub struct Notification {
    pub payload: String,
    pub received_at: tokio::time::Instant,
    pub received_wall: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    pub fn now(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            received_at: tokio::time::Instant::now(),
            received_wall: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to bind rendezvous socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============================================================================
// NotificationChannel
// ============================================================================

/// The listening end of the rendezvous channel.
pub struct NotificationChannel {
    path: PathBuf,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl NotificationChannel {
    /// A per-controller-instance socket path under the temp directory, so
    /// multiple controller instances never collide.
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "termwarden-{}.sock",
            ulid::Ulid::new().to_string().to_lowercase()
        ))
    }

    /// Bind the socket and start the accept loop.
    ///
    /// A stale socket file from a crashed previous run is removed first.
    pub fn bind(
        path: PathBuf,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> Result<Self, ChannelError> {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(|source| ChannelError::Bind {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "rendezvous channel listening");

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, notifications, cancel_rx));

        Ok(Self {
            path,
            cancel_tx: Some(cancel_tx),
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the accept loop and unlink the socket path.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    notifications: mpsc::UnboundedSender<Notification>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let tx = notifications.clone();
                        tokio::spawn(async move {
                            let served = tokio::time::timeout(
                                CONNECTION_TIMEOUT,
                                handle_connection(stream, tx),
                            )
                            .await;
                            if served.is_err() {
                                warn!("rendezvous connection timed out");
                            }
                        });
                    }
                    Err(e) => {
                        // Transient accept errors must not kill the loop.
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = &mut cancel_rx => {
                debug!("rendezvous channel shutting down");
                break;
            }
        }
    }
}

/// Serve one connect/send/receive/close cycle.
async fn handle_connection(mut stream: UnixStream, tx: mpsc::UnboundedSender<Notification>) {
    // One spare byte distinguishes a request exactly at the cap from an
    // oversized one.
    let mut buf = vec![0u8; MAX_REQUEST_BYTES + 1];
    let mut filled = 0;
    loop {
        if filled == buf.len() {
            break;
        }
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                warn!(error = %e, "rendezvous read failed");
                return;
            }
        }
    }

    let response = if filled > MAX_REQUEST_BYTES {
        Response::err(format!("request exceeds {} byte cap", MAX_REQUEST_BYTES))
    } else {
        match serde_json::from_slice::<Request>(&buf[..filled]) {
            Ok(req) if req.method == METHOD_LOG_MESSAGE => match req.message {
                Some(message) => {
                    debug!(message = %message, "notification received");
                    let _ = tx.send(Notification::now(message));
                    Response::ok()
                }
                None => Response::err("missing message field"),
            },
            Ok(req) => Response::err(format!("unknown method: {}", req.method)),
            Err(e) => Response::err(format!("invalid request: {}", e)),
        }
    };

    let body = match serde_json::to_vec(&response) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "response serialization failed");
            return;
        }
    };
    if let Err(e) = stream.write_all(&body).await {
        warn!(error = %e, "rendezvous write failed");
    }
    let _ = stream.shutdown().await;
}

// ============================================================================
// Client side
// ============================================================================

/// Push one status message to a controller listening at `path`.
///
/// Returns the `success` flag from the controller's response.
pub async fn notify(path: &Path, message: &str) -> std::io::Result<bool> {
    let mut stream = UnixStream::connect(path).await?;

    let body = serde_json::to_vec(&Request {
        method: METHOD_LOG_MESSAGE.to_string(),
        message: Some(message.to_string()),
    })?;
    stream.write_all(&body).await?;
    // Half-close so the server sees end of request.
    stream.shutdown().await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let response: Response = serde_json::from_slice(&raw)?;
    Ok(response.success)
}

/// Send raw bytes through one connect/send/receive/close cycle and return
/// the raw response. The controller only interprets
/// [`METHOD_LOG_MESSAGE`]; everything else gets a structured error reply.
pub async fn send_raw(path: &Path, body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(body).await?;
    stream.shutdown().await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn socket_in(dir: &TempDir) -> PathBuf {
        dir.path().join("warden.sock")
    }

    #[tokio::test]
    async fn log_message_is_forwarded_and_acked() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = NotificationChannel::bind(socket_in(&dir), tx).unwrap();

        let ok = notify(channel.path(), "Step 1 done").await.unwrap();
        assert!(ok);

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.payload, "Step 1 done");

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn each_message_is_its_own_connection() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = NotificationChannel::bind(socket_in(&dir), tx).unwrap();

        for i in 0..3 {
            assert!(notify(channel.path(), &format!("msg {}", i)).await.unwrap());
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap().payload, format!("msg {}", i));
        }

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_method_gets_structured_error() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = NotificationChannel::bind(socket_in(&dir), tx).unwrap();

        let raw = send_raw(channel.path(), br#"{"method": "shutdown"}"#)
            .await
            .unwrap();
        let response: Response = serde_json::from_slice(&raw).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("unknown method"));

        // The loop survives and still serves the real method.
        assert!(notify(channel.path(), "still here").await.unwrap());
        assert_eq!(rx.recv().await.unwrap().payload, "still here");

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_json_gets_structured_error() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = NotificationChannel::bind(socket_in(&dir), tx).unwrap();

        let raw = send_raw(channel.path(), b"not json at all").await.unwrap();
        let response: Response = serde_json::from_slice(&raw).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("invalid request"));

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = NotificationChannel::bind(socket_in(&dir), tx).unwrap();

        let raw = send_raw(channel.path(), &vec![b'x'; MAX_REQUEST_BYTES + 1])
            .await
            .unwrap();
        let response: Response = serde_json::from_slice(&raw).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("cap"));

        // The loop survives the oversized connection.
        assert!(notify(channel.path(), "still here").await.unwrap());
        assert_eq!(rx.recv().await.unwrap().payload, "still here");

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn request_exactly_at_cap_is_served() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = NotificationChannel::bind(socket_in(&dir), tx).unwrap();

        // Pad the message so the serialized request is exactly the cap.
        let envelope = serde_json::to_vec(&Request {
            method: METHOD_LOG_MESSAGE.to_string(),
            message: Some(String::new()),
        })
        .unwrap();
        let message = "a".repeat(MAX_REQUEST_BYTES - envelope.len());
        let body = serde_json::to_vec(&Request {
            method: METHOD_LOG_MESSAGE.to_string(),
            message: Some(message.clone()),
        })
        .unwrap();
        assert_eq!(body.len(), MAX_REQUEST_BYTES);

        let raw = send_raw(channel.path(), &body).await.unwrap();
        let response: Response = serde_json::from_slice(&raw).unwrap();
        assert!(response.success);
        assert_eq!(rx.recv().await.unwrap().payload, message);

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_unlinks_socket() {
        let dir = TempDir::new().unwrap();
        let path = socket_in(&dir);
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = NotificationChannel::bind(path.clone(), tx).unwrap();

        assert!(path.exists());
        channel.shutdown().await;
        assert!(!path.exists());
    }

    #[test]
    fn default_paths_are_unique_per_instance() {
        assert_ne!(
            NotificationChannel::default_path(),
            NotificationChannel::default_path()
        );
    }
}
