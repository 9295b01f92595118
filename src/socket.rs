//! Unix socket server for the UI process.
//!
//! Each connection gets every process event pushed as an `Event` frame and
//! may send any number of `Request` frames. Input and resize requests are
//! applied in arrival order on the connection task; everything else runs on
//! its own task, so a slow `start_server` never delays keystrokes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{SubscriptionEvent, Topic};
use crate::dispatch::{Host, SurfaceSet};
use crate::error::ProcError;
use crate::protocol::{EventMsg, Frame, FrameType, RequestEnvelope, Response};

/// Frames queued for one connection's writer.
const OUTBOUND_CAPACITY: usize = 1024;

/// A client that cannot take a frame within this long is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Listen on `socket_path` until `cancel` fires.
///
/// Refuses to start if another daemon is answering on the path; a stale
/// socket file is removed.
pub async fn serve(host: Host, socket_path: &Path, cancel: CancellationToken) -> io::Result<()> {
    if socket_path.exists() {
        let path_owned = socket_path.to_path_buf();
        let is_active = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::task::spawn_blocking(move || std::os::unix::net::UnixStream::connect(&path_owned).is_ok()),
        )
        .await;

        match is_active {
            Ok(Ok(true)) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another daemon is already listening on {}", socket_path.display()),
                ));
            }
            _ => std::fs::remove_file(socket_path)?,
        }
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %socket_path.display(), "unix socket listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("socket server cancelled, stopping accept loop");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let host = host.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, host, cancel).await {
                                tracing::debug!(?e, "client connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to accept unix socket connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    Ok(())
}

/// `$XDG_RUNTIME_DIR/devdock.sock`, or a per-user directory under `/tmp`.
pub fn default_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join("devdock.sock"),
        None => std::env::temp_dir().join(format!("devdock-{}", whoami())).join("devdock.sock"),
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

async fn write_frame_with_timeout<W: AsyncWriteExt + Unpin>(frame: &Frame, writer: &mut W) -> bool {
    tokio::time::timeout(WRITE_TIMEOUT, frame.write_to(writer))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Serve one connection until the client hangs up or the daemon stops.
async fn handle_client<S: AsyncRead + AsyncWrite + Send + 'static>(
    stream: S,
    host: Host,
    cancel: CancellationToken,
) -> io::Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    // A frame cut short by cancellation is dropped along with the connection.
    let mut reader = tokio::io::BufReader::new(reader);

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if !write_frame_with_timeout(&frame, &mut writer).await {
                tracing::debug!("client stopped reading, closing connection");
                break;
            }
        }
    });

    let mut events = host.registry.events.subscribe(Topic::All);
    let event_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(item) = events.recv().await {
            let msg = match item {
                SubscriptionEvent::Event(event) => EventMsg::from(&event),
                SubscriptionEvent::Lagged(missed) => {
                    tracing::warn!(missed, "client fell behind on events");
                    EventMsg::Lagged { missed }
                }
            };
            let frame = match Frame::json(FrameType::Event, &msg) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(?e, "failed to encode event");
                    continue;
                }
            };
            if event_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let surfaces = Arc::new(SurfaceSet::new());
    let result = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = Frame::read_from(&mut reader) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        };
        if out_tx.is_closed() {
            break Ok(());
        }

        if frame.frame_type != FrameType::Request {
            let err = ProcError::InvalidRequest(format!("expected a request frame, got {:?}", frame.frame_type));
            send_response(&out_tx, Response::err(0, &err)).await;
            continue;
        }

        let envelope: RequestEnvelope = match frame.parse_json() {
            Ok(envelope) => envelope,
            Err(e) => {
                let id = serde_json::from_slice::<serde_json::Value>(&frame.payload)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
                    .unwrap_or(0);
                let err = ProcError::InvalidRequest(e.to_string());
                send_response(&out_tx, Response::err(id, &err)).await;
                continue;
            }
        };

        let RequestEnvelope { id, request } = envelope;
        if request.is_fire_and_forget() {
            host.handle(&surfaces, request).await;
            continue;
        }

        let op = request.op();
        let host = host.clone();
        let surfaces = surfaces.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let response = match host.handle(&surfaces, request).await {
                Some(Ok(result)) => Response::ok(id, result),
                Some(Err(e)) => {
                    tracing::debug!(id, op, "request failed: {}", e);
                    Response::err(id, &e)
                }
                None => return,
            };
            send_response(&out_tx, response).await;
        });
    };

    forwarder.abort();
    writer_task.abort();
    result
}

async fn send_response(out_tx: &mpsc::Sender<Frame>, response: Response) {
    match Frame::json(FrameType::Response, &response) {
        Ok(frame) => {
            let _ = out_tx.send(frame).await;
        }
        Err(e) => tracing::warn!(?e, "failed to encode response"),
    }
}
