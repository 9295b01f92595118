//! Unix socket protocol between the UI process and the daemon.
//!
//! Wire format: `[type: u8][length: u32 big-endian][payload: bytes]`
//!
//! Every payload is JSON. Requests carry an `id` that the matching response
//! echoes; events are unsolicited.

use std::io;
use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::broker::{ProcessEvent, Source};
use crate::context::ContextSnapshot;
use crate::error::{ErrorPayload, ProcError};
use crate::screen::ScreenSnapshot;
use crate::session::SessionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client -> daemon.
    Request = 0x01,
    /// Daemon -> client, answers one request.
    Response = 0x02,
    /// Daemon -> client, pushed.
    Event = 0x03,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::Event),
            _ => None,
        }
    }
}

/// Maximum frame payload size (16 MiB). Prevents OOM on malformed data.
const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    pub fn json<T: Serialize>(frame_type: FrameType, msg: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(msg)?;
        Ok(Self::new(frame_type, Bytes::from(payload)))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    pub async fn write_to<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }

    pub async fn read_from<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Self> {
        let type_byte = reader.read_u8().await?;
        let frame_type = FrameType::from_u8(type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type: 0x{:02x}", type_byte),
            )
        })?;

        let length = reader.read_u32().await?;
        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", length),
            ));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            frame_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode a frame from a byte buffer (synchronous, for testing).
    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        if data.len() < 5 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "frame too short"));
        }

        let type_byte = data.get_u8();
        let frame_type = FrameType::from_u8(type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type: 0x{:02x}", type_byte),
            )
        })?;

        let length = data.get_u32();
        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", length),
            ));
        }
        if data.remaining() < length as usize {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "incomplete frame payload"));
        }

        Ok(Self {
            frame_type,
            payload: Bytes::copy_from_slice(&data[..length as usize]),
        })
    }

    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

// ── Requests ───────────────────────────────────────────────────────

fn default_log_limit() -> usize {
    200
}

/// Client -> daemon: `{"id": 7, "op": "start_server", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    StartServer {
        project_id: String,
        /// Resolved through the configured project table when omitted.
        #[serde(default)]
        project_path: Option<PathBuf>,
    },
    StopServer {
        project_id: String,
    },
    GetServerStatus {
        project_id: String,
    },
    ListServers,
    ServerLogs {
        project_id: String,
        #[serde(default = "default_log_limit")]
        limit: usize,
    },
    StartSession(SessionRequest),
    /// No response is sent.
    WriteSession {
        session_id: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// No response is sent.
    ResizeSession {
        session_id: u32,
        cols: u16,
        rows: u16,
    },
    KillSession {
        session_id: u32,
    },
    AttachSession {
        session_id: u32,
        cols: u16,
        rows: u16,
    },
    DetachSession {
        session_id: u32,
    },
    UpdateContext {
        session_id: u32,
        context: ContextSnapshot,
    },
    ListSessions,
    ViewActive {
        #[serde(default)]
        project_id: Option<String>,
    },
    ViewIdle {
        #[serde(default)]
        project_id: Option<String>,
    },
}

impl Request {
    /// Requests the daemon never answers.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, Request::WriteSession { .. } | Request::ResizeSession { .. })
    }

    pub fn op(&self) -> &'static str {
        match self {
            Request::StartServer { .. } => "start_server",
            Request::StopServer { .. } => "stop_server",
            Request::GetServerStatus { .. } => "get_server_status",
            Request::ListServers => "list_servers",
            Request::ServerLogs { .. } => "server_logs",
            Request::StartSession(_) => "start_session",
            Request::WriteSession { .. } => "write_session",
            Request::ResizeSession { .. } => "resize_session",
            Request::KillSession { .. } => "kill_session",
            Request::AttachSession { .. } => "attach_session",
            Request::DetachSession { .. } => "detach_session",
            Request::UpdateContext { .. } => "update_context",
            Request::ListSessions => "list_sessions",
            Request::ViewActive { .. } => "view_active",
            Request::ViewIdle { .. } => "view_idle",
        }
    }
}

// ── Responses ──────────────────────────────────────────────────────

/// Daemon -> client: `{"id", "ok": true, "result"}` or
/// `{"id", "ok": false, "error": {"kind", "message"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Response {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: &ProcError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.to_payload()),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value, ErrorPayload> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.result.unwrap_or(serde_json::Value::Null)),
            (false, Some(error)) => Err(error),
            (false, None) => Err(ErrorPayload {
                kind: crate::error::ErrorKind::InvalidRequest,
                message: "error response without error payload".into(),
            }),
        }
    }
}

/// Result of `attach_session`.
///
/// Events for the session with `seq <= through_seq` are already contained in
/// `replay` and must be skipped by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachResult {
    pub session_id: u32,
    pub through_seq: u64,
    /// Escape sequence that repaints scrollback and screen.
    pub replay: String,
    pub snapshot: ScreenSnapshot,
}

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventMsg {
    Output {
        source: Source,
        seq: u64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Exit {
        source: Source,
        exit_code: Option<i32>,
    },
    /// This connection fell behind and `missed` events were dropped here.
    /// Clients re-attach sessions and re-read server logs to catch up.
    Lagged { missed: u64 },
}

impl EventMsg {
    /// The emitting process; `None` for connection-level notices.
    pub fn source(&self) -> Option<&Source> {
        match self {
            EventMsg::Output { source, .. } | EventMsg::Exit { source, .. } => Some(source),
            EventMsg::Lagged { .. } => None,
        }
    }
}

impl From<&ProcessEvent> for EventMsg {
    fn from(event: &ProcessEvent) -> Self {
        match event {
            ProcessEvent::Output { source, seq, data } => EventMsg::Output {
                source: source.clone(),
                seq: *seq,
                data: data.to_vec(),
            },
            ProcessEvent::Exit { source, exit_code } => EventMsg::Exit {
                source: source.clone(),
                exit_code: *exit_code,
            },
        }
    }
}

/// Serde helper for base64-encoded byte vectors in JSON.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn frame_type_invalid_byte() {
        assert!(FrameType::from_u8(0x00).is_none());
        assert!(FrameType::from_u8(0x04).is_none());
        assert_eq!(FrameType::from_u8(0x03), Some(FrameType::Event));
    }

    #[test]
    fn frame_encode_layout() {
        let frame = Frame::new(FrameType::Response, Bytes::from("{}"));
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[0x02, 0, 0, 0, 2, b'{', b'}']);
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Response);
        assert_eq!(decoded.payload, Bytes::from("{}"));
    }

    #[test]
    fn decode_rejects_short_and_oversized_frames() {
        assert_eq!(Frame::decode(&[0x01, 0, 0]).unwrap_err().kind(), io::ErrorKind::UnexpectedEof);

        let mut big = vec![0x01];
        big.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert_eq!(Frame::decode(&big).unwrap_err().kind(), io::ErrorKind::InvalidData);

        let truncated = [0x01, 0, 0, 0, 10, b'x'];
        assert_eq!(Frame::decode(&truncated).unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn async_read_write() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::json(FrameType::Request, &serde_json::json!({"id": 1, "op": "list_servers"})).unwrap();
        frame.write_to(&mut a).await.unwrap();
        let read = Frame::read_from(&mut b).await.unwrap();
        assert_eq!(read.frame_type, FrameType::Request);
        let envelope: RequestEnvelope = read.parse_json().unwrap();
        assert_eq!(envelope.id, 1);
        assert!(matches!(envelope.request, Request::ListServers));
    }

    #[test]
    fn parses_start_server_with_optional_path() {
        let envelope: RequestEnvelope =
            serde_json::from_str(r#"{"id": 3, "op": "start_server", "project_id": "todo"}"#).unwrap();
        match envelope.request {
            Request::StartServer { project_id, project_path } => {
                assert_eq!(project_id, "todo");
                assert!(project_path.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_start_session_with_defaults() {
        let envelope: RequestEnvelope = serde_json::from_str(
            r#"{"id": 4, "op": "start_session", "working_directory": "/tmp", "context": {"project_id": "todo"}}"#,
        )
        .unwrap();
        match envelope.request {
            Request::StartSession(request) => {
                assert_eq!((request.cols, request.rows), (80, 24));
                assert_eq!(request.context.unwrap().project_id.as_deref(), Some("todo"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn write_session_data_is_base64() {
        let envelope: RequestEnvelope =
            serde_json::from_str(r#"{"id": 5, "op": "write_session", "session_id": 42, "data": "bHMK"}"#).unwrap();
        assert!(envelope.request.is_fire_and_forget());
        match envelope.request {
            Request::WriteSession { session_id, data } => {
                assert_eq!(session_id, 42);
                assert_eq!(data, b"ls\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<RequestEnvelope>(r#"{"id": 1, "op": "format_disk"}"#).is_err());
    }

    #[test]
    fn error_response_shape() {
        let response = Response::err(9, &ProcError::NotFound("session 1".into()));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["kind"], "not_found");
        assert!(json.get("result").is_none());

        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn event_shape() {
        let event = ProcessEvent::Output {
            source: Source::session(7),
            seq: 2,
            data: Bytes::from("hi"),
        };
        let json = serde_json::to_value(EventMsg::from(&event)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "output",
                "source": {"kind": "session", "session_id": 7},
                "seq": 2,
                "data": "aGk=",
            })
        );

        let exit = EventMsg::from(&ProcessEvent::Exit {
            source: Source::server("todo"),
            exit_code: None,
        });
        let json = serde_json::to_value(&exit).unwrap();
        assert_eq!(json["source"]["project_id"], "todo");
        assert!(json["exit_code"].is_null());

        let lagged = serde_json::to_value(EventMsg::Lagged { missed: 12 }).unwrap();
        assert_eq!(lagged, serde_json::json!({"event": "lagged", "missed": 12}));
    }
}
