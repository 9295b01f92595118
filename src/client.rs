//! Unix socket client for the devdock daemon.
//!
//! Used by the CLI subcommands and the integration tests. Requests are
//! answered in whatever order the daemon finishes them, and events arrive in
//! between; the client matches responses by id and queues events.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::UnixStream;

use crate::context::ContextSnapshot;
use crate::error::ErrorPayload;
use crate::preview::{LogLine, ServerSnapshot, ServerStartInfo};
use crate::protocol::{AttachResult, EventMsg, Frame, FrameType, Request, RequestEnvelope, Response};
use crate::session::{SessionHandle, SessionRequest, SessionSnapshot};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Remote(ErrorPayload),

    #[error("connection closed")]
    Closed,
}

impl ClientError {
    /// The daemon's error payload, if this is a failed request.
    pub fn remote(&self) -> Option<&ErrorPayload> {
        match self {
            ClientError::Remote(payload) => Some(payload),
            _ => None,
        }
    }
}

pub struct Client {
    stream: UnixStream,
    next_id: u64,
    events: VecDeque<EventMsg>,
    /// Responses that arrived while waiting for a different id.
    responses: HashMap<u64, Response>,
}

impl Client {
    pub async fn connect(socket_path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self {
            stream,
            next_id: 0,
            events: VecDeque::new(),
            responses: HashMap::new(),
        })
    }

    async fn send(&mut self, request: Request) -> Result<u64, ClientError> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = Frame::json(FrameType::Request, &RequestEnvelope { id, request })?;
        frame.write_to(&mut self.stream).await?;
        Ok(id)
    }

    /// Read one frame, queueing events and responses.
    async fn pump(&mut self) -> Result<(), ClientError> {
        let frame = match Frame::read_from(&mut self.stream).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ClientError::Closed),
            Err(e) => return Err(e.into()),
        };
        match frame.frame_type {
            FrameType::Event => self.events.push_back(frame.parse_json()?),
            FrameType::Response => {
                let response: Response = frame.parse_json()?;
                self.responses.insert(response.id, response);
            }
            FrameType::Request => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "daemon sent a request frame").into());
            }
        }
        Ok(())
    }

    /// Send a request and wait for its response.
    pub async fn request(&mut self, request: Request) -> Result<serde_json::Value, ClientError> {
        let id = self.send(request).await?;
        loop {
            if let Some(response) = self.responses.remove(&id) {
                return response.into_result().map_err(ClientError::Remote);
            }
            self.pump().await?;
        }
    }

    async fn call<T: DeserializeOwned>(&mut self, request: Request) -> Result<T, ClientError> {
        let value = self.request(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Next pushed event. Events received while waiting for responses are
    /// returned first.
    pub async fn next_event(&mut self) -> Result<EventMsg, ClientError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            self.pump().await?;
        }
    }

    /// Drop queued events, e.g. after a replay made them redundant.
    pub fn drain_events(&mut self) -> Vec<EventMsg> {
        self.events.drain(..).collect()
    }

    pub async fn start_server(
        &mut self,
        project_id: &str,
        project_path: Option<PathBuf>,
    ) -> Result<ServerStartInfo, ClientError> {
        self.call(Request::StartServer {
            project_id: project_id.to_string(),
            project_path,
        })
        .await
    }

    pub async fn stop_server(&mut self, project_id: &str) -> Result<ServerSnapshot, ClientError> {
        self.call(Request::StopServer {
            project_id: project_id.to_string(),
        })
        .await
    }

    pub async fn server_status(&mut self, project_id: &str) -> Result<ServerSnapshot, ClientError> {
        self.call(Request::GetServerStatus {
            project_id: project_id.to_string(),
        })
        .await
    }

    pub async fn list_servers(&mut self) -> Result<Vec<ServerSnapshot>, ClientError> {
        self.call(Request::ListServers).await
    }

    pub async fn server_logs(&mut self, project_id: &str, limit: usize) -> Result<Vec<LogLine>, ClientError> {
        self.call(Request::ServerLogs {
            project_id: project_id.to_string(),
            limit,
        })
        .await
    }

    pub async fn start_session(&mut self, request: SessionRequest) -> Result<SessionHandle, ClientError> {
        self.call(Request::StartSession(request)).await
    }

    /// Fire-and-forget.
    pub async fn write_session(&mut self, session_id: u32, data: &[u8]) -> Result<(), ClientError> {
        self.send(Request::WriteSession {
            session_id,
            data: data.to_vec(),
        })
        .await?;
        Ok(())
    }

    /// Fire-and-forget.
    pub async fn resize_session(&mut self, session_id: u32, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.send(Request::ResizeSession { session_id, cols, rows }).await?;
        Ok(())
    }

    pub async fn kill_session(&mut self, session_id: u32) -> Result<(), ClientError> {
        self.request(Request::KillSession { session_id }).await?;
        Ok(())
    }

    pub async fn attach_session(&mut self, session_id: u32, cols: u16, rows: u16) -> Result<AttachResult, ClientError> {
        self.call(Request::AttachSession { session_id, cols, rows }).await
    }

    pub async fn detach_session(&mut self, session_id: u32) -> Result<(), ClientError> {
        self.request(Request::DetachSession { session_id }).await?;
        Ok(())
    }

    pub async fn update_context(&mut self, session_id: u32, context: ContextSnapshot) -> Result<(), ClientError> {
        self.request(Request::UpdateContext { session_id, context }).await?;
        Ok(())
    }

    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSnapshot>, ClientError> {
        self.call(Request::ListSessions).await
    }

    pub async fn view_active(&mut self, project_id: Option<&str>) -> Result<(), ClientError> {
        self.request(Request::ViewActive {
            project_id: project_id.map(str::to_string),
        })
        .await?;
        Ok(())
    }

    pub async fn view_idle(&mut self, project_id: Option<&str>) -> Result<(), ClientError> {
        self.request(Request::ViewIdle {
            project_id: project_id.map(str::to_string),
        })
        .await?;
        Ok(())
    }
}
