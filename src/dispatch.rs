//! Routes protocol requests to the supervisors.
//!
//! `Host` owns every component for one daemon. The socket layer hands it one
//! decoded request at a time together with the per-connection state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use crate::attach::{Attachments, Binding};
use crate::config::{ProjectDirectory, Settings};
use crate::error::{ProcError, ProcResult};
use crate::preview::{LifecycleController, ServerSupervisor};
use crate::protocol::{AttachResult, Request};
use crate::registry::Registry;
use crate::session::SessionSupervisor;

/// Surfaces a single connection has bound, keyed by session id. Dropped
/// with the connection, which releases them.
#[derive(Default)]
pub struct SurfaceSet {
    bindings: Mutex<HashMap<u32, Binding>>,
}

impl SurfaceSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind(&self, binding: Binding) {
        self.bindings.lock().insert(binding.session_id(), binding);
    }

    fn release(&self, session_id: u32) {
        // Dropped outside the lock.
        let binding = self.bindings.lock().remove(&session_id);
        drop(binding);
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct Host {
    pub registry: Registry,
    pub servers: ServerSupervisor,
    pub lifecycle: LifecycleController<ServerSupervisor>,
    pub sessions: SessionSupervisor,
    pub attachments: Attachments,
    projects: Arc<dyn ProjectDirectory>,
    settings: Arc<Settings>,
}

impl Host {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let projects: Arc<dyn ProjectDirectory> = settings.clone();
        Self::with_projects(settings, projects)
    }

    /// Use `projects` instead of the configured project table to resolve
    /// project paths.
    pub fn with_projects(settings: Arc<Settings>, projects: Arc<dyn ProjectDirectory>) -> Self {
        let registry = Registry::new(&settings);
        let servers = ServerSupervisor::new(registry.clone(), settings.clone());
        let lifecycle = LifecycleController::new(servers.clone(), settings.idle_sweep_delay());
        let sessions = SessionSupervisor::new(registry.clone(), settings.clone());
        let attachments = Attachments::new(registry.clone());
        Self {
            registry,
            servers,
            lifecycle,
            sessions,
            attachments,
            projects,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn project_path(&self, project_id: &str, explicit: Option<PathBuf>) -> ProcResult<PathBuf> {
        explicit
            .or_else(|| self.projects.project_path(project_id))
            .ok_or_else(|| ProcError::NotFound(format!("no known path for project {project_id}")))
    }

    /// Handle one request. Returns `None` for requests that get no response.
    pub async fn handle(&self, surfaces: &SurfaceSet, request: Request) -> Option<ProcResult<serde_json::Value>> {
        let result = match request {
            Request::WriteSession { session_id, data } => {
                self.sessions.write(session_id, Bytes::from(data)).await;
                return None;
            }
            Request::ResizeSession { session_id, cols, rows } => {
                if let Err(e) = self.sessions.resize(session_id, cols, rows).await {
                    tracing::debug!(session_id, "resize rejected: {}", e);
                }
                return None;
            }

            Request::StartServer { project_id, project_path } => {
                match self.project_path(&project_id, project_path) {
                    Ok(path) => self.servers.start(&project_id, &path).await.and_then(to_json),
                    Err(e) => Err(e),
                }
            }
            Request::StopServer { project_id } => {
                match self.servers.stop(&project_id).await {
                    Ok(()) => to_json(self.servers.status(&project_id)),
                    Err(e) => Err(e),
                }
            }
            Request::GetServerStatus { project_id } => to_json(self.servers.status(&project_id)),
            Request::ListServers => to_json(self.servers.list()),
            Request::ServerLogs { project_id, limit } => to_json(self.servers.logs(&project_id, limit)),

            Request::StartSession(request) => self.sessions.start(request).await.and_then(to_json),
            Request::KillSession { session_id } => {
                surfaces.release(session_id);
                match self.sessions.kill(session_id).await {
                    Ok(()) => Ok(serde_json::json!({ "session_id": session_id })),
                    Err(e) => Err(e),
                }
            }
            Request::AttachSession { session_id, cols, rows } => {
                match self.attachments.attach(session_id, cols, rows).await {
                    Ok(attachment) => {
                        let snapshot = attachment.snapshot().clone();
                        surfaces.bind(attachment.into_binding());
                        to_json(AttachResult {
                            session_id,
                            through_seq: snapshot.through_seq,
                            replay: snapshot.replay(),
                            snapshot,
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            Request::DetachSession { session_id } => {
                // Only this connection's surface; other connections keep theirs.
                surfaces.release(session_id);
                match self.sessions.get(session_id) {
                    Some(_) => Ok(serde_json::json!({ "session_id": session_id })),
                    None => Err(ProcError::NotFound(format!("session {session_id}"))),
                }
            }
            Request::UpdateContext { session_id, context } => self
                .sessions
                .update_context(session_id, context)
                .map(|()| serde_json::json!({ "session_id": session_id })),
            Request::ListSessions => to_json(self.sessions.list()),

            Request::ViewActive { project_id } => {
                self.lifecycle.view_active(project_id);
                Ok(serde_json::json!({ "active_project": self.lifecycle.active_project() }))
            }
            Request::ViewIdle { project_id } => {
                self.lifecycle.view_idle(project_id);
                Ok(serde_json::json!({
                    "active_project": self.lifecycle.active_project(),
                    "sweep_pending": self.lifecycle.has_pending_sweep(),
                }))
            }
        };
        Some(result)
    }

    /// Stop every server and kill every session, each bounded by the
    /// configured shutdown wait.
    pub async fn shutdown(&self) {
        let within = self.settings.shutdown_wait();
        tokio::join!(self.lifecycle.shutdown(within), self.sessions.shutdown(within));
        tracing::info!("all supervised processes stopped");
    }
}

fn to_json<T: Serialize>(value: T) -> ProcResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| ProcError::InvalidRequest(format!("unserializable result: {e}")))
}
