use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{ErrorPayload, ProcError};
use crate::process::ExitWatch;

use super::output::OutputLog;

/// Lifecycle status of a project's preview server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Ready => "ready",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Failed => "failed",
        }
    }

    /// Statuses that own a port and (possibly) a live process.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServerStatus::Starting | ServerStatus::Ready | ServerStatus::Stopping
        )
    }
}

/// Read-only view of a server, safe to hand to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub project_id: String,
    pub status: ServerStatus,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorPayload>,
}

impl ServerSnapshot {
    pub fn stopped(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            status: ServerStatus::Stopped,
            url: None,
            port: None,
            pid: None,
            started_at: None,
            error: None,
        }
    }
}

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStartInfo {
    pub url: String,
    pub port: u16,
    pub pid: u32,
}

/// Handle to a live preview process. Never leaves the registry.
#[derive(Debug, Clone)]
pub(crate) struct ProcessHandle {
    pub pid: u32,
    pub exit_rx: ExitWatch,
}

pub(crate) struct ServerEntry {
    pub project_id: String,
    pub status: ServerStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<ProcError>,
    /// Bumped on every start and stop. Background tasks carry the value they
    /// were spawned with and discard their result if it no longer matches.
    pub generation: u64,
    pub process: Option<ProcessHandle>,
    pub status_tx: watch::Sender<ServerStatus>,
    pub log: Arc<Mutex<OutputLog>>,
}

impl ServerEntry {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            status: ServerStatus::Stopped,
            port: None,
            pid: None,
            url: None,
            started_at: None,
            last_error: None,
            generation: 0,
            process: None,
            status_tx: watch::channel(ServerStatus::Stopped).0,
            log: Arc::new(Mutex::new(OutputLog::default())),
        }
    }

    /// Change status and wake everyone waiting on this project.
    pub fn set_status(&mut self, status: ServerStatus) {
        self.status = status;
        self.status_tx.send_replace(status);
    }

    /// Clear process bookkeeping and return the port that was held.
    pub fn release(&mut self) -> Option<u16> {
        self.pid = None;
        self.url = None;
        self.process = None;
        self.port.take()
    }

    pub fn start_info(&self) -> Option<ServerStartInfo> {
        Some(ServerStartInfo {
            url: self.url.clone()?,
            port: self.port?,
            pid: self.pid?,
        })
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            project_id: self.project_id.clone(),
            status: self.status,
            url: self.url.clone(),
            port: self.port,
            pid: self.pid,
            started_at: self.started_at,
            error: self.last_error.as_ref().map(ProcError::to_payload),
        }
    }
}

/// All known preview servers, keyed by project id.
///
/// Entries are created lazily on the first start request and never
/// removed; a stopped server is an entry in `Stopped`.
#[derive(Clone, Default)]
pub struct ServerTable {
    inner: Arc<Mutex<HashMap<String, ServerEntry>>>,
}

impl ServerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never held across an `.await`.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, ServerEntry>> {
        self.inner.lock()
    }

    pub fn snapshot(&self, project_id: &str) -> ServerSnapshot {
        self.inner
            .lock()
            .get(project_id)
            .map(ServerEntry::snapshot)
            .unwrap_or_else(|| ServerSnapshot::stopped(project_id))
    }

    pub fn list(&self) -> Vec<ServerSnapshot> {
        let mut list: Vec<_> = self.inner.lock().values().map(ServerEntry::snapshot).collect();
        list.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        list
    }

    /// Project ids whose server is starting or ready.
    pub fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .inner
            .lock()
            .values()
            .filter(|e| matches!(e.status, ServerStatus::Starting | ServerStatus::Ready))
            .map(|e| e.project_id.clone())
            .collect();
        ids.sort();
        ids
    }
}
