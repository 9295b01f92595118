use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::activity::ActivityTracker;
use crate::broker::{ProcessEvent, Source};
use crate::config::Settings;
use crate::context::{self, ContextSnapshot, CONTEXT_FILE_KEY};
use crate::error::{ProcError, ProcResult};
use crate::process::{self, ExitWatch, ProcessExit, Signal};
use crate::pty::{self, Pty, PtyError};
use crate::registry::Registry;
use crate::screen::{Screen, ScreenFeed};

/// Maximum number of concurrent streaming clients per session.
const MAX_CLIENTS_PER_SESSION: usize = 64;

/// Each session costs a PTY pair, three blocking threads, and an emulator
/// with scrollback. Caps a runaway client well below the blocking pool size.
const MAX_SESSIONS: usize = 256;

const INPUT_CHANNEL_CAPACITY: usize = 64;

/// How long the exit monitor waits for the reader to drain the PTY, so the
/// exit event follows the final output.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Parameters for a new terminal session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub working_directory: PathBuf,
    /// Program and arguments. `None` starts a login shell.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub context: Option<ContextSnapshot>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl SessionRequest {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            command: None,
            context: None,
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: u32,
    pub pid: u32,
}

/// Serializable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: u32,
    pub pid: u32,
    pub working_directory: PathBuf,
    pub command: String,
    pub context: ContextSnapshot,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub attached: bool,
    pub clients: usize,
    pub cols: u16,
    pub rows: u16,
}

/// RAII guard that decrements the session client count on drop.
pub struct ClientGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

/// A live terminal session: the PTY, its I/O channels, and the emulator
/// holding its scrollback.
///
/// Cheap to clone; every clone refers to the same session. The session id
/// is the child's PID.
#[derive(Clone)]
pub struct Session {
    pub id: u32,
    pub working_directory: PathBuf,
    /// Human-readable display of the command being run.
    pub command: String,
    pub created_at: DateTime<Utc>,
    context: Arc<RwLock<Arc<ContextSnapshot>>>,
    context_file: Option<PathBuf>,
    client_count: Arc<AtomicUsize>,
    size: Arc<Mutex<(u16, u16)>>,
    input_tx: mpsc::Sender<Bytes>,
    pub screen: Screen,
    pty: Arc<Mutex<Pty>>,
    pub activity: ActivityTracker,
    exit_rx: ExitWatch,
    /// Subscribers receive `()` when the UI surface is detached; the session
    /// stays alive.
    detach_signal: broadcast::Sender<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("working_directory", &self.working_directory)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn context(&self) -> Arc<ContextSnapshot> {
        self.context.read().clone()
    }

    /// True while any surface holds a binding to this session.
    pub fn is_attached(&self) -> bool {
        self.clients() > 0
    }

    /// Register a streaming client. Returns `None` once the session already
    /// has [`MAX_CLIENTS_PER_SESSION`] clients.
    pub fn connect(&self) -> Option<ClientGuard> {
        loop {
            let current = self.client_count.load(Ordering::Acquire);
            if current >= MAX_CLIENTS_PER_SESSION {
                return None;
            }
            if self
                .client_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ClientGuard {
                    counter: Arc::clone(&self.client_count),
                });
            }
        }
    }

    pub fn clients(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe_detach(&self) -> broadcast::Receiver<()> {
        self.detach_signal.subscribe()
    }

    /// Signal all attached streaming clients to detach.
    pub(crate) fn signal_detach(&self) {
        let _ = self.detach_signal.send(());
    }

    /// `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    pub fn has_exited(&self) -> bool {
        process::has_exited(&self.exit_rx)
    }

    /// Resize the PTY and then the emulator. The process keeps running.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.pty.lock().resize(rows, cols)?;
        *self.size.lock() = (cols, rows);
        if let Err(e) = self.screen.resize(cols as usize, rows as usize).await {
            tracing::warn!(session_id = self.id, "failed to resize terminal emulator: {}", e);
        }
        Ok(())
    }

    /// Queue input for the PTY writer. Returns `false` if the writer is gone.
    pub async fn send_input(&self, data: Bytes) -> bool {
        self.activity.touch();
        self.input_tx.send(data).await.is_ok()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (cols, rows) = self.size();
        SessionSnapshot {
            session_id: self.id,
            pid: self.id,
            working_directory: self.working_directory.clone(),
            command: self.command.clone(),
            context: (*self.context()).clone(),
            created_at: self.created_at,
            last_activity: self.activity.last_activity_at(),
            attached: self.is_attached(),
            clients: self.clients(),
            cols,
            rows,
        }
    }
}

/// All live terminal sessions, keyed by session id.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<RwLock<HashMap<u32, Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: u32) -> Option<Session> {
        self.inner.read().get(&session_id).cloned()
    }

    /// Insert unless the table is full or the id is taken.
    fn insert(&self, session: Session) -> Result<(), Session> {
        let mut inner = self.inner.write();
        if inner.len() >= MAX_SESSIONS || inner.contains_key(&session.id) {
            return Err(session);
        }
        inner.insert(session.id, session);
        Ok(())
    }

    fn remove(&self, session_id: u32) -> Option<Session> {
        self.inner.write().remove(&session_id)
    }

    /// Sessions ordered by id.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = self.inner.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns every terminal session: spawn, input, resize, context updates, and
/// teardown. Cheap to clone.
#[derive(Clone)]
pub struct SessionSupervisor {
    registry: Registry,
    settings: Arc<Settings>,
}

impl SessionSupervisor {
    pub fn new(registry: Registry, settings: Arc<Settings>) -> Self {
        Self { registry, settings }
    }

    fn table(&self) -> &SessionTable {
        &self.registry.sessions
    }

    /// Spawn a terminal session.
    ///
    /// The session is registered only once the reader, writer, and child are
    /// all in hand; on any failure the child is killed and nothing is
    /// registered.
    pub async fn start(&self, request: SessionRequest) -> ProcResult<SessionHandle> {
        if request.cols == 0 || request.rows == 0 {
            return Err(ProcError::InvalidRequest(format!(
                "terminal size {}x{} is empty",
                request.cols, request.rows
            )));
        }
        if !request.working_directory.is_dir() {
            return Err(ProcError::Spawn(format!(
                "working directory {} does not exist",
                request.working_directory.display()
            )));
        }
        if self.table().len() >= MAX_SESSIONS {
            return Err(ProcError::Spawn("maximum number of sessions reached".into()));
        }

        let prefix = self.settings.env_prefix.clone();
        let context = request.context.clone().unwrap_or_default();
        let mut cmd = pty::session_command(
            request.command.as_deref(),
            self.settings.shell.as_deref(),
            &request.working_directory,
        );
        for (key, value) in context.to_env(&prefix) {
            cmd.env(key, value);
        }

        let context_path = context::new_context_file_path(&self.settings.resolved_state_dir());
        let context_file = match context::write_context_file(&context_path, &context, &prefix) {
            Ok(()) => {
                cmd.env(context::env_key(&prefix, CONTEXT_FILE_KEY), &context_path);
                Some(context_path)
            }
            Err(e) => {
                tracing::warn!(path = %context_path.display(), "failed to write context file: {}", e);
                None
            }
        };

        let command_display = cmd
            .get_argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let (cols, rows) = (request.cols, request.rows);

        let spawned = tokio::task::spawn_blocking(move || -> Result<_, PtyError> {
            let mut pty = Pty::spawn(rows, cols, cmd)?;
            let pid = pty.process_id();
            match take_io(&mut pty) {
                Ok((reader, writer, child)) => Ok((pty, pid, reader, writer, child)),
                Err(e) => {
                    if let Some(pid) = pid {
                        process::signal_group(pid, Signal::Kill);
                    }
                    if let Ok(mut child) = pty.take_child() {
                        let _ = child.wait();
                    }
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| ProcError::Spawn(format!("spawn task failed: {e}")))
        .and_then(|r| r.map_err(ProcError::from));

        let (pty, pid, reader, writer, child) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                if let Some(path) = &context_file {
                    context::remove_context_file(path);
                }
                tracing::warn!(command = %command_display, "failed to spawn terminal session: {}", e);
                return Err(e);
            }
        };
        let Some(pid) = pid else {
            drop(pty);
            if let Some(path) = &context_file {
                context::remove_context_file(path);
            }
            return Err(ProcError::Spawn("spawned process has no pid".into()));
        };

        let (screen, feed) = Screen::spawn(cols as usize, rows as usize, self.settings.scrollback_limit);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = process::exit_channel();
        let activity = ActivityTracker::new();

        let session = Session {
            id: pid,
            working_directory: request.working_directory.clone(),
            command: command_display,
            created_at: Utc::now(),
            context: Arc::new(RwLock::new(Arc::new(context))),
            context_file,
            client_count: Arc::new(AtomicUsize::new(0)),
            size: Arc::new(Mutex::new((cols, rows))),
            input_tx,
            screen,
            pty: Arc::new(Mutex::new(pty)),
            activity: activity.clone(),
            exit_rx,
            detach_signal: broadcast::channel::<()>(1).0,
        };

        if let Err(session) = self.table().insert(session) {
            tracing::warn!(session_id = pid, "session table full or id taken, killing child");
            discard_child(pid, child).await;
            if let Some(path) = &session.context_file {
                context::remove_context_file(path);
            }
            return Err(ProcError::Spawn("could not register session".into()));
        }

        let reader_task = self.spawn_reader(pid, reader, feed, activity);
        spawn_writer(writer, input_rx);
        self.spawn_exit_monitor(pid, child, reader_task, exit_tx);

        tracing::info!(session_id = pid, cwd = %request.working_directory.display(), "terminal session started");
        Ok(SessionHandle { session_id: pid, pid })
    }

    /// PTY reader: every chunk goes to the emulator first (blocking when it
    /// is behind, so the PTY throttles the child instead of losing bytes),
    /// then to the broker.
    fn spawn_reader(
        &self,
        session_id: u32,
        reader: Box<dyn std::io::Read + Send>,
        feed: ScreenFeed,
        activity: ActivityTracker,
    ) -> tokio::task::JoinHandle<()> {
        let events = self.registry.events.clone();
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let source = Source::session(session_id);
                let mut reader = reader;
                let mut buf = [0u8; 4096];
                let mut seq: u64 = 0;
                let mut feed = Some(feed);
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            seq += 1;
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if let Some(tx) = &feed {
                                if tx.blocking_send((seq, data.clone())).is_err() {
                                    tracing::warn!(session_id, "terminal emulator gone, output no longer recorded");
                                    feed = None;
                                }
                            }
                            events.publish(ProcessEvent::Output {
                                source: source.clone(),
                                seq,
                                data,
                            });
                            activity.touch();
                        }
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!(session_id, "PTY reader task panicked: {:?}", e);
            }
        })
    }

    /// Sole owner of the child. Removes the session, then publishes the exit
    /// event and the exit watch, exactly once.
    fn spawn_exit_monitor(
        &self,
        session_id: u32,
        mut child: pty::PtyChild,
        reader_task: tokio::task::JoinHandle<()>,
        exit_tx: tokio::sync::watch::Sender<ProcessExit>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let waited = tokio::task::spawn_blocking(move || {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| child.wait()))
            })
            .await;
            let exit_code = match waited {
                Ok(Ok(Ok(status))) => Some(status.exit_code() as i32),
                Ok(Ok(Err(e))) => {
                    tracing::error!(session_id, ?e, "error waiting for session child");
                    None
                }
                Ok(Err(e)) => {
                    tracing::error!(session_id, "child exit monitor panicked: {:?}", e);
                    None
                }
                Err(e) => {
                    tracing::error!(session_id, "child exit monitor task failed: {}", e);
                    None
                }
            };

            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader_task).await.is_err() {
                tracing::debug!(session_id, "PTY reader still open after child exit");
            }

            let removed = supervisor.table().remove(session_id);
            if let Some(path) = removed.as_ref().and_then(|s| s.context_file.as_ref()) {
                context::remove_context_file(path);
            }
            supervisor.registry.events.publish(ProcessEvent::Exit {
                source: Source::session(session_id),
                exit_code,
            });
            // After the exit event, so live attachments see it first.
            if let Some(session) = removed {
                session.signal_detach();
            }
            exit_tx.send_replace(ProcessExit::Exited(exit_code));
            tracing::info!(session_id, ?exit_code, "terminal session exited");
        });
    }

    /// Fire-and-forget input. Unknown sessions are ignored.
    pub async fn write(&self, session_id: u32, data: Bytes) {
        match self.table().get(session_id) {
            Some(session) => {
                if !session.send_input(data).await {
                    tracing::debug!(session_id, "PTY writer closed, input dropped");
                }
            }
            None => tracing::debug!(session_id, "write to unknown session dropped"),
        }
    }

    /// Resize a session's PTY and emulator. Unknown sessions are ignored.
    pub async fn resize(&self, session_id: u32, cols: u16, rows: u16) -> ProcResult<()> {
        if cols == 0 || rows == 0 {
            return Err(ProcError::InvalidRequest(format!("terminal size {cols}x{rows} is empty")));
        }
        let Some(session) = self.table().get(session_id) else {
            tracing::debug!(session_id, "resize of unknown session ignored");
            return Ok(());
        };
        if let Err(e) = session.resize(cols, rows).await {
            tracing::warn!(session_id, "resize failed: {}", e);
        }
        Ok(())
    }

    /// SIGHUP the session's process group, SIGKILL after the grace period,
    /// and wait for the exit to be confirmed. Unknown sessions are a no-op.
    pub async fn kill(&self, session_id: u32) -> ProcResult<()> {
        let Some(session) = self.table().get(session_id) else {
            return Ok(());
        };
        tracing::info!(session_id, "killing terminal session");
        process::terminate(session.id, session.exit_rx.clone(), Signal::Hangup, self.settings.stop_grace()).await;
        Ok(())
    }

    /// Replace a session's context. The running process keeps its original
    /// environment; the context file is rewritten.
    pub fn update_context(&self, session_id: u32, snapshot: ContextSnapshot) -> ProcResult<()> {
        let session = self
            .table()
            .get(session_id)
            .ok_or_else(|| ProcError::NotFound(format!("session {session_id}")))?;
        if let Some(path) = &session.context_file {
            if let Err(e) = context::write_context_file(path, &snapshot, &self.settings.env_prefix) {
                tracing::warn!(session_id, path = %path.display(), "failed to rewrite context file: {}", e);
            }
        }
        *session.context.write() = Arc::new(snapshot);
        tracing::debug!(session_id, "session context updated");
        Ok(())
    }

    pub fn get(&self, session_id: u32) -> Option<SessionSnapshot> {
        self.table().get(session_id).map(|s| s.snapshot())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.table().list().iter().map(Session::snapshot).collect()
    }

    /// Kill every session concurrently, giving up after `within`.
    pub async fn shutdown(&self, within: Duration) {
        let ids: Vec<u32> = self.table().list().iter().map(|s| s.id).collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "killing terminal sessions for shutdown");
        let kills = futures::future::join_all(ids.into_iter().map(|id| self.kill(id)));
        if tokio::time::timeout(within, kills).await.is_err() {
            tracing::warn!(?within, "terminal sessions still exiting at shutdown deadline");
        }
    }
}

type PtyIo = (Box<dyn std::io::Read + Send>, Box<dyn std::io::Write + Send>, pty::PtyChild);

fn take_io(pty: &mut Pty) -> Result<PtyIo, PtyError> {
    let reader = pty.take_reader()?;
    let writer = pty.take_writer()?;
    let child = pty.take_child()?;
    Ok((reader, writer, child))
}

/// Kill a child that never became a session and reap it.
async fn discard_child(pid: u32, mut child: pty::PtyChild) {
    process::signal_group(pid, Signal::Kill);
    if let Err(e) = tokio::task::spawn_blocking(move || child.wait()).await {
        tracing::warn!(pid, "failed to reap discarded child: {}", e);
    }
}

fn spawn_writer(writer: Box<dyn std::io::Write + Send>, input_rx: mpsc::Receiver<Bytes>) {
    // Exits when the channel closes or the PTY goes away (write fails with
    // EIO once the child is dead).
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            use std::io::Write;
            let mut writer = writer;
            let mut rx = input_rx;
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        }));
        if let Err(e) = result {
            tracing::error!("PTY writer task panicked: {:?}", e);
        }
    });
}
