//! Preview server supervision: spawn, readiness detection, crash tracking,
//! and graceful stop.
//!
//! Each start runs as a chain of spawned tasks (launcher, two output
//! pumps, readiness watcher, exit monitor) that report back into the
//! [`ServerTable`](super::ServerTable). Every task carries the generation it
//! was spawned with; a stop or restart bumps the generation so stale results
//! are discarded instead of clobbering newer state.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broker::{Broker, ProcessEvent, Source};
use crate::config::{ReadinessProbe, Settings};
use crate::error::{ProcError, ProcResult};
use crate::process::{self, ProcessExit, Signal};
use crate::registry::Registry;

use super::output::{contains_marker, LogLine, LogStream, OutputLog};
use super::state::{ProcessHandle, ServerEntry, ServerSnapshot, ServerStartInfo, ServerStatus};

/// Interval between TCP probes once the readiness marker has been seen.
const PORT_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Per-attempt connect timeout for the port probe.
const PORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the exit monitor waits for the output pumps to drain after the
/// child exits, so the error tail includes the final lines.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Project ids are used in log lines and event sources; restrict them to a
/// safe character set.
fn validate_project_id(project_id: &str) -> ProcResult<()> {
    if project_id.is_empty() {
        return Err(ProcError::InvalidRequest("project id cannot be empty".into()));
    }
    if !project_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        || project_id.contains("..")
    {
        return Err(ProcError::InvalidRequest(format!(
            "project id {project_id:?} may only contain alphanumerics, '-', '_' and '.'"
        )));
    }
    Ok(())
}

enum StartPlan {
    Running(ServerStartInfo),
    /// Another caller's start is in flight; wait for its outcome.
    Join {
        generation: u64,
        status_rx: watch::Receiver<ServerStatus>,
    },
    /// A stop is in progress; wait for it, then start fresh.
    AfterStop(watch::Receiver<ServerStatus>),
    Launch {
        generation: u64,
        port: u16,
        status_rx: watch::Receiver<ServerStatus>,
    },
}

enum Wake {
    Marker,
    OutputClosed,
    Exited,
    Deadline,
}

enum StopPlan {
    Done,
    Join(watch::Receiver<ServerStatus>),
    Terminate {
        generation: u64,
        process: Option<ProcessHandle>,
    },
}

/// Everything the per-process tasks need, bundled so it can be cloned into
/// each of them.
#[derive(Clone)]
struct RunContext {
    project_id: String,
    generation: u64,
    port: u16,
    log: Arc<Mutex<OutputLog>>,
    seq: Arc<AtomicU64>,
}

/// Owns every preview server process. Cheap to clone.
#[derive(Clone)]
pub struct ServerSupervisor {
    registry: Registry,
    settings: Arc<Settings>,
}

impl ServerSupervisor {
    pub fn new(registry: Registry, settings: Arc<Settings>) -> Self {
        Self { registry, settings }
    }

    fn events(&self) -> &Broker {
        &self.registry.events
    }

    /// Start (or join the start of) the preview server for `project_id`.
    ///
    /// Resolves once the server is ready, or with the error that moved it to
    /// `Failed`. Concurrent calls for the same project share one process.
    pub async fn start(&self, project_id: &str, project_path: &Path) -> ProcResult<ServerStartInfo> {
        validate_project_id(project_id)?;

        loop {
            match self.plan_start(project_id)? {
                StartPlan::Running(info) => return Ok(info),
                StartPlan::Join {
                    generation,
                    status_rx,
                } => {
                    tracing::debug!(project = %project_id, "joining in-flight start");
                    return self.await_start(project_id, generation, status_rx).await;
                }
                StartPlan::AfterStop(mut status_rx) => {
                    tracing::debug!(project = %project_id, "waiting for stop before starting");
                    let _ = status_rx.wait_for(|s| *s != ServerStatus::Stopping).await;
                }
                StartPlan::Launch {
                    generation,
                    port,
                    status_rx,
                } => {
                    let ctx = self.run_context(project_id, generation, port);
                    let supervisor = self.clone();
                    let path = project_path.to_path_buf();
                    // The launch runs detached so a caller that gives up can
                    // never leave the project stuck in `Starting`.
                    tokio::spawn(async move {
                        let result = AssertUnwindSafe(supervisor.clone().launch(ctx.clone(), path))
                            .catch_unwind()
                            .await;
                        if let Err(e) = result {
                            tracing::error!(project = %ctx.project_id, "launcher panicked: {:?}", e);
                            supervisor.fail_start(&ctx, ProcError::Spawn("launcher panicked".into()));
                        }
                    });
                    return self.await_start(project_id, generation, status_rx).await;
                }
            }
        }
    }

    fn run_context(&self, project_id: &str, generation: u64, port: u16) -> RunContext {
        let log = self
            .registry
            .servers
            .lock()
            .get(project_id)
            .map(|e| e.log.clone())
            .unwrap_or_default();
        RunContext {
            project_id: project_id.to_string(),
            generation,
            port,
            log,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn plan_start(&self, project_id: &str) -> ProcResult<StartPlan> {
        let mut servers = self.registry.servers.lock();
        let entry = servers
            .entry(project_id.to_string())
            .or_insert_with(|| ServerEntry::new(project_id));

        match entry.status {
            ServerStatus::Ready => entry
                .start_info()
                .map(StartPlan::Running)
                .ok_or_else(|| ProcError::Spawn("ready server has no process".into())),
            ServerStatus::Starting => Ok(StartPlan::Join {
                generation: entry.generation,
                status_rx: entry.status_tx.subscribe(),
            }),
            ServerStatus::Stopping => Ok(StartPlan::AfterStop(entry.status_tx.subscribe())),
            ServerStatus::Stopped | ServerStatus::Failed => {
                let port = match self.registry.ports.allocate() {
                    Ok(port) => port,
                    Err(e) => {
                        tracing::warn!(project = %project_id, "port allocation failed: {}", e);
                        entry.last_error = Some(e.clone());
                        entry.set_status(ServerStatus::Failed);
                        return Err(e);
                    }
                };
                entry.generation += 1;
                entry.port = Some(port);
                entry.started_at = None;
                entry.last_error = None;
                entry.set_status(ServerStatus::Starting);
                {
                    let mut log = entry.log.lock();
                    log.begin_run();
                    log.push(LogStream::System, format!("starting preview server on port {port}"));
                }
                tracing::info!(project = %project_id, port, "starting preview server");
                Ok(StartPlan::Launch {
                    generation: entry.generation,
                    port,
                    status_rx: entry.status_tx.subscribe(),
                })
            }
        }
    }

    /// Wait for the start identified by `generation` to settle.
    async fn await_start(
        &self,
        project_id: &str,
        generation: u64,
        mut status_rx: watch::Receiver<ServerStatus>,
    ) -> ProcResult<ServerStartInfo> {
        let _ = status_rx.wait_for(|s| *s != ServerStatus::Starting).await;

        let servers = self.registry.servers.lock();
        let Some(entry) = servers.get(project_id) else {
            return Err(ProcError::Cancelled(format!("server {project_id} disappeared")));
        };
        if entry.generation != generation {
            return Err(ProcError::Cancelled(format!("start of {project_id} was superseded by a stop")));
        }
        match entry.status {
            ServerStatus::Ready => entry
                .start_info()
                .ok_or_else(|| ProcError::Spawn("ready server has no process".into())),
            ServerStatus::Failed => Err(entry
                .last_error
                .clone()
                .unwrap_or_else(|| ProcError::Spawn("start failed".into()))),
            _ => Err(ProcError::Cancelled(format!("start of {project_id} was cancelled"))),
        }
    }

    /// Spawn the preview command and wire up its tasks.
    async fn launch(self, ctx: RunContext, project_path: PathBuf) {
        if !project_path.is_dir() {
            self.fail_start(
                &ctx,
                ProcError::Spawn(format!(
                    "project directory {} does not exist",
                    project_path.display()
                )),
            );
            return;
        }

        let (program, args) = match self.settings.preview_command.split_first() {
            Some(parts) => parts,
            None => {
                self.fail_start(&ctx, ProcError::Spawn("preview command is empty".into()));
                return;
            }
        };
        let command_line = self.settings.preview_command.join(" ");

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&project_path)
            .env("PORT", ctx.port.to_string())
            .env("BROWSER", "none")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.fail_start(&ctx, ProcError::Spawn(format!("{command_line}: {e}")));
                return;
            }
        };
        let Some(pid) = child.id() else {
            self.fail_start(&ctx, ProcError::Spawn(format!("{command_line}: exited immediately")));
            return;
        };

        let (exit_tx, exit_rx) = process::exit_channel();
        let registered = {
            let mut servers = self.registry.servers.lock();
            match servers.get_mut(&ctx.project_id) {
                Some(entry) if entry.generation == ctx.generation => {
                    entry.pid = Some(pid);
                    entry.url = Some(format!("http://localhost:{}", ctx.port));
                    entry.process = Some(ProcessHandle {
                        pid,
                        exit_rx: exit_rx.clone(),
                    });
                    true
                }
                _ => false,
            }
        };
        if !registered {
            tracing::info!(project = %ctx.project_id, pid, "start cancelled during spawn, killing process");
            process::signal_group(pid, Signal::Kill);
            let _ = child.wait().await;
            return;
        }

        ctx.log
            .lock()
            .push(LogStream::System, format!("spawned `{command_line}` with pid {pid}"));
        tracing::info!(project = %ctx.project_id, pid, port = ctx.port, "preview server spawned");

        let (marker_tx, marker_rx) = watch::channel(false);
        let marker_tx = Arc::new(marker_tx);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(self.spawn_output_pump(&ctx, stdout, LogStream::Stdout, marker_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(self.spawn_output_pump(&ctx, stderr, LogStream::Stderr, marker_tx));
        }

        let monitor = self.clone();
        let monitor_ctx = ctx.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(monitor.monitor_exit(&monitor_ctx, child, pumps, exit_tx))
                .catch_unwind()
                .await;
            if let Err(e) = result {
                tracing::error!(project = %monitor_ctx.project_id, "exit monitor panicked: {:?}", e);
            }
        });

        let watcher = self.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(watcher.watch_readiness(&ctx, marker_rx, exit_rx))
                .catch_unwind()
                .await;
            if let Err(e) = result {
                tracing::error!(project = %ctx.project_id, "readiness watcher panicked: {:?}", e);
                watcher.fail_start(&ctx, ProcError::Spawn("readiness watcher panicked".into()));
            }
        });
    }

    fn spawn_output_pump<R>(
        &self,
        ctx: &RunContext,
        stream: R,
        kind: LogStream,
        marker_tx: Arc<watch::Sender<bool>>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let ctx = ctx.clone();
        let events = self.events().clone();
        let marker = self.settings.readiness_marker.to_lowercase();
        tokio::spawn(async move {
            let source = Source::server(ctx.project_id.as_str());
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(project = %ctx.project_id, ?kind, "output read error: {}", e);
                        break;
                    }
                }
                // Invalid UTF-8 is replaced, not fatal.
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if !*marker_tx.borrow() && contains_marker(&line, &marker) {
                    marker_tx.send_replace(true);
                }
                let seq = ctx.seq.fetch_add(1, Ordering::Relaxed) + 1;
                events.publish(ProcessEvent::Output {
                    source: source.clone(),
                    seq,
                    data: Bytes::from(format!("{line}\n")),
                });
                ctx.log.lock().push(kind, line);
            }
        })
    }

    /// Sole owner of the child. Publishes the exit event exactly once and
    /// classifies the exit against the current state.
    async fn monitor_exit(
        &self,
        ctx: &RunContext,
        mut child: Child,
        pumps: Vec<JoinHandle<()>>,
        exit_tx: watch::Sender<ProcessExit>,
    ) {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(project = %ctx.project_id, "failed to wait for preview server: {}", e);
                None
            }
        };
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(pumps)).await;

        ctx.log
            .lock()
            .push(LogStream::System, format!("process exited with code {code:?}"));
        exit_tx.send_replace(ProcessExit::Exited(code));
        self.events().publish(ProcessEvent::Exit {
            source: Source::server(ctx.project_id.as_str()),
            exit_code: code,
        });

        let mut servers = self.registry.servers.lock();
        let Some(entry) = servers.get_mut(&ctx.project_id) else {
            return;
        };
        if entry.generation != ctx.generation {
            return;
        }
        let error = match entry.status {
            ServerStatus::Starting => {
                let detail = match code {
                    Some(code) => format!("exited with code {code} before becoming ready"),
                    None => "killed by signal before becoming ready".to_string(),
                };
                let tail = ctx.log.lock().error_tail();
                if tail.is_empty() {
                    ProcError::Spawn(detail)
                } else {
                    ProcError::Spawn(format!("{detail}\n{tail}"))
                }
            }
            ServerStatus::Ready => {
                tracing::warn!(project = %ctx.project_id, ?code, "preview server crashed");
                ProcError::Crash {
                    code,
                    output: ctx.log.lock().error_tail(),
                }
            }
            // Stopping is finished by `stop`; Failed/Stopped already released.
            _ => return,
        };
        Self::mark_failed(&self.registry, entry, error);
    }

    async fn watch_readiness(
        &self,
        ctx: &RunContext,
        mut marker_rx: watch::Receiver<bool>,
        mut exit_rx: process::ExitWatch,
    ) {
        let timeout = self.settings.readiness_timeout();
        let deadline = Instant::now() + timeout;

        let wake = tokio::select! {
            seen = async { marker_rx.wait_for(|seen| *seen).await.is_ok() } => {
                if seen { Wake::Marker } else { Wake::OutputClosed }
            }
            _ = process::wait_for_exit(&mut exit_rx) => Wake::Exited,
            _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
        };

        match wake {
            Wake::Marker => {}
            // The exit monitor classifies the failure.
            Wake::Exited => return,
            Wake::Deadline => return self.time_out(ctx, timeout),
            // Both pumps hit EOF without the marker. Whichever comes first,
            // the exit or the deadline, decides the failure.
            Wake::OutputClosed => {
                tokio::select! {
                    _ = process::wait_for_exit(&mut exit_rx) => {}
                    _ = tokio::time::sleep_until(deadline) => self.time_out(ctx, timeout),
                }
                return;
            }
        }

        if self.settings.readiness_probe == ReadinessProbe::MarkerAndPort {
            tracing::debug!(project = %ctx.project_id, port = ctx.port, "marker seen, probing port");
            loop {
                if port_accepts(ctx.port).await {
                    break;
                }
                if process::has_exited(&exit_rx) {
                    return;
                }
                if Instant::now() >= deadline {
                    self.time_out(ctx, timeout);
                    return;
                }
                tokio::time::sleep(PORT_PROBE_INTERVAL).await;
            }
        }

        let mut servers = self.registry.servers.lock();
        if let Some(entry) = servers.get_mut(&ctx.project_id) {
            if entry.generation == ctx.generation && entry.status == ServerStatus::Starting {
                entry.started_at = Some(Utc::now());
                entry.set_status(ServerStatus::Ready);
                entry.log.lock().push(LogStream::System, "preview server ready");
                tracing::info!(project = %ctx.project_id, port = ctx.port, "preview server ready");
            }
        }
    }

    fn time_out(&self, ctx: &RunContext, timeout: Duration) {
        let process = {
            let mut servers = self.registry.servers.lock();
            let Some(entry) = servers.get_mut(&ctx.project_id) else {
                return;
            };
            if entry.generation != ctx.generation || entry.status != ServerStatus::Starting {
                return;
            }
            tracing::warn!(project = %ctx.project_id, ?timeout, "preview server readiness timed out");
            let process = entry.process.clone();
            let error = ProcError::Timeout {
                timeout,
                output: ctx.log.lock().error_tail(),
            };
            Self::mark_failed(&self.registry, entry, error);
            process
        };

        if let Some(ProcessHandle { pid, exit_rx }) = process {
            let grace = self.settings.stop_grace();
            tokio::spawn(async move {
                process::terminate(pid, exit_rx, Signal::Terminate, grace).await;
            });
        }
    }

    /// Record a failed start for the generation in `ctx`, if still current.
    fn fail_start(&self, ctx: &RunContext, error: ProcError) {
        let mut servers = self.registry.servers.lock();
        let Some(entry) = servers.get_mut(&ctx.project_id) else {
            return;
        };
        if entry.generation != ctx.generation || entry.status != ServerStatus::Starting {
            return;
        }
        tracing::warn!(project = %ctx.project_id, "preview server failed to start: {}", error);
        Self::mark_failed(&self.registry, entry, error);
    }

    fn mark_failed(registry: &Registry, entry: &mut ServerEntry, error: ProcError) {
        entry
            .log
            .lock()
            .push(LogStream::System, format!("{}: {}", error.kind().as_str(), error));
        if let Some(port) = entry.release() {
            registry.ports.deallocate(port);
        }
        entry.started_at = None;
        entry.last_error = Some(error);
        entry.set_status(ServerStatus::Failed);
    }

    /// Stop the preview server for `project_id`. Idempotent: a project with
    /// no live process returns `Ok` without side effects.
    pub async fn stop(&self, project_id: &str) -> ProcResult<()> {
        let plan = {
            let mut servers = self.registry.servers.lock();
            match servers.get_mut(project_id) {
                None => StopPlan::Done,
                Some(entry) => match entry.status {
                    ServerStatus::Stopped | ServerStatus::Failed => StopPlan::Done,
                    ServerStatus::Stopping => StopPlan::Join(entry.status_tx.subscribe()),
                    ServerStatus::Starting | ServerStatus::Ready => {
                        entry.generation += 1;
                        entry.set_status(ServerStatus::Stopping);
                        StopPlan::Terminate {
                            generation: entry.generation,
                            process: entry.process.clone(),
                        }
                    }
                },
            }
        };

        match plan {
            StopPlan::Done => Ok(()),
            StopPlan::Join(mut status_rx) => {
                let _ = status_rx.wait_for(|s| *s != ServerStatus::Stopping).await;
                Ok(())
            }
            StopPlan::Terminate {
                generation,
                process: handle,
            } => {
                tracing::info!(project = %project_id, "stopping preview server");
                if let Some(ProcessHandle { pid, exit_rx }) = handle {
                    let code =
                        process::terminate(pid, exit_rx, Signal::Terminate, self.settings.stop_grace()).await;
                    tracing::debug!(project = %project_id, pid, ?code, "preview server exited");
                }

                let mut servers = self.registry.servers.lock();
                if let Some(entry) = servers.get_mut(project_id) {
                    if entry.generation == generation {
                        if let Some(port) = entry.release() {
                            self.registry.ports.deallocate(port);
                        }
                        entry.started_at = None;
                        entry.last_error = None;
                        entry.log.lock().push(LogStream::System, "preview server stopped");
                        entry.set_status(ServerStatus::Stopped);
                    }
                }
                tracing::info!(project = %project_id, "preview server stopped");
                Ok(())
            }
        }
    }

    pub fn status(&self, project_id: &str) -> ServerSnapshot {
        self.registry.servers.snapshot(project_id)
    }

    pub fn list(&self) -> Vec<ServerSnapshot> {
        self.registry.servers.list()
    }

    /// Most recent `limit` log lines for a project, oldest first.
    pub fn logs(&self, project_id: &str, limit: usize) -> Vec<LogLine> {
        self.registry
            .servers
            .lock()
            .get(project_id)
            .map(|e| e.log.clone())
            .map(|log| log.lock().recent(limit))
            .unwrap_or_default()
    }

    /// Projects whose server is starting or ready.
    pub fn tracked_projects(&self) -> Vec<String> {
        self.registry.servers.tracked()
    }
}

async fn port_accepts(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            PORT_CONNECT_TIMEOUT,
            tokio::net::TcpStream::connect(("localhost", port))
        )
        .await,
        Ok(Ok(_))
    )
}
