use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::supervisor::ServerSupervisor;

/// The slice of the server supervisor the lifecycle controller drives.
pub trait ServerControl: Clone + Send + Sync + 'static {
    /// Projects with a live (starting or ready) server.
    fn tracked_projects(&self) -> Vec<String>;

    /// Stop a project's server. Errors are logged by the implementation.
    fn stop_project(&self, project_id: String) -> impl Future<Output = ()> + Send;
}

impl ServerControl for ServerSupervisor {
    fn tracked_projects(&self) -> Vec<String> {
        ServerSupervisor::tracked_projects(self)
    }

    fn stop_project(&self, project_id: String) -> impl Future<Output = ()> + Send {
        let supervisor = self.clone();
        async move {
            if let Err(e) = supervisor.stop(&project_id).await {
                tracing::warn!(project = %project_id, "failed to stop preview server: {}", e);
            }
        }
    }
}

#[derive(Default)]
struct ViewState {
    active: Option<String>,
    /// Bumped on every schedule so a sweep can tell whether it is still the
    /// pending one.
    sweep_generation: u64,
    pending_sweep: Option<CancellationToken>,
}

/// Stops preview servers the user is no longer looking at.
///
/// An idle view schedules a sweep after a delay; any activity before it fires
/// cancels it. The sweep stops every tracked server except the active
/// project's.
#[derive(Clone)]
pub struct LifecycleController<C: ServerControl> {
    control: C,
    idle_delay: Duration,
    state: Arc<Mutex<ViewState>>,
}

impl<C: ServerControl> LifecycleController<C> {
    pub fn new(control: C, idle_delay: Duration) -> Self {
        Self {
            control,
            idle_delay,
            state: Arc::new(Mutex::new(ViewState::default())),
        }
    }

    /// The UI is in use. Records the active project and cancels any
    /// pending idle sweep.
    pub fn view_active(&self, project_id: Option<String>) {
        let mut state = self.state.lock();
        if let Some(token) = state.pending_sweep.take() {
            tracing::debug!("view active, idle sweep cancelled");
            token.cancel();
        }
        state.active = project_id;
    }

    /// The UI went idle. Replaces any pending sweep with a fresh one.
    ///
    /// `project_id`, when given, updates the active project first.
    pub fn view_idle(&self, project_id: Option<String>) {
        let token = CancellationToken::new();
        let generation = {
            let mut state = self.state.lock();
            if let Some(old) = state.pending_sweep.replace(token.clone()) {
                old.cancel();
            }
            if project_id.is_some() {
                state.active = project_id;
            }
            state.sweep_generation += 1;
            state.sweep_generation
        };

        let controller = self.clone();
        let delay = self.idle_delay;
        tracing::debug!(?delay, "view idle, sweep scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => controller.sweep(generation).await,
            }
        });
    }

    async fn sweep(&self, generation: u64) {
        let active = {
            let mut state = self.state.lock();
            if state.sweep_generation != generation || state.pending_sweep.is_none() {
                return;
            }
            state.pending_sweep = None;
            state.active.clone()
        };

        let victims: Vec<String> = self
            .control
            .tracked_projects()
            .into_iter()
            .filter(|id| Some(id) != active.as_ref())
            .collect();
        if victims.is_empty() {
            return;
        }
        tracing::info!(count = victims.len(), active = ?active, "idle sweep stopping preview servers");
        futures::future::join_all(victims.into_iter().map(|id| self.control.stop_project(id))).await;
    }

    pub fn active_project(&self) -> Option<String> {
        self.state.lock().active.clone()
    }

    pub fn has_pending_sweep(&self) -> bool {
        self.state.lock().pending_sweep.is_some()
    }

    /// Cancel any pending sweep and stop every tracked server concurrently,
    /// giving up after `within`.
    pub async fn shutdown(&self, within: Duration) {
        if let Some(token) = self.state.lock().pending_sweep.take() {
            token.cancel();
        }

        let tracked = self.control.tracked_projects();
        if tracked.is_empty() {
            return;
        }
        tracing::info!(count = tracked.len(), "stopping preview servers for shutdown");
        let stops = futures::future::join_all(tracked.into_iter().map(|id| self.control.stop_project(id)));
        if tokio::time::timeout(within, stops).await.is_err() {
            tracing::warn!(?within, "preview servers still stopping at shutdown deadline");
        }
    }
}
