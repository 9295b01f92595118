//! Binding UI surfaces to live terminal sessions.
//!
//! A session outlives any surface rendering it. Attaching subscribes to the
//! session's output, resizes the PTY to the surface, and snapshots the
//! session's emulator. The snapshot carries the sequence number of the last
//! chunk it contains, and the live stream skips everything up to it, so
//! replay followed by the stream has no gap and no duplicates. If the
//! stream falls behind and drops output, the attachment takes a fresh
//! snapshot and hands it out as a resync instead of skipping the gap.

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::broker::{ProcessEvent, Source, Subscription, SubscriptionEvent, Topic};
use crate::error::{ProcError, ProcResult};
use crate::registry::Registry;
use crate::screen::ScreenSnapshot;
use crate::session::{ClientGuard, Session};

/// One item of an attachment's live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachEvent {
    Output { seq: u64, data: Bytes },
    /// Output was dropped; repaint from this snapshot. The stream resumes
    /// after its `through_seq`.
    Resync(ScreenSnapshot),
    Exit { exit_code: Option<i32> },
}

#[derive(Clone)]
pub struct Attachments {
    registry: Registry,
}

impl Attachments {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    fn session(&self, session_id: u32) -> ProcResult<Session> {
        self.registry
            .sessions
            .get(session_id)
            .ok_or_else(|| ProcError::NotFound(format!("session {session_id}")))
    }

    /// Bind a surface of `cols` x `rows` to a running session.
    pub async fn attach(&self, session_id: u32, cols: u16, rows: u16) -> ProcResult<Attachment> {
        if cols == 0 || rows == 0 {
            return Err(ProcError::InvalidRequest(format!("terminal size {cols}x{rows} is empty")));
        }
        let session = self.session(session_id)?;
        let guard = session
            .connect()
            .ok_or_else(|| ProcError::InvalidRequest(format!("session {session_id} has too many clients")))?;

        // Subscribe before the snapshot so nothing produced in between is
        // lost.
        let subscription = self.registry.events.subscribe(Topic::Source(Source::session(session_id)));
        let detach_rx = session.subscribe_detach();

        // The exit monitor removes the session before publishing its exit,
        // so a session still in the table will deliver its exit to us.
        if self.registry.sessions.get(session_id).is_none() {
            return Err(ProcError::NotFound(format!("session {session_id} has exited")));
        }

        if let Err(e) = session.resize(cols, rows).await {
            tracing::warn!(session_id, "resize on attach failed: {}", e);
        }
        let snapshot = session.screen.snapshot().await.map_err(|e| {
            ProcError::NotFound(format!("session {session_id} terminal unavailable: {e}"))
        })?;

        tracing::debug!(session_id, cols, rows, through_seq = snapshot.through_seq, "surface attached");

        Ok(Attachment {
            snapshot,
            subscription: Some(subscription),
            detach_rx,
            binding: Binding {
                session,
                guard: Some(guard),
            },
        })
    }

    /// End every live [`Attachment`] stream for the session. Each stream
    /// releases its binding as it ends. Bare [`Binding`]s are unaffected.
    /// The process and its scrollback are untouched.
    pub fn detach(&self, session_id: u32) -> ProcResult<()> {
        let session = self.session(session_id)?;
        session.signal_detach();
        tracing::debug!(session_id, "attachment streams detached");
        Ok(())
    }
}

/// Holds one of the session's client slots. A session counts as attached
/// while any binding is held.
pub struct Binding {
    session: Session,
    guard: Option<ClientGuard>,
}

impl Binding {
    pub fn session_id(&self) -> u32 {
        self.session.id
    }

    fn release(&mut self) {
        drop(self.guard.take());
    }
}

/// A live binding of one surface to one session.
pub struct Attachment {
    snapshot: ScreenSnapshot,
    subscription: Option<Subscription>,
    detach_rx: broadcast::Receiver<()>,
    binding: Binding,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl Attachment {
    pub fn session_id(&self) -> u32 {
        self.binding.session_id()
    }

    /// Scrollback and screen as of the attach.
    pub fn snapshot(&self) -> &ScreenSnapshot {
        &self.snapshot
    }

    pub fn through_seq(&self) -> u64 {
        self.snapshot.through_seq
    }

    /// Next chunk of output not already in the snapshot. `None` once the
    /// surface is detached or the session's exit has been delivered.
    pub async fn next(&mut self) -> Option<AttachEvent> {
        loop {
            let subscription = self.subscription.as_mut()?;
            // Queued output wins over a detach signal sent after it.
            let event = tokio::select! {
                biased;
                event = subscription.recv() => event,
                _ = self.detach_rx.recv() => None,
            };
            match event {
                Some(SubscriptionEvent::Event(ProcessEvent::Output { seq, data, .. })) => {
                    if seq > self.snapshot.through_seq {
                        return Some(AttachEvent::Output { seq, data });
                    }
                }
                Some(SubscriptionEvent::Lagged(missed)) => {
                    let session_id = self.session_id();
                    tracing::warn!(session_id, missed, "attachment fell behind, resyncing from screen");
                    match self.binding.session.screen.snapshot().await {
                        Ok(snapshot) => {
                            self.snapshot = snapshot.clone();
                            return Some(AttachEvent::Resync(snapshot));
                        }
                        Err(e) => {
                            tracing::warn!(session_id, "resync failed: {}", e);
                            self.end();
                            return None;
                        }
                    }
                }
                Some(SubscriptionEvent::Event(ProcessEvent::Exit { exit_code, .. })) => {
                    self.end();
                    return Some(AttachEvent::Exit { exit_code });
                }
                None => {
                    self.end();
                    return None;
                }
            }
        }
    }

    fn end(&mut self) {
        self.subscription = None;
        self.binding.release();
    }

    /// Drop the output stream but keep the session marked attached, for
    /// callers that already receive the session's events elsewhere.
    pub fn into_binding(self) -> Binding {
        self.binding
    }
}
