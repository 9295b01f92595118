//! Signal delivery and exit tracking shared by both supervisors.

use std::time::Duration;

use tokio::sync::watch;

/// How long to wait for the kernel to reap a process after SIGKILL.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit state of a supervised child, published by its exit monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Running,
    /// Exit code, or `None` when the process was terminated by a signal.
    Exited(Option<i32>),
}

pub type ExitWatch = watch::Receiver<ProcessExit>;

pub fn exit_channel() -> (watch::Sender<ProcessExit>, ExitWatch) {
    watch::channel(ProcessExit::Running)
}

/// Wait until the exit monitor reports an exit. Returns the exit code.
pub async fn wait_for_exit(rx: &mut ExitWatch) -> Option<i32> {
    match rx.wait_for(|e| matches!(e, ProcessExit::Exited(_))).await {
        Ok(exit) => match *exit {
            ProcessExit::Exited(code) => code,
            ProcessExit::Running => None,
        },
        // Monitor dropped without reporting; nothing left to wait for.
        Err(_) => None,
    }
}

pub fn has_exited(rx: &ExitWatch) -> bool {
    matches!(*rx.borrow(), ProcessExit::Exited(_))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hangup,
    Terminate,
    Kill,
}

/// Send `signal` to the process group led by `pid`, falling back to the
/// process itself if it is not a group leader.
///
/// Callers must check the exit watch first: once a child has been reaped
/// its PID may be recycled.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: Signal) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return false;
    }
    let sig = match signal {
        Signal::Hangup => libc::SIGHUP,
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        if libc::kill(-(pid as i32), sig) == 0 {
            return true;
        }
        libc::kill(pid as i32, sig) == 0
    }
}

#[cfg(not(unix))]
pub fn signal_group(pid: u32, signal: Signal) -> bool {
    tracing::warn!(pid, ?signal, "process signals not implemented for this platform");
    false
}

/// Ask a process to exit with `first`, escalate to SIGKILL after `grace`,
/// and wait for the exit monitor to confirm.
///
/// Returns the exit code if the exit was observed.
pub async fn terminate(pid: u32, mut exit_rx: ExitWatch, first: Signal, grace: Duration) -> Option<i32> {
    if let ProcessExit::Exited(code) = *exit_rx.borrow() {
        return code;
    }

    signal_group(pid, first);
    if let Ok(code) = tokio::time::timeout(grace, wait_for_exit(&mut exit_rx)).await {
        tracing::debug!(pid, ?first, "process exited after signal");
        return code;
    }

    if has_exited(&exit_rx) {
        return wait_for_exit(&mut exit_rx).await;
    }
    tracing::warn!(pid, ?first, "process still running after grace period, sending SIGKILL");
    signal_group(pid, Signal::Kill);
    match tokio::time::timeout(KILL_CONFIRM_TIMEOUT, wait_for_exit(&mut exit_rx)).await {
        Ok(code) => code,
        Err(_) => {
            tracing::error!(pid, "process did not exit after SIGKILL");
            None
        }
    }
}
