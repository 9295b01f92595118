#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devdock::config::{ReadinessProbe, Settings};
use devdock::dispatch::Host;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Settings for a daemon whose preview command is `sh -c <script>`.
///
/// Each test file passes its own port range so parallel test binaries
/// never hand out the same port.
pub fn settings(state_dir: &Path, script: &str, ports: (u16, u16)) -> Settings {
    Settings {
        port_range_start: ports.0,
        port_range_end: ports.1,
        preview_command: vec!["sh".into(), "-c".into(), script.into()],
        readiness_marker: "Compiled successfully".into(),
        readiness_timeout_ms: 5_000,
        readiness_probe: ReadinessProbe::MarkerOnly,
        stop_grace_ms: 500,
        idle_sweep_ms: 200,
        shutdown_wait_ms: 5_000,
        state_dir: Some(state_dir.to_path_buf()),
        projects: HashMap::new(),
        ..Default::default()
    }
}

/// A preview command that reports its port, compiles, then idles.
pub const READY_SCRIPT: &str = "echo \"starting on $PORT\"; echo 'Compiled successfully!'; exec sleep 60";

/// A running daemon on a temporary socket.
pub struct Daemon {
    pub host: Host,
    pub socket: PathBuf,
    pub cancel: CancellationToken,
    pub dir: TempDir,
}

impl Daemon {
    pub async fn start(settings: Settings, dir: TempDir) -> Self {
        let host = Host::new(settings);
        let socket = dir.path().join("devdock.sock");
        let cancel = CancellationToken::new();

        let serve_host = host.clone();
        let serve_socket = socket.clone();
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            devdock::socket::serve(serve_host, &serve_socket, serve_cancel)
                .await
                .unwrap();
        });

        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(socket.exists(), "daemon socket should exist at {:?}", socket);

        Self {
            host,
            socket,
            cancel,
            dir,
        }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        self.host.shutdown().await;
    }
}

/// Create `name` under `root` as an empty project directory.
pub fn project_dir(root: &Path, name: &str) -> PathBuf {
    let path = root.join(name);
    std::fs::create_dir_all(&path).unwrap();
    path
}

/// Poll `check` every 20ms for up to 10s.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
