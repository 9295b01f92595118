//! End-to-end tests over the Unix socket: a real daemon, real clients.

mod common;

use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;

use devdock::broker::Source;
use devdock::client::Client;
use devdock::error::ErrorKind;
use devdock::preview::ServerStatus;
use devdock::protocol::{EventMsg, Frame, FrameType, Response};
use devdock::session::SessionRequest;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use common::{project_dir, settings, Daemon, READY_SCRIPT};

const PORTS: (u16, u16) = (46300, 46319);

async fn daemon(script: &str) -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path(), script, PORTS);
    settings
        .projects
        .insert("todo".into(), project_dir(dir.path(), "todo"));
    Daemon::start(settings, dir).await
}

/// Wait for the next event matching `pred`.
async fn wait_event<F: FnMut(&EventMsg) -> bool>(client: &mut Client, mut pred: F) -> EventMsg {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = client.next_event().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

#[tokio::test]
async fn start_server_resolves_configured_project_path() {
    let daemon = daemon(READY_SCRIPT).await;
    let mut client = Client::connect(&daemon.socket).await.unwrap();

    let info = client.start_server("todo", None).await.unwrap();
    assert!((PORTS.0..=PORTS.1).contains(&info.port));

    let status = client.server_status("todo").await.unwrap();
    assert_eq!(status.status, ServerStatus::Ready);
    assert_eq!(status.port, Some(info.port));
    assert_eq!(client.list_servers().await.unwrap().len(), 1);

    let stopped = client.stop_server("todo").await.unwrap();
    assert_eq!(stopped.status, ServerStatus::Stopped);

    // Server output was pushed as events, tagged with the project.
    let event = wait_event(&mut client, |e| matches!(e, EventMsg::Output { .. })).await;
    assert_eq!(event.source(), Some(&Source::server("todo")));

    daemon.stop().await;
}

#[tokio::test]
async fn unknown_project_and_bad_ids_are_reported() {
    let daemon = daemon(READY_SCRIPT).await;
    let mut client = Client::connect(&daemon.socket).await.unwrap();

    let err = client.start_server("nowhere", None).await.unwrap_err();
    assert_eq!(err.remote().unwrap().kind, ErrorKind::NotFound);

    let err = client
        .start_server("../escape", Some(daemon.dir.path().to_path_buf()))
        .await
        .unwrap_err();
    assert_eq!(err.remote().unwrap().kind, ErrorKind::InvalidRequest);

    daemon.stop().await;
}

#[tokio::test]
async fn failed_start_carries_output_in_error() {
    let daemon = daemon("echo 'npm ERR! missing script: start' >&2; exit 1").await;
    let mut client = Client::connect(&daemon.socket).await.unwrap();

    let err = client.start_server("todo", None).await.unwrap_err();
    let payload = err.remote().unwrap();
    assert_eq!(payload.kind, ErrorKind::Spawn);
    assert!(payload.message.contains("missing script: start"), "{}", payload.message);

    let status = client.server_status("todo").await.unwrap();
    assert_eq!(status.status, ServerStatus::Failed);

    let logs = client.server_logs("todo", 10).await.unwrap();
    assert!(logs.iter().any(|l| l.text.contains("missing script")));

    daemon.stop().await;
}

#[tokio::test]
async fn session_round_trip_with_reattach() {
    let daemon = daemon(READY_SCRIPT).await;
    let mut client = Client::connect(&daemon.socket).await.unwrap();

    let mut request = SessionRequest::new(daemon.dir.path());
    request.command = Some(vec![
        "/bin/sh".into(),
        "-c".into(),
        "while read l; do echo \"out:$l\"; done".into(),
    ]);
    let handle = client.start_session(request).await.unwrap();
    let id = handle.session_id;

    client.write_session(id, b"hello\n").await.unwrap();
    wait_event(&mut client, |e| match e {
        EventMsg::Output { source, data, .. } => {
            source == &Source::session(id) && String::from_utf8_lossy(data).contains("out:hello")
        }
        _ => false,
    })
    .await;

    // A second surface, as after navigating back to the terminal view.
    let mut ui = Client::connect(&daemon.socket).await.unwrap();
    let attached = ui.attach_session(id, 100, 30).await.unwrap();
    assert!(attached.snapshot.text().contains("out:hello"));
    assert!(attached.replay.contains("out:hello"));
    assert!(attached.through_seq >= 1);

    let sessions = ui.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].attached);
    assert_eq!((sessions[0].cols, sessions[0].rows), (100, 30));

    ui.detach_session(id).await.unwrap();
    assert!(!ui.list_sessions().await.unwrap()[0].attached);

    client.kill_session(id).await.unwrap();
    let exit = wait_event(&mut client, |e| matches!(e, EventMsg::Exit { .. })).await;
    assert_eq!(exit.source(), Some(&Source::session(id)));
    assert!(client.list_sessions().await.unwrap().is_empty());

    daemon.stop().await;
}

#[tokio::test]
async fn unknown_session_operations() {
    let daemon = daemon(READY_SCRIPT).await;
    let mut client = Client::connect(&daemon.socket).await.unwrap();

    // Fire-and-forget to an unknown id: no response, connection stays usable.
    client.write_session(999_999, b"x").await.unwrap();
    client.resize_session(999_999, 80, 24).await.unwrap();
    client.kill_session(999_999).await.unwrap();

    let err = client.attach_session(999_999, 80, 24).await.unwrap_err();
    assert_eq!(err.remote().unwrap().kind, ErrorKind::NotFound);
    let err = client.detach_session(999_999).await.unwrap_err();
    assert_eq!(err.remote().unwrap().kind, ErrorKind::NotFound);

    daemon.stop().await;
}

#[tokio::test]
async fn malformed_request_gets_invalid_request() {
    let daemon = daemon(READY_SCRIPT).await;
    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();

    let frame = Frame::json(FrameType::Request, &serde_json::json!({"id": 12, "op": "reboot"})).unwrap();
    frame.write_to(&mut stream).await.unwrap();

    let response = loop {
        let frame = Frame::read_from(&mut stream).await.unwrap();
        if frame.frame_type == FrameType::Response {
            break frame.parse_json::<Response>().unwrap();
        }
    };
    assert_eq!(response.id, 12);
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidRequest);

    daemon.stop().await;
}

#[tokio::test]
async fn second_daemon_on_same_socket_is_refused() {
    let daemon = daemon(READY_SCRIPT).await;

    let err = devdock::socket::serve(daemon.host.clone(), &daemon.socket, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), IoErrorKind::AddrInUse);

    daemon.stop().await;
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("devdock.sock");
    // Bound, then dropped: the file remains with nobody listening.
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let settings = settings(dir.path(), READY_SCRIPT, PORTS);
    let daemon = Daemon::start(settings, dir).await;
    let mut connected = false;
    for _ in 0..100 {
        if let Ok(mut client) = Client::connect(&daemon.socket).await {
            connected = client.list_servers().await.is_ok();
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(connected);
    daemon.stop().await;
}
