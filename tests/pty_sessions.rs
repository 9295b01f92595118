//! Terminal sessions: context injection, detach and reattach, geometry.

mod common;

use std::time::Duration;

use bytes::Bytes;
use devdock::attach::{AttachEvent, Attachment};
use devdock::broker::{ProcessEvent, Source, SubscriptionEvent, Topic};
use devdock::context::ContextSnapshot;
use devdock::dispatch::Host;
use devdock::session::SessionRequest;

use common::{eventually, settings};

fn host(dir: &std::path::Path) -> Host {
    Host::new(settings(dir, "true", (46200, 46209)))
}

fn sh(working_directory: &std::path::Path, script: &str) -> SessionRequest {
    let mut request = SessionRequest::new(working_directory);
    request.command = Some(vec!["/bin/sh".into(), "-c".into(), script.into()]);
    request
}

/// Collect attachment output until `needle` shows up.
async fn read_until(attachment: &mut Attachment, needle: &str) -> String {
    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !seen.contains(needle) {
        match tokio::time::timeout_at(deadline, attachment.next()).await {
            Ok(Some(AttachEvent::Output { data, .. })) => seen.push_str(&String::from_utf8_lossy(&data)),
            Ok(Some(AttachEvent::Resync(snapshot))) => seen = snapshot.text(),
            Ok(Some(AttachEvent::Exit { .. })) | Ok(None) | Err(_) => break,
        }
    }
    seen
}

#[tokio::test]
async fn session_id_is_pid_and_cwd_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let host = host(dir.path());
    let cwd = dir.path().canonicalize().unwrap();

    let mut events = host.registry.events.subscribe(Topic::All);
    let handle = host.sessions.start(sh(&cwd, "pwd; echo \"pid=$$\"")).await.unwrap();

    let mut output = String::new();
    let exit_code = loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await.unwrap() {
            Some(SubscriptionEvent::Event(ProcessEvent::Output { source, data, .. })) => {
                assert_eq!(source, Source::session(handle.session_id));
                output.push_str(&String::from_utf8_lossy(&data));
            }
            Some(SubscriptionEvent::Event(ProcessEvent::Exit { exit_code, .. })) => break exit_code,
            Some(SubscriptionEvent::Lagged(n)) => panic!("lost {n} events"),
            None => panic!("broker closed"),
        }
    };
    assert_eq!(exit_code, Some(0));
    assert!(output.contains(&cwd.display().to_string()), "{output}");
    assert!(output.contains(&format!("pid={}", handle.pid)), "{output}");
}

#[tokio::test]
async fn output_is_streamed_while_nobody_is_attached() {
    let dir = tempfile::tempdir().unwrap();
    let host = host(dir.path());

    let mut events = host.registry.events.subscribe(Topic::All);
    let handle = host
        .sessions
        .start(sh(dir.path(), "while read l; do echo \"got $l\"; done"))
        .await
        .unwrap();
    assert!(!host.sessions.get(handle.session_id).unwrap().attached);

    host.sessions.write(handle.session_id, Bytes::from("one\n")).await;
    let mut output = String::new();
    let mut last_seq = 0;
    while !output.contains("got one") {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await.unwrap() {
            Some(SubscriptionEvent::Event(ProcessEvent::Output { seq, data, .. })) => {
                assert_eq!(seq, last_seq + 1, "sequence numbers have no gaps");
                last_seq = seq;
                output.push_str(&String::from_utf8_lossy(&data));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    host.sessions.kill(handle.session_id).await.unwrap();
}

#[tokio::test]
async fn detach_and_reattach_keeps_history_and_process() {
    let dir = tempfile::tempdir().unwrap();
    let host = host(dir.path());

    let handle = host
        .sessions
        .start(sh(dir.path(), "echo first-line; while read l; do echo \"echo:$l\"; done"))
        .await
        .unwrap();
    let id = handle.session_id;

    let mut first = host.attachments.attach(id, 80, 24).await.unwrap();
    let seen = if first.snapshot().text().contains("first-line") {
        String::from("first-line")
    } else {
        read_until(&mut first, "first-line").await
    };
    assert!(seen.contains("first-line"));

    host.sessions.write(id, Bytes::from("while-attached\n")).await;
    read_until(&mut first, "echo:while-attached").await;

    host.attachments.detach(id).unwrap();
    assert!(first.next().await.is_none());
    drop(first);

    // Output produced while detached lands in the scrollback.
    host.sessions.write(id, Bytes::from("while-detached\n")).await;
    let screen_has = |needle: &'static str| {
        let host = host.clone();
        async move {
            let attachment = host.attachments.attach(id, 80, 24).await.unwrap();
            attachment.snapshot().text().contains(needle)
        }
    };
    let mut found = false;
    for _ in 0..200 {
        if screen_has("echo:while-detached").await {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(found);

    let second = host.attachments.attach(id, 80, 24).await.unwrap();
    let text = second.snapshot().text();
    let first_at = text.find("first-line").unwrap();
    let attached_at = text.find("echo:while-attached").unwrap();
    let detached_at = text.find("echo:while-detached").unwrap();
    assert!(first_at < attached_at && attached_at < detached_at, "{text}");
    assert_eq!(host.sessions.get(id).unwrap().pid, handle.pid);

    host.sessions.kill(id).await.unwrap();
}

#[tokio::test]
async fn reattach_resizes_the_live_process() {
    let dir = tempfile::tempdir().unwrap();
    let host = host(dir.path());

    let handle = host
        .sessions
        .start(sh(dir.path(), "while read l; do stty size; done"))
        .await
        .unwrap();
    let id = handle.session_id;

    let mut attachment = host.attachments.attach(id, 100, 30).await.unwrap();
    host.sessions.write(id, Bytes::from("\n")).await;
    let seen = read_until(&mut attachment, "30 100").await;
    assert!(seen.contains("30 100"), "{seen}");

    host.attachments.detach(id).unwrap();
    drop(attachment);

    let mut attachment = host.attachments.attach(id, 120, 40).await.unwrap();
    assert_eq!((attachment.snapshot().cols, attachment.snapshot().rows), (120, 40));
    host.sessions.write(id, Bytes::from("\n")).await;
    let seen = read_until(&mut attachment, "40 120").await;
    assert!(seen.contains("40 120"), "{seen}");
    assert_eq!(host.sessions.get(id).unwrap().pid, handle.pid);

    host.sessions.kill(id).await.unwrap();
}

#[tokio::test]
async fn context_file_tracks_updates() {
    let dir = tempfile::tempdir().unwrap();
    let host = host(dir.path());

    let mut request = sh(
        dir.path(),
        "while read l; do . \"$DEVDOCK_SESSION_CONTEXT_FILE\"; echo \"file=$DEVDOCK_CURRENT_FILE\"; done",
    );
    request.context = Some(ContextSnapshot {
        project_id: Some("todo".into()),
        current_file: Some("src/App.tsx".into()),
        ..Default::default()
    });
    let id = host.sessions.start(request).await.unwrap().session_id;
    let mut attachment = host.attachments.attach(id, 80, 24).await.unwrap();

    host.sessions.write(id, Bytes::from("\n")).await;
    read_until(&mut attachment, "file=src/App.tsx").await;

    host.sessions
        .update_context(
            id,
            ContextSnapshot {
                project_id: Some("todo".into()),
                current_file: Some("src/index.tsx".into()),
                ..Default::default()
            },
        )
        .unwrap();
    host.sessions.write(id, Bytes::from("\n")).await;
    let seen = read_until(&mut attachment, "file=src/index.tsx").await;
    assert!(seen.contains("file=src/index.tsx"), "{seen}");

    host.sessions.kill(id).await.unwrap();
    assert!(eventually(|| host.sessions.list().is_empty()).await);
}

#[tokio::test]
async fn exiting_process_removes_session_once() {
    let dir = tempfile::tempdir().unwrap();
    let host = host(dir.path());

    let mut events = host.registry.events.subscribe(Topic::All);
    let id = host.sessions.start(sh(dir.path(), "exit 4")).await.unwrap().session_id;

    let mut exits = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if let SubscriptionEvent::Event(ProcessEvent::Exit { exit_code, .. }) = event {
            exits.push(exit_code);
        }
    }
    assert_eq!(exits, vec![Some(4)]);
    assert!(host.sessions.get(id).is_none());
    assert!(host.sessions.kill(id).await.is_ok());
    assert!(host.attachments.attach(id, 80, 24).await.is_err());
}
