//! Session hub: connect, shell, exec and lifecycle

mod common;

use bytes::Bytes;
use std::path::Path;
use std::time::Duration;

use common::{hub, wait_for, FakeConnector, FakeFsFactory, HostScript};
use tl_core::error::{CoreError, TransportError};
use tl_core::types::{ConnectionParams, SessionState};
use tl_protocol::{ChannelId, CoreEvent, SessionEvent, SessionId, ShellEvent, TerminalSize};
use tl_session::SessionHub;

fn no_fs() -> FakeFsFactory {
    FakeFsFactory::new(Path::new("/nonexistent"))
}

fn web_hub() -> (SessionHub, std::sync::Arc<FakeConnector>) {
    hub(
        FakeConnector::new().with_host("web", HostScript::password("pw")),
        no_fs(),
    )
}

async fn next_data(rx: &mut tokio::sync::mpsc::Receiver<ShellEvent>) -> ShellEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for shell output")
        .expect("channel consumer dropped")
}

#[tokio::test]
async fn test_password_connect_and_shell_echo() {
    let (hub, _) = web_hub();
    let id = SessionId::new("s1");

    hub.connect(id.clone(), ConnectionParams::password("web", 22, "alice", "pw"))
        .await
        .unwrap();

    let shell = hub.shell(&id, None).await.unwrap();
    let mut rx = hub.subscribe(&shell).unwrap();
    hub.write(&shell, Bytes::from("echo hi\n")).await.unwrap();

    match next_data(&mut rx).await {
        ShellEvent::Data { channel_id, data } => {
            assert_eq!(channel_id, shell);
            assert_eq!(&data[..], b"echo hi\n");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let sessions = hub.list_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Ready);
    assert_eq!(sessions[0].target, "alice@web:22");
    assert_eq!(sessions[0].channels[0].channel_id, shell);
}

#[tokio::test]
async fn test_shell_is_reused_and_resized() {
    let (hub, connector) = web_hub();
    let id = SessionId::new("s1");
    hub.connect(id.clone(), ConnectionParams::password("web", 22, "alice", "pw"))
        .await
        .unwrap();

    let first = hub.shell(&id, Some(TerminalSize::new(120, 40))).await.unwrap();
    let second = hub.shell(&id, None).await.unwrap();
    assert_eq!(first, second);

    hub.resize(&first, TerminalSize::new(100, 30)).await.unwrap();
    assert_eq!(
        connector.links_to("web")[0].resizes(),
        vec![TerminalSize::new(100, 30)]
    );
}

#[tokio::test]
async fn test_concurrent_shell_requests_share_one_channel() {
    let (hub, connector) = web_hub();
    let id = SessionId::new("s1");
    hub.connect(id.clone(), ConnectionParams::password("web", 22, "alice", "pw"))
        .await
        .unwrap();

    let (first, second) = tokio::join!(hub.shell(&id, None), hub.shell(&id, None));
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(connector.links_to("web")[0].shells_opened(), 1);
    assert_eq!(hub.list_sessions()[0].channels.len(), 1);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let (hub, _) = web_hub();
    let id = SessionId::new("s1");

    let err = hub
        .connect(id.clone(), ConnectionParams::password("web", 22, "alice", "nope"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "AuthRejected");
    assert!(hub.list_sessions().is_empty());
}

#[tokio::test]
async fn test_unreachable_host() {
    let (hub, _) = hub(FakeConnector::new(), no_fs());
    let err = hub
        .connect(SessionId::new("s1"), ConnectionParams::password("gone", 22, "a", "b"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Transport(TransportError::NetworkUnreachable(_))
    ));
}

#[tokio::test]
async fn test_connect_twice_same_params_is_noop() {
    let (hub, connector) = web_hub();
    let id = SessionId::new("s1");
    let params = ConnectionParams::password("web", 22, "alice", "pw");

    hub.connect(id.clone(), params.clone()).await.unwrap();
    hub.connect(id.clone(), params).await.unwrap();
    assert_eq!(connector.links().len(), 1);

    let err = hub
        .connect(id, ConnectionParams::password("web", 2222, "alice", "pw"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SessionExists");
}

#[tokio::test]
async fn test_exec_collects_output_and_exit_code() {
    let (hub, _) = web_hub();
    let id = SessionId::new("s1");
    hub.connect(id.clone(), ConnectionParams::password("web", 22, "alice", "pw"))
        .await
        .unwrap();

    let ok = hub.exec(&id, "uname -a").await.unwrap();
    assert_eq!(ok.stdout, "uname -a\n");
    assert_eq!(ok.exit_code, Some(0));

    let failed = hub.exec(&id, "fail now").await.unwrap();
    assert_eq!(failed.stderr, "boom\n");
    assert_eq!(failed.exit_code, Some(1));
}

#[tokio::test]
async fn test_disconnect_closes_channels() {
    let (hub, connector) = web_hub();
    let id = SessionId::new("s1");
    hub.connect(id.clone(), ConnectionParams::password("web", 22, "alice", "pw"))
        .await
        .unwrap();
    let shell = hub.shell(&id, None).await.unwrap();

    hub.disconnect(&id).await;
    hub.disconnect(&id).await;

    assert!(connector.links_to("web")[0].is_closed());
    let err = hub.write(&shell, Bytes::from("ls\n")).await.unwrap_err();
    assert_eq!(err.code(), "ChannelClosed");
    assert!(hub.list_sessions().is_empty());

    // Never handed out.
    let err = hub
        .write(&ChannelId::new(SessionId::new("other"), 1), Bytes::from("x"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ChannelNotFound");
}

#[tokio::test]
async fn test_close_channel_keeps_siblings() {
    let (hub, _) = web_hub();
    let id = SessionId::new("s1");
    hub.connect(id.clone(), ConnectionParams::password("web", 22, "alice", "pw"))
        .await
        .unwrap();
    let shell = hub.shell(&id, None).await.unwrap();
    let mut rx = hub.subscribe(&shell).unwrap();

    hub.close_channel(&shell).unwrap();
    hub.close_channel(&shell).unwrap();
    assert!(matches!(
        next_data(&mut rx).await,
        ShellEvent::Close { exit_code: None, .. }
    ));

    // The session is still usable.
    let output = hub.exec(&id, "true").await.unwrap();
    assert_eq!(output.exit_code, Some(0));
    let reopened = hub.shell(&id, None).await.unwrap();
    assert!(reopened.local > shell.local);
}

#[tokio::test]
async fn test_lost_transport_closes_channels() {
    let (hub, connector) = web_hub();
    let mut events = hub.events();
    let id = SessionId::new("s1");
    hub.connect(id.clone(), ConnectionParams::password("web", 22, "alice", "pw"))
        .await
        .unwrap();
    let shell = hub.shell(&id, None).await.unwrap();
    let mut rx = hub.subscribe(&shell).unwrap();

    connector.links_to("web")[0].sever();

    assert!(matches!(
        next_data(&mut rx).await,
        ShellEvent::Close { exit_code: None, .. }
    ));
    wait_for(&mut events, Duration::from_secs(5), |e| {
        matches!(
            e,
            CoreEvent::Session(SessionEvent::State {
                state: SessionState::Failed,
                ..
            })
        )
    })
    .await;

    let err = hub.write(&shell, Bytes::from("ls\n")).await.unwrap_err();
    assert_eq!(err.code(), "ChannelClosed");
    assert_eq!(hub.list_sessions()[0].state, SessionState::Failed);
}

#[tokio::test]
async fn test_reconnect_after_loss() {
    let (hub, connector) = web_hub();
    let id = SessionId::new("s1");
    hub.connect(id.clone(), ConnectionParams::password("web", 22, "alice", "pw"))
        .await
        .unwrap();
    let old_shell = hub.shell(&id, None).await.unwrap();
    connector.links_to("web")[0].sever();

    hub.reconnect(&id).await.unwrap();

    assert_eq!(connector.links_to("web").len(), 2);
    assert_eq!(hub.list_sessions()[0].state, SessionState::Ready);
    let new_shell = hub.shell(&id, None).await.unwrap();
    assert_ne!(new_shell, old_shell);

    let err = hub.write(&old_shell, Bytes::from("ls\n")).await.unwrap_err();
    assert_eq!(err.code(), "ChannelClosed");
}

#[tokio::test]
async fn test_reconnect_stops_on_rejected_credentials() {
    let (hub, connector) = web_hub();
    let id = SessionId::new("s1");
    hub.connect(id.clone(), ConnectionParams::password("web", 22, "alice", "pw"))
        .await
        .unwrap();

    connector.set_host("web", HostScript::password("rotated"));
    connector.links_to("web")[0].sever();

    let err = hub.reconnect(&id).await.unwrap_err();
    assert_eq!(err.code(), "AuthRejected");
    // Rejected credentials end the retries at once.
    assert_eq!(connector.links_to("web").len(), 2);
}

#[tokio::test]
async fn test_failed_connect_leaves_nothing_to_reconnect() {
    let (hub, connector) = web_hub();
    let id = SessionId::new("s1");
    let err = hub
        .connect(id.clone(), ConnectionParams::password("web", 22, "alice", "bad"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AuthRejected");

    let err = hub.reconnect(&id).await.unwrap_err();
    assert_eq!(err.code(), "SessionNotFound");
    assert_eq!(connector.links().len(), 1);
}

#[tokio::test]
async fn test_remote_only_operations_on_unknown_session() {
    let (hub, _) = web_hub();
    let id = SessionId::new("missing");
    assert_eq!(hub.shell(&id, None).await.unwrap_err().code(), "SessionNotFound");
    assert_eq!(hub.exec(&id, "ls").await.unwrap_err().code(), "SessionNotFound");
    assert!(!hub.sftp_available(&id).await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_shell_session() {
    let (hub, _) = web_hub();
    let params = tl_core::types::LocalShellParams {
        shell: Some("/bin/sh".to_string()),
        ..Default::default()
    };

    let (id, shell) = hub.connect_local(None, params).await.unwrap();
    let mut rx = hub.subscribe(&shell).unwrap();
    hub.write(&shell, Bytes::from("echo hub-$((40+2))\nexit\n"))
        .await
        .unwrap();

    let mut output = Vec::new();
    loop {
        match next_data(&mut rx).await {
            ShellEvent::Data { data, .. } => output.extend_from_slice(&data),
            ShellEvent::Stderr { .. } => {}
            ShellEvent::Close { .. } => break,
        }
    }
    assert!(String::from_utf8_lossy(&output).contains("hub-42"));
    assert_eq!(
        hub.exec(&id, "ls").await.unwrap_err().code(),
        "WrongSessionKind"
    );
}
