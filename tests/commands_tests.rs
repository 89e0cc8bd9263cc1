use futures::StreamExt;
use sfb_app::commands;
use sfb_app::*;
use std::sync::Arc;
use std::time::Duration;

fn demo_remote() -> MemoryRemote {
    MemoryRemote::new()
        .with_host("h")
        .with_user("u", "p")
        .with_home("/home/u")
        .with_dir("/home/u/docs")
        .with_file("/home/u/a.txt", vec![b'x'; 1024])
}

fn state(remote: &MemoryRemote) -> AppState {
    let config = CoreConfig {
        chunk_size: 128,
        ..CoreConfig::default()
    };
    build_state_with(config, Arc::new(remote.clone()))
}

fn credentials() -> ConnectionConfig {
    serde_json::from_value(serde_json::json!({
        "host": "h",
        "username": "u",
        "password": "p"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_connect_list_download_via_commands() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(&demo_remote());

    let info = commands::connect(&state, credentials()).await.unwrap();
    assert_eq!(info.state, SessionState::Connected);
    assert_eq!(info.remote_home.as_deref(), Some("/home/u"));

    let entries = commands::list_files(&state, String::new()).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["docs", "a.txt"]);

    let local = dir.path().join("a.txt");
    let token = commands::download_file(
        &state,
        "/home/u/a.txt".into(),
        local.to_string_lossy().to_string(),
    )
    .await;

    let events: Vec<ProgressEvent> = tokio::time::timeout(
        Duration::from_secs(5),
        commands::transfer_events(&state, token).collect(),
    )
    .await
    .unwrap();
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(std::fs::read(&local).unwrap().len(), 1024);

    let status = commands::transfer_status(&state, token).await.unwrap();
    assert_eq!(status.state, TransferState::Completed);

    commands::disconnect(&state).await;
    commands::disconnect(&state).await;
    assert!(commands::session_info(&state).await.is_none());
}

#[tokio::test]
async fn test_errors_serialise_with_kind() {
    let state = state(&demo_remote());

    let err = commands::list_files(&state, "/".into()).await.unwrap_err();
    let json = serde_json::to_value(&err).unwrap();
    assert_eq!(json["kind"], "session");
    assert_eq!(json["message"]["kind"], "notConnected");

    let mut bad = credentials();
    bad.password = None;
    let err = commands::connect(&state, bad).await.unwrap_err();
    let json = serde_json::to_value(&err).unwrap();
    assert_eq!(json["kind"], "invalidConfig");

    commands::connect(&state, credentials()).await.unwrap();
    let err = commands::list_files(&state, "/nope".into()).await.unwrap_err();
    let json = serde_json::to_value(&err).unwrap();
    assert_eq!(json["kind"], "pathNotFound");
}

#[tokio::test]
async fn test_cancel_download_command() {
    let dir = tempfile::tempdir().unwrap();
    let remote = demo_remote().with_chunk_delay(Duration::from_millis(10));
    let state = state(&remote);
    commands::connect(&state, credentials()).await.unwrap();

    let token = commands::download_file(
        &state,
        "/home/u/a.txt".into(),
        dir.path().join("a.txt").to_string_lossy().to_string(),
    )
    .await;
    commands::cancel_download(&state, token).await.unwrap();

    let mut sub = commands::subscribe_token(&state, token);
    assert_eq!(sub.wait_terminal(token).await, Some(TransferOutcome::Cancelled));
    assert!(matches!(
        commands::cancel_download(&state, token).await,
        Err(CancelError::AlreadyTerminal(_))
    ));

    assert_eq!(commands::list_transfers(&state).await.len(), 1);
    assert_eq!(commands::clear_finished_transfers(&state).await, 1);
    assert!(matches!(
        commands::cancel_download(&state, token).await,
        Err(CancelError::UnknownToken(_))
    ));
}

#[tokio::test]
async fn test_upload_command_and_global_stream() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("notes.txt");
    std::fs::write(&local, b"remember the milk").unwrap();
    let remote = demo_remote();
    let state = state(&remote);
    commands::connect(&state, credentials()).await.unwrap();

    let mut events = Box::pin(commands::progress_events(&state));
    let token = commands::upload_file(
        &state,
        local.to_string_lossy().to_string(),
        "/home/u/docs/notes.txt".into(),
    )
    .await;

    loop {
        let ev = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        if let ProgressEvent::Terminal { token: t, outcome } = ev {
            assert_eq!(t, token);
            assert_eq!(
                outcome,
                TransferOutcome::Completed {
                    bytes_transferred: 17
                }
            );
            break;
        }
    }
    assert_eq!(
        remote.file("/home/u/docs/notes.txt").unwrap(),
        b"remember the milk"
    );
}

#[tokio::test]
async fn test_shutdown_ends_progress_stream() {
    let state = state(&demo_remote());
    commands::connect(&state, credentials()).await.unwrap();
    let events = commands::progress_events(&state);

    commands::shutdown(&state).await;
    let drained: Vec<ProgressEvent> =
        tokio::time::timeout(Duration::from_secs(2), events.collect())
            .await
            .unwrap();
    assert!(drained.is_empty());
    assert!(commands::session_info(&state).await.is_none());
}

#[test]
fn test_load_config_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("config.json");
    assert_eq!(load_config(Some(missing.as_path())), CoreConfig::default());

    let present = dir.path().join("present.json");
    std::fs::write(&present, r#"{"chunkSize": 2048, "multiplexing": "off"}"#).unwrap();
    let cfg = load_config(Some(present.as_path()));
    assert_eq!(cfg.chunk_size, 2048);
    assert_eq!(cfg.multiplexing, sfb_core::config::MultiplexingPolicy::Off);
}
