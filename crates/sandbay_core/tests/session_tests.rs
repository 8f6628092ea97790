//! Integration tests for session lifecycle and the command channel.

mod common;

use std::sync::Arc;

use common::{count, drain, Harness};
use parking_lot::Mutex;
use sandbay_core::{CommandRequest, FileRecord, SessionStorage, WORKSPACE_ROOT};
use sandbay_runner::{stop_pair, ContainerRuntime, LogHandler, LogLine, TERMINATED};

#[tokio::test]
async fn test_distinct_sessions_get_distinct_containers_and_cwds() {
    let h = Harness::new();

    let a = h.manager.open("t1", "demo", "u1").await.unwrap();
    let b = h.manager.open("t2", "demo", "u1").await.unwrap();
    assert_ne!(a.container, b.container);

    h.manager
        .execute(&CommandRequest::new("t1", "cd src"))
        .await
        .unwrap();

    assert_eq!(h.manager.session("t1").unwrap().cwd, "/workspace/src");
    assert_eq!(h.manager.session("t2").unwrap().cwd, WORKSPACE_ROOT);
}

#[tokio::test]
async fn test_cd_chain_tracks_logical_directory() {
    let h = Harness::new();
    let session = h.manager.open("t1", "demo", "u1").await.unwrap();
    h.runtime.clear_calls();

    let outcome = h
        .manager
        .execute(&CommandRequest::new("t1", "cd a && cd b && pwd"))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.cwd, "/workspace/a/b");
    assert_eq!(outcome.stdout.trim(), "/workspace/a/b");
    assert!(!outcome.stdout.contains("__SANDBAY_PWD__"));

    // Only `pwd` reached the container, rooted at the logical directory
    let execs = h.runtime.get_method_calls("exec");
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].workdir.as_deref(), Some("/workspace/a/b"));
    assert_eq!(execs[0].target, session.container);
}

#[tokio::test]
async fn test_cd_home_and_override() {
    let h = Harness::new();
    h.manager.open("t1", "demo", "u1").await.unwrap();

    let outcome = h
        .manager
        .execute(&CommandRequest::new("t1", "pwd").cwd("lib"))
        .await
        .unwrap();
    assert_eq!(outcome.cwd, "/workspace/lib");

    let outcome = h
        .manager
        .execute(&CommandRequest::new("t1", "cd"))
        .await
        .unwrap();
    assert_eq!(outcome.cwd, "/workspace");
}

#[tokio::test]
async fn test_failed_step_stops_chain() {
    let h = Harness::new();
    h.manager.open("t1", "demo", "u1").await.unwrap();
    h.runtime.clear_calls();

    let outcome = h
        .manager
        .execute(&CommandRequest::new("t1", "false && echo never"))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert!(!outcome.stdout.contains("never"));
    assert_eq!(h.runtime.get_method_calls("exec").len(), 1);
}

#[tokio::test]
async fn test_mkdir_then_cd_fires_file_tree_changed_once() {
    let h = Harness::new();
    h.store
        .insert_project("u1", "demo", vec![FileRecord::file("index.html", "<p>v1</p>")]);
    h.manager.open("t1", "demo", "u1").await.unwrap();
    let mut rx = h.manager.subscribe();

    let outcome = h
        .manager
        .execute(&CommandRequest::new("t1", "mkdir sub && cd sub && pwd"))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.cwd, "/workspace/sub");
    assert!(outcome.files_changed);

    let events = drain(&mut rx);
    assert_eq!(count(&events, "file_tree_changed"), 1);
    assert_eq!(count(&events, "command_completed"), 1);
}

#[tokio::test]
async fn test_read_only_command_does_not_sync() {
    let h = Harness::new();
    h.manager.open("t1", "demo", "u1").await.unwrap();
    let mut rx = h.manager.subscribe();

    let outcome = h
        .manager
        .execute(&CommandRequest::new("t1", "echo hello"))
        .await
        .unwrap();

    assert_eq!(outcome.stdout, "hello\n");
    assert!(!outcome.files_changed);
    assert_eq!(count(&drain(&mut rx), "file_tree_changed"), 0);
}

#[tokio::test]
async fn test_sync_back_writes_session_content_to_store() {
    let h = Harness::new();
    h.store
        .insert_project("u1", "demo", vec![FileRecord::file("index.html", "v1")]);
    let session = h.manager.open("t1", "demo", "u1").await.unwrap();

    // Simulate the command's effect on the bind-mounted directory
    let dir = session.storage.temp_dir().unwrap().to_path_buf();
    std::fs::write(dir.join("notes.txt"), "new").unwrap();

    h.manager
        .execute(&CommandRequest::new("t1", "touch notes.txt"))
        .await
        .unwrap();

    let paths: Vec<String> = h
        .store
        .files("u1", "demo")
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(paths, vec!["index.html", "notes.txt"]);
}

#[tokio::test]
async fn test_sync_back_keeps_files_it_does_not_capture() {
    let h = Harness::new();
    let video = "a".repeat(2 * 1024 * 1024);
    h.store.insert_project(
        "u1",
        "demo",
        vec![
            FileRecord::file("index.html", "v1"),
            FileRecord::file("assets/video.txt", video.clone()),
            FileRecord::file("node_modules/lib.js", "module.exports = 1"),
            FileRecord::file("deleted.css", "body{}"),
        ],
    );
    let session = h.manager.open("t1", "demo", "u1").await.unwrap();

    let dir = session.storage.temp_dir().unwrap().to_path_buf();
    std::fs::remove_file(dir.join("deleted.css")).unwrap();
    std::fs::write(dir.join("logo.png"), [0x89, b'P', b'N', b'G', 0xff, 0xfe]).unwrap();
    std::fs::create_dir(dir.join("sub")).unwrap();

    h.manager
        .execute(&CommandRequest::new("t1", "mkdir sub"))
        .await
        .unwrap();

    let files = h.store.files("u1", "demo");
    let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["assets", "assets/video.txt", "index.html", "node_modules/lib.js", "sub"]
    );
    assert_eq!(files[1].content.len(), video.len());
    assert_eq!(
        std::fs::read(dir.join("logo.png")).unwrap(),
        [0x89, b'P', b'N', b'G', 0xff, 0xfe]
    );
}

#[tokio::test]
async fn test_close_releases_everything() {
    let h = Harness::new();
    h.store
        .insert_project("u1", "demo", vec![FileRecord::file("index.html", "<h1>hi</h1>")]);
    let session = h.manager.open("t1", "demo", "u1").await.unwrap();
    let web = h.manager.start_web_server("t1").await.unwrap();
    let temp = session.storage.temp_dir().unwrap().to_path_buf();
    assert!(temp.exists());

    assert!(h.manager.close("t1").await.unwrap());

    assert!(h.runtime.container(session.container.as_deref().unwrap()).is_none());
    assert!(h.runtime.container(&web.container).is_none());
    assert!(!temp.exists());
    let status = h.manager.validate("t1").await.unwrap();
    assert!(!status.found);
    assert!(!h.manager.close("t1").await.unwrap());
}

#[tokio::test]
async fn test_dead_container_recovers_once() {
    let h = Harness::new();
    let session = h.manager.open("t1", "demo", "u1").await.unwrap();
    h.manager
        .execute(&CommandRequest::new("t1", "cd src"))
        .await
        .unwrap();
    let mut rx = h.manager.subscribe();

    h.runtime.kill(session.container.as_deref().unwrap());
    let status = h.manager.validate("t1").await.unwrap();
    assert!(status.found && !status.running);

    let outcome = h
        .manager
        .execute(&CommandRequest::new("t1", "pwd"))
        .await
        .unwrap();

    assert!(outcome.recovered);
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.cwd, "/workspace/src");

    let events = drain(&mut rx);
    assert_eq!(count(&events, "recovery_occurred"), 1);
    assert_eq!(count(&events, "container_restarted"), 1);

    let recovered = h.manager.session("t1").unwrap();
    assert!(h
        .runtime
        .is_running(recovered.container.as_deref().unwrap())
        .await
        .unwrap());

    // A healthy session does not recover again
    let outcome = h
        .manager
        .execute(&CommandRequest::new("t1", "pwd"))
        .await
        .unwrap();
    assert!(!outcome.recovered);
    assert_eq!(count(&drain(&mut rx), "recovery_occurred"), 0);
}

#[tokio::test]
async fn test_recovery_restarts_web_server() {
    let h = Harness::new();
    let session = h.manager.open("t1", "demo", "u1").await.unwrap();
    let web = h.manager.start_web_server("t1").await.unwrap();

    h.runtime.kill(session.container.as_deref().unwrap());
    h.manager
        .execute(&CommandRequest::new("t1", "pwd"))
        .await
        .unwrap();

    let recovered = h.manager.session("t1").unwrap();
    assert_eq!(recovered.web_port, Some(web.port));
    let prefix = format!("{}-web-", recovered.container.as_deref().unwrap());
    assert_eq!(h.running_with_prefix(&prefix).len(), 1);
}

#[tokio::test]
async fn test_streaming_hides_probe() {
    let h = Harness::new();
    h.manager.open("t1", "demo", "u1").await.unwrap();

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let handler: LogHandler = Arc::new(move |line: LogLine| sink.lock().push(line.message));

    let outcome = h
        .manager
        .execute_streaming(&CommandRequest::new("t1", "echo hi"), handler, None)
        .await
        .unwrap();

    assert_eq!(outcome.stdout, "hi\n");
    assert_eq!(*lines.lock(), vec!["hi".to_string()]);
}

#[tokio::test]
async fn test_streaming_keeps_logical_directory() {
    let h = Harness::new();
    h.manager.open("t1", "demo", "u1").await.unwrap();
    let handler: LogHandler = Arc::new(|_line: LogLine| {});

    let outcome = h
        .manager
        .execute_streaming(&CommandRequest::new("t1", "cd sub && pwd"), handler, None)
        .await
        .unwrap();

    assert_eq!(outcome.cwd, "/workspace/sub");
    assert_eq!(outcome.stdout.trim(), "/workspace/sub");
    assert_eq!(h.manager.session("t1").unwrap().cwd, "/workspace/sub");
}

#[tokio::test]
async fn test_stop_before_run_skips_exec() {
    let h = Harness::new();
    h.manager.open("t1", "demo", "u1").await.unwrap();
    h.runtime.clear_calls();

    let (handle, signal) = stop_pair();
    handle.stop();
    let handler: LogHandler = Arc::new(|_line: LogLine| {});

    let outcome = h
        .manager
        .execute_streaming(&CommandRequest::new("t1", "echo hi"), handler, Some(signal))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, TERMINATED);
    assert!(!h.runtime.was_called("exec_streaming"));
}

#[tokio::test]
async fn test_execute_unknown_session() {
    let h = Harness::new();
    let err = h
        .manager
        .execute(&CommandRequest::new("nope", "ls"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "session_not_found");
}

#[tokio::test]
async fn test_bulk_close_by_owner_and_project() {
    let h = Harness::new();
    h.manager.open("t1", "demo", "u1").await.unwrap();
    h.manager.open("t2", "other", "u1").await.unwrap();
    h.manager.open("t3", "demo", "u2").await.unwrap();

    assert_eq!(h.manager.list_sessions(Some("u1")).len(), 2);
    assert_eq!(h.manager.close_project("u1", "demo").await.unwrap(), 1);
    assert_eq!(h.manager.close_owner("u1").await.unwrap(), 1);

    let remaining = h.manager.list_sessions(None);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].session_id, "t3");
}

#[tokio::test]
async fn test_snapshot_restores_only_running_sessions() {
    let h = Harness::new();
    h.manager.open("t1", "demo", "u1").await.unwrap();
    let stale = h.manager.open("t2", "demo", "u1").await.unwrap();
    let stale_container = stale.container.clone().unwrap();
    h.runtime.stop_container(&stale_container).await.unwrap();

    let restarted = h.restart();
    assert_eq!(restarted.load_snapshot().await.unwrap(), 1);

    assert!(restarted.session("t1").is_some());
    assert!(restarted.session("t2").is_none());
    // Leftovers are not removed
    assert!(h.runtime.container(&stale_container).is_some());
}

#[tokio::test]
async fn test_snapshot_survives_corruption() {
    let h = Harness::new();
    let state = h.manager.config().snapshot_path();
    std::fs::create_dir_all(state.parent().unwrap()).unwrap();
    std::fs::write(&state, "{ truncated").unwrap();

    assert_eq!(h.restart().load_snapshot().await.unwrap(), 0);
}

#[tokio::test]
async fn test_default_path_is_not_removed_on_close() {
    let h = Harness::new();
    let session = h.manager.open("t1", "scratch", "u1").await.unwrap();
    let SessionStorage::HostPath { path } = &session.storage else {
        panic!("expected a host path, got {:?}", session.storage);
    };

    h.manager.close("t1").await.unwrap();
    assert!(path.join("index.html").exists());
}
