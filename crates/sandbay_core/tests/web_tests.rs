//! Integration tests for per-session web servers and file sync.

mod common;

use common::{count, drain, Harness};
use sandbay_core::{FileKind, FileRecord, SiteKind, WebPortPolicy};
use tokio::net::TcpListener;

fn web_prefix(h: &Harness, session_id: &str) -> String {
    let session = h.manager.session(session_id).unwrap();
    format!("{}-web-", session.container.unwrap())
}

#[tokio::test]
async fn test_reprovisioning_keeps_one_web_container() {
    let h = Harness::new();
    h.store
        .insert_project("u1", "site", vec![FileRecord::file("index.html", "<h1>v1</h1>")]);
    h.manager.open("t1", "site", "u1").await.unwrap();
    let mut rx = h.manager.subscribe();

    let first = h.manager.start_web_server("t1").await.unwrap();
    let second = h.manager.start_web_server("t1").await.unwrap();

    assert_ne!(first.container, second.container);
    assert_eq!(first.port, second.port);
    assert_eq!(h.running_with_prefix(&web_prefix(&h, "t1")), vec![second.container.clone()]);
    assert_eq!(second.url, format!("http://localhost:{}/", second.port));
    assert_eq!(count(&drain(&mut rx), "web_server_ready"), 2);

    let session = h.manager.session("t1").unwrap();
    assert_eq!(session.web_container, Some(second.container));
}

#[tokio::test]
async fn test_single_page_config_is_mounted() {
    let h = Harness::new();
    h.store
        .insert_project("u1", "site", vec![FileRecord::file("index.html", "<h1>hi</h1>")]);
    h.manager.open("t1", "site", "u1").await.unwrap();

    let info = h.manager.start_web_server("t1").await.unwrap();
    assert_eq!(
        info.site,
        SiteKind::SinglePage {
            index: "index.html".into()
        }
    );

    let config_path = h
        .manager
        .config()
        .web_config_dir()
        .join(format!("{}.conf", info.container));
    let config = std::fs::read_to_string(&config_path).unwrap();
    assert!(config.contains("try_files $uri $uri/ /index.html;"));
    assert!(config.contains("no-store"));

    let web = h.runtime.container(&info.container).unwrap();
    assert_eq!(web.spec.ports[0].container, 80);
    assert!(web.spec.mounts.iter().all(|m| m.read_only));
}

#[tokio::test]
async fn test_node_project_is_served_as_source() {
    let h = Harness::new();
    h.store.insert_project(
        "u1",
        "api",
        vec![
            FileRecord::file("package.json", "{}"),
            FileRecord::file("server.js", "console.log(1)"),
        ],
    );
    h.manager.open("t1", "api", "u1").await.unwrap();

    let info = h.manager.start_web_server("t1").await.unwrap();
    assert_eq!(
        info.site,
        SiteKind::NodeSource {
            entry: "server.js".into()
        }
    );
}

#[tokio::test]
async fn test_stop_web_server() {
    let h = Harness::new();
    h.manager.open("t1", "site", "u1").await.unwrap();
    let info = h.manager.start_web_server("t1").await.unwrap();

    assert!(h.manager.stop_web_server("t1").await.unwrap());
    assert!(h.runtime.container(&info.container).is_none());
    assert!(h.manager.session("t1").unwrap().web_container.is_none());
}

#[tokio::test]
async fn test_file_change_reaches_session_and_web() {
    let h = Harness::new();
    h.store
        .insert_project("u1", "site", vec![FileRecord::file("index.html", "<h1>v1</h1>")]);
    let session = h.manager.open("t1", "site", "u1").await.unwrap();
    let before = h.manager.start_web_server("t1").await.unwrap();

    h.store
        .set_file("u1", "site", FileRecord::file("index.html", "<h1>v2</h1>"));
    let report = h
        .manager
        .notify_file_changed("site", "index.html")
        .await
        .unwrap();

    assert_eq!(report.sessions_updated, vec!["t1"]);
    assert!(report.mismatches.is_empty());
    assert_eq!(report.web_recreated, vec!["t1"]);

    let dir = session.storage.temp_dir().unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.join("index.html")).unwrap(),
        "<h1>v2</h1>"
    );
    let running = h.running_with_prefix(&web_prefix(&h, "t1"));
    assert_eq!(running.len(), 1);
    assert_ne!(running[0], before.container);
}

#[tokio::test]
async fn test_size_mismatch_is_reported_and_content_kept() {
    let h = Harness::new();
    h.store
        .insert_project("u1", "site", vec![FileRecord::file("index.html", "v1")]);
    let session = h.manager.open("t1", "site", "u1").await.unwrap();

    h.store.set_file(
        "u1",
        "site",
        FileRecord {
            path: "index.html".into(),
            kind: FileKind::File,
            content: "abc".into(),
            size: 99,
        },
    );
    let report = h
        .manager
        .notify_file_changed("site", "index.html")
        .await
        .unwrap();

    assert_eq!(report.sessions_updated, vec!["t1"]);
    assert_eq!(report.mismatches, vec!["t1"]);
    let dir = session.storage.temp_dir().unwrap();
    assert_eq!(std::fs::read_to_string(dir.join("index.html")).unwrap(), "abc");
}

#[tokio::test]
async fn test_deleted_record_is_removed_from_session() {
    let h = Harness::new();
    h.store.insert_project(
        "u1",
        "site",
        vec![
            FileRecord::file("index.html", "<h1>v1</h1>"),
            FileRecord::file("old.css", "body{}"),
        ],
    );
    let session = h.manager.open("t1", "site", "u1").await.unwrap();
    h.store
        .insert_project("u1", "site", vec![FileRecord::file("index.html", "<h1>v1</h1>")]);

    let report = h
        .manager
        .notify_file_changed("site", "old.css")
        .await
        .unwrap();

    assert_eq!(report.sessions_updated, vec!["t1"]);
    assert!(report.web_recreated.is_empty());
    assert!(!session.storage.temp_dir().unwrap().join("old.css").exists());
}

#[tokio::test]
async fn test_overlapping_notifications_leave_one_web_container() {
    let h = Harness::new();
    h.store
        .insert_project("u1", "site", vec![FileRecord::file("index.html", "v1")]);
    let session = h.manager.open("t1", "site", "u1").await.unwrap();
    h.manager.start_web_server("t1").await.unwrap();

    h.store.set_file("u1", "site", FileRecord::file("index.html", "v3"));
    let (a, b) = tokio::join!(
        h.manager.notify_file_changed("site", "index.html"),
        h.manager.notify_file_changed("site", "index.html"),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(h.running_with_prefix(&web_prefix(&h, "t1")).len(), 1);
    let dir = session.storage.temp_dir().unwrap();
    assert_eq!(std::fs::read_to_string(dir.join("index.html")).unwrap(), "v3");
}

#[tokio::test]
async fn test_fixed_port_conflict_is_reported() {
    let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let h = Harness::with_config(|c| c.web_port = WebPortPolicy::Fixed { port });
    h.manager.open("t1", "site", "u1").await.unwrap();

    let err = h.manager.start_web_server("t1").await.unwrap_err();

    assert!(err.is_port_conflict());
    assert!(h.running_with_prefix(&web_prefix(&h, "t1")).is_empty());
    assert!(h.manager.session("t1").unwrap().web_container.is_none());
    drop(listener);
}

#[tokio::test]
async fn test_web_server_requires_session() {
    let h = Harness::new();
    let err = h.manager.start_web_server("ghost").await.unwrap_err();
    assert_eq!(err.kind(), "session_not_found");
}
