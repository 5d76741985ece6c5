use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use codebox::{http_server, AppState, Config};
use serde_json::{json, Value};
use std::process::Stdio;
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

const KEY: &str = "test-secret";
const BOUNDARY: &str = "codebox-test-boundary";

struct Harness {
    _tmp: TempDir,
    root: std::path::PathBuf,
    app: Router,
}

fn harness_with(max_file_size: u64, timeout_ms: u64) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = Config {
        api_key: KEY.into(),
        max_file_size,
        timeout_ms,
        ..Config::rooted_at(tmp.path())
    };
    let app = http_server::router(AppState::new(config));
    Harness {
        root: tmp.path().to_path_buf(),
        _tmp: tmp,
        app,
    }
}

fn harness() -> Harness {
    harness_with(1024 * 1024, 10_000)
}

async fn python_available() -> bool {
    tokio::process::Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), 16 * 1024 * 1024).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, req).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn exec_request(key: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/exec")
        .header("content-type", "application/json")
        .header("x-api-key", key)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", KEY)
        .body(Body::empty())
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header("x-api-key", KEY)
        .body(Body::empty())
        .unwrap()
}

fn upload_request(entity_id: Option<&str>, files: &[(&str, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    if let Some(id) = entity_id {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"entity_id\"\r\n\r\n{id}\r\n"
            )
            .as_bytes(),
        );
    }
    for (name, data) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: text/plain\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header("x-api-key", KEY)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn health_needs_no_key() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn wrong_key_is_rejected_without_side_effects() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        exec_request(
            "wrong",
            json!({"code": "open('x','w')", "lang": "py", "entity_id": "s1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid API key");
    assert!(!h.root.join("sessions/s1").exists());

    for near_miss in ["test-secre", "test-secret ", "TEST-SECRET"] {
        let (status, _) = send(
            &h.app,
            exec_request(near_miss, json!({"code": "1", "lang": "py"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{near_miss:?} accepted");
    }

    let missing = Request::builder()
        .uri("/files/s1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.app, missing).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_fields_and_unknown_language_are_bad_requests() {
    let h = harness();
    let (status, _) = send_json(&h.app, exec_request(KEY, json!({"lang": "py"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send_json(
        &h.app,
        exec_request(KEY, json!({"code": "x", "lang": "cobol", "entity_id": "s1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("cobol"));
    assert!(!h.root.join("sessions/s1").exists());

    let (status, _) = send_json(
        &h.app,
        exec_request(KEY, json!({"code": "x", "lang": "py", "entity_id": "../up"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn hello_world_scenario() {
    if !python_available().await {
        return;
    }
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        exec_request(KEY, json!({"code": "print('Hello, World!')", "lang": "py"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["stdout"], "Hello, World!\n");
    assert_eq!(body["run"]["code"], 0);
    assert_eq!(body["run"]["status"], "completed");
    assert_eq!(body["run"]["signal"], Value::Null);
    assert_eq!(body["language"], "py");
    assert_eq!(body["files"], json!([]));
    assert!(body["session_id"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn timeout_is_an_explicit_outcome() {
    if !python_available().await {
        return;
    }
    let h = harness_with(1024, 800);
    let (status, body) = send_json(
        &h.app,
        exec_request(KEY, json!({"code": "import time\ntime.sleep(30)", "lang": "py"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["status"], "timed_out");
    assert_eq!(body["run"]["signal"], "SIGKILL");
    assert_eq!(body["run"]["code"], Value::Null);
}

#[tokio::test]
async fn artifacts_are_downloadable() {
    if !python_available().await {
        return;
    }
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        exec_request(
            KEY,
            json!({
                "code": "open('report.txt', 'w').write('done')",
                "lang": "py",
                "entity_id": "art"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let files = body["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "report.txt");
    assert_eq!(files[0]["path"], "/download/art/report.txt");

    let (status, bytes) = send(&h.app, get("/download/art/report.txt")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"done");
}

#[tokio::test]
async fn upload_list_delete_round_trip() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        upload_request(Some("files1"), &[("a.txt", b"alpha"), ("b.txt", b"be")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], "files1");
    assert_eq!(body["files"].as_array().unwrap().len(), 2);
    assert!(body["files"][0].get("content").is_none());

    let (status, listed) = send_json(&h.app, get("/files/files1?detail=full")).await;
    assert_eq!(status, StatusCode::OK);
    let a = listed
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["name"] == "a.txt")
        .unwrap();
    assert_eq!(a["size"], 5);
    assert_eq!(a["contentType"], "text/plain");
    assert!(a["etag"].is_string());

    let (status, simple) = send_json(&h.app, get("/files/files1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(simple[0].get("size").is_none());

    let (status, _) = send_json(&h.app, delete("/files/files1/a.txt")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, listed) = send_json(&h.app, get("/files/files1?detail=full")).await;
    let names: Vec<_> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["b.txt"]);

    let (status, _) = send(&h.app, get("/download/files1/a.txt")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send_json(&h.app, delete("/files/files1/a.txt")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversize_upload_is_rejected_and_persists_nothing() {
    let h = harness_with(8, 10_000);
    let (status, _) = send_json(
        &h.app,
        upload_request(Some("big"), &[("ok.txt", b"12345678"), ("no.txt", b"123456789")]),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!h.root.join("sessions/big").exists());
    assert!(!h.root.join("uploads/big").exists());
    let leftovers: Vec<_> = std::fs::read_dir(h.root.join("uploads"))
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.file_name()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "spooled bodies left behind: {leftovers:?}");

    let (status, _) = send_json(&h.app, get("/files/big")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(&h.app, upload_request(Some("big"), &[("ok.txt", b"12345678")])).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_session_listing_is_not_found() {
    let h = harness();
    let (status, _) = send_json(&h.app, get("/files/nobody")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn uploaded_file_is_staged_into_later_execution() {
    if !python_available().await {
        return;
    }
    let h = harness();
    let (_, uploaded) = send_json(
        &h.app,
        upload_request(Some("uploader"), &[("data.txt", b"staged content")]),
    )
    .await;
    let file_id = uploaded["files"][0]["id"].clone();

    let (status, body) = send_json(
        &h.app,
        exec_request(
            KEY,
            json!({
                "code": "print(open('data.txt').read())",
                "lang": "py",
                "entity_id": "runner",
                "files": [{"id": file_id, "session_id": "uploader", "name": "data.txt"}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["stdout"], "staged content\n");
    assert_eq!(body["files"][0]["name"], "data.txt");
}

#[tokio::test]
async fn purge_removes_session() {
    let h = harness();
    send_json(&h.app, upload_request(Some("tmp1"), &[("x.txt", b"x")])).await;
    let (status, _) = send(&h.app, delete("/sessions/tmp1")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send_json(&h.app, get("/files/tmp1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
