//! HTTP routes and the live log websocket

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use opspro_engine::ssh::mock::{MockConnector, MockHost, MockReply};

use crate::common::{site_host, site_zip, Harness};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HOST: &str = "10.0.4.1";

async fn call(harness: &Harness, request: Request<Body>) -> Response {
    harness.router().oneshot(request).await.unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn upload(harness: &Harness) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/artifacts?filename=site.zip")
        .body(Body::from(site_zip()))
        .unwrap();
    let response = call(harness, request).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let harness = Harness::new(MockConnector::new());
    let response = call(&harness, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_verify_by_resource_id() {
    let host = MockHost::new()
        .on("echo ok", MockReply::ok("ok\n"))
        .on("/dev/tcp", MockReply::ok("open\n"))
        .on("redis-cli", MockReply::ok("PONG\n"));
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));
    harness.add_resource("1", HOST).await;

    let body = json!({
        "resource_id": "1",
        "middleware_type": "redis",
        "password": "pw"
    });
    let response = call(&harness, post_json("/verify", body)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["ssh_ok"], true);
    assert_eq!(report["auth_valid"], true);
    assert_eq!(report["success"], true);
    assert_eq!(report["raw_details"]["port"], "6379");
}

#[tokio::test]
async fn test_verify_with_sealed_password() {
    let host = MockHost::new()
        .on("echo ok", MockReply::ok("ok\n"))
        .on("/dev/tcp", MockReply::ok("open\n"))
        .on("REDISCLI_AUTH='sealed-pw'", MockReply::ok("PONG\n"))
        .on("redis-cli", MockReply::ok("WRONGPASS invalid username-password pair"));
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));
    harness.add_resource("1", HOST).await;
    let handle = harness.vault.seal_text("sealed-pw").unwrap();

    let body = json!({
        "resource_id": "1",
        "middleware_type": "redis",
        "password_handle": handle.as_str()
    });
    let report = body_json(call(&harness, post_json("/verify", body)).await).await;
    assert_eq!(report["auth_valid"], true);
}

#[tokio::test]
async fn test_verify_input_errors() {
    let harness = Harness::new(MockConnector::new());
    harness.add_resource("1", HOST).await;

    let both = json!({
        "resource_id": "1",
        "target": {"host_address": HOST, "ssh_username": "root", "credential_handle": "x"},
        "middleware_type": "mysql"
    });
    let response = call(&harness, post_json("/verify", both)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].as_str().unwrap().contains("not both"));

    let unknown = json!({"resource_id": "99", "middleware_type": "mysql"});
    assert_eq!(call(&harness, post_json("/verify", unknown)).await.status(), StatusCode::NOT_FOUND);

    let bad_kind = json!({"resource_id": "1", "middleware_type": "oracle"});
    let response = call(&harness, post_json("/verify", bad_kind)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response)
        .await["error"]
        .as_str()
        .unwrap()
        .contains("unsupported middleware type 'oracle'"));
    assert_eq!(harness.connector.connect_count(), 0);
}

#[tokio::test]
async fn test_verify_accepts_sentinel_alias() {
    let host = MockHost::new()
        .on("echo ok", MockReply::ok("ok\n"))
        .on("/dev/tcp", MockReply::ok("open\n"));
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));
    harness.add_resource("1", HOST).await;

    let body = json!({"resource_id": "1", "middleware_type": "redis-sentinel"});
    let response = call(&harness, post_json("/verify", body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["ssh_ok"], true);
}

#[tokio::test]
async fn test_upload_rejects_package_without_site() {
    let harness = Harness::new(MockConnector::new());
    let request = Request::builder()
        .method("POST")
        .uri("/artifacts?filename=site.zip")
        .body(Body::from(b"not a zip".to_vec()))
        .unwrap();

    let response = call(&harness, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/artifacts?filename=site.rar")
        .body(Body::from(site_zip()))
        .unwrap();
    assert_eq!(call(&harness, request).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deploy_inline_and_async() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, site_host()));
    harness.add_resource("1", HOST).await;
    let artifact_id = upload(&harness).await;

    let inline = json!({"artifact_id": artifact_id, "target_resource_ids": ["1"]});
    let response = call(&harness, post_json("/deploy", inline)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["operation"], "deploy");
    assert_eq!(body["success"], true);
    assert_eq!(body["results"][0]["steps"].as_array().unwrap().len(), 7);

    let queued = json!({"artifact_id": artifact_id, "target_resource_ids": ["1"], "async": true});
    let response = call(&harness, post_json("/deploy", queued)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let job_id = body_json(response).await["job_id"].as_str().unwrap().to_string();

    let mut record = Value::Null;
    for _ in 0..200 {
        record = body_json(call(&harness, get(&format!("/jobs/{}", job_id))).await).await;
        if record["status"] == "succeeded" || record["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(record["status"], "succeeded");
    assert_eq!(record["output"]["success"], true);

    let history = body_json(call(&harness, get("/jobs")).await).await;
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(call(&harness, get("/jobs/nope")).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rollback_route() {
    let host = site_host().on("then echo found", MockReply::ok("found\n"));
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));
    harness.add_resource("1", HOST).await;

    let body = json!({"target_resource_id": "1", "backup_name": "html_20240501_101500.tar.gz"});
    let response = call(&harness, post_json("/rollback", body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["operation"], "rollback");

    let bad = json!({"target_resource_id": "1", "backup_name": "latest"});
    assert_eq!(call(&harness, post_json("/rollback", bad)).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_backups_route() {
    let host = MockHost::new().on(
        "stat -c",
        MockReply::ok("512 /usr/local/nginx/backup/html_20240101_080000.tar.gz\n"),
    );
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));
    harness.add_resource("1", HOST).await;

    let response = call(&harness, get("/resources/1/backups")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let backups = body_json(response).await;
    assert_eq!(backups[0]["name"], "html_20240101_080000.tar.gz");
    assert_eq!(backups[0]["created_at"], "2024-01-01 08:00:00");
}

#[tokio::test]
async fn test_containers_route() {
    let listing = concat!(
        r#"{"ID":"a1b2c3","Names":"start_nginx","Image":"nginx:1.25","Status":"Up 2 hours","State":"running","Ports":"80/tcp","CreatedAt":"2024-05-01"}"#,
        "\n",
        r#"{"ID":"d4e5f6","Names":"worker","Image":"app:3","Status":"Exited (1)","State":"exited","Ports":"","RunningFor":"2 days ago"}"#,
        "\n"
    );
    let host = MockHost::new().on("docker ps -a", MockReply::ok(listing));
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));
    harness.add_resource("1", HOST).await;

    let response = call(&harness, get("/resources/1/containers")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let containers = body_json(response).await;
    assert_eq!(containers.as_array().unwrap().len(), 2);
    assert_eq!(containers[0]["name"], "start_nginx");
    assert_eq!(containers[1]["state"], "exited");
    assert_eq!(containers[1]["created"], "2 days ago");
    assert_eq!(harness.connector.open_sessions(), 0);

    call(&harness, get("/resources/1/containers?all=false")).await;
    assert!(harness
        .connector
        .commands(HOST)
        .last()
        .unwrap()
        .starts_with("docker ps --format"));
}

#[tokio::test]
async fn test_container_actions() {
    let host = MockHost::new()
        .on("docker restart start_nginx", MockReply::ok("start_nginx\n"))
        .on("docker stop ghost", MockReply::fail(1, "Error response from daemon: No such container: ghost"));
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));
    harness.add_resource("1", HOST).await;

    let response = call(&harness, post_json("/resources/1/containers/start_nginx/restart", json!({}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let result = body_json(response).await;
    assert_eq!(result["success"], true);
    assert_eq!(result["action"], "restart");
    assert_eq!(result["message"], "container start_nginx restarted");

    let result = body_json(call(&harness, post_json("/resources/1/containers/ghost/stop", json!({}))).await).await;
    assert_eq!(result["success"], false);
    assert!(result["message"].as_str().unwrap().contains("No such container"));

    let response = call(&harness, post_json("/resources/1/containers/start_nginx/kill", json!({}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = call(&harness, post_json("/resources/1/containers/web%3Breboot/stop", json!({}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = call(&harness, post_json("/resources/9/containers/start_nginx/stop", json!({}))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert_eq!(harness.connector.connect_count(), 2);
    assert_eq!(harness.connector.open_sessions(), 0);
}

// ================================== WEBSOCKET =================================== //

async fn spawn_server(harness: &Harness) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = harness.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), socket.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("unexpected websocket event {:?}", other),
        }
    }
}

/// Collect `lines` frames until `count` lines arrived
async fn read_lines(socket: &mut Socket, count: usize) -> Vec<String> {
    let mut lines = Vec::new();
    while lines.len() < count {
        let frame = next_frame(socket).await;
        assert_eq!(frame["type"], "lines", "{}", frame);
        for line in frame["lines"].as_array().unwrap() {
            lines.push(line.as_str().unwrap().to_string());
        }
    }
    lines
}

fn tailing_harness(lines: &[&str], hold_open: bool) -> Harness {
    let host = MockHost::new().stream("tail -n 100 -F '/var/log/app.log'", lines, hold_open);
    Harness::new(MockConnector::new().with_host(HOST, host))
}

#[tokio::test]
async fn test_ws_streams_and_closes() {
    let harness = tailing_harness(&["INFO start", "ERROR boom", "INFO done"], true);
    harness.add_resource("7", HOST).await;
    let addr = spawn_server(&harness).await;

    let (mut socket, _) = connect_async(format!("ws://{}/ws/logs/7?path=/var/log/app.log", addr))
        .await
        .unwrap();
    assert_eq!(read_lines(&mut socket, 3).await, vec!["INFO start", "ERROR boom", "INFO done"]);

    socket.send(Message::Text("close".into())).await.unwrap();
    let connector = harness.connector.clone();
    let relay = harness.app.relay.clone();
    tokio::time::timeout(Duration::from_secs(2), async {
        while connector.open_streams() > 0 || connector.open_sessions() > 0 || relay.registry().active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Released, so a new client may attach
    let (mut socket, _) = connect_async(format!("ws://{}/ws/logs/7?path=/var/log/app.log", addr))
        .await
        .unwrap();
    read_lines(&mut socket, 3).await;
}

#[tokio::test]
async fn test_ws_keyword_filter() {
    let harness = tailing_harness(&["INFO start", "ERROR boom", "INFO done"], true);
    harness.add_resource("7", HOST).await;
    let addr = spawn_server(&harness).await;

    let (mut socket, _) = connect_async(format!("ws://{}/ws/logs/7?path=/var/log/app.log", addr))
        .await
        .unwrap();
    read_lines(&mut socket, 3).await;

    let filter = json!({"type": "filter", "keyword": "error"}).to_string();
    socket.send(Message::Text(filter.into())).await.unwrap();
    let frame = next_frame(&mut socket).await;
    assert_eq!(frame["type"], "history");
    assert_eq!(frame["keyword"], "error");
    assert_eq!(frame["lines"], json!(["ERROR boom"]));

    let clear = json!({"type": "filter", "keyword": ""}).to_string();
    socket.send(Message::Text(clear.into())).await.unwrap();
    let frame = next_frame(&mut socket).await;
    assert_eq!(frame["lines"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_ws_remote_close_notice() {
    let harness = tailing_harness(&["last words"], false);
    harness.add_resource("7", HOST).await;
    let addr = spawn_server(&harness).await;

    let (mut socket, _) = connect_async(format!("ws://{}/ws/logs/7?path=/var/log/app.log", addr))
        .await
        .unwrap();
    assert_eq!(read_lines(&mut socket, 1).await, vec!["last words"]);

    let frame = next_frame(&mut socket).await;
    assert_eq!(frame["type"], "closed");
    assert_eq!(frame["message"], "stream closed by remote host");
}

#[tokio::test]
async fn test_ws_refusals_are_http_errors() {
    let harness = tailing_harness(&[], true);
    harness.add_resource("7", HOST).await;
    let addr = spawn_server(&harness).await;

    let url = format!("ws://{}/ws/logs/7?path=/var/log/app.log", addr);
    let (_first, _) = connect_async(url.as_str()).await.unwrap();

    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), StatusCode::CONFLICT),
        other => panic!("second reader was not refused: {:?}", other.map(|_| ())),
    }

    match connect_async(format!("ws://{}/ws/logs/7?path=relative.log", addr)).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), StatusCode::BAD_REQUEST),
        other => panic!("relative path was accepted: {:?}", other.map(|_| ())),
    }

    match connect_async(format!("ws://{}/ws/logs/404?path=/var/log/app.log", addr)).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        other => panic!("unknown resource was accepted: {:?}", other.map(|_| ())),
    }
}
