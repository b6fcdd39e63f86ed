//! End-to-end tests against a running server.
//!
//! Each test binds the real router on an ephemeral port and talks to it
//! with a websocket client, the way a browser would.

use std::net::SocketAddr;
use std::time::Duration;

use daemon::auth::Principal;
use daemon::config::Config;
use daemon::server::{run, AppState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
    _root: TempDir,
}

impl TestServer {
    async fn start(token: Option<&str>) -> Self {
        let root = TempDir::new().unwrap();
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.token = token.map(str::to_string);
        config.session.default_shell = "/bin/sh".to_string();
        config.session.handshake_timeout_secs = 1;
        config.session.terminate_grace_ms = 500;
        config.files.allowed_paths = vec![root.path().to_path_buf()];

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(config);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(listener, state.clone(), shutdown.clone()));

        Self {
            addr,
            state,
            shutdown,
            handle,
            _root: root,
        }
    }

    fn url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws?token={}", self.addr, token),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    async fn connect(&self) -> Client {
        let (ws, _) = connect_async(self.url(None)).await.unwrap();
        ws
    }

    async fn stop(self) {
        self.shutdown.cancel();
        timeout(WAIT, self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next JSON frame from the server. Panics on close.
async fn next_frame(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {:?}", frame),
            _ => continue,
        }
    }
}

/// Attaches and returns the session id from the `session` reply.
async fn attach(ws: &mut Client, session_id: Option<&str>) -> String {
    send(
        ws,
        json!({"type": "attach", "session_id": session_id, "rows": 24, "cols": 80}),
    )
    .await;
    let frame = next_frame(ws).await;
    assert_eq!(frame["type"], "session", "got {frame}");
    frame["id"].as_str().unwrap().to_string()
}

/// Collects output until it contains `needle`.
async fn read_until(ws: &mut Client, needle: &str) -> String {
    let mut output = String::new();
    while !output.contains(needle) {
        let frame = next_frame(ws).await;
        if frame["type"] == "output" {
            output.push_str(frame["data"].as_str().unwrap());
        }
    }
    output
}

/// Skips frames until the server closes. Returns the frames and close code.
async fn read_until_close(ws: &mut Client) -> (Vec<Value>, Option<u16>) {
    let mut frames = Vec::new();
    loop {
        let msg = match timeout(WAIT, ws.next()).await.expect("timed out waiting for close") {
            Some(Ok(msg)) => msg,
            Some(Err(_)) | None => return (frames, None),
        };
        match msg {
            Message::Text(text) => frames.push(serde_json::from_str(&text).unwrap()),
            Message::Close(frame) => return (frames, frame.map(|f| u16::from(f.code))),
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_new_session_echoes_input() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;

    let id = attach(&mut ws, None).await;
    assert!(!id.is_empty());

    send(&mut ws, json!({"type": "input", "data": "echo hello-$((1+1))\n"})).await;
    let output = read_until(&mut ws, "hello-2").await;
    assert!(output.contains("hello-2"));

    server.stop().await;
}

#[tokio::test]
async fn test_binary_input_and_ping() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;
    attach(&mut ws, None).await;

    send(&mut ws, json!({"type": "ping"})).await;
    loop {
        if next_frame(&mut ws).await["type"] == "pong" {
            break;
        }
    }

    ws.send(Message::Binary(b"echo bin-$((3*3))\n".to_vec()))
        .await
        .unwrap();
    read_until(&mut ws, "bin-9").await;

    server.stop().await;
}

#[tokio::test]
async fn test_reattach_replays_scrollback() {
    let server = TestServer::start(None).await;

    let mut first = server.connect().await;
    let id = attach(&mut first, None).await;
    send(&mut first, json!({"type": "input", "data": "echo marker-$((40+2))\n"})).await;
    read_until(&mut first, "marker-42").await;

    send(&mut first, json!({"type": "detach"})).await;
    let (_, code) = read_until_close(&mut first).await;
    assert_eq!(code, Some(1000));

    let mut second = server.connect().await;
    let resumed = attach(&mut second, Some(&id)).await;
    assert_eq!(resumed, id);

    // Replayed from the ring before any new input
    read_until(&mut second, "marker-42").await;

    send(&mut second, json!({"type": "input", "data": "echo after-$((1+2))\n"})).await;
    read_until(&mut second, "after-3").await;

    server.stop().await;
}

#[tokio::test]
async fn test_session_survives_dropped_connection() {
    let server = TestServer::start(None).await;

    let mut first = server.connect().await;
    let id = attach(&mut first, None).await;
    drop(first);

    // The session stays registered after the transport vanishes
    let mut second = server.connect().await;
    let resumed = attach(&mut second, Some(&id)).await;
    assert_eq!(resumed, id);
    assert_eq!(server.state.registry.count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_second_attach_takes_over() {
    let server = TestServer::start(None).await;

    let mut first = server.connect().await;
    let id = attach(&mut first, None).await;

    let mut second = server.connect().await;
    attach(&mut second, Some(&id)).await;

    let (frames, code) = read_until_close(&mut first).await;
    assert_eq!(code, Some(protocol::close_code::REPLACED));
    assert!(frames.iter().any(|f| f["type"] == "status"));

    send(&mut second, json!({"type": "input", "data": "echo still-$((2+2))\n"})).await;
    read_until(&mut second, "still-4").await;

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_session_is_rejected() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;

    send(&mut ws, json!({"type": "attach", "session_id": "no-such-session"})).await;
    let (frames, code) = read_until_close(&mut ws).await;

    assert_eq!(code, Some(protocol::close_code::SESSION_NOT_FOUND));
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[0]["code"], "session_not_found");
    assert_eq!(server.state.registry.count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_first_frame_must_be_attach() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;

    send(&mut ws, json!({"type": "ping"})).await;
    let (frames, code) = read_until_close(&mut ws).await;

    assert_eq!(code, Some(protocol::close_code::INVALID_FRAME));
    assert_eq!(frames[0]["code"], "invalid_frame");

    server.stop().await;
}

#[tokio::test]
async fn test_handshake_timeout_closes() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;

    let (_, code) = read_until_close(&mut ws).await;
    assert_eq!(code, Some(protocol::close_code::HANDSHAKE_TIMEOUT));

    server.stop().await;
}

#[tokio::test]
async fn test_process_exit_reports_code() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;
    let id = attach(&mut ws, None).await;

    send(&mut ws, json!({"type": "input", "data": "exit 3\n"})).await;
    let (frames, code) = read_until_close(&mut ws).await;

    assert_eq!(code, Some(protocol::close_code::PROCESS_EXITED));
    let exit = frames.iter().find(|f| f["type"] == "exit").unwrap();
    assert_eq!(exit["code"], 3);

    // Exited sessions cannot be resumed
    let mut again = server.connect().await;
    send(&mut again, json!({"type": "attach", "session_id": id})).await;
    let (_, code) = read_until_close(&mut again).await;
    assert_eq!(code, Some(protocol::close_code::SESSION_NOT_FOUND));

    server.stop().await;
}

#[tokio::test]
async fn test_client_terminate_closes_session() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;
    attach(&mut ws, None).await;

    send(&mut ws, json!({"type": "terminate"})).await;
    let (_, code) = read_until_close(&mut ws).await;

    assert_eq!(code, Some(protocol::close_code::TERMINATED));
    assert_eq!(server.state.registry.count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_terminate_with_background_job() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;
    attach(&mut ws, None).await;

    send(&mut ws, json!({"type": "input", "data": "sleep 300 &\necho bg-$((4+4))\n"})).await;
    read_until(&mut ws, "bg-8").await;

    send(&mut ws, json!({"type": "terminate"})).await;
    let (_, code) = read_until_close(&mut ws).await;

    assert_eq!(code, Some(protocol::close_code::TERMINATED));
    assert_eq!(server.state.registry.count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_registry_terminate_closes_attached_client() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;
    let id = attach(&mut ws, None).await;

    server
        .state
        .registry
        .terminate(&id, &Principal::Anonymous)
        .await
        .unwrap();

    let (_, code) = read_until_close(&mut ws).await;
    assert_eq!(code, Some(protocol::close_code::TERMINATED));

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_terminates_sessions() {
    let server = TestServer::start(None).await;
    let mut ws = server.connect().await;
    attach(&mut ws, None).await;

    let registry = server.state.registry.clone();
    server.shutdown.cancel();

    let (_, code) = read_until_close(&mut ws).await;
    assert_eq!(code, Some(protocol::close_code::TERMINATED));

    timeout(WAIT, server.handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
async fn test_websocket_requires_token() {
    let server = TestServer::start(Some("secret-token")).await;

    match connect_async(server.url(None)).await {
        Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), 401),
        other => panic!("expected 401, got {:?}", other.map(|(_, r)| r.status())),
    }

    match connect_async(server.url(Some("wrong"))).await {
        Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), 401),
        other => panic!("expected 401, got {:?}", other.map(|(_, r)| r.status())),
    }

    let (mut ws, _) = connect_async(server.url(Some("secret-token"))).await.unwrap();
    attach(&mut ws, None).await;

    server.stop().await;
}
