//! Integration tests for the container log pipeline and the panel server
//!
//! A fake engine speaks just enough HTTP to serve framed log bodies and
//! not-found errors, so the raw engine client, the frame demultiplexer, the
//! event bridge and the SSE route are exercised together.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostpanel::api::{PanelServer, PanelState};
use hostpanel::bridge::{BridgeConfig, BridgeEvent, LogBridge};
use hostpanel::certs::CertificateManager;
use hostpanel::config::{CertbotConfig, NginxConfig};
use hostpanel::demux::encode_header;
use hostpanel::logsource::{DockerEndpoint, LogSource, LogSourceError};
use hostpanel::nginx::ProxyConfigurator;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

const TOKEN: &str = "integration-token";

/// Minimal stand-in for the engine's logs endpoint
///
/// - `/containers/missing/...` answers 404 with an engine error body
/// - `/containers/live/...` sends two frames and stays open
/// - anything else sends two frames split across chunks, then ends
#[derive(Clone)]
struct FakeEngine {
    addr: SocketAddr,
    paths: Arc<Mutex<Vec<String>>>,
    closed: Arc<Notify>,
}

impl FakeEngine {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let engine = FakeEngine {
            addr: listener.local_addr().unwrap(),
            paths: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Notify::new()),
        };

        let server = engine.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let server = server.clone();
                tokio::spawn(async move { server.serve(socket).await });
            }
        });

        engine
    }

    fn endpoint(&self) -> DockerEndpoint {
        DockerEndpoint::Tcp(self.addr.to_string())
    }

    fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    async fn serve(&self, mut socket: TcpStream) {
        let Some(path) = read_request_path(&mut socket).await else {
            return;
        };
        self.paths.lock().unwrap().push(path.clone());

        if path.starts_with("/containers/missing/") {
            let body = r#"{"message":"No such container: missing"}"#;
            let response = format!(
                "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            return;
        }

        let head = "HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\nTransfer-Encoding: chunked\r\n\r\n";
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }

        let mut framed = Vec::new();
        framed.extend_from_slice(&encode_header(1, 6));
        framed.extend_from_slice(b"hello\n");
        framed.extend_from_slice(&encode_header(2, 5));
        framed.extend_from_slice(b"oops\n");

        // Cut inside the first header and inside the first payload
        for piece in [&framed[..3], &framed[3..10], &framed[10..]] {
            let chunk = format!("{:x}\r\n", piece.len());
            if socket.write_all(chunk.as_bytes()).await.is_err()
                || socket.write_all(piece).await.is_err()
                || socket.write_all(b"\r\n").await.is_err()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if path.starts_with("/containers/live/") {
            let mut buf = [0u8; 256];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            self.closed.notify_one();
            return;
        }

        let _ = socket.write_all(b"0\r\n\r\n").await;
    }
}

async fn read_request_path(socket: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..n]);
    }
    let head = String::from_utf8_lossy(&head);
    head.lines()
        .next()?
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
}

/// Panel server wired to the fake engine; no container manager
struct TestPanel {
    port: u16,
    _shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn start_panel(engine: &FakeEngine, keepalive: Duration) -> TestPanel {
    let dir = tempfile::tempdir().unwrap();
    let nginx = NginxConfig {
        binary: "true".to_string(),
        sites_dir: dir.path().join("sites"),
        streams_dir: dir.path().join("streams"),
        reload_on_change: false,
    };
    let certbot = CertbotConfig {
        live_dir: dir.path().join("live"),
        ..Default::default()
    };

    let state = Arc::new(PanelState {
        docker: None,
        logs: LogSource::new(engine.endpoint(), 200),
        bridge: BridgeConfig {
            keepalive_interval: keepalive,
        },
        proxy: ProxyConfigurator::new(&nginx, &certbot),
        certs: CertificateManager::new(&certbot),
        auth_token: TOKEN.to_string(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = PanelServer::new(listener.local_addr().unwrap(), state, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestPanel {
        port,
        _shutdown: shutdown_tx,
        _dir: dir,
    }
}

/// Send a GET with `Connection: close` and read the whole response
async fn http_get(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn test_log_source_feeds_bridge() {
    let engine = FakeEngine::start().await;
    let source = LogSource::new(engine.endpoint(), 200);

    let upstream = source.open("web").await.unwrap();
    let mut bridge = LogBridge::open(upstream, BridgeConfig::default());

    let mut events = Vec::new();
    while let Some(event) = bridge.recv().await {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            BridgeEvent::Text("hello\n".to_string()),
            BridgeEvent::Text("oops\n".to_string()),
            BridgeEvent::End,
        ]
    );

    let paths = engine.paths();
    assert_eq!(paths.len(), 1);
    assert_eq!(
        paths[0],
        "/containers/web/logs?follow=1&stdout=1&stderr=1&tail=200"
    );
}

#[tokio::test]
async fn test_missing_container_fails_on_open() {
    let engine = FakeEngine::start().await;
    let source = LogSource::new(engine.endpoint(), 200);

    match source.open("missing").await {
        Err(LogSourceError::NotFound(name)) => assert_eq!(name, "missing"),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("missing container opened a stream"),
    }
}

#[tokio::test]
async fn test_cancel_releases_engine_connection() {
    let engine = FakeEngine::start().await;
    let source = LogSource::new(engine.endpoint(), 10);

    let upstream = source.open("live").await.unwrap();
    let mut bridge = LogBridge::open(upstream, BridgeConfig::default());

    assert_eq!(
        bridge.recv().await,
        Some(BridgeEvent::Text("hello\n".to_string()))
    );

    bridge.cancel();
    bridge.closed().await;
    assert_eq!(bridge.recv().await, None);

    tokio::time::timeout(Duration::from_secs(5), engine.closed.notified())
        .await
        .expect("engine connection was not released");
}

#[tokio::test]
async fn test_sse_route_streams_until_end() {
    let engine = FakeEngine::start().await;
    let panel = start_panel(&engine, Duration::from_secs(15)).await;

    let response = http_get(
        panel.port,
        &format!("/api/containers/web/logs?token={}", TOKEN),
    )
    .await;
    let lower = response.to_lowercase();

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(lower.contains("content-type: text/event-stream"));
    assert!(lower.contains("cache-control: no-cache"));

    let hello = response.find(r#"data: {"text":"hello\n"}"#).unwrap();
    let oops = response.find(r#"data: {"text":"oops\n"}"#).unwrap();
    let end = response
        .find("event: end\ndata: {\"text\":\"[log stream ended]\"}\n\n")
        .unwrap();
    assert!(hello < oops && oops < end);
    assert!(!response.contains("event: error"));
}

#[tokio::test]
async fn test_sse_route_missing_container_is_plain_404() {
    let engine = FakeEngine::start().await;
    let panel = start_panel(&engine, Duration::from_secs(15)).await;

    let response = http_get(
        panel.port,
        &format!("/api/containers/missing/logs?token={}", TOKEN),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
    assert!(response.to_lowercase().contains("content-type: application/json"));
    assert!(response.contains("No such container: missing"));
    assert!(!response.contains("data:"));
}

#[tokio::test]
async fn test_sse_route_requires_token() {
    let engine = FakeEngine::start().await;
    let panel = start_panel(&engine, Duration::from_secs(15)).await;

    let response = http_get(panel.port, "/api/containers/web/logs").await;
    assert!(response.starts_with("HTTP/1.1 401"), "got: {}", response);
    assert!(engine.paths().is_empty());

    let health = http_get(panel.port, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn test_browser_disconnect_releases_engine_connection() {
    let engine = FakeEngine::start().await;
    let panel = start_panel(&engine, Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", panel.port)).await.unwrap();
    let request = format!(
        "GET /api/containers/live/logs?token={} HTTP/1.1\r\nHost: localhost\r\n\r\n",
        TOKEN
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !String::from_utf8_lossy(&received).contains("oops") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "panel closed the stream early");
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("log lines never arrived");

    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), engine.closed.notified())
        .await
        .expect("engine connection was not released after the browser left");
}
