//! Raw container log streams from the engine's HTTP API
//!
//! The Docker client library demultiplexes log output on its own, so the
//! log viewer talks to the engine directly and hands the undecoded body to
//! [`crate::demux`].

use bytes::Bytes;
use futures::Stream;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default socket of a local engine
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Where the container engine API listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl DockerEndpoint {
    /// Parse `unix:///path/to/socket` or `tcp://host:port`
    pub fn parse(host: &str) -> anyhow::Result<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            Ok(DockerEndpoint::Unix(PathBuf::from(path)))
        } else if let Some(addr) = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
        {
            Ok(DockerEndpoint::Tcp(addr.trim_end_matches('/').to_string()))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// Explicit host, then `DOCKER_HOST`, then the first common socket
    /// that exists, then the default local socket
    pub fn resolve(explicit: Option<&str>) -> anyhow::Result<Self> {
        match explicit {
            Some(host) => Self::parse(host),
            None => match std::env::var("DOCKER_HOST") {
                Ok(host) if !host.is_empty() => Self::parse(&host),
                _ => Ok(DockerEndpoint::Unix(
                    find_local_socket().unwrap_or_else(|| PathBuf::from(DEFAULT_DOCKER_SOCKET)),
                )),
            },
        }
    }
}

fn find_local_socket() -> Option<PathBuf> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let candidates: [(&str, String); 5] = [
        ("Linux default", DEFAULT_DOCKER_SOCKET.to_string()),
        ("Docker Desktop", format!("{}/.docker/run/docker.sock", home)),
        ("Colima", format!("{}/.colima/default/docker.sock", home)),
        ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
        ("Podman", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    candidates.into_iter().find_map(|(name, path)| {
        // Empty env vars produce relative or doubled paths
        if !path.starts_with('/') || path.contains("//") {
            return None;
        }
        let path = PathBuf::from(path);
        if path.exists() {
            debug!(path = %path.display(), name, "Found container engine socket");
            Some(path)
        } else {
            None
        }
    })
}

impl std::fmt::Display for DockerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DockerEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            DockerEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogSourceError {
    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Cannot connect to container engine at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Container engine request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid log request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("Container engine returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// Opens follow-mode log streams for containers
#[derive(Debug, Clone)]
pub struct LogSource {
    endpoint: DockerEndpoint,
    tail: u32,
}

impl LogSource {
    pub fn new(endpoint: DockerEndpoint, tail: u32) -> Self {
        Self { endpoint, tail }
    }

    pub fn endpoint(&self) -> &DockerEndpoint {
        &self.endpoint
    }

    /// Open the log stream of `container`: the last `tail` lines, then live output.
    ///
    /// Fails before any data is streamed if the container does not exist.
    pub async fn open(&self, container: &str) -> Result<LogStream, LogSourceError> {
        let path = logs_path(container, self.tail);
        debug!(container, endpoint = %self.endpoint, tail = self.tail, "Opening container log stream");

        let (response, conn) = match &self.endpoint {
            #[cfg(unix)]
            DockerEndpoint::Unix(socket) => {
                let stream = tokio::net::UnixStream::connect(socket)
                    .await
                    .map_err(|source| LogSourceError::Connect {
                        endpoint: self.endpoint.to_string(),
                        source,
                    })?;
                send_get(stream, &path).await?
            }
            #[cfg(not(unix))]
            DockerEndpoint::Unix(_) => {
                return Err(LogSourceError::Connect {
                    endpoint: self.endpoint.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "unix sockets are not supported on this platform",
                    ),
                });
            }
            DockerEndpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|source| LogSourceError::Connect {
                        endpoint: self.endpoint.to_string(),
                        source,
                    })?;
                send_get(stream, &path).await?
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(LogStream {
                body: response.into_body(),
                conn,
            });
        }

        let message = error_message(response).await;
        conn.abort();
        if status == StatusCode::NOT_FOUND {
            Err(LogSourceError::NotFound(container.to_string()))
        } else {
            Err(LogSourceError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

async fn send_get<T>(io: T, path: &str) -> Result<(Response<Incoming>, JoinHandle<()>), LogSourceError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(io)).await?;
    let conn = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Container engine connection closed with error");
        }
    });

    let request = Request::get(path)
        .header(HOST, "docker")
        .body(Empty::<Bytes>::new())?;

    match sender.send_request(request).await {
        Ok(response) => Ok((response, conn)),
        Err(e) => {
            conn.abort();
            Err(e.into())
        }
    }
}

/// Engine errors carry `{"message": "..."}`
async fn error_message(response: Response<Incoming>) -> String {
    let status = response.status();
    let body = match response.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return status.to_string(),
    };
    serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string())
}

fn logs_path(container: &str, tail: u32) -> String {
    format!(
        "/containers/{}/logs?follow=1&stdout=1&stderr=1&tail={}",
        urlencoding::encode(container),
        tail
    )
}

/// Undecoded log bytes of one container
///
/// Dropping the stream tears down the engine connection.
pub struct LogStream {
    body: Incoming,
    conn: JoinHandle<()>,
}

impl Stream for LogStream {
    type Item = Result<Bytes, hyper::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    // Trailers carry no log data
                    if let Ok(data) = frame.into_data() {
                        return Poll::Ready(Some(Ok(data)));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.conn.abort();
    }
}
