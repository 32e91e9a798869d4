//! Panel API server
//!
//! Serves the embedded dashboard and the JSON API used by it: containers,
//! networks and volumes on the engine, nginx sites and stream forwards,
//! certificates, and live container logs as server-sent events.

use crate::bridge::{BridgeConfig, LogBridge};
use crate::certs::{CertificateManager, IssueRequest};
use crate::dashboard;
use crate::docker::{
    CreateContainerRequest, CreateNetworkRequest, CreateVolumeRequest, DockerManager,
    SharedDockerManager,
};
use crate::error::{json_error_response, ApiError, PanelErrorCode};
use crate::logsource::LogSource;
use crate::nginx::ProxyConfigurator;
use crate::sites::{SiteDefinition, StreamDefinition};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the panel
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted JSON request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Body type of every panel response
pub type PanelBody = BoxBody<Bytes, hyper::Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
}

/// A parsed request target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Dashboard,
    DashboardCss,
    DashboardJs,
    Health,
    Version,
    ListContainers,
    CreateContainer,
    InspectContainer(&'a str),
    RemoveContainer(&'a str),
    Container(&'a str, ContainerAction),
    ContainerLogs(&'a str),
    ListNetworks,
    CreateNetwork,
    RemoveNetwork(&'a str),
    ListVolumes,
    CreateVolume,
    RemoveVolume(&'a str),
    ListSites,
    ApplySite,
    GetSite(&'a str),
    RemoveSite(&'a str),
    ListStreams,
    ApplyStream,
    GetStream(&'a str),
    RemoveStream(&'a str),
    ListCertificates,
    IssueCertificate,
    DeleteCertificate(&'a str),
    NginxTest,
    NginxReload,
    NotFound,
}

impl<'a> Route<'a> {
    pub fn parse(method: &Method, path: &'a str) -> Self {
        let trimmed = path.trim_end_matches('/');
        let segments: Vec<&str> = trimmed.split('/').skip(1).collect();

        match (method, segments.as_slice()) {
            (&Method::GET, [] | [""] | ["dashboard"]) => Route::Dashboard,
            (&Method::GET, ["dashboard", "style.css"]) => Route::DashboardCss,
            (&Method::GET, ["dashboard", "app.js"]) => Route::DashboardJs,
            (&Method::GET, ["health"]) => Route::Health,
            (&Method::GET, ["version"]) => Route::Version,

            (&Method::GET, ["api", "containers"]) => Route::ListContainers,
            (&Method::POST, ["api", "containers"]) => Route::CreateContainer,
            (&Method::GET, ["api", "containers", id]) => Route::InspectContainer(id),
            (&Method::DELETE, ["api", "containers", id]) => Route::RemoveContainer(id),
            (&Method::POST, ["api", "containers", id, "start"]) => {
                Route::Container(id, ContainerAction::Start)
            }
            (&Method::POST, ["api", "containers", id, "stop"]) => {
                Route::Container(id, ContainerAction::Stop)
            }
            (&Method::POST, ["api", "containers", id, "restart"]) => {
                Route::Container(id, ContainerAction::Restart)
            }
            (&Method::GET, ["api", "containers", id, "logs"]) => Route::ContainerLogs(id),

            (&Method::GET, ["api", "networks"]) => Route::ListNetworks,
            (&Method::POST, ["api", "networks"]) => Route::CreateNetwork,
            (&Method::DELETE, ["api", "networks", name]) => Route::RemoveNetwork(name),

            (&Method::GET, ["api", "volumes"]) => Route::ListVolumes,
            (&Method::POST, ["api", "volumes"]) => Route::CreateVolume,
            (&Method::DELETE, ["api", "volumes", name]) => Route::RemoveVolume(name),

            (&Method::GET, ["api", "sites"]) => Route::ListSites,
            (&Method::POST, ["api", "sites"]) => Route::ApplySite,
            (&Method::GET, ["api", "sites", name]) => Route::GetSite(name),
            (&Method::DELETE, ["api", "sites", name]) => Route::RemoveSite(name),

            (&Method::GET, ["api", "streams"]) => Route::ListStreams,
            (&Method::POST, ["api", "streams"]) => Route::ApplyStream,
            (&Method::GET, ["api", "streams", name]) => Route::GetStream(name),
            (&Method::DELETE, ["api", "streams", name]) => Route::RemoveStream(name),

            (&Method::GET, ["api", "certificates"]) => Route::ListCertificates,
            (&Method::POST, ["api", "certificates"]) => Route::IssueCertificate,
            (&Method::DELETE, ["api", "certificates", name]) => Route::DeleteCertificate(name),

            (&Method::POST, ["api", "nginx", "test"]) => Route::NginxTest,
            (&Method::POST, ["api", "nginx", "reload"]) => Route::NginxReload,

            _ => Route::NotFound,
        }
    }

    /// Routes served without a token
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Route::Dashboard
                | Route::DashboardCss
                | Route::DashboardJs
                | Route::Health
                | Route::Version
                | Route::NotFound
        )
    }
}

/// Everything a request handler needs
pub struct PanelState {
    /// `None` when the engine was unreachable at startup
    pub docker: Option<SharedDockerManager>,
    pub logs: LogSource,
    pub bridge: BridgeConfig,
    pub proxy: ProxyConfigurator,
    pub certs: CertificateManager,
    pub auth_token: String,
}

impl PanelState {
    fn docker(&self) -> Result<&DockerManager, ApiError> {
        self.docker.as_deref().ok_or_else(|| {
            ApiError::Engine("The container engine is not available".to_string())
        })
    }

    /// `Authorization: Bearer <token>`, or `?token=` for EventSource clients
    fn check_auth<B>(&self, req: &Request<B>) -> bool {
        let header_token = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).to_string());

        let token = header_token.or_else(|| {
            req.uri().query().and_then(|query| {
                query.split('&').find_map(|pair| {
                    pair.strip_prefix("token=")
                        .and_then(|v| urlencoding::decode(v).ok())
                        .map(|v| v.into_owned())
                })
            })
        });

        token.is_some_and(|t| constant_time_eq(&t, &self.auth_token))
    }

    /// Route and answer one request
    pub async fn handle<B>(self: Arc<Self>, req: Request<B>) -> Result<Response<PanelBody>, hyper::Error>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let route = Route::parse(&method, &path);

        debug!(%method, %path, "API request");

        if !route.is_public() && !self.check_auth(&req) {
            warn!(%path, "Unauthorized API request");
            return Ok(json_error_response(
                PanelErrorCode::Unauthorized,
                "unauthorized",
            ));
        }

        let response = match self.dispatch(route, req).await {
            Ok(response) => response,
            Err(e) => {
                match e.code() {
                    PanelErrorCode::InternalError | PanelErrorCode::CommandFailed => {
                        error!(%method, %path, error = %e, "API error")
                    }
                    _ => debug!(%method, %path, error = %e, "API request failed"),
                }
                e.into_response()
            }
        };
        Ok(response)
    }

    async fn dispatch<B>(&self, route: Route<'_>, req: Request<B>) -> Result<Response<PanelBody>, ApiError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        match route {
            Route::Dashboard => Ok(dashboard::serve_dashboard()),
            Route::DashboardCss => Ok(dashboard::serve_css()),
            Route::DashboardJs => Ok(dashboard::serve_js()),
            Route::Health => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
            Route::Version => {
                let version = serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                });
                Ok(json_response(StatusCode::OK, version.to_string()))
            }
            Route::NotFound => Err(ApiError::NotFound("Not found".to_string())),

            // ==================== Containers ====================
            Route::ListContainers => ok(self.docker()?.list_containers().await?),
            Route::CreateContainer => {
                let request: CreateContainerRequest = read_json(req).await?;
                let id = self.docker()?.create_container(&request).await?;
                created(serde_json::json!({ "id": id }))
            }
            Route::InspectContainer(id) => ok(self.docker()?.inspect_container(id).await?),
            Route::RemoveContainer(id) => {
                self.docker()?.remove_container(id).await?;
                ok(serde_json::json!({ "removed": id }))
            }
            Route::Container(id, action) => {
                let docker = self.docker()?;
                match action {
                    ContainerAction::Start => docker.start_container(id).await?,
                    ContainerAction::Stop => docker.stop_container(id).await?,
                    ContainerAction::Restart => docker.restart_container(id).await?,
                }
                ok(serde_json::json!({ "id": id }))
            }
            Route::ContainerLogs(id) => self.container_logs(id).await,

            // ==================== Networks ====================
            Route::ListNetworks => ok(self.docker()?.list_networks().await?),
            Route::CreateNetwork => {
                let request: CreateNetworkRequest = read_json(req).await?;
                self.docker()?.create_network(&request).await?;
                created(serde_json::json!({ "name": request.name }))
            }
            Route::RemoveNetwork(name) => {
                self.docker()?.remove_network(name).await?;
                ok(serde_json::json!({ "removed": name }))
            }

            // ==================== Volumes ====================
            Route::ListVolumes => ok(self.docker()?.list_volumes().await?),
            Route::CreateVolume => {
                let request: CreateVolumeRequest = read_json(req).await?;
                created(self.docker()?.create_volume(&request).await?)
            }
            Route::RemoveVolume(name) => {
                self.docker()?.remove_volume(name).await?;
                ok(serde_json::json!({ "removed": name }))
            }

            // ==================== Sites & streams ====================
            Route::ListSites => ok(self.proxy.sites().list()?),
            Route::ApplySite => {
                let site: SiteDefinition = read_json(req).await?;
                self.proxy.apply_site(&site).await?;
                ok(site)
            }
            Route::GetSite(name) => match self.proxy.sites().get(name)? {
                Some(site) => ok(site),
                None => Err(ApiError::NotFound(format!("No such site: {}", name))),
            },
            Route::RemoveSite(name) => {
                self.proxy.remove_site(name).await?;
                ok(serde_json::json!({ "removed": name }))
            }
            Route::ListStreams => ok(self.proxy.streams().list()?),
            Route::ApplyStream => {
                let stream: StreamDefinition = read_json(req).await?;
                self.proxy.apply_stream(&stream).await?;
                ok(stream)
            }
            Route::GetStream(name) => match self.proxy.streams().get(name)? {
                Some(stream) => ok(stream),
                None => Err(ApiError::NotFound(format!("No such stream: {}", name))),
            },
            Route::RemoveStream(name) => {
                self.proxy.remove_stream(name).await?;
                ok(serde_json::json!({ "removed": name }))
            }

            // ==================== Certificates ====================
            Route::ListCertificates => ok(self.certs.list()?),
            Route::IssueCertificate => {
                let request: IssueRequest = read_json(req).await?;
                let name = self.certs.issue(&request).await?;
                created(serde_json::json!({ "name": name }))
            }
            Route::DeleteCertificate(name) => {
                self.certs.delete(name).await?;
                ok(serde_json::json!({ "removed": name }))
            }

            // ==================== nginx ====================
            Route::NginxTest => {
                let output = self.proxy.controller().test().await?;
                ok(serde_json::json!({ "output": output }))
            }
            Route::NginxReload => {
                self.proxy.controller().reload().await?;
                ok(serde_json::json!({ "reloaded": true }))
            }
        }
    }

    /// Stream a container's logs as server-sent events
    async fn container_logs(&self, id: &str) -> Result<Response<PanelBody>, ApiError> {
        // A missing container fails here, before any event is sent
        let upstream = self.logs.open(id).await?;
        info!(container = id, "Streaming container logs");

        let bridge = LogBridge::open(upstream, self.bridge.clone());
        let mut response = Response::new(bridge.into_body());
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        Ok(response)
    }
}

/// Panel HTTP server
pub struct PanelServer {
    bind_addr: SocketAddr,
    state: Arc<PanelState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PanelServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<PanelState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "Panel server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Panel server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, state: Arc<PanelState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { state.handle(req).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

// ==================== Helper Functions ====================

async fn read_json<T, B>(req: Request<B>) -> Result<T, ApiError>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let body = http_body_util::Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read request body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))
}

/// Token comparison whose timing does not depend on where the inputs differ
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn ok<T: Serialize>(data: T) -> Result<Response<PanelBody>, ApiError> {
    envelope(StatusCode::OK, data)
}

fn created<T: Serialize>(data: T) -> Result<Response<PanelBody>, ApiError> {
    envelope(StatusCode::CREATED, data)
}

fn envelope<T: Serialize>(status: StatusCode, data: T) -> Result<Response<PanelBody>, ApiError> {
    let body = serde_json::to_string(&ApiResponse::ok(data))
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(json_response(status, body))
}

pub(crate) fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<PanelBody> {
    let mut response = Response::new(Full::new(body.into()).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CertbotConfig, NginxConfig};
    use crate::logsource::DockerEndpoint;

    fn state(dir: &std::path::Path) -> Arc<PanelState> {
        let nginx = NginxConfig {
            binary: "true".to_string(),
            sites_dir: dir.join("sites"),
            streams_dir: dir.join("streams"),
            reload_on_change: false,
        };
        let certbot = CertbotConfig {
            live_dir: dir.join("live"),
            ..Default::default()
        };
        Arc::new(PanelState {
            docker: None,
            logs: LogSource::new(DockerEndpoint::Tcp("127.0.0.1:1".to_string()), 10),
            bridge: BridgeConfig::default(),
            proxy: ProxyConfigurator::new(&nginx, &certbot),
            certs: CertificateManager::new(&certbot),
            auth_token: "secret".to_string(),
        })
    }

    fn request(method: Method, uri: &str, body: &str, token: Option<&str>) -> Request<Full<Bytes>> {
        let mut req = Request::new(Full::new(Bytes::from(body.to_string())));
        *req.method_mut() = method;
        *req.uri_mut() = uri.parse().unwrap();
        if let Some(token) = token {
            req.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
            );
        }
        req
    }

    async fn body_json(response: Response<PanelBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_route_parsing() {
        assert_eq!(Route::parse(&Method::GET, "/"), Route::Dashboard);
        assert_eq!(Route::parse(&Method::GET, "/api/containers/"), Route::ListContainers);
        assert_eq!(
            Route::parse(&Method::GET, "/api/containers/web/logs"),
            Route::ContainerLogs("web")
        );
        assert_eq!(
            Route::parse(&Method::POST, "/api/containers/web/restart"),
            Route::Container("web", ContainerAction::Restart)
        );
        assert_eq!(
            Route::parse(&Method::DELETE, "/api/certificates/shop"),
            Route::DeleteCertificate("shop")
        );
        assert_eq!(Route::parse(&Method::PUT, "/api/sites"), Route::NotFound);
        assert_eq!(Route::parse(&Method::GET, "/api/containers/web/top"), Route::NotFound);
    }

    #[test]
    fn test_public_routes() {
        assert!(Route::Health.is_public());
        assert!(Route::Dashboard.is_public());
        assert!(!Route::ListSites.is_public());
        assert!(!Route::ContainerLogs("web").is_public());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(!constant_time_eq("", "secret"));
    }

    #[test]
    fn test_api_response() {
        let response: ApiResponse<String> = ApiResponse::ok("test".to_string());
        assert!(response.success);
        assert_eq!(response.data, Some("test".to_string()));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_auth_header_and_query_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let denied = Arc::clone(&state)
            .handle(request(Method::GET, "/api/sites", "", None))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let wrong = Arc::clone(&state)
            .handle(request(Method::GET, "/api/sites", "", Some("nope")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let header = Arc::clone(&state)
            .handle(request(Method::GET, "/api/sites", "", Some("secret")))
            .await
            .unwrap();
        assert_eq!(header.status(), StatusCode::OK);

        let query = Arc::clone(&state)
            .handle(request(Method::GET, "/api/sites?token=secret", "", None))
            .await
            .unwrap();
        assert_eq!(query.status(), StatusCode::OK);

        let health = state
            .handle(request(Method::GET, "/health", "", None))
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_site_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let site = r#"{"name":"blog","server_names":["blog.example.com"],"upstream":"127.0.0.1:2368"}"#;
        let response = Arc::clone(&state)
            .handle(request(Method::POST, "/api/sites", site, Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = Arc::clone(&state)
            .handle(request(Method::GET, "/api/sites/blog", "", Some("secret")))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["listen_port"], 80);

        let response = Arc::clone(&state)
            .handle(request(Method::DELETE, "/api/sites/blog", "", Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = state
            .handle(request(Method::GET, "/api/sites/blog", "", Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_json_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = state(dir.path())
            .handle(request(Method::POST, "/api/streams", "{", Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_engine_routes_without_engine() {
        let dir = tempfile::tempdir().unwrap();
        let response = state(dir.path())
            .handle(request(Method::GET, "/api/containers", "", Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_logs_fail_before_streaming_when_engine_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let response = state(dir.path())
            .handle(request(Method::GET, "/api/containers/web/logs?token=secret", "", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
