//! Container, network and volume management through the Docker API

use crate::error::ApiError;
use crate::logsource::DockerEndpoint;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, HostConfig, Network, PortBinding, RestartPolicy,
    RestartPolicyNameEnum, Volume,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds the engine waits for a graceful stop before killing
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Form data for a new container
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateContainerRequest {
    pub image: String,
    pub name: Option<String>,
    /// `KEY=value` entries
    #[serde(default)]
    pub env: Vec<String>,
    /// `[ip:]host:container[/tcp|/udp]` mappings
    #[serde(default)]
    pub ports: Vec<String>,
    /// `volume-or-path:/container/path[:ro]` binds
    #[serde(default)]
    pub volumes: Vec<String>,
    pub network: Option<String>,
    /// `no`, `always`, `unless-stopped` or `on-failure`
    pub restart: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    /// Pull the image before creating (default: only when missing)
    #[serde(default)]
    pub pull: bool,
    /// Start after creating (default: true)
    #[serde(default = "default_true")]
    pub start: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub driver: Option<String>,
    #[serde(default)]
    pub internal: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub driver: Option<String>,
}

/// Row of the container table
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: Vec<String>,
}

impl From<ContainerSummary> for ContainerInfo {
    fn from(summary: ContainerSummary) -> Self {
        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let ports = summary
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| match p.public_port {
                Some(public) => format!(
                    "{}:{}->{}",
                    p.ip.unwrap_or_else(|| "0.0.0.0".to_string()),
                    public,
                    p.private_port
                ),
                None => p.private_port.to_string(),
            })
            .collect();

        Self {
            id: summary.id.unwrap_or_default(),
            name,
            image: summary.image.unwrap_or_default(),
            state: summary.state.unwrap_or_default(),
            status: summary.status.unwrap_or_default(),
            ports,
        }
    }
}

/// Manages containers, networks and volumes on the local engine
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Connect to the engine and verify it responds
    pub async fn new(endpoint: &DockerEndpoint) -> anyhow::Result<Self> {
        let client = Self::connect(endpoint)?;

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon at {} is not responding: {}. \
                 Ensure dockerd is running and the panel can access its socket.",
                endpoint,
                e
            )
        })?;

        debug!(%endpoint, "Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect(endpoint: &DockerEndpoint) -> anyhow::Result<Docker> {
        match endpoint {
            DockerEndpoint::Unix(path) => {
                let socket_path = path.to_string_lossy();
                Docker::connect_with_socket(&socket_path, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| {
                        anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e)
                    })
            }
            DockerEndpoint::Tcp(addr) => {
                let url = format!("tcp://{}", addr);
                Docker::connect_with_http(&url, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", url, e))
            }
        }
    }

    // ==================== Containers ====================

    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>, ApiError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.client.list_containers(Some(options)).await?;
        Ok(containers.into_iter().map(ContainerInfo::from).collect())
    }

    pub async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, ApiError> {
        Ok(self.client.inspect_container(id, None).await?)
    }

    /// Create (and by default start) a container; returns its id
    pub async fn create_container(&self, request: &CreateContainerRequest) -> Result<String, ApiError> {
        if request.image.trim().is_empty() {
            return Err(ApiError::BadRequest("image is required".to_string()));
        }

        self.pull_image(&request.image, request.pull).await?;

        let config = container_config(request)?;
        let options = request.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self.client.create_container(options, config).await?;
        for warning in &response.warnings {
            warn!(container_id = %response.id, %warning, "Container created with warning");
        }
        info!(
            container_id = %response.id,
            image = %request.image,
            name = ?request.name,
            "Created container"
        );

        if request.start {
            self.start_container(&response.id).await?;
        }

        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), ApiError> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container_id = id, "Started container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn stop_container(&self, id: &str) -> Result<(), ApiError> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container_id = id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn restart_container(&self, id: &str) -> Result<(), ApiError> {
        self.client.restart_container(id, None).await?;
        info!(container_id = id, "Restarted container");
        Ok(())
    }

    pub async fn remove_container(&self, id: &str) -> Result<(), ApiError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.client.remove_container(id, Some(options)).await?;
        info!(container_id = id, "Removed container");
        Ok(())
    }

    /// Pull `image` when forced or when it is not present locally
    async fn pull_image(&self, image: &str, force: bool) -> Result<(), ApiError> {
        if !force && self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(ApiError::Engine(format!(
                            "Failed to pull image '{}': {}",
                            image, error
                        )));
                    }
                    if let Some(status) = progress.status {
                        debug!(image, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    let err_str = e.to_string();
                    if err_str.contains("manifest unknown") || err_str.contains("not found") {
                        return Err(ApiError::NotFound(format!(
                            "Image '{}' not found in registry. Check the image name and tag.",
                            image
                        )));
                    }
                    return Err(ApiError::Engine(format!(
                        "Failed to pull image '{}': {}",
                        image, e
                    )));
                }
            }
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    // ==================== Networks ====================

    pub async fn list_networks(&self) -> Result<Vec<Network>, ApiError> {
        Ok(self
            .client
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?)
    }

    pub async fn create_network(&self, request: &CreateNetworkRequest) -> Result<(), ApiError> {
        validate_resource_name(&request.name)?;

        let options = CreateNetworkOptions {
            name: request.name.clone(),
            driver: request.driver.clone().unwrap_or_else(|| "bridge".to_string()),
            internal: request.internal,
            ..Default::default()
        };
        self.client.create_network(options).await?;
        info!(network = %request.name, "Created network");
        Ok(())
    }

    pub async fn remove_network(&self, name: &str) -> Result<(), ApiError> {
        self.client.remove_network(name).await?;
        info!(network = name, "Removed network");
        Ok(())
    }

    // ==================== Volumes ====================

    pub async fn list_volumes(&self) -> Result<Vec<Volume>, ApiError> {
        let response = self
            .client
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await?;
        Ok(response.volumes.unwrap_or_default())
    }

    pub async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, ApiError> {
        validate_resource_name(&request.name)?;

        let options = CreateVolumeOptions {
            name: request.name.clone(),
            driver: request.driver.clone().unwrap_or_else(|| "local".to_string()),
            ..Default::default()
        };
        let volume = self.client.create_volume(options).await?;
        info!(volume = %request.name, "Created volume");
        Ok(volume)
    }

    pub async fn remove_volume(&self, name: &str) -> Result<(), ApiError> {
        self.client
            .remove_volume(name, Some(RemoveVolumeOptions { force: false }))
            .await?;
        info!(volume = name, "Removed volume");
        Ok(())
    }
}

/// Build the engine's create-container body from form data
fn container_config(request: &CreateContainerRequest) -> Result<Config<String>, ApiError> {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    for mapping in &request.ports {
        let (key, binding) = parse_port_mapping(mapping)?;
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings
            .entry(key)
            .or_insert(None)
            .get_or_insert_with(Vec::new)
            .push(binding);
    }

    for entry in &request.env {
        if !entry.contains('=') {
            return Err(ApiError::BadRequest(format!(
                "Invalid environment entry '{}': expected KEY=value",
                entry
            )));
        }
    }

    let mut host_config = HostConfig {
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        binds: (!request.volumes.is_empty()).then(|| request.volumes.clone()),
        network_mode: request.network.clone(),
        restart_policy: request
            .restart
            .as_deref()
            .map(parse_restart_policy)
            .transpose()?,
        ..Default::default()
    };

    if let Some(ref memory) = request.memory {
        host_config.memory = Some(
            parse_memory_limit(memory).map_err(|e| ApiError::BadRequest(e.to_string()))?,
        );
    }
    if let Some(ref cpus) = request.cpus {
        let cpu_count: f64 = cpus
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("Invalid CPU limit: {}", cpus)))?;
        // NanoCPUs is CPUs * 1e9
        host_config.nano_cpus = Some((cpu_count * 1_000_000_000.0) as i64);
    }

    Ok(Config {
        image: Some(request.image.clone()),
        cmd: (!request.command.is_empty()).then(|| request.command.clone()),
        env: (!request.env.is_empty()).then(|| request.env.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Parse `[ip:]host:container[/proto]` into the engine's port key and binding
fn parse_port_mapping(mapping: &str) -> Result<(String, PortBinding), ApiError> {
    let invalid = || {
        ApiError::BadRequest(format!(
            "Invalid port mapping '{}': expected [ip:]host:container[/tcp|/udp]",
            mapping
        ))
    };

    let (ports, proto) = match mapping.trim().split_once('/') {
        Some((ports, proto)) if proto == "tcp" || proto == "udp" => (ports, proto),
        Some(_) => return Err(invalid()),
        None => (mapping.trim(), "tcp"),
    };

    let parts: Vec<&str> = ports.split(':').collect();
    let (host_ip, host_port, container_port) = match parts.as_slice() {
        [host, container] => (None, *host, *container),
        [ip, host, container] => (Some(ip.to_string()), *host, *container),
        _ => return Err(invalid()),
    };

    let container_port: u16 = container_port.parse().map_err(|_| invalid())?;
    let host_port: u16 = host_port.parse().map_err(|_| invalid())?;
    if container_port == 0 {
        return Err(invalid());
    }

    let binding = PortBinding {
        host_ip,
        host_port: Some(host_port.to_string()),
    };
    Ok((format!("{}/{}", container_port, proto), binding))
}

fn parse_restart_policy(policy: &str) -> Result<RestartPolicy, ApiError> {
    let name = match policy {
        "" | "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        other => {
            return Err(ApiError::BadRequest(format!(
                "Invalid restart policy '{}'",
                other
            )))
        }
    };
    Ok(RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    })
}

/// Engine object names: alphanumerics, `.`, `_` and `-`, not starting with a separator
fn validate_resource_name(name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("Invalid name '{}'", name)))
    }
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches('g');
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches('m');
        (num, 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches('k');
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}

/// Wrapper to share DockerManager across tasks
pub type SharedDockerManager = Arc<DockerManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256mb").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1048576);
        assert!(parse_memory_limit("invalid").is_err());
    }

    #[test]
    fn test_parse_port_mapping() {
        let (key, binding) = parse_port_mapping("8080:80").unwrap();
        assert_eq!(key, "80/tcp");
        assert_eq!(binding.host_port.as_deref(), Some("8080"));
        assert_eq!(binding.host_ip, None);

        let (key, binding) = parse_port_mapping("127.0.0.1:5353:53/udp").unwrap();
        assert_eq!(key, "53/udp");
        assert_eq!(binding.host_ip.as_deref(), Some("127.0.0.1"));

        assert!(parse_port_mapping("80").is_err());
        assert!(parse_port_mapping("8080:80/sctp").is_err());
        assert!(parse_port_mapping("a:b").is_err());
    }

    #[test]
    fn test_parse_restart_policy() {
        assert_eq!(
            parse_restart_policy("unless-stopped").unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert!(parse_restart_policy("sometimes").is_err());
    }

    #[test]
    fn test_container_config_from_form() {
        let request: CreateContainerRequest = serde_json::from_value(serde_json::json!({
            "image": "nginx:alpine",
            "name": "web",
            "env": ["MODE=prod"],
            "ports": ["8080:80", "8443:443"],
            "volumes": ["site-data:/usr/share/nginx/html:ro"],
            "network": "frontend",
            "restart": "always",
            "memory": "256m"
        }))
        .unwrap();
        assert!(request.start);

        let config = container_config(&request).unwrap();
        assert_eq!(config.image.as_deref(), Some("nginx:alpine"));
        let exposed = config.exposed_ports.unwrap();
        assert!(exposed.contains_key("80/tcp"));
        assert!(exposed.contains_key("443/tcp"));

        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("frontend"));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.binds.unwrap().len(), 1);
        let bindings = host.port_bindings.unwrap();
        assert_eq!(
            bindings["80/tcp"].as_ref().unwrap()[0].host_port.as_deref(),
            Some("8080")
        );
    }

    #[test]
    fn test_container_config_rejects_bad_env() {
        let request = CreateContainerRequest {
            image: "alpine".to_string(),
            env: vec!["NOVALUE".to_string()],
            ..Default::default()
        };
        assert!(matches!(container_config(&request), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_validate_resource_name() {
        assert!(validate_resource_name("backend_net-1").is_ok());
        assert!(validate_resource_name("").is_err());
        assert!(validate_resource_name("-lead").is_err());
        assert!(validate_resource_name("bad name").is_err());
    }

    #[test]
    fn test_container_info_from_summary() {
        let summary = ContainerSummary {
            id: Some("abc123".to_string()),
            names: Some(vec!["/web".to_string()]),
            image: Some("nginx".to_string()),
            state: Some("running".to_string()),
            status: Some("Up 2 minutes".to_string()),
            ..Default::default()
        };
        let info = ContainerInfo::from(summary);
        assert_eq!(info.name, "web");
        assert_eq!(info.state, "running");
        assert!(info.ports.is_empty());
    }
}
