use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the control panel
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Container engine settings
    #[serde(default)]
    pub docker: DockerConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub nginx: NginxConfig,

    /// Certificate issuance settings
    #[serde(default)]
    pub certbot: CertbotConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Panel port (default: 8088)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Token required for every API call.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Engine endpoint, `unix:///path` or `tcp://host:port`.
    /// Falls back to DOCKER_HOST, then the default local socket
    pub host: Option<String>,

    /// Number of prior log lines sent before following (default: 200)
    #[serde(default = "default_log_tail")]
    pub log_tail: u32,

    /// Seconds between keep-alive comments on log streams (default: 15)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            log_tail: default_log_tail(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl DockerConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    /// nginx executable (default: nginx, resolved through PATH)
    #[serde(default = "default_nginx_binary")]
    pub binary: String,

    /// Directory holding generated `server` blocks for HTTP sites
    #[serde(default = "default_sites_dir")]
    pub sites_dir: PathBuf,

    /// Directory holding generated `server` blocks for TCP/UDP forwards,
    /// included from the `stream {}` context
    #[serde(default = "default_streams_dir")]
    pub streams_dir: PathBuf,

    /// Reload nginx after every successful change (default: true)
    #[serde(default = "default_true")]
    pub reload_on_change: bool,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            binary: default_nginx_binary(),
            sites_dir: default_sites_dir(),
            streams_dir: default_streams_dir(),
            reload_on_change: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertbotConfig {
    /// certbot executable (default: certbot)
    #[serde(default = "default_certbot_binary")]
    pub binary: String,

    /// Directory with one subdirectory per certificate
    #[serde(default = "default_live_dir")]
    pub live_dir: PathBuf,

    /// Webroot served for HTTP-01 challenges
    #[serde(default = "default_webroot")]
    pub webroot: PathBuf,

    /// Contact email for the certificate authority
    pub email: Option<String>,

    /// Use the staging environment of the certificate authority
    #[serde(default)]
    pub staging: bool,
}

impl Default for CertbotConfig {
    fn default() -> Self {
        Self {
            binary: default_certbot_binary(),
            live_dir: default_live_dir(),
            webroot: default_webroot(),
            email: None,
            staging: false,
        }
    }
}

fn default_listen_port() -> u16 {
    8088
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_log_tail() -> u32 {
    200
}

fn default_keepalive_secs() -> u64 {
    15
}

fn default_nginx_binary() -> String {
    "nginx".to_string()
}

fn default_sites_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d")
}

fn default_streams_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/streams.d")
}

fn default_certbot_binary() -> String {
    "certbot".to_string()
}

fn default_live_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_webroot() -> PathBuf {
    PathBuf::from("/var/www/certbot")
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.docker.keepalive_secs == 0 {
            errors.push("docker.keepalive_secs must be at least 1".to_string());
        }
        if let Some(host) = &self.docker.host {
            if let Err(e) = crate::logsource::DockerEndpoint::parse(host) {
                errors.push(e.to_string());
            }
        }
        if self.nginx.sites_dir == self.nginx.streams_dir {
            errors.push("nginx.sites_dir and nginx.streams_dir must differ".to_string());
        }
        if let Some(token) = &self.server.admin_token {
            if token.trim().is_empty() {
                errors.push("server.admin_token must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9000
bind = "0.0.0.0"
admin_token = "secret"

[docker]
host = "unix:///run/docker.sock"
log_tail = 50

[nginx]
sites_dir = "/tmp/sites"
streams_dir = "/tmp/streams"
reload_on_change = false

[certbot]
email = "ops@example.com"
staging = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.docker.log_tail, 50);
        assert_eq!(config.docker.keepalive_secs, 15);
        assert!(!config.nginx.reload_on_change);
        assert_eq!(config.nginx.binary, "nginx");
        assert!(config.certbot.staging);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.docker.log_tail, 200);
        assert_eq!(config.docker.keepalive_interval(), Duration::from_secs(15));
        assert_eq!(config.nginx.sites_dir, PathBuf::from("/etc/nginx/conf.d"));
        assert_eq!(config.certbot.live_dir, PathBuf::from("/etc/letsencrypt/live"));
        assert!(config.nginx.reload_on_change);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.docker.host = Some("docker.sock".to_string());
        config.docker.keepalive_secs = 0;
        config.nginx.streams_dir = config.nginx.sites_dir.clone();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("keepalive_secs"));
        assert!(err.contains("Invalid docker host format"));
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostpanel.toml");
        std::fs::write(&path, "[server]\nport = 7000\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 7000);
    }
}
