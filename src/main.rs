use hostpanel::api::{PanelServer, PanelState, PKG_NAME, VERSION};
use hostpanel::bridge::BridgeConfig;
use hostpanel::certs::CertificateManager;
use hostpanel::config::Config;
use hostpanel::docker::DockerManager;
use hostpanel::logsource::{DockerEndpoint, LogSource};
use hostpanel::nginx::ProxyConfigurator;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostpanel=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hostpanel.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let endpoint = DockerEndpoint::resolve(config.docker.host.as_deref())?;
    info!(endpoint = %endpoint, "Using container engine");

    // The panel still serves sites and certificates without an engine
    let docker = match DockerManager::new(&endpoint).await {
        Ok(manager) => Some(Arc::new(manager)),
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "Container engine unavailable, container routes will fail");
            None
        }
    };

    // Generate or use configured admin token
    let auth_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let state = Arc::new(PanelState {
        docker,
        logs: LogSource::new(endpoint, config.docker.log_tail),
        bridge: BridgeConfig {
            keepalive_interval: config.docker.keepalive_interval(),
        },
        proxy: ProxyConfigurator::new(&config.nginx, &config.certbot),
        certs: CertificateManager::new(&config.certbot),
        auth_token,
    });

    let panel_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = PanelServer::new(panel_addr, state, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Panel server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP re-checks the configuration file
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, validating configuration...");
                    match Config::load(&config_path) {
                        Ok(_) => info!("Configuration is valid; restart the panel to apply changes"),
                        Err(e) => error!(error = %e, "Configuration is invalid"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Open log streams end with their connections
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control panel");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        host = ?config.docker.host,
        log_tail = config.docker.log_tail,
        keepalive_secs = config.docker.keepalive_secs,
        "Container engine settings"
    );
    info!(
        binary = %config.nginx.binary,
        sites_dir = %config.nginx.sites_dir.display(),
        streams_dir = %config.nginx.streams_dir.display(),
        reload_on_change = config.nginx.reload_on_change,
        "nginx settings"
    );
    info!(
        binary = %config.certbot.binary,
        live_dir = %config.certbot.live_dir.display(),
        staging = config.certbot.staging,
        "Certificate settings"
    );
}
