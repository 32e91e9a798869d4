//! nginx process control and transactional configuration changes

use crate::config::{CertbotConfig, NginxConfig};
use crate::error::ApiError;
use crate::sites::{ConfigStore, ProxyDefinition, RenderContext, SiteDefinition, StreamDefinition};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Runs the nginx binary
#[derive(Debug, Clone)]
pub struct NginxController {
    binary: String,
}

impl NginxController {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `nginx -t`; returns nginx's report on success
    pub async fn test(&self) -> Result<String, ApiError> {
        let (success, output) = self.run(&["-t"]).await?;
        if success {
            debug!(output = %output, "nginx configuration test passed");
            Ok(output)
        } else {
            Err(ApiError::ProxyConfigInvalid(output))
        }
    }

    /// `nginx -s reload`
    pub async fn reload(&self) -> Result<(), ApiError> {
        let (success, output) = self.run(&["-s", "reload"]).await?;
        if success {
            info!("nginx reloaded");
            Ok(())
        } else {
            Err(ApiError::CommandFailed(format!(
                "nginx reload failed: {}",
                output
            )))
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(bool, String), ApiError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                ApiError::CommandFailed(format!("Failed to run '{}': {}", self.binary, e))
            })?;

        // nginx reports on stderr
        let mut report = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            if !report.is_empty() {
                report.push('\n');
            }
            report.push_str(stdout.trim());
        }
        Ok((output.status.success(), report))
    }
}

/// Applies site and stream changes: write, `nginx -t`, reload or roll back
pub struct ProxyConfigurator {
    nginx: NginxController,
    sites: ConfigStore<SiteDefinition>,
    streams: ConfigStore<StreamDefinition>,
    ctx: RenderContext,
    reload_on_change: bool,
    /// Serializes write-test-reload so rollbacks never interleave
    changes: Mutex<()>,
}

impl ProxyConfigurator {
    pub fn new(nginx: &NginxConfig, certbot: &CertbotConfig) -> Self {
        Self {
            nginx: NginxController::new(nginx.binary.clone()),
            sites: ConfigStore::new(nginx.sites_dir.clone()),
            streams: ConfigStore::new(nginx.streams_dir.clone()),
            ctx: RenderContext {
                cert_live_dir: certbot.live_dir.clone(),
                acme_webroot: certbot.webroot.clone(),
            },
            reload_on_change: nginx.reload_on_change,
            changes: Mutex::new(()),
        }
    }

    pub fn controller(&self) -> &NginxController {
        &self.nginx
    }

    pub fn sites(&self) -> &ConfigStore<SiteDefinition> {
        &self.sites
    }

    pub fn streams(&self) -> &ConfigStore<StreamDefinition> {
        &self.streams
    }

    pub fn render_context(&self) -> &RenderContext {
        &self.ctx
    }

    pub async fn apply_site(&self, site: &SiteDefinition) -> Result<(), ApiError> {
        self.apply(&self.sites, site).await
    }

    pub async fn remove_site(&self, name: &str) -> Result<(), ApiError> {
        self.remove(&self.sites, name).await
    }

    pub async fn apply_stream(&self, stream: &StreamDefinition) -> Result<(), ApiError> {
        self.apply(&self.streams, stream).await
    }

    pub async fn remove_stream(&self, name: &str) -> Result<(), ApiError> {
        self.remove(&self.streams, name).await
    }

    async fn apply<T: ProxyDefinition>(
        &self,
        store: &ConfigStore<T>,
        definition: &T,
    ) -> Result<(), ApiError> {
        definition.validate()?;
        let _guard = self.changes.lock().await;

        let snapshot = store.snapshot(definition.name())?;
        store.write(definition, &self.ctx)?;
        self.commit(store, &snapshot).await?;

        info!(name = definition.name(), dir = %store.dir().display(), "Applied proxy definition");
        Ok(())
    }

    async fn remove<T: ProxyDefinition>(
        &self,
        store: &ConfigStore<T>,
        name: &str,
    ) -> Result<(), ApiError> {
        crate::sites::validate_name(name)?;
        let _guard = self.changes.lock().await;

        let snapshot = store.snapshot(name)?;
        if !store.remove(name)? {
            return Err(ApiError::NotFound(format!("No such definition: {}", name)));
        }
        self.commit(store, &snapshot).await?;

        info!(name, dir = %store.dir().display(), "Removed proxy definition");
        Ok(())
    }

    /// Test the new configuration; restore `snapshot` if nginx rejects it
    async fn commit<T: ProxyDefinition>(
        &self,
        store: &ConfigStore<T>,
        snapshot: &crate::sites::Snapshot,
    ) -> Result<(), ApiError> {
        if let Err(e) = self.nginx.test().await {
            warn!(error = %e, "nginx rejected configuration, rolling back");
            if let Err(restore_err) = store.restore(snapshot) {
                warn!(error = %restore_err, "Failed to roll back proxy definition");
            }
            return Err(e);
        }

        if self.reload_on_change {
            self.nginx.reload().await?;
        }
        Ok(())
    }
}
