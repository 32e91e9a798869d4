//! Reverse-proxy site and stream-forward definitions
//!
//! Each definition is stored as the generated nginx `server` block
//! (`{name}.conf`) next to the form data it was rendered from
//! (`{name}.json`). The JSON sidecar is the source of truth for listing and
//! editing; the `.conf` file is what nginx includes.

use crate::error::ApiError;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Paths referenced from generated configuration
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// Certificate directory, one subdirectory per certificate
    pub cert_live_dir: PathBuf,
    /// Webroot for HTTP-01 challenges
    pub acme_webroot: PathBuf,
}

/// A definition that renders to one nginx configuration file
pub trait ProxyDefinition: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn name(&self) -> &str;
    fn validate(&self) -> Result<(), ApiError>;
    fn render(&self, ctx: &RenderContext) -> String;
}

/// HTTP(S) virtual host proxying to one upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteDefinition {
    pub name: String,
    pub server_names: Vec<String>,
    /// `http://host:port` or `host:port`
    pub upstream: String,
    #[serde(default = "default_http_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    /// Pass `Upgrade` headers through
    #[serde(default)]
    pub websocket: bool,
    /// nginx size, e.g. `10m`
    pub client_max_body_size: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Certificate name under the live directory
    pub certificate: String,
    #[serde(default = "default_https_port")]
    pub listen_port: u16,
    /// Redirect plain HTTP to HTTPS
    #[serde(default)]
    pub force_https: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    Tcp,
    Udp,
}

/// Layer-4 forward from a local port to `host:port`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub name: String,
    pub protocol: StreamProtocol,
    pub listen_port: u16,
    pub upstream: String,
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

impl SiteDefinition {
    fn upstream_url(&self) -> String {
        if self.upstream.contains("://") {
            self.upstream.clone()
        } else {
            format!("http://{}", self.upstream)
        }
    }

    fn write_proxy_location(&self, out: &mut String) {
        let _ = writeln!(out, "    location / {{");
        let _ = writeln!(out, "        proxy_pass {};", self.upstream_url());
        out.push_str("        proxy_http_version 1.1;\n");
        out.push_str("        proxy_set_header Host $host;\n");
        out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
        out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
        out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
        if self.websocket {
            out.push_str("        proxy_set_header Upgrade $http_upgrade;\n");
            out.push_str("        proxy_set_header Connection \"upgrade\";\n");
            out.push_str("        proxy_read_timeout 3600s;\n");
        }
        out.push_str("    }\n");
    }

    fn write_common(&self, out: &mut String) {
        let _ = writeln!(out, "    server_name {};", self.server_names.join(" "));
        if let Some(size) = &self.client_max_body_size {
            let _ = writeln!(out, "    client_max_body_size {};", size);
        }
    }
}

impl ProxyDefinition for SiteDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), ApiError> {
        validate_name(&self.name)?;
        if self.server_names.is_empty() {
            return Err(ApiError::BadRequest(
                "at least one server name is required".to_string(),
            ));
        }
        for server_name in &self.server_names {
            validate_server_name(server_name)?;
        }
        validate_token("upstream", &self.upstream)?;
        validate_port(self.listen_port)?;
        if let Some(size) = &self.client_max_body_size {
            let valid = !size.is_empty()
                && size.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']).chars().all(|c| c.is_ascii_digit());
            if !valid {
                return Err(ApiError::BadRequest(format!(
                    "Invalid client_max_body_size '{}'",
                    size
                )));
            }
        }
        if let Some(tls) = &self.tls {
            validate_name(&tls.certificate)?;
            validate_port(tls.listen_port)?;
            if tls.listen_port == self.listen_port {
                return Err(ApiError::BadRequest(
                    "HTTP and HTTPS listen ports must differ".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn render(&self, ctx: &RenderContext) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Managed by hostpanel: {}", self.name);

        out.push_str("server {\n");
        let _ = writeln!(out, "    listen {};", self.listen_port);
        let _ = writeln!(out, "    listen [::]:{};", self.listen_port);
        self.write_common(&mut out);
        out.push('\n');
        out.push_str("    location /.well-known/acme-challenge/ {\n");
        let _ = writeln!(out, "        root {};", ctx.acme_webroot.display());
        out.push_str("    }\n\n");
        match &self.tls {
            Some(tls) if tls.force_https => {
                out.push_str("    location / {\n");
                if tls.listen_port == 443 {
                    out.push_str("        return 301 https://$host$request_uri;\n");
                } else {
                    let _ = writeln!(
                        out,
                        "        return 301 https://$host:{}$request_uri;",
                        tls.listen_port
                    );
                }
                out.push_str("    }\n");
            }
            _ => self.write_proxy_location(&mut out),
        }
        out.push_str("}\n");

        if let Some(tls) = &self.tls {
            let cert_dir = ctx.cert_live_dir.join(&tls.certificate);
            out.push('\n');
            out.push_str("server {\n");
            let _ = writeln!(out, "    listen {} ssl;", tls.listen_port);
            let _ = writeln!(out, "    listen [::]:{} ssl;", tls.listen_port);
            self.write_common(&mut out);
            let _ = writeln!(
                out,
                "    ssl_certificate {};",
                cert_dir.join("fullchain.pem").display()
            );
            let _ = writeln!(
                out,
                "    ssl_certificate_key {};",
                cert_dir.join("privkey.pem").display()
            );
            out.push_str("    ssl_protocols TLSv1.2 TLSv1.3;\n\n");
            self.write_proxy_location(&mut out);
            out.push_str("}\n");
        }

        out
    }
}

impl ProxyDefinition for StreamDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), ApiError> {
        validate_name(&self.name)?;
        validate_port(self.listen_port)?;
        validate_token("upstream", &self.upstream)?;
        let port_ok = self
            .upstream
            .rsplit_once(':')
            .and_then(|(host, port)| (!host.is_empty()).then_some(port))
            .and_then(|port| port.parse::<u16>().ok())
            .is_some_and(|port| port > 0);
        if !port_ok || self.upstream.contains("://") {
            return Err(ApiError::BadRequest(format!(
                "Invalid stream upstream '{}': expected host:port",
                self.upstream
            )));
        }
        Ok(())
    }

    fn render(&self, _ctx: &RenderContext) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Managed by hostpanel: {}", self.name);
        out.push_str("server {\n");
        match self.protocol {
            StreamProtocol::Tcp => {
                let _ = writeln!(out, "    listen {};", self.listen_port);
                let _ = writeln!(out, "    proxy_pass {};", self.upstream);
                out.push_str("    proxy_connect_timeout 10s;\n");
            }
            StreamProtocol::Udp => {
                let _ = writeln!(out, "    listen {} udp;", self.listen_port);
                let _ = writeln!(out, "    proxy_pass {};", self.upstream);
                out.push_str("    proxy_timeout 30s;\n");
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Files of one definition as they were before a change
#[derive(Debug)]
pub struct Snapshot {
    name: String,
    conf: Option<String>,
    json: Option<String>,
}

/// Directory of `{name}.conf` + `{name}.json` pairs
pub struct ConfigStore<T> {
    dir: PathBuf,
    _definition: PhantomData<fn() -> T>,
}

impl<T: ProxyDefinition> ConfigStore<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _definition: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn conf_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.conf", name))
    }

    fn json_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// All definitions with a readable sidecar, sorted by name
    pub fn list(&self) -> anyhow::Result<Vec<T>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.dir.display()))
            }
        };

        let mut definitions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| serde_json::from_str::<T>(&content).map_err(Into::into))
            {
                Ok(definition) => definitions.push(definition),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable definition"),
            }
        }
        definitions.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(definitions)
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Option<T>> {
        let path = self.json_path(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Current files of `name`, for rolling back a change
    pub fn snapshot(&self, name: &str) -> anyhow::Result<Snapshot> {
        Ok(Snapshot {
            name: name.to_string(),
            conf: read_optional(&self.conf_path(name))?,
            json: read_optional(&self.json_path(name))?,
        })
    }

    /// Write the rendered config and sidecar of `definition`
    pub fn write(&self, definition: &T, ctx: &RenderContext) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let name = definition.name();
        let json = serde_json::to_string_pretty(definition)?;
        std::fs::write(self.conf_path(name), definition.render(ctx))
            .with_context(|| format!("Failed to write {}", self.conf_path(name).display()))?;
        std::fs::write(self.json_path(name), json)
            .with_context(|| format!("Failed to write {}", self.json_path(name).display()))?;
        debug!(name, dir = %self.dir.display(), "Wrote proxy definition");
        Ok(())
    }

    /// Remove both files; returns whether anything existed
    pub fn remove(&self, name: &str) -> anyhow::Result<bool> {
        let mut existed = false;
        for path in [self.conf_path(name), self.json_path(name)] {
            match std::fs::remove_file(&path) {
                Ok(()) => existed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
        }
        Ok(existed)
    }

    /// Put the files of `snapshot` back exactly as they were
    pub fn restore(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        for (path, content) in [
            (self.conf_path(&snapshot.name), &snapshot.conf),
            (self.json_path(&snapshot.name), &snapshot.json),
        ] {
            match content {
                Some(content) => std::fs::write(&path, content)?,
                None => match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }
}

fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Definition names become file names
pub fn validate_name(name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "Invalid name '{}': use lowercase letters, digits, '.', '_' or '-'",
            name
        )))
    }
}

/// Domain-like server name; `_` is the catch-all
fn validate_server_name(server_name: &str) -> Result<(), ApiError> {
    if server_name == "_" {
        return Ok(());
    }

    let invalid = |reason: &str| {
        ApiError::BadRequest(format!("Invalid server name '{}': {}", server_name, reason))
    };

    if server_name.is_empty() || server_name.len() > 253 {
        return Err(invalid("length must be 1-253"));
    }
    let valid_chars = server_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*');
    if !valid_chars {
        return Err(invalid("contains invalid characters"));
    }
    // Wildcard must be at the start
    if server_name.contains('*') && !server_name.starts_with("*.") {
        return Err(invalid("wildcard (*) must be at the start"));
    }
    if server_name[1..].contains('*') {
        return Err(invalid("only one wildcard is allowed"));
    }
    Ok(())
}

/// Values pasted into a directive must not break out of it
fn validate_token(field: &str, value: &str) -> Result<(), ApiError> {
    let valid = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"' | '\'' | '#'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("Invalid {} '{}'", field, value)))
    }
}

fn validate_port(port: u16) -> Result<(), ApiError> {
    if port == 0 {
        Err(ApiError::BadRequest("port must be non-zero".to_string()))
    } else {
        Ok(())
    }
}
