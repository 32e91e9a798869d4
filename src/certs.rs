//! TLS certificates: listing, issuance through certbot, self-signed fallback

use crate::config::CertbotConfig;
use crate::error::ApiError;
use crate::sites::validate_name;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Marker file written next to self-signed certificates
const SELF_SIGNED_MARKER: &str = ".self-signed";

/// Certificate found in the live directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificateInfo {
    pub name: String,
    pub domains: Vec<String>,
    pub issuer: String,
    pub not_after: DateTime<Utc>,
    pub days_remaining: i64,
    pub self_signed: bool,
    pub cert_path: String,
    pub key_path: String,
}

/// Form data for a new certificate
#[derive(Debug, Clone, Deserialize)]
pub struct IssueRequest {
    pub domains: Vec<String>,
    /// Defaults to the first domain
    pub name: Option<String>,
    /// Overrides the configured contact email
    pub email: Option<String>,
    /// Generate locally instead of asking the certificate authority
    #[serde(default)]
    pub self_signed: bool,
}

impl IssueRequest {
    fn cert_name(&self) -> Result<String, ApiError> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => self
                .domains
                .first()
                .map(|d| d.trim_start_matches("*.").to_lowercase())
                .ok_or_else(|| ApiError::BadRequest("at least one domain is required".to_string()))?,
        };
        validate_name(&name)?;
        Ok(name)
    }
}

pub struct CertificateManager {
    binary: String,
    live_dir: PathBuf,
    webroot: PathBuf,
    email: Option<String>,
    staging: bool,
}

impl CertificateManager {
    pub fn new(config: &CertbotConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            live_dir: config.live_dir.clone(),
            webroot: config.webroot.clone(),
            email: config.email.clone(),
            staging: config.staging,
        }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    /// Every readable certificate, sorted by name
    pub fn list(&self) -> anyhow::Result<Vec<CertificateInfo>> {
        let entries = match std::fs::read_dir(&self.live_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.live_dir.display()))
            }
        };

        let mut certs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.read_certificate(&name) {
                Ok(Some(info)) => certs.push(info),
                Ok(None) => {}
                Err(e) => warn!(name = %name, error = %e, "Skipping unreadable certificate"),
            }
        }
        certs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(certs)
    }

    fn read_certificate(&self, name: &str) -> anyhow::Result<Option<CertificateInfo>> {
        let dir = self.live_dir.join(name);
        let cert_path = dir.join("cert.pem");
        if !cert_path.exists() {
            return Ok(None);
        }

        let pem_bytes = std::fs::read(&cert_path)
            .with_context(|| format!("Failed to read {}", cert_path.display()))?;
        let (_, pem) = x509_parser::pem::parse_x509_pem(&pem_bytes).context("Failed to parse PEM")?;
        let cert = pem.parse_x509().context("Failed to parse X509")?;

        let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .context("Certificate expiry out of range")?;
        let days_remaining = (not_after - Utc::now()).num_days();

        let mut domains = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                    domains.push(dns.to_string());
                }
            }
        }
        if domains.is_empty() {
            if let Some(cn) = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
            {
                domains.push(cn.to_string());
            }
        }

        Ok(Some(CertificateInfo {
            name: name.to_string(),
            domains,
            issuer: cert.issuer().to_string(),
            not_after,
            days_remaining,
            self_signed: dir.join(SELF_SIGNED_MARKER).exists(),
            cert_path: dir.join("fullchain.pem").to_string_lossy().to_string(),
            key_path: dir.join("privkey.pem").to_string_lossy().to_string(),
        }))
    }

    /// Obtain a certificate; returns its name
    pub async fn issue(&self, request: &IssueRequest) -> Result<String, ApiError> {
        let name = request.cert_name()?;
        if request.domains.is_empty() {
            return Err(ApiError::BadRequest(
                "at least one domain is required".to_string(),
            ));
        }
        for domain in &request.domains {
            validate_domain(domain)?;
        }

        if request.self_signed {
            self.generate_self_signed(&name, &request.domains)?;
            info!(name = %name, domains = ?request.domains, "Generated self-signed certificate");
            return Ok(name);
        }

        let email = request
            .email
            .clone()
            .or_else(|| self.email.clone())
            .ok_or_else(|| {
                ApiError::BadRequest("an email is required to request a certificate".to_string())
            })?;

        let args = self.issue_args(&name, &request.domains, &email);
        info!(name = %name, domains = ?request.domains, staging = self.staging, "Requesting certificate");
        self.run(&args).await?;
        info!(name = %name, "Certificate issued");
        Ok(name)
    }

    fn issue_args(&self, name: &str, domains: &[String], email: &str) -> Vec<String> {
        let mut args = vec![
            "certonly".to_string(),
            "--webroot".to_string(),
            "-w".to_string(),
            self.webroot.to_string_lossy().to_string(),
        ];
        for domain in domains {
            args.push("-d".to_string());
            args.push(domain.clone());
        }
        args.extend([
            "--cert-name".to_string(),
            name.to_string(),
            "--non-interactive".to_string(),
            "--agree-tos".to_string(),
            "-m".to_string(),
            email.to_string(),
        ]);
        if self.staging {
            args.push("--staging".to_string());
        }
        args
    }

    pub async fn delete(&self, name: &str) -> Result<(), ApiError> {
        validate_name(name)?;
        let dir = self.live_dir.join(name);
        if !dir.exists() {
            return Err(ApiError::NotFound(format!("No such certificate: {}", name)));
        }

        if dir.join(SELF_SIGNED_MARKER).exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        } else {
            let args = [
                "delete".to_string(),
                "--cert-name".to_string(),
                name.to_string(),
                "--non-interactive".to_string(),
            ];
            self.run(&args).await?;
        }
        info!(name = %name, "Deleted certificate");
        Ok(())
    }

    fn generate_self_signed(&self, name: &str, domains: &[String]) -> Result<(), ApiError> {
        use rcgen::{generate_simple_self_signed, CertifiedKey};

        let dir = self.live_dir.join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(domains.to_vec())
            .context("Failed to generate certificate")?;

        let cert_pem = cert.pem();
        std::fs::write(dir.join("cert.pem"), &cert_pem).context("Failed to write certificate")?;
        std::fs::write(dir.join("fullchain.pem"), &cert_pem)
            .context("Failed to write certificate chain")?;
        let key_path = dir.join("privkey.pem");
        std::fs::write(&key_path, key_pair.serialize_pem()).context("Failed to write private key")?;
        std::fs::write(dir.join(SELF_SIGNED_MARKER), "").context("Failed to write marker")?;

        // Set restrictive permissions on key file
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict private key permissions")?;
        }

        Ok(())
    }

    async fn run(&self, args: &[String]) -> Result<(), ApiError> {
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

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        Err(ApiError::CommandFailed(format!(
            "certbot {} failed: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            detail.trim()
        )))
    }
}

/// Hostname check; wildcards only as a leading `*.`
fn validate_domain(domain: &str) -> Result<(), ApiError> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*')
        && (!domain.contains('*') || (domain.starts_with("*.") && !domain[1..].contains('*')));
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("Invalid domain '{}'", domain)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> CertificateManager {
        CertificateManager::new(&CertbotConfig {
            live_dir: dir.to_path_buf(),
            email: Some("ops@example.com".to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_self_signed_issue_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let certs = manager(dir.path());
        assert!(certs.list().unwrap().is_empty());

        let request = IssueRequest {
            domains: vec!["panel.example.com".to_string(), "www.panel.example.com".to_string()],
            name: None,
            email: None,
            self_signed: true,
        };
        let name = certs.issue(&request).await.unwrap();
        assert_eq!(name, "panel.example.com");

        let listed = certs.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].self_signed);
        assert!(listed[0].domains.contains(&"www.panel.example.com".to_string()));
        assert!(listed[0].days_remaining > 0);
        assert!(listed[0].cert_path.ends_with("panel.example.com/fullchain.pem"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("panel.example.com/privkey.pem"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        certs.delete("panel.example.com").await.unwrap();
        assert!(certs.list().unwrap().is_empty());
        assert!(matches!(
            certs.delete("panel.example.com").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn test_issue_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut certs = manager(dir.path());
        certs.staging = true;

        let args = certs.issue_args(
            "shop",
            &["shop.example.com".to_string(), "www.shop.example.com".to_string()],
            "ops@example.com",
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("certonly --webroot -w /var/www/certbot"));
        assert!(joined.contains("-d shop.example.com -d www.shop.example.com"));
        assert!(joined.contains("--cert-name shop"));
        assert!(joined.contains("-m ops@example.com"));
        assert!(joined.ends_with("--staging"));
    }

    #[test]
    fn test_cert_name_defaults_to_first_domain() {
        let request = IssueRequest {
            domains: vec!["*.Example.com".to_string()],
            name: None,
            email: None,
            self_signed: false,
        };
        assert_eq!(request.cert_name().unwrap(), "example.com");
    }

    #[tokio::test]
    async fn test_issue_validates_input() {
        let dir = tempfile::tempdir().unwrap();
        let certs = manager(dir.path());

        let bad = IssueRequest {
            domains: vec!["bad domain.com".to_string()],
            name: Some("bad".to_string()),
            email: None,
            self_signed: true,
        };
        assert!(matches!(certs.issue(&bad).await, Err(ApiError::BadRequest(_))));

        let empty = IssueRequest {
            domains: vec![],
            name: None,
            email: None,
            self_signed: true,
        };
        assert!(matches!(certs.issue(&empty).await, Err(ApiError::BadRequest(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_certbot_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let certs = CertificateManager::new(&CertbotConfig {
            binary: "false".to_string(),
            live_dir: dir.path().to_path_buf(),
            email: Some("ops@example.com".to_string()),
            ..Default::default()
        });
        let request = IssueRequest {
            domains: vec!["shop.example.com".to_string()],
            name: None,
            email: None,
            self_signed: false,
        };
        assert!(matches!(
            certs.issue(&request).await,
            Err(ApiError::CommandFailed(_))
        ));
    }
}
