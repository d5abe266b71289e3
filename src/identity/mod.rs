//! Device identity material
//!
//! A device talks to the management plane with one of two credentials:
//!
//! - the shared bootstrap bundle, before it has a certificate of its own
//! - its own issued certificate, for every call after registration
//!
//! Call sites pick one explicitly through [`Credential`]; nothing infers the
//! credential from ambient state.
//!
//! Key pairs and CSRs come from an [`IdentityProvider`]. The production
//! provider shells out to `openssl`; [`InProcessProvider`] uses `rcgen` and
//! needs no external tooling.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

use crate::pki::{CertificateAuthority, DeviceCsr};
use crate::{Error, Result};

/// Bootstrap CA file name inside the certificate directory
pub const BOOTSTRAP_CA_FILE: &str = "default_ca.pem";
/// Bootstrap client certificate file name
pub const BOOTSTRAP_CERT_FILE: &str = "default_cert.pem";
/// Bootstrap client key file name
pub const BOOTSTRAP_KEY_FILE: &str = "default_key.pem";
/// Key of the CA that signed a locally generated bootstrap bundle
pub const BOOTSTRAP_CA_KEY_FILE: &str = "default_ca_key.pem";

/// Layout of the certificate directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertsDir {
    root: PathBuf,
}

impl CertsDir {
    /// Wrap a directory path
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared bootstrap CA certificate
    pub fn bootstrap_ca(&self) -> PathBuf {
        self.root.join(BOOTSTRAP_CA_FILE)
    }

    /// Key of the bootstrap CA, present only for locally generated bundles
    pub fn bootstrap_ca_key(&self) -> PathBuf {
        self.root.join(BOOTSTRAP_CA_KEY_FILE)
    }

    /// Shared bootstrap client certificate
    pub fn bootstrap_cert(&self) -> PathBuf {
        self.root.join(BOOTSTRAP_CERT_FILE)
    }

    /// Shared bootstrap client key
    pub fn bootstrap_key(&self) -> PathBuf {
        self.root.join(BOOTSTRAP_KEY_FILE)
    }

    /// Device private key (`{id}.key`)
    pub fn device_key(&self, device_id: &str) -> PathBuf {
        self.root.join(format!("{}.key", device_id))
    }

    /// Device CSR (`{id}.csr`)
    pub fn device_csr(&self, device_id: &str) -> PathBuf {
        self.root.join(format!("{}.csr", device_id))
    }

    /// Device issued certificate (`{id}.pem`)
    pub fn device_cert(&self, device_id: &str) -> PathBuf {
        self.root.join(format!("{}.pem", device_id))
    }
}

/// Replace `$` line delimiters in a CSR PEM with real line breaks
pub fn normalize_csr_pem(raw: &str) -> String {
    raw.replace('$', "\n")
}

/// Key and CSR generated for one device
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    /// Path of the private key file
    pub key_path: PathBuf,
    /// Path of the CSR file
    pub csr_path: PathBuf,
    /// Private key PEM
    pub key_pem: String,
    /// CSR PEM, already normalized for transmission
    pub csr_pem: String,
}

/// Shared bootstrap bundle used for enrolment and registration
#[derive(Clone)]
pub struct BootstrapIdentity {
    /// CA certificate used to verify the management plane
    pub ca_pem: String,
    /// Bootstrap client certificate
    pub cert_pem: String,
    /// Bootstrap client key
    pub key_pem: String,
}

impl BootstrapIdentity {
    /// Read the bootstrap bundle from the certificate directory
    pub async fn load(certs: &CertsDir) -> Result<Self> {
        Ok(Self {
            ca_pem: read_pem(&certs.bootstrap_ca()).await?,
            cert_pem: read_pem(&certs.bootstrap_cert()).await?,
            key_pem: read_pem(&certs.bootstrap_key()).await?,
        })
    }
}

/// Load an existing CA from its certificate and key files
pub async fn load_ca(cert_path: &Path, key_path: &Path) -> Result<CertificateAuthority> {
    let cert_pem = read_pem(cert_path).await?;
    let key_pem = read_pem(key_path).await?;
    Ok(CertificateAuthority::from_pem(&cert_pem, &key_pem)?)
}

/// Issue a bootstrap client certificate from `ca` and write the bundle
///
/// The CA key is written next to the bundle so later bundles can be signed
/// by the same CA.
pub async fn write_bootstrap_bundle(
    certs: &CertsDir,
    ca: &CertificateAuthority,
    common_name: &str,
) -> Result<BootstrapIdentity> {
    tokio::fs::create_dir_all(certs.root()).await.map_err(|e| {
        Error::identity(format!("failed to create {}: {}", certs.root().display(), e))
    })?;

    let client = ca.issue_client_certificate(common_name)?;
    for (path, contents) in [
        (certs.bootstrap_ca(), ca.ca_cert_pem()),
        (certs.bootstrap_ca_key(), ca.ca_key_pem()),
        (certs.bootstrap_cert(), client.cert_pem.as_str()),
        (certs.bootstrap_key(), client.key_pem.as_str()),
    ] {
        tokio::fs::write(&path, contents).await.map_err(|e| {
            Error::identity(format!("failed to write {}: {}", path.display(), e))
        })?;
    }
    debug!(folder = %certs.root().display(), common_name, "Bootstrap bundle written");

    Ok(BootstrapIdentity {
        ca_pem: ca.ca_cert_pem().to_string(),
        cert_pem: client.cert_pem,
        key_pem: client.key_pem,
    })
}

impl std::fmt::Debug for BootstrapIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapIdentity").finish_non_exhaustive()
    }
}

/// A device's own certificate and key, issued at registration
#[derive(Clone)]
pub struct IssuedIdentity {
    /// Device the certificate was issued to
    pub device_id: String,
    /// Issued certificate PEM
    pub cert_pem: String,
    /// Device private key PEM
    pub key_pem: String,
}

impl IssuedIdentity {
    /// Store an issued certificate as `{id}.pem` next to the device key
    pub async fn persist(
        certs: &CertsDir,
        device_id: &str,
        cert_pem: &str,
        key: &KeyMaterial,
    ) -> Result<Self> {
        let path = certs.device_cert(device_id);
        tokio::fs::write(&path, cert_pem).await.map_err(|e| {
            Error::identity(format!("failed to write certificate {}: {}", path.display(), e))
        })?;

        Ok(Self {
            device_id: device_id.to_string(),
            cert_pem: cert_pem.to_string(),
            key_pem: key.key_pem.clone(),
        })
    }
}

impl std::fmt::Debug for IssuedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Credential presented on a management plane call
#[derive(Clone, Debug)]
pub enum Credential {
    /// The shared bootstrap bundle
    Bootstrap,
    /// The device's own issued identity
    Issued(IssuedIdentity),
}

impl Credential {
    /// Whether this is the shared bootstrap credential
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Credential::Bootstrap)
    }

    /// Device id of an issued credential
    pub fn issued_to(&self) -> Option<&str> {
        match self {
            Credential::Bootstrap => None,
            Credential::Issued(identity) => Some(&identity.device_id),
        }
    }
}

async fn read_pem(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::identity(format!("failed to read {}: {}", path.display(), e)))
}

/// Produces key material for a device
///
/// Generation failures are fatal for the device and never retried.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Generate a key pair and a CSR whose CN is the device id
    async fn generate(&self, device_id: &str) -> Result<KeyMaterial>;
}

// =============================================================================
// openssl
// =============================================================================

/// Identity provider that shells out to `openssl`
///
/// Runs `openssl ecparam` for a prime256v1 key, then `openssl req` for the
/// CSR, writing `{id}.key` and `{id}.csr` into the certificate directory.
pub struct OpensslProvider {
    certs: CertsDir,
    binary: String,
}

impl OpensslProvider {
    /// Create a provider using `openssl` from `PATH`
    pub fn new(certs: CertsDir) -> Self {
        Self {
            certs,
            binary: "openssl".to_string(),
        }
    }

    /// Use a specific openssl binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::identity(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::identity(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for OpensslProvider {
    async fn generate(&self, device_id: &str) -> Result<KeyMaterial> {
        let key_path = self.certs.device_key(device_id);
        let csr_path = self.certs.device_csr(device_id);
        let key_arg = key_path.to_string_lossy().to_string();
        let csr_arg = csr_path.to_string_lossy().to_string();
        let subject = format!("/CN={}", device_id);

        debug!(device_id = %device_id, "Generating key and CSR with openssl");

        self.run(&[
            "ecparam", "-name", "prime256v1", "-genkey", "-noout", "-out", &key_arg,
        ])
        .await?;
        self.run(&[
            "req", "-new", "-subj", &subject, "-key", &key_arg, "-out", &csr_arg,
        ])
        .await?;

        // A zero exit status is not proof the files exist.
        let key_pem = read_pem(&key_path).await?;
        let csr_pem = normalize_csr_pem(&read_pem(&csr_path).await?);

        Ok(KeyMaterial {
            key_path,
            csr_path,
            key_pem,
            csr_pem,
        })
    }
}

// =============================================================================
// In-process
// =============================================================================

/// Identity provider backed by `rcgen`
pub struct InProcessProvider {
    certs: CertsDir,
}

impl InProcessProvider {
    /// Create a provider writing into the given directory
    pub fn new(certs: CertsDir) -> Self {
        Self { certs }
    }
}

#[async_trait]
impl IdentityProvider for InProcessProvider {
    async fn generate(&self, device_id: &str) -> Result<KeyMaterial> {
        let request = DeviceCsr::generate(device_id)?;

        let key_path = self.certs.device_key(device_id);
        let csr_path = self.certs.device_csr(device_id);
        tokio::fs::write(&key_path, request.private_key_pem()).await?;
        tokio::fs::write(&csr_path, request.csr_pem()).await?;

        Ok(KeyMaterial {
            key_path,
            csr_path,
            key_pem: request.private_key_pem().to_string(),
            csr_pem: normalize_csr_pem(request.csr_pem()),
        })
    }
}
