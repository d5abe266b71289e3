//! Management plane client
//!
//! Device-facing data channel. Every call is mutual TLS with a credential the
//! caller selects explicitly: the shared bootstrap bundle before registration,
//! the device's issued identity after.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::header::CONNECTION;
use reqwest::{Certificate, Client, Identity};
use tracing::trace;

use crate::config::ManagementEndpoint;
use crate::identity::{BootstrapIdentity, Credential, IssuedIdentity};
use crate::messages::{DataMessage, EnrolmentInfo, HeartbeatInfo, RegistrationInfo};
use crate::transport::{execute, ApiResponse, DEFAULT_REQUEST_TIMEOUT};
use crate::{Error, Result};

/// Path prefix of the device data API
pub const DATA_API_PREFIX: &str = "/api/flotta-management/v1/data";

/// Direction of a data call, seen from the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device to management plane (`/out`)
    Out,
    /// Management plane to device (`/in`)
    In,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Out => "out",
            Direction::In => "in",
        }
    }
}

/// Data API URL for a device and direction
pub fn data_url(endpoint: &ManagementEndpoint, device_id: &str, direction: Direction) -> String {
    format!(
        "{}{}/{}/{}",
        endpoint.base_url(),
        DATA_API_PREFIX,
        device_id,
        direction.as_str()
    )
}

/// Operations against the management plane
///
/// Implementations return the raw status and body; the lifecycle decides
/// which statuses are fatal, retryable, or ignored.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Send the enrolment message
    async fn enrol(
        &self,
        device_id: &str,
        credential: &Credential,
        message: &DataMessage<EnrolmentInfo>,
    ) -> Result<ApiResponse>;

    /// Send the registration message carrying the CSR
    async fn register(
        &self,
        device_id: &str,
        credential: &Credential,
        message: &DataMessage<RegistrationInfo>,
    ) -> Result<ApiResponse>;

    /// Poll for updates; `poll_index` names the poll within its iteration
    async fn get_updates(
        &self,
        device_id: &str,
        credential: &Credential,
        poll_index: u32,
    ) -> Result<ApiResponse>;

    /// Send a heartbeat
    async fn send_heartbeat(
        &self,
        device_id: &str,
        credential: &Credential,
        message: &DataMessage<HeartbeatInfo>,
    ) -> Result<ApiResponse>;
}

/// HTTPS implementation of [`ManagementApi`]
///
/// One pooled client carries the bootstrap identity for every device.
/// Issued identities get a fresh client per call with idle pooling off, so
/// own-identity calls never reuse a connection, matching agents that poll
/// from behind flaky links.
pub struct HttpManagementClient {
    endpoint: ManagementEndpoint,
    bootstrap: BootstrapIdentity,
    bootstrap_client: Client,
}

impl HttpManagementClient {
    /// Build a client for the given endpoint and bootstrap bundle
    pub fn new(endpoint: ManagementEndpoint, bootstrap: BootstrapIdentity) -> Result<Self> {
        let bootstrap_client = mtls_client(
            &bootstrap.ca_pem,
            &bootstrap.cert_pem,
            &bootstrap.key_pem,
            true,
        )?;
        Ok(Self {
            endpoint,
            bootstrap,
            bootstrap_client,
        })
    }

    fn issued_client(&self, identity: &IssuedIdentity) -> Result<Client> {
        mtls_client(
            &self.bootstrap.ca_pem,
            &identity.cert_pem,
            &identity.key_pem,
            false,
        )
    }

    fn client_for(&self, credential: &Credential) -> Result<Client> {
        match credential {
            Credential::Bootstrap => Ok(self.bootstrap_client.clone()),
            Credential::Issued(identity) => self.issued_client(identity),
        }
    }
}

fn mtls_client(ca_pem: &str, cert_pem: &str, key_pem: &str, pooled: bool) -> Result<Client> {
    let ca = Certificate::from_pem(ca_pem.as_bytes())
        .map_err(|e| Error::http(format!("invalid CA certificate: {}", e)))?;

    let mut bundle = String::with_capacity(cert_pem.len() + key_pem.len() + 1);
    bundle.push_str(cert_pem);
    if !cert_pem.ends_with('\n') {
        bundle.push('\n');
    }
    bundle.push_str(key_pem);
    let identity = Identity::from_pem(bundle.as_bytes())
        .map_err(|e| Error::http(format!("invalid client identity: {}", e)))?;

    let mut builder = Client::builder()
        .use_rustls_tls()
        .add_root_certificate(ca)
        .identity(identity)
        .timeout(DEFAULT_REQUEST_TIMEOUT);
    if !pooled {
        builder = builder.pool_max_idle_per_host(0);
    }

    builder
        .build()
        .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))
}

#[async_trait]
impl ManagementApi for HttpManagementClient {
    async fn enrol(
        &self,
        device_id: &str,
        credential: &Credential,
        message: &DataMessage<EnrolmentInfo>,
    ) -> Result<ApiResponse> {
        let url = data_url(&self.endpoint, device_id, Direction::Out);
        trace!(device_id = %device_id, url = %url, "Sending enrolment");
        let request = self.client_for(credential)?.post(url).json(message);
        execute("enrol", request).await
    }

    async fn register(
        &self,
        device_id: &str,
        credential: &Credential,
        message: &DataMessage<RegistrationInfo>,
    ) -> Result<ApiResponse> {
        let url = data_url(&self.endpoint, device_id, Direction::Out);
        let request = self.client_for(credential)?.post(url).json(message);
        execute("register", request).await
    }

    async fn get_updates(
        &self,
        device_id: &str,
        credential: &Credential,
        poll_index: u32,
    ) -> Result<ApiResponse> {
        let url = data_url(&self.endpoint, device_id, Direction::In);
        let request = self
            .client_for(credential)?
            .get(url)
            .header(CONNECTION, "close");
        execute(&format!("get_updates-{}", poll_index), request).await
    }

    async fn send_heartbeat(
        &self,
        device_id: &str,
        credential: &Credential,
        message: &DataMessage<HeartbeatInfo>,
    ) -> Result<ApiResponse> {
        let url = data_url(&self.endpoint, device_id, Direction::Out);
        let request = self
            .client_for(credential)?
            .post(url)
            .header(CONNECTION, "close")
            .json(message);
        execute("heartbeat", request).await
    }
}
