//! Cluster API client
//!
//! Operator-facing side of the simulation: approving signing requests,
//! labeling devices and creating workloads. Calls authenticate with a bearer
//! token and skip server certificate validation, as test clusters run with
//! self-signed API certificates.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};

use crate::config::ControlPlaneEndpoint;
use crate::messages::{approval_patch, edge_workload, label_patch};
use crate::transport::{execute, ApiResponse, DEFAULT_REQUEST_TIMEOUT};
use crate::{Error, Result};

/// API group and version of the Flotta resources
pub const FLOTTA_API: &str = "/apis/management.project-flotta.io/v1alpha1";

const MERGE_PATCH: &str = "application/merge-patch+json";

/// Operations against the cluster API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    /// Approve the device's pending signing request
    async fn approve(&self, device_id: &str) -> Result<ApiResponse>;

    /// Label the device resource with `label_key: device_id`
    async fn label(&self, device_id: &str, label_key: &str) -> Result<ApiResponse>;

    /// Create the device's workload at `index`
    async fn create_workload(
        &self,
        device_id: &str,
        index: u32,
        label_key: &str,
    ) -> Result<ApiResponse>;
}

/// HTTPS implementation of [`ControlPlaneApi`]
pub struct HttpControlPlaneClient {
    endpoint: ControlPlaneEndpoint,
    client: Client,
}

impl HttpControlPlaneClient {
    /// Build a client for the given cluster API endpoint
    pub fn new(endpoint: ControlPlaneEndpoint) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(true)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { endpoint, client })
    }

    /// URL of the namespaced Flotta resource collection `kind`
    pub fn resource_url(&self, kind: &str) -> String {
        format!(
            "{}{}/namespaces/{}/{}",
            self.endpoint.base_url(),
            FLOTTA_API,
            self.endpoint.namespace,
            kind
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.endpoint.bearer_token)
            .header(CACHE_CONTROL, "no-cache")
    }
}

#[async_trait]
impl ControlPlaneApi for HttpControlPlaneClient {
    async fn approve(&self, device_id: &str) -> Result<ApiResponse> {
        let url = format!("{}/{}", self.resource_url("edgedevicesignedrequest"), device_id);
        let body = serde_json::to_vec(&approval_patch())?;
        let request = self
            .authorized(self.client.patch(url))
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body);
        execute("approve", request).await
    }

    async fn label(&self, device_id: &str, label_key: &str) -> Result<ApiResponse> {
        let url = format!("{}/{}", self.resource_url("edgedevices"), device_id);
        let body = serde_json::to_vec(&label_patch(label_key, device_id))?;
        let request = self
            .authorized(self.client.patch(url))
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body);
        execute("label", request).await
    }

    async fn create_workload(
        &self,
        device_id: &str,
        index: u32,
        label_key: &str,
    ) -> Result<ApiResponse> {
        let workload = edge_workload(device_id, &self.endpoint.namespace, index, label_key);
        let request = self
            .authorized(self.client.post(self.resource_url("edgeworkloads")))
            .json(&workload);
        execute(&format!("create workload-{}", index), request).await
    }
}
