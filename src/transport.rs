//! Shared HTTP plumbing for the management and cluster API clients

use std::time::{Duration, Instant};

use tracing::debug;

use crate::Result;

/// Default per-request timeout for both endpoints
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Status code and body of a completed HTTP exchange
///
/// Clients never interpret status codes; the lifecycle decides what each
/// status means for each step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl ApiResponse {
    /// Create a response from a status and body
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the response carries exactly the given status
    pub fn is(&self, status: u16) -> bool {
        self.status == status
    }
}

/// Send a request and collect its status and body
///
/// `name` is the request name used in logs (e.g. `enrol`, `get_updates-2`).
pub(crate) async fn execute(
    name: &str,
    request: reqwest::RequestBuilder,
) -> Result<ApiResponse> {
    let started = Instant::now();
    let response = request.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;

    debug!(
        request = %name,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );

    Ok(ApiResponse { status, body })
}
