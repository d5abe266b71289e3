//! Simulation configuration
//!
//! The core consumes a single immutable [`SimConfig`] shared by every device
//! through an `Arc`. Nothing in the library reads command lines or
//! environment variables; the binary binds those to this record.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::{
    Error, Result, DEFAULT_CLUSTER_API_PORT, DEFAULT_LABEL_KEY, DEFAULT_MANAGEMENT_PORT,
    DEFAULT_MAX_REGISTER_ATTEMPTS, DEFAULT_POLLS_PER_ITERATION,
};

/// Device-facing management plane endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagementEndpoint {
    /// Host name of the Flotta HTTPS server
    pub host: String,
    /// Port of the Flotta HTTPS server
    pub port: u16,
}

impl ManagementEndpoint {
    /// Base URL (`https://host:port`)
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

impl Default for ManagementEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_MANAGEMENT_PORT,
        }
    }
}

/// Operator-facing cluster API endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct ControlPlaneEndpoint {
    /// Host name of the cluster API server
    pub host: String,
    /// Port of the cluster API server
    pub port: u16,
    /// Bearer token for cluster API calls
    pub bearer_token: String,
    /// Namespace holding the edge device resources
    pub namespace: String,
}

impl ControlPlaneEndpoint {
    /// Base URL (`https://host:port`)
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

impl Default for ControlPlaneEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_CLUSTER_API_PORT,
            bearer_token: String::new(),
            namespace: "default".to_string(),
        }
    }
}

// The token must never end up in logs.
impl fmt::Debug for ControlPlaneEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlaneEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("bearer_token", &"<redacted>")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Delays used by the lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleTimings {
    /// Lower bound of the random sleep between approve/register attempts
    pub backoff_min: Duration,
    /// Upper bound of the random sleep between approve/register attempts
    pub backoff_max: Duration,
    /// Spacing between update polls within one iteration
    pub poll_spacing: Duration,
    /// Wait before the first poll after provisioning
    pub settle_delay: Duration,
    /// Update polls per steady-state iteration
    pub polls_per_iteration: u32,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_secs(30),
            backoff_max: Duration::from_secs(45),
            poll_spacing: Duration::from_secs(15),
            settle_delay: Duration::from_secs(5),
            polls_per_iteration: DEFAULT_POLLS_PER_ITERATION,
        }
    }
}

impl LifecycleTimings {
    /// Timings scaled down for tests and dry runs
    pub fn fast() -> Self {
        Self {
            backoff_min: Duration::from_millis(1),
            backoff_max: Duration::from_millis(3),
            poll_spacing: Duration::from_millis(1),
            settle_delay: Duration::from_millis(1),
            polls_per_iteration: DEFAULT_POLLS_PER_ITERATION,
        }
    }
}

/// Bounds on the two retry loops
///
/// Registration is always bounded. Approval is unbounded unless a cap is set:
/// it waits on an external operator and is expected to succeed eventually.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryLimits {
    /// Maximum registration attempts (including the first)
    pub max_register_attempts: u32,
    /// Optional cap on approval attempts; `None` retries forever
    pub approve_max_attempts: Option<u32>,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_register_attempts: DEFAULT_MAX_REGISTER_ATTEMPTS,
            approve_max_attempts: None,
        }
    }
}

/// Immutable configuration shared by every simulated device
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Directory holding the bootstrap bundle and per-device key material
    pub certs_dir: PathBuf,
    /// Management plane endpoint
    pub management: ManagementEndpoint,
    /// Cluster API endpoint
    pub control_plane: ControlPlaneEndpoint,
    /// Workloads created per device
    pub workload_count: u32,
    /// Steady-state iterations per device
    pub iteration_count: u32,
    /// Label key binding workloads to devices
    pub label_key: String,
    /// Lifecycle delays
    pub timings: LifecycleTimings,
    /// Retry bounds
    pub retry_limits: RetryLimits,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            certs_dir: PathBuf::from("certs"),
            management: ManagementEndpoint::default(),
            control_plane: ControlPlaneEndpoint::default(),
            workload_count: 1,
            iteration_count: 1,
            label_key: DEFAULT_LABEL_KEY.to_string(),
            timings: LifecycleTimings::default(),
            retry_limits: RetryLimits::default(),
        }
    }
}

impl SimConfig {
    /// Check the configuration for values the lifecycle cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.management.host.is_empty() {
            return Err(Error::config("management host must not be empty"));
        }
        if self.management.port == 0 {
            return Err(Error::config("management port must not be 0"));
        }
        if self.control_plane.host.is_empty() {
            return Err(Error::config("cluster API host must not be empty"));
        }
        if self.control_plane.port == 0 {
            return Err(Error::config("cluster API port must not be 0"));
        }
        if self.control_plane.namespace.is_empty() {
            return Err(Error::config("target namespace must not be empty"));
        }
        if self.label_key.is_empty() {
            return Err(Error::config("label key must not be empty"));
        }
        if self.timings.backoff_min > self.timings.backoff_max {
            return Err(Error::config(format!(
                "backoff range is inverted: {:?} > {:?}",
                self.timings.backoff_min, self.timings.backoff_max
            )));
        }
        if self.retry_limits.max_register_attempts == 0 {
            return Err(Error::config("max register attempts must be at least 1"));
        }
        if self.retry_limits.approve_max_attempts == Some(0) {
            return Err(Error::config("approve attempt cap must be at least 1"));
        }
        Ok(())
    }
}
