//! flotta-sim - edge device fleet simulator for the Flotta management plane
//!
//! Drives many simulated edge devices through the full Flotta device lifecycle
//! concurrently so that the management plane's behavior under load can be
//! measured.
//!
//! # Architecture
//!
//! Every simulated device runs its own lifecycle state machine:
//! - Enrol with the shared bootstrap identity (mTLS)
//! - Wait for the operator to approve the enrolment on the cluster API
//! - Register with a locally generated CSR and receive a signed certificate
//! - Label the device and create its workloads on the cluster API
//! - Poll for updates and send heartbeats with its own issued identity
//!
//! The driver runs the state machines as a structured task group and collects
//! one outcome per device. Devices never share mutable state.
//!
//! # Modules
//!
//! - [`config`] - Immutable simulation configuration
//! - [`identity`] - Per-device key material and credential selection
//! - [`pki`] - In-process CA and certificate inspection helpers
//! - [`messages`] - Management-plane and cluster-API wire bodies
//! - [`transport`] - Shared HTTP response type
//! - [`management`] - Device data-plane client (mTLS)
//! - [`control`] - Cluster API client (bearer token)
//! - [`device`] - Device record and lifecycle phases
//! - [`lifecycle`] - Per-device lifecycle state machine
//! - [`driver`] - Concurrent fleet driver
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod control;
pub mod device;
pub mod driver;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod management;
pub mod messages;
pub mod pki;
pub mod telemetry;
pub mod transport;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants mirror the behavior of real Flotta devices. Tests shrink
// the timings through config.

/// Label key used to bind workloads to a single device
pub const DEFAULT_LABEL_KEY: &str = "region";

/// Maximum number of registration attempts before a device gives up
pub const DEFAULT_MAX_REGISTER_ATTEMPTS: u32 = 9;

/// Number of update polls per steady-state iteration
pub const DEFAULT_POLLS_PER_ITERATION: u32 = 4;

/// Default management plane HTTPS port
pub const DEFAULT_MANAGEMENT_PORT: u16 = 8043;

/// Default cluster API port
pub const DEFAULT_CLUSTER_API_PORT: u16 = 6443;
