//! Fleet simulator integration tests
//!
//! # Test Organization
//!
//! - `lifecycle_scenarios`: Stories about a single device meeting a slow or
//!   failing control plane (pending registration, slow approval, failures
//!   that must stop the device early)
//!
//! - `steady_state`: Stories about what a provisioned device sends once it
//!   has its own certificate
//!
//! - `concurrency`: Stories about many devices running at once without
//!   touching each other's identity material

mod helpers;
mod lifecycle_scenarios;
mod steady_state;
