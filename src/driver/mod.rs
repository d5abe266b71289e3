//! Fleet driver
//!
//! Runs many device lifecycles concurrently inside one `JoinSet` and waits
//! for every one of them to reach a terminal state. Devices share nothing
//! mutable: each task owns its lifecycle, and only the configuration and
//! backend clients are shared behind `Arc`s.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SimConfig;
use crate::device::{Device, Phase};
use crate::lifecycle::{Backends, DeviceLifecycle, DeviceOutcome, OutcomeStatus};
use crate::{Error, Result};

/// How many devices to run and how fast to start them
#[derive(Clone, Debug, PartialEq)]
pub struct DriverConfig {
    /// Devices to simulate
    pub device_count: usize,
    /// Devices started per second; `None` starts them all at once
    pub spawn_rate: Option<f64>,
    /// Upper bound on devices running at the same time
    pub max_concurrent: Option<usize>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            spawn_rate: None,
            max_concurrent: None,
        }
    }
}

impl DriverConfig {
    /// Delay between two device launches
    ///
    /// `None` when launches are not paced, or when the rate is too small for
    /// its interval to be represented. [`DriverConfig::validate`] rejects the
    /// latter.
    pub fn spawn_interval(&self) -> Option<Duration> {
        match self.spawn_rate {
            Some(rate) if rate.is_finite() && rate > 0.0 => {
                Duration::try_from_secs_f64(1.0 / rate).ok()
            }
            _ => None,
        }
    }

    /// Reject settings the driver cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == Some(0) {
            return Err(Error::config("max_concurrent must be at least 1"));
        }
        if let Some(rate) = self.spawn_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(Error::config(format!(
                    "spawn rate must be a positive number, got {}",
                    rate
                )));
            }
            if self.spawn_interval().is_none() {
                return Err(Error::config(format!(
                    "spawn rate {} is too small to pace launches",
                    rate
                )));
            }
        }
        Ok(())
    }
}

/// Aggregated outcome of a fleet run
#[derive(Debug, Default)]
pub struct FleetReport {
    /// Terminal outcome of every device that finished its task
    pub outcomes: Vec<DeviceOutcome>,
    /// Ids of devices whose task panicked; counted as failures
    pub panicked: Vec<String>,
}

impl FleetReport {
    /// Devices launched
    pub fn total(&self) -> usize {
        self.outcomes.len() + self.panicked.len()
    }

    /// Devices that reached `Done`
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Devices that failed, panicked tasks included
    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    /// Whether every launched device succeeded
    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    /// Failure count per phase the devices failed to reach
    pub fn failures_by_phase(&self) -> BTreeMap<Phase, usize> {
        let mut failures = BTreeMap::new();
        for phase in self.outcomes.iter().filter_map(DeviceOutcome::failed_phase) {
            *failures.entry(phase).or_insert(0) += 1;
        }
        failures
    }

    /// Highest registration attempt count seen across devices
    pub fn max_register_attempts(&self) -> u32 {
        self.outcomes
            .iter()
            .map(|o| o.register_attempts)
            .max()
            .unwrap_or(0)
    }

    /// Log totals and one line per failed device
    pub fn log_summary(&self) {
        for device_id in &self.panicked {
            warn!(device_id = %device_id, "Device task panicked");
        }
        for outcome in &self.outcomes {
            if let OutcomeStatus::Failed { phase, error } = &outcome.status {
                warn!(
                    device_id = %outcome.device_id,
                    phase = %phase,
                    status = ?error.status(),
                    error = %error,
                    "Device failed"
                );
            }
        }

        let by_phase: Vec<String> = self
            .failures_by_phase()
            .iter()
            .map(|(phase, count)| format!("{}={}", phase, count))
            .collect();

        info!(
            total = self.total(),
            succeeded = self.succeeded(),
            failed = self.failed(),
            panicked = self.panicked.len(),
            max_register_attempts = self.max_register_attempts(),
            failures_by_phase = %by_phase.join(","),
            "Fleet run finished"
        );
    }
}

/// Launches device lifecycles and collects their outcomes
pub struct FleetDriver {
    config: Arc<SimConfig>,
    driver: DriverConfig,
    backends: Backends,
    cancellation_token: CancellationToken,
}

impl FleetDriver {
    /// Create a driver
    pub fn new(config: SimConfig, driver: DriverConfig, backends: Backends) -> Self {
        Self {
            config: Arc::new(config),
            driver,
            backends,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Use an external cancellation token
    ///
    /// Cancelling it stops new launches, and in-flight devices stop at their
    /// next wait.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Token that cancels this run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Run every device to a terminal state
    pub async fn run(self) -> FleetReport {
        let token = self.cancellation_token;
        let interval = self.driver.spawn_interval();
        let semaphore = self
            .driver
            .max_concurrent
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        let mut tasks = JoinSet::new();
        let mut launched = HashMap::new();

        info!(
            devices = self.driver.device_count,
            spawn_rate = ?self.driver.spawn_rate,
            max_concurrent = ?self.driver.max_concurrent,
            "Starting fleet"
        );

        for index in 0..self.driver.device_count {
            if index > 0 {
                if let Some(interval) = interval {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }

            let permit = match &semaphore {
                Some(semaphore) => tokio::select! {
                    _ = token.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                },
                None => None,
            };
            if token.is_cancelled() || (semaphore.is_some() && permit.is_none()) {
                info!(launched = index, "Run cancelled, no further devices launched");
                break;
            }

            let device = Device::new();
            let device_id = device.device_id.clone();
            let lifecycle = DeviceLifecycle::with_device(
                device,
                self.config.clone(),
                self.backends.clone(),
                token.child_token(),
            );
            let handle = tasks.spawn(async move {
                let _permit = permit;
                lifecycle.run().await
            });
            launched.insert(handle.id(), device_id);
        }

        let mut report = FleetReport::default();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    launched.remove(&id);
                    report.outcomes.push(outcome);
                }
                Err(e) => {
                    let device_id = launched
                        .remove(&e.id())
                        .unwrap_or_else(|| "unknown".to_string());
                    error!(device_id = %device_id, error = %e, "Device task panicked");
                    report.panicked.push(device_id);
                }
            }
        }
        report
    }
}
