//! Per-device lifecycle state machine
//!
//! One [`DeviceLifecycle`] drives one simulated device through
//! enrolment, approval, registration, labeling, workload creation and the
//! steady-state poll/heartbeat loop. Each step requires the success flag of
//! the step before it; the first fatal error stops the device and is
//! reported in its [`DeviceOutcome`].
//!
//! Approval and registration retry with different policies on purpose.
//! Approval waits on an external operator and retries any non-200 without
//! bound (unless a cap is configured). Registration only retries 404, the
//! "not provisioned yet" answer, and gives up after a fixed number of
//! attempts.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SimConfig;
use crate::control::ControlPlaneApi;
use crate::device::{Device, Phase};
use crate::identity::{CertsDir, Credential, IdentityProvider, IssuedIdentity};
use crate::management::ManagementApi;
use crate::messages::{
    DataMessage, EnrolmentInfo, HeartbeatInfo, RegistrationInfo, RegistrationResponse,
};
use crate::transport::ApiResponse;
use crate::{Error, Result};

/// External collaborators shared by every lifecycle in a run
#[derive(Clone)]
pub struct Backends {
    /// Management plane client
    pub management: Arc<dyn ManagementApi>,
    /// Cluster API client
    pub control_plane: Arc<dyn ControlPlaneApi>,
    /// Key and CSR generator
    pub identity: Arc<dyn IdentityProvider>,
}

/// How a device's lifecycle ended
#[derive(Debug)]
pub enum OutcomeStatus {
    /// Reached `Done`
    Succeeded,
    /// Stopped while attempting `phase`
    Failed {
        /// Phase the device was trying to reach
        phase: Phase,
        /// Error that stopped it
        error: Error,
    },
}

/// Terminal report of one device
#[derive(Debug)]
pub struct DeviceOutcome {
    /// Device id
    pub device_id: String,
    /// Registration attempts made
    pub register_attempts: u32,
    /// Approval attempts made
    pub approve_attempts: u32,
    /// Phases the device went through, in order
    pub phase_history: Vec<Phase>,
    /// Success or failure
    pub status: OutcomeStatus,
}

impl DeviceOutcome {
    /// Whether the device reached `Done`
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Succeeded)
    }

    /// Phase the device failed to reach, if it failed
    pub fn failed_phase(&self) -> Option<Phase> {
        match &self.status {
            OutcomeStatus::Succeeded => None,
            OutcomeStatus::Failed { phase, .. } => Some(*phase),
        }
    }

    /// Error that stopped the device, if it failed
    pub fn error(&self) -> Option<&Error> {
        match &self.status {
            OutcomeStatus::Succeeded => None,
            OutcomeStatus::Failed { error, .. } => Some(error),
        }
    }
}

/// State machine for one simulated device
pub struct DeviceLifecycle {
    device: Device,
    config: Arc<SimConfig>,
    backends: Backends,
    cancel: CancellationToken,
    certs: CertsDir,
    issued: Option<IssuedIdentity>,
}

impl DeviceLifecycle {
    /// Create a lifecycle for `device`
    pub fn with_device(
        device: Device,
        config: Arc<SimConfig>,
        backends: Backends,
        cancel: CancellationToken,
    ) -> Self {
        let certs = CertsDir::new(&config.certs_dir);
        Self {
            device,
            config,
            backends,
            cancel,
            certs,
            issued: None,
        }
    }

    /// Run the device to completion or to its first fatal error
    pub async fn run(mut self) -> DeviceOutcome {
        let span = info_span!("device", device_id = %self.device.device_id);
        let result = self.drive().instrument(span.clone()).await;

        let status = match result {
            Ok(()) => OutcomeStatus::Succeeded,
            Err(error) => {
                let phase = self.device.phase().next().unwrap_or(Phase::Done);
                span.in_scope(|| {
                    if matches!(error, Error::Cancelled) {
                        info!(phase = %phase, "Device cancelled");
                    } else {
                        error!(
                            phase = %phase,
                            status = ?error.status(),
                            error = %error,
                            "Device failed"
                        );
                    }
                });
                OutcomeStatus::Failed { phase, error }
            }
        };

        DeviceOutcome {
            device_id: self.device.device_id.clone(),
            register_attempts: self.device.register_attempts,
            approve_attempts: self.device.approve_attempts,
            phase_history: self.device.phase_history().to_vec(),
            status,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.enrol().await?;
        self.advance(Phase::Enrolled)?;

        self.approve().await?;
        self.advance(Phase::Approved)?;

        self.register().await?;
        self.advance(Phase::Registered)?;

        self.label().await?;
        self.advance(Phase::Labeled)?;

        self.create_workloads().await?;
        self.advance(Phase::WorkloadsCreated)?;

        self.enter_steady_state().await?;
        self.advance(Phase::SteadyState)?;

        self.run_steady_state().await?;
        self.finish()?;
        self.advance(Phase::Done)
    }

    fn advance(&mut self, to: Phase) -> Result<()> {
        self.device.advance_to(to)?;
        debug!(phase = %to, "Phase reached");
        Ok(())
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    async fn enrol(&mut self) -> Result<()> {
        let device_id = self.device.device_id.clone();
        let message =
            EnrolmentInfo::message(&self.config.control_plane.namespace, &self.device.hardware);

        let response = self
            .backends
            .management
            .enrol(&device_id, &Credential::Bootstrap, &message)
            .await?;
        if !response.is(200) {
            return Err(Error::unexpected_status("enrol", &device_id, 200, &response));
        }

        self.device.enrolled = true;
        info!("Device enrolled");
        Ok(())
    }

    async fn approve(&mut self) -> Result<()> {
        let device_id = self.device.device_id.clone();
        if !self.device.enrolled {
            return Err(Error::precondition("approve", &device_id));
        }
        let cap = self.config.retry_limits.approve_max_attempts;

        loop {
            self.device.approve_attempts += 1;
            let attempt = self.device.approve_attempts;

            match self.backends.control_plane.approve(&device_id).await {
                Ok(response) if response.is(200) => {
                    info!(attempts = attempt, "Enrolment approved");
                    return Ok(());
                }
                Ok(response) => warn!(
                    attempt,
                    status = response.status,
                    "Approval not accepted yet"
                ),
                Err(e) => warn!(attempt, error = %e, "Approval request failed"),
            }

            if let Some(max) = cap {
                if attempt >= max {
                    return Err(Error::ApprovalNotGranted {
                        device_id,
                        attempts: attempt,
                    });
                }
            }
            self.pause(self.backoff_delay()).await?;
        }
    }

    async fn register(&mut self) -> Result<()> {
        let device_id = self.device.device_id.clone();
        if !self.device.enrolled {
            return Err(Error::precondition("register", &device_id));
        }

        let material = self.backends.identity.generate(&device_id).await?;
        let message = RegistrationInfo::message(&material.csr_pem, &self.device.hardware);

        let (attempts, result) = self.send_register_request(&device_id, &message).await;
        self.device.register_attempts = attempts;
        let response = result?;
        if !response.is(200) {
            return Err(Error::unexpected_status(
                "register",
                &device_id,
                200,
                &response,
            ));
        }

        let certificate = RegistrationResponse::certificate_from(&response.body)?;
        let issued =
            IssuedIdentity::persist(&self.certs, &device_id, &certificate, &material).await?;

        self.issued = Some(issued);
        self.device.registered = true;
        info!(attempts, "Device registered");
        Ok(())
    }

    /// Send the registration until something other than 404 comes back
    ///
    /// Returns the number of HTTP attempts made alongside the result, so the
    /// counter is owned by the caller rather than by the client.
    async fn send_register_request(
        &self,
        device_id: &str,
        message: &DataMessage<RegistrationInfo>,
    ) -> (u32, Result<ApiResponse>) {
        let max = self.config.retry_limits.max_register_attempts;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let response = match self
                .backends
                .management
                .register(device_id, &Credential::Bootstrap, message)
                .await
            {
                Ok(response) => response,
                Err(e) => return (attempts, Err(e)),
            };

            if !response.is(404) {
                return (attempts, Ok(response));
            }
            if attempts >= max {
                return (
                    attempts,
                    Err(Error::RetryBoundExceeded {
                        device_id: device_id.to_string(),
                        attempts,
                    }),
                );
            }

            debug!(attempt = attempts, max, "Registration not visible yet, retrying");
            if let Err(e) = self.pause(self.backoff_delay()).await {
                return (attempts, Err(e));
            }
        }
    }

    async fn label(&mut self) -> Result<()> {
        let device_id = self.device.device_id.clone();
        if !self.device.registered {
            return Err(Error::precondition("label", &device_id));
        }

        let response = self
            .backends
            .control_plane
            .label(&device_id, &self.config.label_key)
            .await?;
        if !response.is(200) {
            return Err(Error::unexpected_status("label", &device_id, 200, &response));
        }

        debug!(label_key = %self.config.label_key, "Device labeled");
        Ok(())
    }

    // Partially created workloads are left in place on failure.
    async fn create_workloads(&mut self) -> Result<()> {
        let device_id = self.device.device_id.clone();
        if !self.device.registered {
            return Err(Error::precondition("create_workload", &device_id));
        }

        for index in 0..self.config.workload_count {
            let response = self
                .backends
                .control_plane
                .create_workload(&device_id, index, &self.config.label_key)
                .await?;
            if !response.is(201) {
                return Err(Error::unexpected_status(
                    "create_workload",
                    &device_id,
                    201,
                    &response,
                ));
            }
        }

        debug!(count = self.config.workload_count, "Workloads created");
        Ok(())
    }

    // =========================================================================
    // Steady state
    // =========================================================================

    /// Own credential of a registered device
    fn issued_credential(&self) -> Result<Credential> {
        match (&self.issued, self.device.registered) {
            (Some(issued), true) => Ok(Credential::Issued(issued.clone())),
            _ => Err(Error::precondition("steady_state", &self.device.device_id)),
        }
    }

    async fn enter_steady_state(&mut self) -> Result<()> {
        self.issued_credential()?;
        self.pause(self.config.timings.settle_delay).await
    }

    async fn run_steady_state(&mut self) -> Result<()> {
        let device_id = self.device.device_id.clone();
        let credential = self.issued_credential()?;

        for iteration in 0..self.config.iteration_count {
            debug!(iteration, "Steady-state iteration");
            self.get_updates(&device_id, &credential).await?;
            self.send_heartbeat(&device_id, &credential).await;
        }
        Ok(())
    }

    /// Poll for updates; only cancellation is an error here
    async fn get_updates(&self, device_id: &str, credential: &Credential) -> Result<()> {
        for poll in 0..self.config.timings.polls_per_iteration {
            if poll > 0 {
                self.pause(self.config.timings.poll_spacing).await?;
            }
            match self
                .backends
                .management
                .get_updates(device_id, credential, poll)
                .await
            {
                Ok(response) if response.is(200) => {}
                Ok(response) => debug!(poll, status = response.status, "Update poll not OK"),
                Err(e) => debug!(poll, error = %e, "Update poll failed"),
            }
        }
        Ok(())
    }

    async fn send_heartbeat(&self, device_id: &str, credential: &Credential) {
        let message: DataMessage<HeartbeatInfo> = HeartbeatInfo::message(device_id);
        match self
            .backends
            .management
            .send_heartbeat(device_id, credential, &message)
            .await
        {
            Ok(response) if response.is(200) => {}
            Ok(response) => debug!(status = response.status, "Heartbeat not accepted"),
            Err(e) => debug!(error = %e, "Heartbeat failed"),
        }
    }

    /// Recheck the registration counter against its bound
    fn finish(&self) -> Result<()> {
        let max = self.config.retry_limits.max_register_attempts;
        if self.device.register_attempts > max {
            return Err(Error::RetryBoundExceeded {
                device_id: self.device.device_id.clone(),
                attempts: self.device.register_attempts,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Sleep unless the run is cancelled first
    async fn pause(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn backoff_delay(&self) -> Duration {
        let timings = &self.config.timings;
        if timings.backoff_min >= timings.backoff_max {
            return timings.backoff_min;
        }
        rand::thread_rng().gen_range(timings.backoff_min..=timings.backoff_max)
    }
}
