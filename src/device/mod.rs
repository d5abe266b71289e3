//! Simulated device record and lifecycle phases

use std::fmt;

use rand::Rng;
use uuid::Uuid;

use crate::{Error, Result};

/// Lifecycle phase of a simulated device
///
/// Phases are ordered; a device only ever moves to the next one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Nothing sent yet
    Start,
    /// Enrolment accepted by the management plane
    Enrolled,
    /// Enrolment approved on the cluster API
    Approved,
    /// Certificate issued and stored
    Registered,
    /// Device labeled on the cluster API
    Labeled,
    /// All workloads created
    WorkloadsCreated,
    /// Polling for updates and sending heartbeats
    SteadyState,
    /// Lifecycle finished
    Done,
}

impl Phase {
    /// Every phase in lifecycle order
    pub const ALL: [Phase; 8] = [
        Phase::Start,
        Phase::Enrolled,
        Phase::Approved,
        Phase::Registered,
        Phase::Labeled,
        Phase::WorkloadsCreated,
        Phase::SteadyState,
        Phase::Done,
    ];

    /// The phase that follows this one, if any
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Start => Some(Phase::Enrolled),
            Phase::Enrolled => Some(Phase::Approved),
            Phase::Approved => Some(Phase::Registered),
            Phase::Registered => Some(Phase::Labeled),
            Phase::Labeled => Some(Phase::WorkloadsCreated),
            Phase::WorkloadsCreated => Some(Phase::SteadyState),
            Phase::SteadyState => Some(Phase::Done),
            Phase::Done => None,
        }
    }

    /// Lowercase name used in logs and reports
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Enrolled => "enrolled",
            Phase::Approved => "approved",
            Phase::Registered => "registered",
            Phase::Labeled => "labeled",
            Phase::WorkloadsCreated => "workloads_created",
            Phase::SteadyState => "steady_state",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Random lowercase ASCII string
pub fn random_lowercase<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

/// Synthetic hardware identity, fixed for the device's lifetime
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareProfile {
    /// Product name reported by the system vendor block
    pub product_name: String,
    /// Serial number reported by the system vendor block
    pub serial_number: String,
    /// Host name, always ending in `.flotta`
    pub hostname: String,
}

impl HardwareProfile {
    /// Generate a profile from the given random source
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        Self {
            product_name: random_lowercase(rng, 10),
            serial_number: random_lowercase(rng, 10),
            hostname: format!("{}.flotta", random_lowercase(rng, 10)),
        }
    }

    /// Generate a profile from the thread-local random source
    pub fn random() -> Self {
        Self::generate(&mut rand::thread_rng())
    }
}

/// One simulated device
///
/// Owned by exactly one lifecycle; nothing here is shared across devices.
#[derive(Clone, Debug)]
pub struct Device {
    /// Device id, also the certificate CN and resource name
    pub device_id: String,
    /// Hardware identity re-sent on enrolment and registration
    pub hardware: HardwareProfile,
    /// Set once enrolment returned 200
    pub enrolled: bool,
    /// Set once a certificate was issued and stored
    pub registered: bool,
    /// Registration attempts made, including the first
    pub register_attempts: u32,
    /// Approval attempts made, including the first
    pub approve_attempts: u32,
    phase: Phase,
    history: Vec<Phase>,
}

impl Device {
    /// Create a device with a fresh UUID and random hardware
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Create a device with a fixed id and random hardware
    pub fn with_id(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            hardware: HardwareProfile::random(),
            enrolled: false,
            registered: false,
            register_attempts: 0,
            approve_attempts: 0,
            phase: Phase::Start,
            history: vec![Phase::Start],
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase the device has been in, in order
    pub fn phase_history(&self) -> &[Phase] {
        &self.history
    }

    /// Move to the next phase
    ///
    /// Only the immediate successor is accepted.
    pub fn advance_to(&mut self, to: Phase) -> Result<()> {
        if self.phase.next() != Some(to) {
            return Err(Error::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.history.push(to);
        Ok(())
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}
