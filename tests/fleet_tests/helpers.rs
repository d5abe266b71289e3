//! In-memory Flotta backend shared by the fleet tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use flotta_sim::config::{LifecycleTimings, SimConfig};
use flotta_sim::control::ControlPlaneApi;
use flotta_sim::device::Device;
use flotta_sim::identity::{CertsDir, Credential, InProcessProvider};
use flotta_sim::lifecycle::{Backends, DeviceLifecycle, DeviceOutcome};
use flotta_sim::management::ManagementApi;
use flotta_sim::messages::{DataMessage, EnrolmentInfo, HeartbeatInfo, RegistrationInfo};
use flotta_sim::pki::CertificateAuthority;
use flotta_sim::transport::ApiResponse;
use flotta_sim::Result;

/// Call kinds the backend understands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Enrol,
    Register,
    GetUpdates(u32),
    Heartbeat,
    Approve,
    Label(String),
    CreateWorkload(String),
}

/// Credential a management call arrived with
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Presented {
    /// Cluster API call, no device credential
    None,
    Bootstrap,
    /// Issued identity: device id and certificate PEM
    Issued(String, String),
}

#[derive(Clone, Debug)]
pub struct Recorded {
    pub device_id: String,
    pub call: Call,
    pub presented: Presented,
}

/// Status codes the backend answers with, per device, in order
///
/// Once a queue is empty the step succeeds.
#[derive(Clone, Debug, Default)]
pub struct Script {
    pub enrol: VecDeque<u16>,
    pub approve: VecDeque<u16>,
    pub register: VecDeque<u16>,
    pub label: VecDeque<u16>,
    pub create_workload: VecDeque<u16>,
}

impl Script {
    pub fn register(mut self, statuses: &[u16]) -> Self {
        self.register = statuses.iter().copied().collect();
        self
    }

    pub fn approve(mut self, statuses: &[u16]) -> Self {
        self.approve = statuses.iter().copied().collect();
        self
    }

    pub fn enrol(mut self, statuses: &[u16]) -> Self {
        self.enrol = statuses.iter().copied().collect();
        self
    }

    pub fn create_workload(mut self, statuses: &[u16]) -> Self {
        self.create_workload = statuses.iter().copied().collect();
        self
    }
}

#[derive(Default)]
struct State {
    scripts: HashMap<String, Script>,
    calls: Vec<Recorded>,
    csrs: HashMap<String, String>,
    issued: HashMap<String, String>,
    accepted_registrations: HashMap<String, u32>,
    accepted_approvals: HashMap<String, u32>,
}

/// Management plane and cluster API in one, backed by a test CA
pub struct RecordingBackend {
    ca: CertificateAuthority,
    template: Script,
    straggler: Option<Script>,
    state: Mutex<State>,
}

impl RecordingBackend {
    pub fn new(template: Script) -> Arc<Self> {
        Self::build(template, None)
    }

    /// The first device to show up gets `straggler`, every other one `template`
    pub fn with_straggler(template: Script, straggler: Script) -> Arc<Self> {
        Self::build(template, Some(straggler))
    }

    fn build(template: Script, straggler: Option<Script>) -> Arc<Self> {
        Arc::new(Self {
            ca: CertificateAuthority::new("Flotta Test CA").unwrap(),
            template,
            straggler,
            state: Mutex::new(State::default()),
        })
    }

    fn next_status(
        &self,
        device_id: &str,
        pick: impl FnOnce(&mut Script) -> &mut VecDeque<u16>,
        default: u16,
    ) -> u16 {
        let mut state = self.state.lock().unwrap();
        if !state.scripts.contains_key(device_id) {
            let script = match &self.straggler {
                Some(straggler) if state.scripts.is_empty() => straggler.clone(),
                _ => self.template.clone(),
            };
            state.scripts.insert(device_id.to_string(), script);
        }
        let script = state.scripts.get_mut(device_id).unwrap();
        pick(script).pop_front().unwrap_or(default)
    }

    fn record(&self, device_id: &str, call: Call, presented: Presented) {
        self.state.lock().unwrap().calls.push(Recorded {
            device_id: device_id.to_string(),
            call,
            presented,
        });
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, device_id: &str) -> Vec<Recorded> {
        self.calls()
            .into_iter()
            .filter(|r| r.device_id == device_id)
            .collect()
    }

    /// Distinct devices that made a call matching `matches`
    pub fn devices_with(&self, matches: impl Fn(&Call) -> bool) -> HashSet<String> {
        self.calls()
            .into_iter()
            .filter(|r| matches(&r.call))
            .map(|r| r.device_id)
            .collect()
    }

    pub fn count(&self, device_id: &str, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls_for(device_id)
            .iter()
            .filter(|r| matches(&r.call))
            .count()
    }

    /// CSR the device sent on its accepted registration
    pub fn csr_of(&self, device_id: &str) -> Option<String> {
        self.state.lock().unwrap().csrs.get(device_id).cloned()
    }

    /// Certificate the backend issued to the device
    pub fn issued_to(&self, device_id: &str) -> Option<String> {
        self.state.lock().unwrap().issued.get(device_id).cloned()
    }

    pub fn accepted_registrations(&self, device_id: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .accepted_registrations
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn accepted_approvals(&self, device_id: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.accepted_approvals.get(device_id).copied().unwrap_or(0)
    }

    pub fn ca_pem(&self) -> &str {
        self.ca.ca_cert_pem()
    }
}

fn presented(credential: &Credential) -> Presented {
    match credential {
        Credential::Bootstrap => Presented::Bootstrap,
        Credential::Issued(identity) => {
            Presented::Issued(identity.device_id.clone(), identity.cert_pem.clone())
        }
    }
}

#[async_trait]
impl ManagementApi for RecordingBackend {
    async fn enrol(
        &self,
        device_id: &str,
        credential: &Credential,
        _message: &DataMessage<EnrolmentInfo>,
    ) -> Result<ApiResponse> {
        self.record(device_id, Call::Enrol, presented(credential));
        let status = self.next_status(device_id, |s| &mut s.enrol, 200);
        Ok(ApiResponse::new(status, ""))
    }

    async fn register(
        &self,
        device_id: &str,
        credential: &Credential,
        message: &DataMessage<RegistrationInfo>,
    ) -> Result<ApiResponse> {
        self.record(device_id, Call::Register, presented(credential));
        let status = self.next_status(device_id, |s| &mut s.register, 200);
        if status != 200 {
            return Ok(ApiResponse::new(status, "pending"));
        }

        let csr = &message.content.certificate_request;
        let cert = self.ca.sign_csr(csr, device_id)?;

        let mut state = self.state.lock().unwrap();
        state.csrs.insert(device_id.to_string(), csr.clone());
        state.issued.insert(device_id.to_string(), cert.clone());
        *state
            .accepted_registrations
            .entry(device_id.to_string())
            .or_insert(0) += 1;

        let body = serde_json::json!({ "content": { "certificate": cert } });
        Ok(ApiResponse::new(200, body.to_string()))
    }

    async fn get_updates(
        &self,
        device_id: &str,
        credential: &Credential,
        poll_index: u32,
    ) -> Result<ApiResponse> {
        self.record(device_id, Call::GetUpdates(poll_index), presented(credential));
        // Polls are informational; a non-200 here must not hurt the device.
        let status = if poll_index % 2 == 0 { 200 } else { 503 };
        Ok(ApiResponse::new(status, "{}"))
    }

    async fn send_heartbeat(
        &self,
        device_id: &str,
        credential: &Credential,
        message: &DataMessage<HeartbeatInfo>,
    ) -> Result<ApiResponse> {
        assert_eq!(message.content.status, "up");
        self.record(device_id, Call::Heartbeat, presented(credential));
        Ok(ApiResponse::new(200, ""))
    }
}

#[async_trait]
impl ControlPlaneApi for RecordingBackend {
    async fn approve(&self, device_id: &str) -> Result<ApiResponse> {
        self.record(device_id, Call::Approve, Presented::None);
        let status = self.next_status(device_id, |s| &mut s.approve, 200);
        if status == 200 {
            let mut state = self.state.lock().unwrap();
            *state
                .accepted_approvals
                .entry(device_id.to_string())
                .or_insert(0) += 1;
        }
        Ok(ApiResponse::new(status, ""))
    }

    async fn label(&self, device_id: &str, label_key: &str) -> Result<ApiResponse> {
        self.record(device_id, Call::Label(label_key.to_string()), Presented::None);
        let status = self.next_status(device_id, |s| &mut s.label, 200);
        Ok(ApiResponse::new(status, ""))
    }

    async fn create_workload(
        &self,
        device_id: &str,
        index: u32,
        _label_key: &str,
    ) -> Result<ApiResponse> {
        let name = flotta_sim::messages::workload_name(device_id, index);
        self.record(device_id, Call::CreateWorkload(name), Presented::None);
        let status = self.next_status(device_id, |s| &mut s.create_workload, 201);
        Ok(ApiResponse::new(status, ""))
    }
}

/// Fast configuration writing into `dir`
pub fn test_config(dir: &Path) -> SimConfig {
    SimConfig {
        certs_dir: dir.to_path_buf(),
        timings: LifecycleTimings::fast(),
        ..Default::default()
    }
}

pub fn backends(backend: &Arc<RecordingBackend>, dir: &Path) -> Backends {
    Backends {
        management: backend.clone(),
        control_plane: backend.clone(),
        identity: Arc::new(InProcessProvider::new(CertsDir::new(dir))),
    }
}

/// Run one device with a fixed id to completion
pub async fn run_device(
    device_id: &str,
    config: SimConfig,
    backend: &Arc<RecordingBackend>,
) -> DeviceOutcome {
    let dir = config.certs_dir.clone();
    DeviceLifecycle::with_device(
        Device::with_id(device_id),
        Arc::new(config),
        backends(backend, &dir),
        CancellationToken::new(),
    )
    .run()
    .await
}
