//! Wire types for the management plane and the cluster API
//!
//! Management plane calls carry a [`DataMessage`] envelope around a typed
//! payload. Cluster API bodies are built as JSON values since they are
//! merge patches or Kubernetes objects with a fixed shape.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::device::HardwareProfile;

/// Message type tag carried in every envelope
pub const MESSAGE_TYPE: &str = "data";
/// Envelope version
pub const MESSAGE_VERSION: u32 = 1;
/// Agent version reported in heartbeats
pub const AGENT_VERSION: &str = "278650";
/// Workloads reported in every heartbeat
pub const HEARTBEAT_WORKLOADS: u32 = 9;

const CPU_ARCHITECTURE: &str = "x86_64";
const CPU_MODEL: &str = "Intel(R) Core(TM) i7-6820HQ CPU @ 2.70GHz";
const MANUFACTURER: &str = "LENOVO";
const OS_IMAGE_ID: &str = "unknown";
const NEVER_UPLOADED: &str = "0001-01-01T00:00:00.000Z";
const CONTAINER_FAILURE: &str = "error starting container f8433cc4b0c963ce95625ab3b1811382f852432f61a2d087422210e9d34bc2bc: cannot listen on the TCP port: listen tcp4 :11000: bind: address already in use,error starting container 7cd64802bde9d6b9dd425d79ea68eb49546e5fc87d0dce474c7515e81f448d50: a dependency of container 7cd64802bde9d6b9dd425d79ea68eb49546e5fc87d0dce474c7515e81f448d50 failed to start: container state improper";

/// Purpose of a management plane message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Directive {
    /// First contact, sent with the bootstrap identity
    Enrolment,
    /// CSR submission, sent with the bootstrap identity
    Registration,
    /// Status report, sent with the issued identity
    Heartbeat,
}

/// Envelope for every message a device sends to the management plane
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataMessage<T> {
    /// Typed payload
    pub content: T,
    /// What the payload is
    pub directive: Directive,
    /// Fresh UUID per message
    pub message_id: String,
    /// Send time, RFC 3339 in UTC
    pub sent: String,
    /// Always `data`
    #[serde(rename = "type")]
    pub message_type: String,
    /// Always 1
    pub version: u32,
}

impl<T> DataMessage<T> {
    /// Wrap a payload in a fresh envelope
    pub fn new(directive: Directive, content: T) -> Self {
        Self {
            content,
            directive,
            message_id: Uuid::new_v4().to_string(),
            sent: now_rfc3339(),
            message_type: MESSAGE_TYPE.to_string(),
            version: MESSAGE_VERSION,
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// =============================================================================
// Hardware
// =============================================================================

/// CPU block of the hardware report
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    /// CPU architecture
    pub architecture: String,
    /// CPU flags, always empty
    pub flags: Vec<String>,
    /// CPU model name
    pub model_name: String,
}

/// System vendor block of the hardware report
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemVendor {
    /// Manufacturer name
    pub manufacturer: String,
    /// Product name
    pub product_name: String,
    /// Serial number
    pub serial_number: String,
}

/// Hardware report sent on enrolment and registration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// CPU details
    pub cpu: CpuInfo,
    /// Host name
    pub hostname: String,
    /// System vendor details
    pub system_vendor: SystemVendor,
}

impl From<&HardwareProfile> for HardwareInfo {
    fn from(profile: &HardwareProfile) -> Self {
        Self {
            cpu: CpuInfo {
                architecture: CPU_ARCHITECTURE.to_string(),
                flags: Vec::new(),
                model_name: CPU_MODEL.to_string(),
            },
            hostname: profile.hostname.clone(),
            system_vendor: SystemVendor {
                manufacturer: MANUFACTURER.to_string(),
                product_name: profile.product_name.clone(),
                serial_number: profile.serial_number.clone(),
            },
        }
    }
}

// =============================================================================
// Enrolment and registration
// =============================================================================

/// Device features sent on enrolment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFeatures {
    /// Hardware report
    pub hardware: HardwareInfo,
    /// OS image id
    pub os_image_id: String,
}

/// Enrolment payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolmentInfo {
    /// Namespace the device asks to join
    pub target_namespace: String,
    /// Device features
    pub features: DeviceFeatures,
}

impl EnrolmentInfo {
    /// Enrolment envelope for a device
    pub fn message(target_namespace: &str, hardware: &HardwareProfile) -> DataMessage<Self> {
        DataMessage::new(
            Directive::Enrolment,
            Self {
                target_namespace: target_namespace.to_string(),
                features: DeviceFeatures {
                    hardware: hardware.into(),
                    os_image_id: OS_IMAGE_ID.to_string(),
                },
            },
        )
    }
}

/// Registration payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Normalized CSR PEM
    pub certificate_request: String,
    /// Hardware report
    pub hardware: HardwareInfo,
    /// OS image id
    pub os_image_id: String,
}

impl RegistrationInfo {
    /// Registration envelope for a device
    pub fn message(csr_pem: &str, hardware: &HardwareProfile) -> DataMessage<Self> {
        DataMessage::new(
            Directive::Registration,
            Self {
                certificate_request: csr_pem.to_string(),
                hardware: hardware.into(),
                os_image_id: OS_IMAGE_ID.to_string(),
            },
        )
    }
}

/// Certificate returned by a successful registration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationContent {
    /// Issued certificate PEM
    pub certificate: String,
}

/// Body of a successful registration response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationResponse {
    /// Response content
    pub content: RegistrationContent,
}

impl RegistrationResponse {
    /// Extract the issued certificate from a response body
    pub fn certificate_from(body: &str) -> crate::Result<String> {
        let response: RegistrationResponse = serde_json::from_str(body)?;
        Ok(response.content.certificate)
    }
}

// =============================================================================
// Heartbeat
// =============================================================================

/// Event reported in a heartbeat
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    /// Event text
    pub message: String,
    /// Short reason
    pub reason: String,
    /// Severity
    #[serde(rename = "type")]
    pub event_type: String,
}

/// Workload status reported in a heartbeat
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// Last data upload time
    pub last_data_upload: String,
    /// Workload name
    pub name: String,
    /// Workload state
    pub status: String,
}

/// Heartbeat payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    /// Recent events
    pub events: Vec<EventInfo>,
    /// Device status
    pub status: String,
    /// Report time
    pub time: String,
    /// Agent version
    pub version: String,
    /// Workload states
    pub workloads: Vec<WorkloadStatus>,
}

impl HeartbeatInfo {
    /// Heartbeat reporting a device that is up with failing containers
    pub fn for_device(device_id: &str) -> Self {
        let events = (0..4)
            .map(|_| EventInfo {
                message: CONTAINER_FAILURE.to_string(),
                reason: "Failed".to_string(),
                event_type: "warn".to_string(),
            })
            .collect();

        let workloads = (1..=HEARTBEAT_WORKLOADS)
            .map(|i| WorkloadStatus {
                last_data_upload: NEVER_UPLOADED.to_string(),
                name: workload_name(device_id, i),
                status: if i % 2 == 1 { "Running" } else { "Created" }.to_string(),
            })
            .collect();

        Self {
            events,
            status: "up".to_string(),
            time: now_rfc3339(),
            version: AGENT_VERSION.to_string(),
            workloads,
        }
    }

    /// Heartbeat envelope for a device
    pub fn message(device_id: &str) -> DataMessage<Self> {
        DataMessage::new(Directive::Heartbeat, Self::for_device(device_id))
    }
}

// =============================================================================
// Cluster API bodies
// =============================================================================

/// Name of a device's workload at `index`
pub fn workload_name(device_id: &str, index: u32) -> String {
    format!("{}-{}", device_id, index)
}

/// Merge patch approving a device's signing request
pub fn approval_patch() -> Value {
    json!({ "spec": { "approved": true } })
}

/// Merge patch labeling a device with its own id
pub fn label_patch(label_key: &str, device_id: &str) -> Value {
    json!({ "metadata": { "labels": { label_key: device_id } } })
}

/// EdgeWorkload object bound to one device through a label selector
pub fn edge_workload(device_id: &str, namespace: &str, index: u32, label_key: &str) -> Value {
    json!({
        "apiVersion": "management.project-flotta.io/v1alpha1",
        "kind": "EdgeWorkload",
        "metadata": {
            "name": workload_name(device_id, index),
            "namespace": namespace,
        },
        "spec": {
            "data": {
                "paths": [{ "source": ".", "target": "nginx" }]
            },
            "deviceSelector": {
                "matchLabels": { label_key: device_id }
            },
            "pod": {
                "spec": {
                    "containers": [{
                        "image": "docker.io/nginx:1.14.2",
                        "name": "nginx",
                        "ports": [{
                            "containerPort": 80,
                            "hostPort": 9090,
                            "protocol": "TCP"
                        }]
                    }]
                }
            },
            "type": "pod"
        }
    })
}
