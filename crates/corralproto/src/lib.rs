//! corralproto - Protocol types for the corral sandbox-fleet control plane
//!
//! This crate defines the messages exchanged between the control plane and
//! sandbox-host daemons over a bidirectional stream. Every message pairs a
//! correlation `request_id` with exactly one payload variant; the two
//! directions have separate payload enums so neither side can emit a message
//! shape the other direction owns.

use serde::{Deserialize, Serialize};

pub mod frame;

#[cfg(feature = "peer")]
pub mod agent;
#[cfg(feature = "peer")]
pub mod socket;

pub use frame::{FrameError, FrameKind, WireFrame, FRAME_COUNT, PROTOCOL_VERSION};

#[cfg(feature = "peer")]
pub use agent::{AgentConfig, CommandHandler, HostAgent};

/// Messages flowing control plane -> host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPayload {
    /// Reply to a `Registration`, echoing its request id.
    RegistrationAck {
        accepted: bool,
        assigned_host_id: String,
    },

    // === Sandbox lifecycle ===
    CreateSandbox {
        name: String,
        image: String,
        cpus: u32,
        memory_mb: u64,
        disk_mb: u64,
        bridge: Option<String>,
    },
    DestroySandbox {
        sandbox_id: String,
    },
    StartSandbox {
        sandbox_id: String,
    },
    StopSandbox {
        sandbox_id: String,
    },
    RunCommand {
        sandbox_id: String,
        command: Vec<String>,
        timeout_secs: Option<u64>,
    },
    CreateSnapshot {
        sandbox_id: String,
        snapshot_name: String,
    },
    GetSandboxIp {
        sandbox_id: String,
    },

    // === Source VM management ===
    ListSourceVms,
    ValidateSourceVm {
        name: String,
    },
    PrepareSourceVm {
        name: String,
    },
    RunSourceCommand {
        name: String,
        command: Vec<String>,
    },
    ReadSourceFile {
        name: String,
        path: String,
    },

    // === Host introspection ===
    ListTemplates,
    Capabilities,
}

impl ControlPayload {
    /// Short name for logging and span naming.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegistrationAck { .. } => "registration_ack",
            Self::CreateSandbox { .. } => "create_sandbox",
            Self::DestroySandbox { .. } => "destroy_sandbox",
            Self::StartSandbox { .. } => "start_sandbox",
            Self::StopSandbox { .. } => "stop_sandbox",
            Self::RunCommand { .. } => "run_command",
            Self::CreateSnapshot { .. } => "create_snapshot",
            Self::GetSandboxIp { .. } => "get_sandbox_ip",
            Self::ListSourceVms => "list_source_vms",
            Self::ValidateSourceVm { .. } => "validate_source_vm",
            Self::PrepareSourceVm { .. } => "prepare_source_vm",
            Self::RunSourceCommand { .. } => "run_source_command",
            Self::ReadSourceFile { .. } => "read_source_file",
            Self::ListTemplates => "list_templates",
            Self::Capabilities => "capabilities",
        }
    }
}

/// Messages flowing host -> control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostPayload {
    /// First message on every stream: who the host is and what it has.
    Registration(HostRegistration),

    /// Periodic liveness signal with current availability.
    Heartbeat {
        available_cpus: u32,
        available_memory_mb: u64,
        available_disk_mb: u64,
    },

    /// Unsolicited resource snapshot, sent when inventory shifts.
    ResourceReport {
        available_cpus: u32,
        available_memory_mb: u64,
        available_disk_mb: u64,
        sandbox_count: u32,
    },

    /// Asynchronous failure notice, not tied to any in-flight request.
    ErrorReport {
        sandbox_id: Option<String>,
        error: String,
        context: Option<serde_json::Value>,
    },

    /// Graceful teardown notification.
    Disconnect {
        reason: Option<String>,
    },

    // === Command responses, correlated by request id ===
    CreateSandboxResponse {
        sandbox_id: String,
        ip: Option<String>,
    },
    DestroySandboxResponse {
        sandbox_id: String,
    },
    StartSandboxResponse {
        sandbox_id: String,
        state: String,
    },
    StopSandboxResponse {
        sandbox_id: String,
        state: String,
    },
    RunCommandResponse {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    CreateSnapshotResponse {
        snapshot_id: String,
    },
    GetSandboxIpResponse {
        sandbox_id: String,
        ip: String,
    },
    ListSourceVmsResponse {
        source_vms: Vec<SourceVm>,
    },
    ValidateSourceVmResponse {
        name: String,
        valid: bool,
        message: Option<String>,
    },
    PrepareSourceVmResponse {
        name: String,
        prepared: bool,
    },
    RunSourceCommandResponse {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    ReadSourceFileResponse {
        path: String,
        content: String,
    },
    ListTemplatesResponse {
        templates: Vec<String>,
    },
    CapabilitiesResponse {
        version: String,
        features: Vec<String>,
    },

    /// Generic failure reply when a command cannot be honored.
    CommandError {
        code: String,
        message: String,
    },
}

impl HostPayload {
    /// Whether this payload answers an in-flight command and should be
    /// routed through correlation rather than handled by variant.
    pub fn is_response(&self) -> bool {
        !matches!(
            self,
            Self::Registration(_)
                | Self::Heartbeat { .. }
                | Self::ResourceReport { .. }
                | Self::ErrorReport { .. }
                | Self::Disconnect { .. }
        )
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registration(_) => "registration",
            Self::Heartbeat { .. } => "heartbeat",
            Self::ResourceReport { .. } => "resource_report",
            Self::ErrorReport { .. } => "error_report",
            Self::Disconnect { .. } => "disconnect",
            Self::CreateSandboxResponse { .. } => "create_sandbox_response",
            Self::DestroySandboxResponse { .. } => "destroy_sandbox_response",
            Self::StartSandboxResponse { .. } => "start_sandbox_response",
            Self::StopSandboxResponse { .. } => "stop_sandbox_response",
            Self::RunCommandResponse { .. } => "run_command_response",
            Self::CreateSnapshotResponse { .. } => "create_snapshot_response",
            Self::GetSandboxIpResponse { .. } => "get_sandbox_ip_response",
            Self::ListSourceVmsResponse { .. } => "list_source_vms_response",
            Self::ValidateSourceVmResponse { .. } => "validate_source_vm_response",
            Self::PrepareSourceVmResponse { .. } => "prepare_source_vm_response",
            Self::RunSourceCommandResponse { .. } => "run_source_command_response",
            Self::ReadSourceFileResponse { .. } => "read_source_file_response",
            Self::ListTemplatesResponse { .. } => "list_templates_response",
            Self::CapabilitiesResponse { .. } => "capabilities_response",
            Self::CommandError { .. } => "command_error",
        }
    }
}

/// The inventory a host advertises with its initial registration.
///
/// Stored verbatim by the registry and used for host-selection queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRegistration {
    pub host_id: String,
    pub hostname: String,
    pub version: String,
    pub total_cpus: u32,
    pub total_memory_mb: u64,
    pub total_disk_mb: u64,
    pub available_cpus: u32,
    pub available_memory_mb: u64,
    pub available_disk_mb: u64,
    #[serde(default)]
    pub base_images: Vec<String>,
    #[serde(default)]
    pub source_vms: Vec<SourceVm>,
    #[serde(default)]
    pub bridges: Vec<Bridge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceVm {
    pub name: String,
    pub state: String,
    pub ip: Option<String>,
    pub prepared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bridge {
    pub name: String,
    pub subnet: String,
}

/// Current resource availability, as carried by heartbeats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Availability {
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

/// A control-plane message with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEnvelope {
    pub request_id: String,
    pub payload: ControlPayload,
}

impl ControlEnvelope {
    pub fn new(request_id: impl Into<String>, payload: ControlPayload) -> Self {
        Self {
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn to_frame(&self) -> Result<WireFrame, FrameError> {
        if self.request_id.is_empty() {
            return Err(FrameError::EmptyRequestId);
        }
        let kind = match self.payload {
            ControlPayload::RegistrationAck { .. } => FrameKind::Reply,
            _ => FrameKind::Request,
        };
        let body = serde_json::to_vec(&self.payload)?;
        Ok(WireFrame::new(kind, self.request_id.clone(), body.into()))
    }

    pub fn from_frame(frame: &WireFrame) -> Result<Self, FrameError> {
        let payload = serde_json::from_slice(&frame.body)?;
        Ok(Self {
            request_id: frame.request_id.clone(),
            payload,
        })
    }
}

/// A host message with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct HostEnvelope {
    pub request_id: String,
    pub payload: HostPayload,
}

impl HostEnvelope {
    pub fn new(request_id: impl Into<String>, payload: HostPayload) -> Self {
        Self {
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn to_frame(&self) -> Result<WireFrame, FrameError> {
        if self.request_id.is_empty() {
            return Err(FrameError::EmptyRequestId);
        }
        let kind = match self.payload {
            HostPayload::Registration(_) => FrameKind::Register,
            HostPayload::Heartbeat { .. } => FrameKind::Heartbeat,
            HostPayload::ResourceReport { .. } | HostPayload::ErrorReport { .. } => {
                FrameKind::Report
            }
            HostPayload::Disconnect { .. } => FrameKind::Disconnect,
            _ => FrameKind::Reply,
        };
        let body = serde_json::to_vec(&self.payload)?;
        Ok(WireFrame::new(kind, self.request_id.clone(), body.into()))
    }

    pub fn from_frame(frame: &WireFrame) -> Result<Self, FrameError> {
        let payload = serde_json::from_slice(&frame.body)?;
        Ok(Self {
            request_id: frame.request_id.clone(),
            payload,
        })
    }
}
