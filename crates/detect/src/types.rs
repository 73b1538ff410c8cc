//! Data model shared by the detection pipeline.

use serde::{Deserialize, Serialize};

/// Sentinel returned when a process id cannot be mapped to a path.
pub const UNKNOWN_PROCESS: &str = "Unknown";

/// Friendly name used when an endpoint does not expose one.
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Data-flow direction of an audio endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Microphone-class input.
    Capture,
    /// Speaker-class output.
    Render,
}

/// An audio device currently in the active state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Opaque identity string, stable across enumerations.
    pub id: String,
    pub name: String,
    pub direction: Direction,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, name: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            direction,
        }
    }
}

/// Identity signals of the device behind an endpoint.
///
/// Every field is optional; backends fill in what the OS exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    pub instance_id: Option<String>,
    pub hardware_ids: Vec<String>,
    pub parent_id: Option<String>,
    pub enumerator_name: Option<String>,
    pub class_guid: Option<String>,
    pub bus_type_guid: Option<String>,
    pub friendly_name: Option<String>,
    pub description: Option<String>,
}

/// Lifecycle state of an audio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Inactive,
    Active,
    Expired,
}

/// Snapshot of one live session on an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub process_id: u32,
    pub state: SessionState,
    pub muted: bool,
    /// Linear master volume in `[0.0, 1.0]`; `None` when the volume
    /// interface could not be queried.
    pub volume: Option<f32>,
}

impl Session {
    pub fn new(process_id: u32, state: SessionState) -> Self {
        Self {
            process_id,
            state,
            muted: false,
            volume: Some(1.0),
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn without_volume(mut self) -> Self {
        self.volume = None;
        self
    }

    pub fn muted(mut self) -> Self {
        self.muted = true;
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

/// A process currently producing audio output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderProcessInfo {
    pub process_name: String,
    pub process_id: u32,
    pub device_name: String,
    pub is_active: bool,
}

/// Per-process session change delivered by the session monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSessionInfo {
    pub process_name: String,
    pub full_path: String,
    pub process_id: u32,
    pub device_name: String,
    pub is_active: bool,
}

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    DeviceRemoved,
    ServerShutdown,
    FormatChanged,
    SessionLogoff,
    SessionDisconnected,
    ExclusiveModeOverride,
    Other,
}

/// Native session notification, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionCreated {
        endpoint: Endpoint,
        process_id: u32,
    },
    StateChanged {
        endpoint: Endpoint,
        process_id: u32,
        state: SessionState,
    },
    Disconnected {
        endpoint: Endpoint,
        process_id: u32,
        reason: DisconnectReason,
    },
}

impl SessionEvent {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::SessionCreated { endpoint, .. }
            | Self::StateChanged { endpoint, .. }
            | Self::Disconnected { endpoint, .. } => endpoint,
        }
    }

    pub fn process_id(&self) -> u32 {
        match self {
            Self::SessionCreated { process_id, .. }
            | Self::StateChanged { process_id, .. }
            | Self::Disconnected { process_id, .. } => *process_id,
        }
    }

    /// Whether the session is producing or capturing audio after this event.
    pub fn is_active(&self) -> bool {
        match self {
            Self::SessionCreated { .. } => true,
            Self::StateChanged { state, .. } => *state == SessionState::Active,
            Self::Disconnected { .. } => false,
        }
    }
}

/// Returns the file name component of a Windows or POSIX path.
pub fn process_name_from_path(path: &str) -> String {
    path.rsplit(['\\', '/'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(path)
        .to_string()
}
