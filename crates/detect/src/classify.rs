//! Bluetooth device classification.
//!
//! Identity signals are accurate and stable, so they are consulted first.
//! Name matching is a heuristic fallback that can misfire on wired devices
//! with suggestive names and only runs when every identity check came up empty.

use crate::config::ClassifierConfig;
use crate::provider::AudioSubsystem;
use crate::types::{DeviceProperties, Endpoint};

/// Bluetooth-stack enumerator markers found in device identity strings.
pub const BLUETOOTH_ID_MARKERS: &[&str] = &["BTHENUM", "BTHHFENUM", "BTHLE", "BLUETOOTH"];

/// Class, interface and bus GUIDs used by the Bluetooth stack.
pub const BLUETOOTH_GUIDS: &[&str] = &[
    // Bluetooth device setup class
    "e0cbf06c-cd8b-4647-bb8a-263b43f0f974",
    // Bluetooth radio port interface
    "0850302a-b344-4fda-9be9-90576b8d46f0",
    // Bluetooth LE device interface
    "781aee18-7733-4ce4-add0-91f41c67b592",
];

/// Name fragments associated with Bluetooth audio profiles and products.
pub const BLUETOOTH_NAME_PATTERNS: &[&str] = &[
    "bluetooth",
    "hands-free",
    "handsfree",
    "hands free",
    "a2dp",
    "stereo headset",
    "wireless headset",
    "wireless headphones",
    "airpods",
    "galaxy buds",
    "pixel buds",
    "wh-1000",
    "wf-1000",
    "jabra",
    "soundcore",
    "powerbeats",
];

/// Which check identified a device as Bluetooth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothEvidence {
    InstanceId,
    HardwareId,
    ParentId,
    ClassGuid,
    DeviceName,
}

/// Decides whether an endpoint sits on the Bluetooth stack.
#[derive(Debug, Clone)]
pub struct DeviceClassifier {
    name_patterns: Vec<String>,
}

impl Default for DeviceClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

impl DeviceClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let name_patterns = BLUETOOTH_NAME_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(config.extra_name_patterns.iter().map(|p| p.to_lowercase()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { name_patterns }
    }

    /// First matching check, in priority order.
    pub fn classify(&self, props: &DeviceProperties) -> Option<BluetoothEvidence> {
        let instance = props
            .instance_id
            .iter()
            .chain(props.enumerator_name.iter());
        if instance.into_iter().any(|id| has_bluetooth_marker(id)) {
            return Some(BluetoothEvidence::InstanceId);
        }

        if props.hardware_ids.iter().any(|id| has_bluetooth_marker(id)) {
            return Some(BluetoothEvidence::HardwareId);
        }

        if props.parent_id.as_deref().is_some_and(has_bluetooth_marker) {
            return Some(BluetoothEvidence::ParentId);
        }

        let guids = props.class_guid.iter().chain(props.bus_type_guid.iter());
        if guids.into_iter().any(|g| is_bluetooth_guid(g)) {
            return Some(BluetoothEvidence::ClassGuid);
        }

        let names = props.friendly_name.iter().chain(props.description.iter());
        if names.into_iter().any(|n| self.matches_name(n)) {
            return Some(BluetoothEvidence::DeviceName);
        }

        None
    }

    pub fn is_bluetooth(&self, props: &DeviceProperties) -> bool {
        self.classify(props).is_some()
    }

    fn matches_name(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.name_patterns.iter().any(|p| name.contains(p.as_str()))
    }
}

/// Classify `endpoint` using the identity signals its device exposes.
pub fn is_bluetooth_class<S>(subsystem: &S, classifier: &DeviceClassifier, endpoint: &Endpoint) -> bool
where
    S: AudioSubsystem + ?Sized,
{
    let mut props = subsystem.device_properties(endpoint);
    if props.friendly_name.is_none() {
        props.friendly_name = Some(endpoint.name.clone());
    }

    match classifier.classify(&props) {
        Some(evidence) => {
            tracing::debug!(endpoint = %endpoint.id, ?evidence, "bluetooth_endpoint");
            true
        }
        None => false,
    }
}

fn has_bluetooth_marker(id: &str) -> bool {
    let id = id.to_uppercase();
    BLUETOOTH_ID_MARKERS.iter().any(|m| id.contains(m))
}

fn is_bluetooth_guid(guid: &str) -> bool {
    let guid = guid
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .to_lowercase();
    BLUETOOTH_GUIDS.contains(&guid.as_str())
}
