//! Polling query facade.
//!
//! Composes catalog → classifier → fusion → stabilizer → resolver into
//! synchronous answers on the caller's thread.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::catalog::list_active_endpoints;
use crate::classify::{is_bluetooth_class, DeviceClassifier};
use crate::config::{DetectConfig, FusionConfig};
use crate::error::{DetectError, Result};
use crate::fusion::detect_raw_activity;
use crate::list::{list_active_processes, list_render_processes, merge_unique};
use crate::provider::{AudioSubsystem, ProcessInspector};
use crate::stabilizer::BluetoothStabilizer;
use crate::types::{Direction, Endpoint, RenderProcessInfo};

/// Structured result of a microphone usage query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrophoneUsage {
    pub success: bool,
    pub processes: Vec<String>,
    pub error_code: i32,
    pub error_message: String,
}

impl MicrophoneUsage {
    pub fn ok(processes: Vec<String>) -> Self {
        Self {
            success: true,
            processes,
            error_code: 0,
            error_message: String::new(),
        }
    }

    pub fn failed(error: &DetectError) -> Self {
        Self {
            success: false,
            processes: Vec::new(),
            error_code: error.code(),
            error_message: error.to_string(),
        }
    }
}

impl From<Result<Vec<String>>> for MicrophoneUsage {
    fn from(result: Result<Vec<String>>) -> Self {
        match result {
            Ok(processes) => Self::ok(processes),
            Err(e) => Self::failed(&e),
        }
    }
}

/// Outcome of polling capture endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CapturePoll {
    pub active: bool,
    /// A Bluetooth device still reports a state its raw signal has left, so
    /// further polls may change the answer without any session event.
    pub settling: bool,
}

/// Runs activity queries against one audio subsystem.
///
/// Bluetooth debounce state lives here, so keep one instance for the life of
/// the process and share it.
pub struct ActivityQuery {
    subsystem: Arc<dyn AudioSubsystem>,
    inspector: Arc<dyn ProcessInspector>,
    classifier: DeviceClassifier,
    stabilizer: BluetoothStabilizer,
    fusion: FusionConfig,
}

impl ActivityQuery {
    pub fn new(
        subsystem: Arc<dyn AudioSubsystem>,
        inspector: Arc<dyn ProcessInspector>,
        config: &DetectConfig,
    ) -> Self {
        Self {
            subsystem,
            inspector,
            classifier: DeviceClassifier::new(&config.classifier),
            stabilizer: BluetoothStabilizer::new(config.stabilizer.clone()),
            fusion: config.fusion.clone(),
        }
    }

    pub fn subsystem(&self) -> &Arc<dyn AudioSubsystem> {
        &self.subsystem
    }

    pub fn inspector(&self) -> &Arc<dyn ProcessInspector> {
        &self.inspector
    }

    pub fn stabilizer(&self) -> &BluetoothStabilizer {
        &self.stabilizer
    }

    pub fn is_bluetooth(&self, endpoint: &Endpoint) -> bool {
        is_bluetooth_class(self.subsystem.as_ref(), &self.classifier, endpoint)
    }

    /// Whether `endpoint` shows activity right now.
    ///
    /// Pure for wired endpoints; stabilized across calls for Bluetooth ones.
    pub fn has_active_audio(&self, endpoint: &Endpoint) -> bool {
        self.has_active_audio_at(endpoint, Instant::now())
    }

    pub fn has_active_audio_at(&self, endpoint: &Endpoint, now: Instant) -> bool {
        self.poll_endpoint(endpoint, now).active
    }

    fn poll_endpoint(&self, endpoint: &Endpoint, now: Instant) -> CapturePoll {
        let bluetooth = self.is_bluetooth(endpoint);
        let signal = detect_raw_activity(self.subsystem.as_ref(), endpoint, bluetooth, &self.fusion);
        let raw = signal.is_some();

        tracing::debug!(endpoint = %endpoint.id, bluetooth, ?signal, "endpoint_activity");

        if bluetooth {
            let active = self.stabilizer.observe(&endpoint.id, raw, now);
            CapturePoll {
                active,
                settling: active != raw,
            }
        } else {
            CapturePoll {
                active: raw,
                settling: false,
            }
        }
    }

    /// Processes with an active session on `endpoint`.
    pub fn resolve_active_processes(&self, endpoint: &Endpoint) -> Vec<String> {
        list_active_processes(self.subsystem.as_ref(), self.inspector.as_ref(), endpoint)
    }

    /// Executable paths of every process currently using a microphone.
    pub fn microphone_processes(&self) -> Result<Vec<String>> {
        let now = Instant::now();
        let endpoints = list_active_endpoints(self.subsystem.as_ref(), Direction::Capture)?;

        let mut seen = HashSet::new();
        let mut processes = Vec::new();
        for endpoint in &endpoints {
            if self.has_active_audio_at(endpoint, now) {
                merge_unique(&mut processes, &mut seen, self.resolve_active_processes(endpoint));
            }
        }

        tracing::debug!(count = processes.len(), "microphone_processes");
        Ok(processes)
    }

    pub fn microphone_usage(&self) -> MicrophoneUsage {
        self.microphone_processes().into()
    }

    /// Whether any capture endpoint reports activity.
    ///
    /// Every endpoint is polled even after a hit so each Bluetooth
    /// stabilizer keeps receiving readings.
    pub fn is_microphone_active(&self) -> Result<bool> {
        self.poll_capture().map(|poll| poll.active)
    }

    /// Poll every capture endpoint once.
    pub(crate) fn poll_capture(&self) -> Result<CapturePoll> {
        let now = Instant::now();
        let endpoints = list_active_endpoints(self.subsystem.as_ref(), Direction::Capture)?;
        Ok(endpoints
            .iter()
            .map(|endpoint| self.poll_endpoint(endpoint, now))
            .fold(CapturePoll::default(), |acc, poll| CapturePoll {
                active: acc.active || poll.active,
                settling: acc.settling || poll.settling,
            }))
    }

    /// Processes currently producing audio output, across render endpoints.
    pub fn render_processes(&self) -> Vec<RenderProcessInfo> {
        let endpoints = match list_active_endpoints(self.subsystem.as_ref(), Direction::Render) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!(error = %e, "render_enumeration_failed");
                return Vec::new();
            }
        };

        endpoints
            .iter()
            .flat_map(|endpoint| {
                list_render_processes(self.subsystem.as_ref(), self.inspector.as_ref(), endpoint)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeInspector, FakeSubsystem};
    use crate::types::{DeviceProperties, Session, SessionState};
    use std::time::Duration;

    fn query(fake: &FakeSubsystem, inspector: FakeInspector) -> ActivityQuery {
        ActivityQuery::new(
            Arc::new(fake.clone()),
            Arc::new(inspector),
            &DetectConfig::default(),
        )
    }

    fn bluetooth_mic(fake: &FakeSubsystem) -> Endpoint {
        let endpoint = Endpoint::new("bt", "Headset", Direction::Capture);
        fake.add_endpoint(endpoint.clone());
        fake.set_properties(
            "bt",
            DeviceProperties {
                instance_id: Some(r"BTHHFENUM\{0000111e}\7&2".into()),
                ..Default::default()
            },
        );
        endpoint
    }

    #[test]
    fn test_wired_activity_has_no_history() {
        let fake = FakeSubsystem::new();
        let mic = Endpoint::new("mic", "USB Mic", Direction::Capture);
        fake.add_endpoint(mic.clone());
        fake.set_padding("mic", 256);
        let q = query(&fake, FakeInspector::new());

        assert!(q.has_active_audio(&mic));
        assert!(q.has_active_audio(&mic));
        fake.set_padding("mic", 0);
        assert!(!q.has_active_audio(&mic));
        assert!(!q.has_active_audio(&mic));
        assert_eq!(q.stabilizer().tracked_devices(), 0);
    }

    #[test]
    fn test_bluetooth_activity_is_stabilized() {
        let fake = FakeSubsystem::new();
        let bt = bluetooth_mic(&fake);
        fake.set_peak("bt", 0.4);
        let q = query(&fake, FakeInspector::new());
        let t0 = Instant::now();

        assert!(!q.has_active_audio_at(&bt, t0));
        assert!(q.has_active_audio_at(&bt, t0 + Duration::from_millis(500)));

        fake.set_peak("bt", 0.0);
        assert!(q.has_active_audio_at(&bt, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_capture_poll_flags_settling_bluetooth() {
        let fake = FakeSubsystem::new();
        bluetooth_mic(&fake);
        fake.add_endpoint(Endpoint::new("usb", "USB Mic", Direction::Capture));
        fake.set_padding("usb", 64);
        let q = query(&fake, FakeInspector::new());

        // Nothing seen yet on the headset: wired activity alone is settled.
        assert_eq!(
            q.poll_capture().unwrap(),
            CapturePoll {
                active: true,
                settling: false
            }
        );

        fake.set_padding("usb", 0);
        fake.set_peak("bt", 0.4);
        assert_eq!(
            q.poll_capture().unwrap(),
            CapturePoll {
                active: false,
                settling: true
            }
        );
        assert_eq!(
            q.poll_capture().unwrap(),
            CapturePoll {
                active: true,
                settling: false
            }
        );
    }

    #[test]
    fn test_enumeration_failure_is_structured() {
        let fake = FakeSubsystem::new();
        fake.fail_enumeration(DetectError::EndpointEnumerationFailed {
            code: Some(-2147023728),
            message: "EnumAudioEndpoints".into(),
        });
        let usage = query(&fake, FakeInspector::new()).microphone_usage();

        assert!(!usage.success);
        assert!(usage.processes.is_empty());
        assert_eq!(usage.error_code, -2147023728);
        assert!(usage.error_message.contains("EnumAudioEndpoints"));
    }

    #[test]
    fn test_processes_merged_across_endpoints() {
        let fake = FakeSubsystem::new();
        for id in ["a", "b", "idle"] {
            fake.add_endpoint(Endpoint::new(id, id, Direction::Capture));
        }
        fake.set_sessions("a", vec![Session::new(1, SessionState::Active).with_volume(0.5)]);
        fake.set_sessions(
            "b",
            vec![
                Session::new(1, SessionState::Active).with_volume(0.5),
                Session::new(2, SessionState::Active).with_volume(0.5),
            ],
        );
        // Inactive endpoint: its sessions are never resolved.
        fake.set_sessions("idle", vec![Session::new(3, SessionState::Active).muted()]);
        let inspector = FakeInspector::new()
            .with_process(1, "zoom.exe")
            .with_process(2, "discord.exe")
            .with_process(3, "muted.exe");

        let processes = query(&fake, inspector).microphone_processes().unwrap();
        assert_eq!(processes, vec!["zoom.exe", "discord.exe"]);
    }

    #[test]
    fn test_render_processes_span_devices() {
        let fake = FakeSubsystem::new();
        fake.add_endpoint(Endpoint::new("spk", "Speakers", Direction::Render));
        fake.add_endpoint(Endpoint::new("hdmi", "Monitor", Direction::Render));
        fake.set_sessions("spk", vec![Session::new(5, SessionState::Active)]);
        fake.set_sessions("hdmi", vec![Session::new(6, SessionState::Active)]);
        let inspector = FakeInspector::new().with_process(5, r"C:\a\vlc.exe");

        let render = query(&fake, inspector).render_processes();
        assert_eq!(render.len(), 2);
        assert_eq!(render[0].process_name, "vlc.exe");
        assert_eq!(render[1].process_name, "Unknown");
        assert_eq!(render[1].device_name, "Monitor");
    }

    #[test]
    fn test_usage_serializes_camel_case() {
        let json = serde_json::to_value(MicrophoneUsage::ok(vec!["x.exe".into()])).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["errorCode"], 0);
        assert_eq!(json["processes"][0], "x.exe");
    }
}
