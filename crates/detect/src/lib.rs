//! Active audio session detection.
//!
//! Answers "which processes are using a microphone right now" and reports
//! changes to that answer as they happen. Wired devices are judged on the
//! current signals alone; Bluetooth devices go through a debounce layer
//! because their power-saving radios make the raw signal flap.

mod catalog;
mod classify;
mod config;
mod error;
pub mod fake;
mod fusion;
mod list;
mod mic;
pub mod platform;
mod process;
mod provider;
mod pump;
mod query;
mod session_monitor;
mod stabilizer;
mod types;

use std::sync::Arc;

pub use catalog::list_active_endpoints;
pub use classify::{
    is_bluetooth_class, BluetoothEvidence, DeviceClassifier, BLUETOOTH_GUIDS,
    BLUETOOTH_ID_MARKERS, BLUETOOTH_NAME_PATTERNS,
};
pub use config::*;
pub use error::{DetectError, Result};
pub use fusion::{detect_raw_activity, is_audible_session, session_signal, ActivitySignal};
pub use list::{list_active_processes, list_render_processes, resolve_process_path};
pub use mic::{MicrophoneUsageMonitor, MonitorState};
pub use process::SysinfoInspector;
pub use provider::{
    AudioSubsystem, NullSubsystem, ProcessInspector, SessionEventSink, SessionWatch,
};
pub use query::{ActivityQuery, MicrophoneUsage};
pub use session_monitor::{describe_session_event, SessionMonitorHandle, SessionMonitors};
pub use stabilizer::{BluetoothDeviceState, BluetoothStabilizer};
pub use types::*;

/// Receives `(active, render_processes)` from the microphone usage monitor.
pub type UsageCallback = Arc<dyn Fn(bool, Vec<RenderProcessInfo>) + Send + Sync + 'static>;

/// Receives one report per session event from a session monitor.
pub type SessionCallback = Arc<dyn Fn(ProcessSessionInfo) + Send + Sync + 'static>;

pub fn new_usage_callback<F>(f: F) -> UsageCallback
where
    F: Fn(bool, Vec<RenderProcessInfo>) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn new_session_callback<F>(f: F) -> SessionCallback
where
    F: Fn(ProcessSessionInfo) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Entry point bundling the query facade and both monitors.
///
/// Keep one per process: Bluetooth debounce history lives inside it.
pub struct Detector {
    query: Arc<ActivityQuery>,
    usage_monitor: MicrophoneUsageMonitor,
    session_monitors: SessionMonitors,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(&DetectConfig::default())
    }
}

impl Detector {
    /// Detector over the running platform's audio subsystem.
    pub fn new(config: &DetectConfig) -> Self {
        Self::with_providers(
            Arc::new(platform::default_subsystem()),
            Arc::new(SysinfoInspector::new()),
            config,
        )
    }

    pub fn with_providers(
        subsystem: Arc<dyn AudioSubsystem>,
        inspector: Arc<dyn ProcessInspector>,
        config: &DetectConfig,
    ) -> Self {
        let query = Arc::new(ActivityQuery::new(subsystem, inspector, config));
        Self {
            usage_monitor: MicrophoneUsageMonitor::new(Arc::clone(&query)),
            session_monitors: SessionMonitors::new(Arc::clone(&query)),
            query,
        }
    }

    pub fn query(&self) -> &ActivityQuery {
        &self.query
    }

    /// Executable paths of processes currently using a microphone.
    pub fn active_microphone_processes(&self) -> Result<Vec<String>> {
        self.query.microphone_processes()
    }

    pub fn active_microphone_usage(&self) -> MicrophoneUsage {
        self.query.microphone_usage()
    }

    pub fn is_microphone_active(&self) -> Result<bool> {
        self.query.is_microphone_active()
    }

    pub fn active_render_processes(&self) -> Vec<RenderProcessInfo> {
        self.query.render_processes()
    }

    /// Report `(process_name, is_active)` for each capture session event.
    pub fn start_session_monitor<F>(&self, on_event: F) -> Result<SessionMonitorHandle>
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.session_monitors
            .start(new_session_callback(move |info| {
                on_event(&info.process_name, info.is_active)
            }))
    }

    pub fn start_enhanced_session_monitor(
        &self,
        on_event: SessionCallback,
    ) -> Result<SessionMonitorHandle> {
        self.session_monitors.start(on_event)
    }

    pub fn stop_session_monitor(&self, handle: SessionMonitorHandle) {
        self.session_monitors.stop(handle);
    }

    /// Start the edge-triggered usage monitor; `false` if it could not start.
    pub fn start_microphone_usage_monitor(&self, on_change: UsageCallback) -> bool {
        self.usage_monitor.start(on_change)
    }

    pub fn stop_microphone_usage_monitor(&self) {
        self.usage_monitor.stop();
    }

    pub fn microphone_monitor_state(&self) -> MonitorState {
        self.usage_monitor.state()
    }

    /// Stop every monitor.
    pub fn stop(&self) {
        self.usage_monitor.stop();
        self.session_monitors.stop_all();
    }
}
