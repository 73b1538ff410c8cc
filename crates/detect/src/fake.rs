//! In-memory audio subsystem for testing.
//!
//! Endpoints, signals and sessions are scripted by the test; session
//! notifications are raised with [`FakeSubsystem::emit`] and reach every sink
//! still registered on the event's endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{DetectError, Result};
use crate::provider::{AudioSubsystem, ProcessInspector, SessionEventSink, SessionWatch};
use crate::types::{DeviceProperties, Direction, Endpoint, Session, SessionEvent};

#[derive(Default)]
struct FakeState {
    endpoints: Vec<Endpoint>,
    properties: HashMap<String, DeviceProperties>,
    peaks: HashMap<String, f32>,
    padding: HashMap<String, u32>,
    sessions: HashMap<String, Vec<Result<Session>>>,
    unreachable_session_lists: HashSet<String>,
    unwatchable: HashSet<String>,
    enumeration_failure: Option<DetectError>,
    watches: HashMap<u64, (String, SessionEventSink)>,
    next_watch_id: u64,
}

/// Scriptable [`AudioSubsystem`] double.
#[derive(Clone, Default)]
pub struct FakeSubsystem {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_endpoint(&self, endpoint: Endpoint) {
        self.lock().endpoints.push(endpoint);
    }

    pub fn set_properties(&self, id: &str, properties: DeviceProperties) {
        self.lock().properties.insert(id.to_string(), properties);
    }

    pub fn set_peak(&self, id: &str, peak: f32) {
        self.lock().peaks.insert(id.to_string(), peak);
    }

    pub fn set_padding(&self, id: &str, frames: u32) {
        self.lock().padding.insert(id.to_string(), frames);
    }

    pub fn set_sessions(&self, id: &str, sessions: Vec<Session>) {
        self.lock()
            .sessions
            .insert(id.to_string(), sessions.into_iter().map(Ok).collect());
    }

    /// Append a session whose inspection fails.
    pub fn add_broken_session(&self, id: &str) {
        self.lock()
            .sessions
            .entry(id.to_string())
            .or_default()
            .push(Err(DetectError::PerSessionInspectionFailed {
                endpoint: id.to_string(),
                message: "session vanished".to_string(),
            }));
    }

    pub fn fail_session_list(&self, id: &str) {
        self.lock().unreachable_session_lists.insert(id.to_string());
    }

    pub fn fail_watch(&self, id: &str) {
        self.lock().unwatchable.insert(id.to_string());
    }

    pub fn fail_enumeration(&self, error: DetectError) {
        self.lock().enumeration_failure = Some(error);
    }

    /// Number of registrations that have not been released.
    pub fn active_watch_count(&self) -> usize {
        self.lock().watches.len()
    }

    /// Deliver `event` to every sink registered on its endpoint.
    pub fn emit(&self, event: SessionEvent) {
        let sinks: Vec<SessionEventSink> = self
            .lock()
            .watches
            .values()
            .filter(|(endpoint_id, _)| *endpoint_id == event.endpoint().id)
            .map(|(_, sink)| Arc::clone(sink))
            .collect();

        for sink in sinks {
            sink(event.clone());
        }
    }
}

struct FakeWatch {
    id: u64,
    endpoint: Endpoint,
    state: Arc<Mutex<FakeState>>,
}

impl SessionWatch for FakeWatch {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn unregister(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.watches.remove(&self.id);
    }
}

impl Drop for FakeWatch {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl AudioSubsystem for FakeSubsystem {
    fn active_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>> {
        let state = self.lock();
        if let Some(error) = &state.enumeration_failure {
            return Err(error.clone());
        }
        Ok(state
            .endpoints
            .iter()
            .filter(|e| e.direction == direction)
            .cloned()
            .collect())
    }

    fn device_properties(&self, endpoint: &Endpoint) -> DeviceProperties {
        self.lock()
            .properties
            .get(&endpoint.id)
            .cloned()
            .unwrap_or_else(|| DeviceProperties {
                friendly_name: Some(endpoint.name.clone()),
                ..Default::default()
            })
    }

    fn peak_level(&self, endpoint: &Endpoint) -> Option<f32> {
        self.lock().peaks.get(&endpoint.id).copied()
    }

    fn current_padding(&self, endpoint: &Endpoint) -> Option<u32> {
        self.lock().padding.get(&endpoint.id).copied()
    }

    fn sessions(&self, endpoint: &Endpoint) -> Result<Vec<Result<Session>>> {
        let state = self.lock();
        if state.unreachable_session_lists.contains(&endpoint.id) {
            return Err(DetectError::PerSessionInspectionFailed {
                endpoint: endpoint.id.clone(),
                message: "session manager unavailable".to_string(),
            });
        }
        Ok(state.sessions.get(&endpoint.id).cloned().unwrap_or_default())
    }

    fn watch_sessions(
        &self,
        endpoint: &Endpoint,
        sink: SessionEventSink,
    ) -> Result<Box<dyn SessionWatch>> {
        let mut state = self.lock();
        if state.unwatchable.contains(&endpoint.id) {
            return Err(DetectError::RegistrationFailed {
                endpoint: endpoint.id.clone(),
                message: "RegisterSessionNotification refused".to_string(),
            });
        }
        state.next_watch_id += 1;
        let id = state.next_watch_id;
        state.watches.insert(id, (endpoint.id.clone(), sink));

        Ok(Box::new(FakeWatch {
            id,
            endpoint: endpoint.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// Map-backed [`ProcessInspector`] double.
#[derive(Clone, Default)]
pub struct FakeInspector {
    paths: Arc<Mutex<HashMap<u32, String>>>,
}

impl FakeInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process(self, pid: u32, path: impl Into<String>) -> Self {
        self.insert(pid, path);
        self
    }

    pub fn insert(&self, pid: u32, path: impl Into<String>) {
        self.paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, path.into());
    }
}

impl ProcessInspector for FakeInspector {
    fn executable_path(&self, pid: u32) -> Option<String> {
        self.paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .cloned()
    }
}
