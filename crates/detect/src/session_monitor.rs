//! Per-process session notifications on capture endpoints.
//!
//! Unlike the usage monitor there is no aggregation and no edge
//! suppression: every native event for a user process becomes one
//! [`ProcessSessionInfo`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::list_active_endpoints;
use crate::error::Result;
use crate::list::resolve_process_path;
use crate::provider::ProcessInspector;
use crate::pump::{EventPump, Trigger};
use crate::query::ActivityQuery;
use crate::types::{process_name_from_path, Direction, ProcessSessionInfo, SessionEvent};
use crate::SessionCallback;

/// Identifies one running session monitor. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionMonitorHandle(u64);

impl SessionMonitorHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionMonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build the report for `event`, or `None` for system sessions.
pub fn describe_session_event<I>(inspector: &I, event: &SessionEvent) -> Option<ProcessSessionInfo>
where
    I: ProcessInspector + ?Sized,
{
    let pid = event.process_id();
    if pid == 0 {
        return None;
    }
    let full_path = resolve_process_path(inspector, pid);

    Some(ProcessSessionInfo {
        process_name: process_name_from_path(&full_path),
        full_path,
        process_id: pid,
        device_name: event.endpoint().name.clone(),
        is_active: event.is_active(),
    })
}

/// Registry of running session monitors.
pub struct SessionMonitors {
    query: Arc<ActivityQuery>,
    next_id: AtomicU64,
    monitors: Mutex<HashMap<SessionMonitorHandle, EventPump>>,
}

impl SessionMonitors {
    pub fn new(query: Arc<ActivityQuery>) -> Self {
        Self {
            query,
            next_id: AtomicU64::new(1),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Start delivering session events for every capture endpoint.
    pub fn start(&self, on_event: SessionCallback) -> Result<SessionMonitorHandle> {
        let subsystem = self.query.subsystem();
        let endpoints = list_active_endpoints(subsystem.as_ref(), Direction::Capture)?;

        let inspector = Arc::clone(self.query.inspector());
        let handler = move |trigger: Trigger| -> Option<Duration> {
            let Trigger::Event(event) = trigger else {
                return None;
            };
            match describe_session_event(inspector.as_ref(), &event) {
                Some(info) => {
                    tracing::debug!(pid = info.process_id, active = info.is_active, "session_event");
                    on_event(info);
                }
                None => tracing::trace!(?event, "system_session_event_dropped"),
            }
            None
        };

        let pump = EventPump::start("session-monitor", subsystem.as_ref(), &endpoints, handler)?;
        let handle = SessionMonitorHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle, pump);

        tracing::info!(%handle, "session_monitor_started");
        Ok(handle)
    }

    /// Stop the monitor behind `handle`. Unknown handles are ignored.
    pub fn stop(&self, handle: SessionMonitorHandle) {
        let pump = self
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle);

        match pump {
            Some(mut pump) => {
                pump.shutdown();
                tracing::info!(%handle, "session_monitor_stopped");
            }
            None => tracing::debug!(%handle, "session_monitor_unknown_handle"),
        }
    }

    pub fn stop_all(&self) {
        let pumps: Vec<EventPump> = self
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, pump)| pump)
            .collect();
        drop(pumps);
    }

    pub fn running(&self) -> usize {
        self.monitors.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for SessionMonitors {
    fn drop(&mut self) {
        self.stop_all();
    }
}
