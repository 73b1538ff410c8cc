//! Provider traits for the audio subsystem and process inspection.
//!
//! These traits abstract the OS bindings, allowing the detection pipeline to
//! remain platform-neutral and testable.

use std::sync::Arc;

use crate::error::Result;
use crate::types::{DeviceProperties, Direction, Endpoint, Session, SessionEvent};

/// Receiver for native session notifications.
///
/// Invoked on whatever thread the OS delivers notifications on.
pub type SessionEventSink = Arc<dyn Fn(SessionEvent) + Send + Sync + 'static>;

/// Binding to the OS audio subsystem.
pub trait AudioSubsystem: Send + Sync {
    /// Endpoints currently in the active state for `direction`.
    fn active_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>>;

    /// Identity signals of the device behind `endpoint`.
    fn device_properties(&self, endpoint: &Endpoint) -> DeviceProperties;

    /// Hardware meter peak, or `None` when metering is unsupported.
    fn peak_level(&self, endpoint: &Endpoint) -> Option<f32>;

    /// Frames queued in the endpoint buffer, or `None` when unavailable.
    fn current_padding(&self, endpoint: &Endpoint) -> Option<u32>;

    /// Live sessions on `endpoint`.
    ///
    /// The outer error means the session list itself was unreachable; an
    /// inner error is one session that could not be inspected.
    fn sessions(&self, endpoint: &Endpoint) -> Result<Vec<Result<Session>>>;

    /// Register for new-session, state-change and disconnect notifications
    /// on `endpoint` and on each of its existing sessions.
    ///
    /// Notifications stop once the returned watch is unregistered or dropped.
    fn watch_sessions(
        &self,
        endpoint: &Endpoint,
        sink: SessionEventSink,
    ) -> Result<Box<dyn SessionWatch>>;
}

/// A live notification registration on one endpoint.
pub trait SessionWatch: Send {
    /// The endpoint this watch is registered on.
    fn endpoint(&self) -> &Endpoint;

    /// Release every registration. Idempotent.
    fn unregister(&mut self);
}

/// Maps a process id to its executable path.
pub trait ProcessInspector: Send + Sync {
    /// Full executable path of `pid`, or `None` if it cannot be queried.
    fn executable_path(&self, pid: u32) -> Option<String>;
}

impl<T: AudioSubsystem + ?Sized> AudioSubsystem for Arc<T> {
    fn active_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>> {
        (**self).active_endpoints(direction)
    }

    fn device_properties(&self, endpoint: &Endpoint) -> DeviceProperties {
        (**self).device_properties(endpoint)
    }

    fn peak_level(&self, endpoint: &Endpoint) -> Option<f32> {
        (**self).peak_level(endpoint)
    }

    fn current_padding(&self, endpoint: &Endpoint) -> Option<u32> {
        (**self).current_padding(endpoint)
    }

    fn sessions(&self, endpoint: &Endpoint) -> Result<Vec<Result<Session>>> {
        (**self).sessions(endpoint)
    }

    fn watch_sessions(
        &self,
        endpoint: &Endpoint,
        sink: SessionEventSink,
    ) -> Result<Box<dyn SessionWatch>> {
        (**self).watch_sessions(endpoint, sink)
    }
}

impl<T: ProcessInspector + ?Sized> ProcessInspector for Arc<T> {
    fn executable_path(&self, pid: u32) -> Option<String> {
        (**self).executable_path(pid)
    }
}

/// Null subsystem for unsupported platforms: no endpoints, no sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSubsystem;

struct NullWatch(Endpoint);

impl SessionWatch for NullWatch {
    fn endpoint(&self) -> &Endpoint {
        &self.0
    }

    fn unregister(&mut self) {}
}

impl AudioSubsystem for NullSubsystem {
    fn active_endpoints(&self, _direction: Direction) -> Result<Vec<Endpoint>> {
        Ok(Vec::new())
    }

    fn device_properties(&self, _endpoint: &Endpoint) -> DeviceProperties {
        DeviceProperties::default()
    }

    fn peak_level(&self, _endpoint: &Endpoint) -> Option<f32> {
        None
    }

    fn current_padding(&self, _endpoint: &Endpoint) -> Option<u32> {
        None
    }

    fn sessions(&self, _endpoint: &Endpoint) -> Result<Vec<Result<Session>>> {
        Ok(Vec::new())
    }

    fn watch_sessions(
        &self,
        endpoint: &Endpoint,
        _sink: SessionEventSink,
    ) -> Result<Box<dyn SessionWatch>> {
        Ok(Box::new(NullWatch(endpoint.clone())))
    }
}
