//! Event-driven microphone usage monitor.
//!
//! Reports the aggregate "is any microphone in use" boolean whenever session
//! notifications change it, together with a snapshot of the processes
//! currently producing audio output.
//!
//! Bluetooth readings are debounced across polls, so a single notification is
//! not enough to settle them. While any Bluetooth device reports a state its
//! raw signal has left, the monitor re-polls on the stabilizer's recheck
//! interval and goes quiet again once they agree.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::catalog::list_active_endpoints;
use crate::pump::{EventPump, Trigger};
use crate::query::{ActivityQuery, CapturePoll};
use crate::types::Direction;
use crate::UsageCallback;

/// Lifecycle of a [`MicrophoneUsageMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Initializing,
    Running,
}

struct Inner {
    state: MonitorState,
    pump: Option<EventPump>,
}

/// Delivers `on_change(active, render_processes)` on aggregate changes.
///
/// The first report after [`start`](Self::start) is always delivered; later
/// ones only when the boolean differs from the last delivered value.
pub struct MicrophoneUsageMonitor {
    query: Arc<ActivityQuery>,
    inner: Mutex<Inner>,
}

impl MicrophoneUsageMonitor {
    pub fn new(query: Arc<ActivityQuery>) -> Self {
        Self {
            query,
            inner: Mutex::new(Inner {
                state: MonitorState::Stopped,
                pump: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> MonitorState {
        self.lock().state
    }

    /// Register on every capture endpoint and start reporting.
    ///
    /// A running monitor is stopped first. Returns `false` when capture
    /// endpoints cannot be enumerated or the worker cannot be spawned.
    pub fn start(&self, on_change: UsageCallback) -> bool {
        self.stop();

        let previous = {
            let mut inner = self.lock();
            std::mem::replace(&mut inner.state, MonitorState::Initializing)
        };
        if previous != MonitorState::Stopped {
            // Another start raced us between stop() and here.
            self.lock().state = previous;
            tracing::warn!(?previous, "microphone_monitor_start_raced");
            return false;
        }

        let subsystem = self.query.subsystem();
        let endpoints = match list_active_endpoints(subsystem.as_ref(), Direction::Capture) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!(error = %e, "microphone_monitor_start_failed");
                self.lock().state = MonitorState::Stopped;
                return false;
            }
        };

        let mut reporter = UsageReporter::new(Arc::clone(&self.query), on_change);
        let handler = move |trigger: Trigger| reporter.run(trigger);

        let pump = match EventPump::start("mic-monitor", subsystem.as_ref(), &endpoints, handler) {
            Ok(pump) => pump,
            Err(e) => {
                tracing::warn!(error = %e, "microphone_monitor_start_failed");
                self.lock().state = MonitorState::Stopped;
                return false;
            }
        };
        let mut inner = self.lock();
        inner.state = MonitorState::Running;
        inner.pump.insert(pump).trigger(Trigger::Initial);
        true
    }

    /// Release every registration. Idempotent, and safe to call from inside
    /// the callback.
    pub fn stop(&self) {
        let pump = {
            let mut inner = self.lock();
            if inner.state == MonitorState::Running {
                inner.state = MonitorState::Stopped;
            }
            inner.pump.take()
        };

        if let Some(mut pump) = pump {
            pump.shutdown();
        }
    }
}

/// Turns pump triggers into `on_change` reports.
///
/// Whatever runs first is reported unconditionally, whether the owner's
/// initial trigger or a notification that beat it to the worker. After that
/// only changes of the boolean are delivered.
struct UsageReporter {
    query: Arc<ActivityQuery>,
    on_change: UsageCallback,
    last_reported: Option<bool>,
}

impl UsageReporter {
    fn new(query: Arc<ActivityQuery>, on_change: UsageCallback) -> Self {
        Self {
            query,
            on_change,
            last_reported: None,
        }
    }

    /// Returns the delay before the next unprompted poll, if one is needed.
    fn run(&mut self, trigger: Trigger) -> Option<Duration> {
        let first = self.last_reported.is_none();
        let poll = match self.query.poll_capture() {
            Ok(poll) => poll,
            Err(e) if first => {
                tracing::warn!(error = %e, ?trigger, "initial_check_failed");
                CapturePoll::default()
            }
            Err(e) => {
                tracing::warn!(error = %e, ?trigger, "usage_check_failed");
                return None;
            }
        };
        let recheck = poll
            .settling
            .then(|| self.query.stabilizer().config().recheck_interval());

        if self.last_reported == Some(poll.active) {
            tracing::debug!(active = poll.active, settling = poll.settling, "microphone_usage_unchanged");
            return recheck;
        }
        self.last_reported = Some(poll.active);

        let render = self.query.render_processes();
        tracing::info!(active = poll.active, render = render.len(), "microphone_usage_changed");
        (self.on_change)(poll.active, render);
        recheck
    }
}

impl Drop for MicrophoneUsageMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectConfig;
    use crate::error::DetectError;
    use crate::fake::{FakeInspector, FakeSubsystem};
    use crate::new_usage_callback;
    use crate::types::{DeviceProperties, Endpoint, RenderProcessInfo, SessionEvent, SessionState};
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    fn query(fake: &FakeSubsystem) -> ActivityQuery {
        ActivityQuery::new(
            Arc::new(fake.clone()),
            Arc::new(FakeInspector::new()),
            &DetectConfig::default(),
        )
    }

    fn monitor(fake: &FakeSubsystem) -> MicrophoneUsageMonitor {
        MicrophoneUsageMonitor::new(Arc::new(query(fake)))
    }

    fn recorder() -> (UsageCallback, Receiver<(bool, Vec<RenderProcessInfo>)>) {
        let (tx, rx) = unbounded();
        let callback = new_usage_callback(move |active, render| {
            let _ = tx.send((active, render));
        });
        (callback, rx)
    }

    #[test]
    fn test_initial_report_is_unconditional() {
        let fake = FakeSubsystem::new();
        fake.add_endpoint(Endpoint::new("mic", "Mic", Direction::Capture));
        let monitor = monitor(&fake);
        let (callback, rx) = recorder();

        assert!(monitor.start(callback));
        assert_eq!(monitor.state(), MonitorState::Running);
        let (active, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!active);
        monitor.stop();
    }

    #[test]
    fn test_event_ahead_of_initial_trigger_reports_once() {
        let fake = FakeSubsystem::new();
        let mic = Endpoint::new("mic", "Mic", Direction::Capture);
        fake.add_endpoint(mic.clone());
        let (callback, rx) = recorder();
        let mut reporter = UsageReporter::new(Arc::new(query(&fake)), callback);

        reporter.run(Trigger::Event(SessionEvent::StateChanged {
            endpoint: mic,
            process_id: 8,
            state: SessionState::Inactive,
        }));
        reporter.run(Trigger::Initial);

        assert_eq!(rx.try_iter().map(|(active, _)| active).collect::<Vec<_>>(), vec![false]);
    }

    #[test]
    fn test_settling_bluetooth_requests_recheck() {
        let fake = FakeSubsystem::new();
        let headset = Endpoint::new("bt", "Headset Hands-Free", Direction::Capture);
        fake.add_endpoint(headset.clone());
        fake.set_properties(
            "bt",
            DeviceProperties {
                instance_id: Some(r"BTHHFENUM\{0000111e}\7&2".into()),
                ..Default::default()
            },
        );
        let query = Arc::new(query(&fake));
        let interval = query.stabilizer().config().recheck_interval();
        let (callback, rx) = recorder();
        let mut reporter = UsageReporter::new(Arc::clone(&query), callback);

        assert_eq!(reporter.run(Trigger::Initial), None);
        assert_eq!(rx.try_recv().map(|(active, _)| active), Ok(false));

        // One raw-active reading is held back and asks for another poll.
        fake.set_peak("bt", 0.5);
        let created = SessionEvent::SessionCreated {
            endpoint: headset,
            process_id: 21,
        };
        assert_eq!(reporter.run(Trigger::Event(created)), Some(interval));
        assert!(rx.try_recv().is_err());

        assert_eq!(reporter.run(Trigger::Recheck), None);
        assert_eq!(rx.try_recv().map(|(active, _)| active), Ok(true));

        // Silence is held by the debounce and keeps the rechecks coming.
        fake.set_peak("bt", 0.0);
        assert_eq!(reporter.run(Trigger::Recheck), Some(interval));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_enumeration_failure_fails_start() {
        let fake = FakeSubsystem::new();
        fake.fail_enumeration(DetectError::enumeration("no endpoints"));
        let monitor = monitor(&fake);
        let (callback, rx) = recorder();

        assert!(!monitor.start(callback));
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_restart_replaces_registrations() {
        let fake = FakeSubsystem::new();
        fake.add_endpoint(Endpoint::new("mic", "Mic", Direction::Capture));
        let monitor = monitor(&fake);

        let (first, _rx1) = recorder();
        let (second, rx2) = recorder();
        assert!(monitor.start(first));
        assert!(monitor.start(second));
        assert_eq!(fake.active_watch_count(), 1);
        assert!(rx2.recv_timeout(Duration::from_secs(2)).is_ok());

        monitor.stop();
        assert_eq!(fake.active_watch_count(), 0);
    }

    #[test]
    fn test_stop_from_callback() {
        let fake = FakeSubsystem::new();
        let mic = Endpoint::new("mic", "Mic", Direction::Capture);
        fake.add_endpoint(mic.clone());
        let monitor = Arc::new(monitor(&fake));
        let (tx, rx) = unbounded();

        let weak = Arc::downgrade(&monitor);
        let callback = new_usage_callback(move |active, _| {
            if let Some(monitor) = weak.upgrade() {
                monitor.stop();
            }
            let _ = tx.send(active);
        });

        assert!(monitor.start(callback));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(false));
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(fake.active_watch_count(), 0);

        fake.set_padding("mic", 64);
        fake.emit(SessionEvent::SessionCreated {
            endpoint: mic,
            process_id: 3,
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
