//! Hand-off from native notification threads to one worker thread.
//!
//! Session notifications arrive on OS threads. The pump registers a watch on
//! every endpoint it is given, forwards each event through a channel and runs
//! the handler on its own worker, so subscribers never execute inside a
//! native callback. A handler may also ask to be run again after a delay when
//! its answer can change without any notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};

use crate::error::{DetectError, Result};
use crate::provider::{AudioSubsystem, SessionEventSink, SessionWatch};
use crate::types::{Endpoint, SessionEvent};

/// Why the handler is being run.
#[derive(Debug, Clone)]
pub(crate) enum Trigger {
    /// Requested by the owner, not by the OS.
    Initial,
    Event(SessionEvent),
    /// The delay requested by the previous run elapsed without an event.
    Recheck,
}

enum Message {
    Trigger(Trigger),
    Shutdown,
}

pub(crate) struct EventPump {
    name: &'static str,
    watches: Vec<Box<dyn SessionWatch>>,
    sender: Sender<Message>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
    live: Arc<AtomicBool>,
}

impl EventPump {
    /// Spawn the worker and register a watch on each endpoint.
    ///
    /// An endpoint that refuses registration is logged and skipped. When a
    /// handler run returns a delay, the worker runs it again with
    /// [`Trigger::Recheck`] once the delay passes without another message.
    /// Any run replaces the pending delay with its own answer.
    pub(crate) fn start<F>(
        name: &'static str,
        subsystem: &dyn AudioSubsystem,
        endpoints: &[Endpoint],
        mut handler: F,
    ) -> Result<Self>
    where
        F: FnMut(Trigger) -> Option<Duration> + Send + 'static,
    {
        let (sender, receiver) = unbounded::<Message>();
        let live = Arc::new(AtomicBool::new(true));

        let worker_live = Arc::clone(&live);
        let worker = thread::Builder::new()
            .name(format!("micwatch-{name}"))
            .spawn(move || {
                let mut recheck_at: Option<Instant> = None;
                loop {
                    let trigger = match recheck_at {
                        Some(deadline) => match receiver.recv_deadline(deadline) {
                            Ok(Message::Trigger(trigger)) => trigger,
                            Ok(Message::Shutdown) => break,
                            Err(RecvTimeoutError::Timeout) => Trigger::Recheck,
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match receiver.recv() {
                            Ok(Message::Trigger(trigger)) => trigger,
                            Ok(Message::Shutdown) | Err(_) => break,
                        },
                    };
                    if !worker_live.load(Ordering::SeqCst) {
                        continue;
                    }
                    recheck_at = handler(trigger).map(|delay| Instant::now() + delay);
                }
                tracing::debug!(pump = name, "pump_worker_exited");
            })
            .map_err(|e| DetectError::subsystem(format!("failed to spawn {name} worker: {e}")))?;
        let worker_id = worker.thread().id();

        let tx = sender.clone();
        let sink: SessionEventSink = Arc::new(move |event| {
            let _ = tx.send(Message::Trigger(Trigger::Event(event)));
        });

        let mut watches = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match subsystem.watch_sessions(endpoint, Arc::clone(&sink)) {
                Ok(watch) => watches.push(watch),
                Err(e) => {
                    tracing::warn!(pump = name, endpoint = %endpoint.id, error = %e, "session_watch_failed");
                }
            }
        }

        tracing::info!(
            pump = name,
            endpoints = endpoints.len(),
            watched = watches.len(),
            "pump_started"
        );

        Ok(Self {
            name,
            watches,
            sender,
            worker: Some(worker),
            worker_id,
            live,
        })
    }

    /// Queue a handler run that did not come from the OS.
    pub(crate) fn trigger(&self, trigger: Trigger) {
        let _ = self.sender.send(Message::Trigger(trigger));
    }

    /// Release every registration and wait for the worker.
    ///
    /// No handler run starts after this returns. When called from the
    /// worker itself the join is skipped and the worker exits after the
    /// current run.
    pub(crate) fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.live.store(false, Ordering::SeqCst);
        for watch in &mut self.watches {
            watch.unregister();
        }
        self.watches.clear();
        let _ = self.sender.send(Message::Shutdown);

        if thread::current().id() == self.worker_id {
            tracing::debug!(pump = self.name, "pump_stopped_from_worker");
        } else if worker.join().is_err() {
            tracing::warn!(pump = self.name, "pump_worker_panicked");
        }

        tracing::info!(pump = self.name, "pump_stopped");
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeSubsystem;
    use crate::types::Direction;

    fn created(endpoint: &Endpoint, pid: u32) -> SessionEvent {
        SessionEvent::SessionCreated {
            endpoint: endpoint.clone(),
            process_id: pid,
        }
    }

    #[test]
    fn test_events_reach_handler_on_worker() {
        let fake = FakeSubsystem::new();
        let mic = Endpoint::new("mic", "Mic", Direction::Capture);
        let (tx, rx) = unbounded();

        let mut pump = EventPump::start("test", &fake, &[mic.clone()], move |t| {
            let _ = tx.send((t, thread::current().id()));
            None
        })
        .unwrap();

        fake.emit(created(&mic, 7));
        let (trigger, thread_id) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(trigger, Trigger::Event(ref e) if e.process_id() == 7));
        assert_ne!(thread_id, thread::current().id());

        pump.shutdown();
    }

    #[test]
    fn test_shutdown_releases_watches_and_is_idempotent() {
        let fake = FakeSubsystem::new();
        let endpoints = [
            Endpoint::new("a", "A", Direction::Capture),
            Endpoint::new("b", "B", Direction::Capture),
        ];
        let (tx, rx) = unbounded::<Trigger>();
        let mut pump = EventPump::start("test", &fake, &endpoints, move |t| {
            let _ = tx.send(t);
            None
        })
        .unwrap();
        assert_eq!(fake.active_watch_count(), 2);

        pump.shutdown();
        pump.shutdown();
        assert_eq!(fake.active_watch_count(), 0);

        fake.emit(created(&endpoints[0], 1));
        pump.trigger(Trigger::Initial);
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_refused_endpoint_is_skipped() {
        let fake = FakeSubsystem::new();
        fake.fail_watch("b");
        let endpoints = [
            Endpoint::new("a", "A", Direction::Capture),
            Endpoint::new("b", "B", Direction::Capture),
        ];
        let pump = EventPump::start("test", &fake, &endpoints, |_| None).unwrap();
        assert_eq!(fake.active_watch_count(), 1);
        drop(pump);
        assert_eq!(fake.active_watch_count(), 0);
    }

    #[test]
    fn test_requested_delay_reruns_handler_until_declined() {
        let fake = FakeSubsystem::new();
        let (tx, rx) = unbounded::<Trigger>();
        let mut reruns_left = 2;
        let mut pump = EventPump::start("test", &fake, &[], move |t| {
            let _ = tx.send(t);
            if reruns_left == 0 {
                return None;
            }
            reruns_left -= 1;
            Some(Duration::from_millis(20))
        })
        .unwrap();

        pump.trigger(Trigger::Initial);
        let wait = Duration::from_secs(2);
        assert!(matches!(rx.recv_timeout(wait), Ok(Trigger::Initial)));
        assert!(matches!(rx.recv_timeout(wait), Ok(Trigger::Recheck)));
        assert!(matches!(rx.recv_timeout(wait), Ok(Trigger::Recheck)));
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        pump.shutdown();
    }
}
