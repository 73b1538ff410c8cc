//! Activity signal fusion for a single endpoint.
//!
//! Signals are consulted from most to least direct and the first positive one
//! wins. Any inspection interface the device does not support is skipped.

use crate::config::FusionConfig;
use crate::provider::AudioSubsystem;
use crate::types::{Endpoint, Session};

/// The signal that showed activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    /// Hardware meter peak above zero.
    Meter,
    /// Frames queued in the endpoint buffer.
    Padding,
    /// An active, audible session.
    Session,
    /// Bluetooth only: a session exists at all.
    SessionPresent,
}

/// Whether `session` counts as audible.
///
/// Some Bluetooth drivers transiently report zero volume on a live stream, so
/// an unmuted zero-volume session still counts on Bluetooth endpoints.
pub fn is_audible_session(session: &Session, bluetooth: bool, config: &FusionConfig) -> bool {
    if !session.is_active() || session.muted {
        return false;
    }
    match session.volume {
        Some(volume) => volume > config.volume_epsilon || (bluetooth && volume == 0.0),
        None => false,
    }
}

/// Session-level activity check over a snapshot of sessions.
pub fn session_signal(
    sessions: &[Session],
    bluetooth: bool,
    config: &FusionConfig,
) -> Option<ActivitySignal> {
    if sessions
        .iter()
        .any(|s| is_audible_session(s, bluetooth, config))
    {
        return Some(ActivitySignal::Session);
    }
    // Bluetooth session state lags the radio; presence is enough corroboration.
    if bluetooth && !sessions.is_empty() {
        return Some(ActivitySignal::SessionPresent);
    }
    None
}

/// Raw, unstabilized activity of `endpoint`.
pub fn detect_raw_activity<S>(
    subsystem: &S,
    endpoint: &Endpoint,
    bluetooth: bool,
    config: &FusionConfig,
) -> Option<ActivitySignal>
where
    S: AudioSubsystem + ?Sized,
{
    if subsystem.peak_level(endpoint).is_some_and(|peak| peak > 0.0) {
        return Some(ActivitySignal::Meter);
    }

    if subsystem.current_padding(endpoint).is_some_and(|frames| frames > 0) {
        return Some(ActivitySignal::Padding);
    }

    let sessions: Vec<Session> = match subsystem.sessions(endpoint) {
        Ok(sessions) => sessions.into_iter().filter_map(Result::ok).collect(),
        Err(e) => {
            tracing::debug!(endpoint = %endpoint.id, error = %e, "session_list_unavailable");
            Vec::new()
        }
    };

    session_signal(&sessions, bluetooth, config)
}
