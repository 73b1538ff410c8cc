//! Session resolution: which processes own the live sessions of an endpoint.

use std::collections::HashSet;

use crate::error::Result;
use crate::provider::{AudioSubsystem, ProcessInspector};
use crate::types::{process_name_from_path, Endpoint, RenderProcessInfo, Session, UNKNOWN_PROCESS};

/// Resolve `pid` to an executable path, or the `"Unknown"` sentinel.
///
/// A process that exits between enumeration and resolution must not abort
/// the query, so this never fails.
pub fn resolve_process_path<I>(inspector: &I, pid: u32) -> String
where
    I: ProcessInspector + ?Sized,
{
    inspector.executable_path(pid).unwrap_or_else(|| {
        tracing::debug!(pid, "process_resolution_failed");
        UNKNOWN_PROCESS.to_string()
    })
}

/// Sessions of `endpoint` that could be inspected; broken ones are skipped.
fn inspectable_sessions<S>(subsystem: &S, endpoint: &Endpoint) -> Result<Vec<Session>>
where
    S: AudioSubsystem + ?Sized,
{
    let sessions = subsystem.sessions(endpoint)?;
    Ok(sessions
        .into_iter()
        .filter_map(|session| match session {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::debug!(endpoint = %endpoint.id, error = %e, "session_skipped");
                None
            }
        })
        .collect())
}

/// Executable paths of processes with an active session on `endpoint`.
///
/// Deduplicated by path, in first-seen order. An unreachable session list
/// yields an empty result.
pub fn list_active_processes<S, I>(subsystem: &S, inspector: &I, endpoint: &Endpoint) -> Vec<String>
where
    S: AudioSubsystem + ?Sized,
    I: ProcessInspector + ?Sized,
{
    let sessions = match inspectable_sessions(subsystem, endpoint) {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::warn!(endpoint = %endpoint.id, error = %e, "session_list_unavailable");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for session in sessions {
        if session.process_id == 0 || !session.is_active() {
            continue;
        }
        let path = resolve_process_path(inspector, session.process_id);
        if seen.insert(path.clone()) {
            paths.push(path);
        }
    }
    paths
}

/// Processes producing audio on a render endpoint.
///
/// A session counts when it is active, unmuted and its volume interface is
/// readable; quiet volume still counts. Deduplicated by process id.
pub fn list_render_processes<S, I>(
    subsystem: &S,
    inspector: &I,
    endpoint: &Endpoint,
) -> Vec<RenderProcessInfo>
where
    S: AudioSubsystem + ?Sized,
    I: ProcessInspector + ?Sized,
{
    let sessions = match inspectable_sessions(subsystem, endpoint) {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::warn!(endpoint = %endpoint.id, error = %e, "session_list_unavailable");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    sessions
        .into_iter()
        .filter(|s| s.process_id != 0 && s.is_active() && !s.muted && s.volume.is_some())
        .filter(|s| seen.insert(s.process_id))
        .map(|s| RenderProcessInfo {
            process_name: process_name_from_path(&resolve_process_path(inspector, s.process_id)),
            process_id: s.process_id,
            device_name: endpoint.name.clone(),
            is_active: true,
        })
        .collect()
}

/// Append `items` to `into`, skipping values already present.
pub(crate) fn merge_unique(into: &mut Vec<String>, seen: &mut HashSet<String>, items: Vec<String>) {
    for item in items {
        if seen.insert(item.clone()) {
            into.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeInspector, FakeSubsystem};
    use crate::types::{Direction, SessionState};

    fn mic() -> Endpoint {
        Endpoint::new("mic", "Microphone", Direction::Capture)
    }

    #[test]
    fn test_same_path_is_reported_once() {
        let fake = FakeSubsystem::new();
        fake.set_sessions(
            "mic",
            vec![
                Session::new(10, SessionState::Active),
                Session::new(11, SessionState::Active),
            ],
        );
        let inspector = FakeInspector::new()
            .with_process(10, r"C:\Program Files\Google\Chrome\chrome.exe")
            .with_process(11, r"C:\Program Files\Google\Chrome\chrome.exe");

        assert_eq!(
            list_active_processes(&fake, &inspector, &mic()),
            vec![r"C:\Program Files\Google\Chrome\chrome.exe"]
        );
    }

    #[test]
    fn test_skips_system_inactive_and_broken_sessions() {
        let fake = FakeSubsystem::new();
        fake.set_sessions(
            "mic",
            vec![
                Session::new(0, SessionState::Active),
                Session::new(20, SessionState::Inactive),
                Session::new(21, SessionState::Expired),
                Session::new(22, SessionState::Active),
            ],
        );
        fake.add_broken_session("mic");
        let inspector = FakeInspector::new().with_process(22, r"C:\Apps\teams.exe");

        assert_eq!(
            list_active_processes(&fake, &inspector, &mic()),
            vec![r"C:\Apps\teams.exe"]
        );
    }

    #[test]
    fn test_unresolvable_pid_reports_unknown_once() {
        let fake = FakeSubsystem::new();
        fake.set_sessions(
            "mic",
            vec![
                Session::new(30, SessionState::Active),
                Session::new(31, SessionState::Active),
                Session::new(32, SessionState::Active),
            ],
        );
        let inspector = FakeInspector::new().with_process(31, r"C:\Apps\obs64.exe");

        assert_eq!(
            list_active_processes(&fake, &inspector, &mic()),
            vec![UNKNOWN_PROCESS.to_string(), r"C:\Apps\obs64.exe".to_string()]
        );
    }

    #[test]
    fn test_first_seen_order_is_preserved() {
        let fake = FakeSubsystem::new();
        fake.set_sessions(
            "mic",
            vec![
                Session::new(3, SessionState::Active),
                Session::new(1, SessionState::Active),
                Session::new(2, SessionState::Active),
            ],
        );
        let inspector = FakeInspector::new()
            .with_process(1, "a.exe")
            .with_process(2, "b.exe")
            .with_process(3, "c.exe");

        assert_eq!(
            list_active_processes(&fake, &inspector, &mic()),
            vec!["c.exe", "a.exe", "b.exe"]
        );
    }

    #[test]
    fn test_render_processes() {
        let fake = FakeSubsystem::new();
        let speakers = Endpoint::new("spk", "Speakers (Realtek)", Direction::Render);
        fake.set_sessions(
            "spk",
            vec![
                Session::new(40, SessionState::Active).with_volume(0.01),
                Session::new(40, SessionState::Active),
                Session::new(41, SessionState::Active).muted(),
                Session::new(42, SessionState::Active).without_volume(),
                Session::new(43, SessionState::Inactive),
            ],
        );
        let inspector = FakeInspector::new().with_process(40, r"C:\Apps\Spotify.exe");

        let render = list_render_processes(&fake, &inspector, &speakers);
        assert_eq!(
            render,
            vec![RenderProcessInfo {
                process_name: "Spotify.exe".into(),
                process_id: 40,
                device_name: "Speakers (Realtek)".into(),
                is_active: true,
            }]
        );
    }

    #[test]
    fn test_unreachable_session_list_is_empty() {
        let fake = FakeSubsystem::new();
        fake.fail_session_list("mic");
        assert!(list_active_processes(&fake, &FakeInspector::new(), &mic()).is_empty());
    }
}
