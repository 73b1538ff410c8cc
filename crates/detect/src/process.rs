//! Process id to executable path lookup via `sysinfo`.

use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::provider::ProcessInspector;

/// [`ProcessInspector`] backed by `sysinfo`.
///
/// Each lookup refreshes only the requested pid; nothing is cached across
/// queries because pids are reused.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoInspector;

impl SysinfoInspector {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessInspector for SysinfoInspector {
    fn executable_path(&self, pid: u32) -> Option<String> {
        if pid == 0 {
            return None;
        }
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let exe = sys.process(pid)?.exe()?;
        Some(exe.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_current_process() {
        let pid = std::process::id();
        let path = SysinfoInspector::new().executable_path(pid);
        assert!(path.is_some_and(|p| !p.is_empty()));
    }

    #[test]
    fn test_system_idle_pid_is_unresolved() {
        assert_eq!(SysinfoInspector::new().executable_path(0), None);
    }
}
